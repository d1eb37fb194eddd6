pub mod archive;
pub mod pipe;

pub use archive::ImageArchive;

use crate::constants::{ARCHIVE_CHANNEL_CAPACITY, ARCHIVE_CHUNK_SIZE};
use crate::error::{ImageError, Result};
use crate::local::DaemonClient;

/// Stream `archive` into the daemon's import while it is being written.
///
/// The archive is produced on a blocking thread and consumed by the import
/// concurrently through a bounded pipe. Both sides are joined before this
/// returns. When both fail, the root cause wins: a producer error other
/// than a broken pipe, otherwise the consumer's error.
pub async fn load_into(daemon: &dyn DaemonClient, archive: ImageArchive) -> Result<()> {
    let (mut writer, reader) = pipe::channel(ARCHIVE_CHANNEL_CAPACITY, ARCHIVE_CHUNK_SIZE);

    let producer = tokio::task::spawn_blocking(move || {
        let written = archive.write_to(&mut writer).map(|_| ());
        match written {
            Ok(()) => writer
                .finish()
                .map_err(|e| ImageError::io("finish archive stream", e)),
            Err(e) => {
                writer.abort(&e.to_string());
                Err(e)
            }
        }
    });
    let consumer = daemon.import_archive(Box::new(reader));

    let (produced, consumed) = tokio::join!(producer, consumer);
    let produced = produced.unwrap_or_else(|e| {
        Err(ImageError::io(
            "archive producer task",
            std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        ))
    });

    match (produced, consumed) {
        (Err(e), _) if !is_broken_pipe(&e) => Err(e),
        (_, Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Ok(()), Ok(())) => Ok(()),
    }
}

fn is_broken_pipe(err: &ImageError) -> bool {
    matches!(err, ImageError::Io { source, .. } if source.kind() == std::io::ErrorKind::BrokenPipe)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broken_pipe_detection() {
        let broken = ImageError::io(
            "write",
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"),
        );
        let other = ImageError::io(
            "write",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(is_broken_pipe(&broken));
        assert!(!is_broken_pipe(&other));
        assert!(!is_broken_pipe(&ImageError::EmptyImage {
            image: "x".into()
        }));
    }
}
