//! Bounded handoff between a blocking archive producer and an async consumer.
//!
//! The writer half is a `std::io::Write` meant to run on a blocking thread;
//! the reader half is an `AsyncRead`. Closing either side is seen by the
//! other: a dropped reader turns further writes into `BrokenPipe`, and an
//! aborted writer delivers its error to the reader instead of a clean EOF.

use std::io::{self, Write};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

type Chunk = io::Result<Vec<u8>>;

pub fn channel(capacity: usize, chunk_size: usize) -> (ArchiveWriter, ArchiveReader) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        ArchiveWriter {
            tx,
            buf: Vec::with_capacity(chunk_size),
            chunk_size,
        },
        ArchiveReader {
            rx,
            chunk: Vec::new(),
            pos: 0,
        },
    )
}

pub struct ArchiveWriter {
    tx: mpsc::Sender<Chunk>,
    buf: Vec<u8>,
    chunk_size: usize,
}

impl ArchiveWriter {
    fn send_buffered(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(self.chunk_size));
        self.tx
            .blocking_send(Ok(chunk))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "archive consumer closed"))
    }

    /// Flush what is left and close the stream cleanly
    pub fn finish(mut self) -> io::Result<()> {
        self.send_buffered()
    }

    /// Close the stream with an error the reader will observe
    pub fn abort(self, reason: &str) {
        let err = io::Error::new(io::ErrorKind::Other, reason.to_string());
        // The reader may already be gone; nothing left to tell it then.
        let _ = self.tx.blocking_send(Err(err));
    }
}

impl Write for ArchiveWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.tx.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "archive consumer closed",
            ));
        }
        let room = self.chunk_size - self.buf.len();
        let n = room.min(data.len());
        self.buf.extend_from_slice(&data[..n]);
        if self.buf.len() >= self.chunk_size {
            self.send_buffered()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered()
    }
}

pub struct ArchiveReader {
    rx: mpsc::Receiver<Chunk>,
    chunk: Vec<u8>,
    pos: usize,
}

impl AsyncRead for ArchiveReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        while this.pos >= this.chunk.len() {
            match ready!(this.rx.poll_recv(cx)) {
                Some(Ok(chunk)) => {
                    this.chunk = chunk;
                    this.pos = 0;
                }
                Some(Err(e)) => return Poll::Ready(Err(e)),
                None => return Poll::Ready(Ok(())),
            }
        }
        let n = buf.remaining().min(this.chunk.len() - this.pos);
        buf.put_slice(&this.chunk[this.pos..this.pos + n]);
        this.pos += n;
        Poll::Ready(Ok(()))
    }
}
