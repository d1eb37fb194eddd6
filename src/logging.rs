use std::io;
/// Structured logging utilities for imgkit
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

/// Initialize structured logging with optional JSON output
pub fn init_logging(json_output: bool) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("imgkit=info"));

    let registry = Registry::default().with(env_filter);

    if json_output {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(io::stderr)
                    .with_current_span(true)
                    .with_thread_ids(true)
                    .with_span_events(FmtSpan::ACTIVE),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(io::stderr)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()?;
    }

    Ok(())
}

/// Shorten a `sha256:<hex>` identifier for log output
pub fn short_id(id: &str) -> &str {
    let hex = id.strip_prefix("sha256:").unwrap_or(id);
    hex.get(..12).unwrap_or(hex)
}

#[macro_export]
macro_rules! log_layer_added {
    ($image:expr, $diff_id:expr) => {
        tracing::debug!(
            image = %$image,
            diff_id = %$crate::logging::short_id(&$diff_id),
            "Layer added"
        );
    };
}

#[macro_export]
macro_rules! log_layer_reused {
    ($image:expr, $diff_id:expr, $via:expr) => {
        tracing::debug!(
            image = %$image,
            diff_id = %$crate::logging::short_id(&$diff_id),
            via = $via,
            "Layer reused"
        );
    };
}

#[macro_export]
macro_rules! log_rebase {
    ($image:expr, $new_base:expr, $kept:expr) => {
        tracing::info!(
            image = %$image,
            new_base = %$new_base,
            kept_layers = $kept,
            "Rebase completed"
        );
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id_strips_algorithm() {
        assert_eq!(
            short_id("sha256:0123456789abcdef0123456789abcdef"),
            "0123456789ab"
        );
    }

    #[test]
    fn test_short_id_handles_short_input() {
        assert_eq!(short_id("abc"), "abc");
        assert_eq!(short_id(""), "");
    }

    #[test]
    fn test_short_id_handles_multibyte_input() {
        assert_eq!(short_id("sha256:aéééééé"), "aéééééé");
        assert_eq!(short_id("abcdefghijkl€x"), "abcdefghijkl");
    }
}
