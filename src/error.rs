/// imgkit error types and handling utilities
use std::sync::Arc;
use thiserror::Error;

/// Main error type for image operations.
///
/// Cloneable so a single stored failure (see [`crate::previous::PreviousImage`])
/// can be handed to every caller that observes it.
#[derive(Debug, Clone, Error)]
pub enum ImageError {
    /// Image or its config is absent
    #[error("failed to {what}, image '{image}' does not exist")]
    NotFound { image: String, what: String },

    /// Reuse target missing from the previous image
    #[error("image '{image}' does not contain layer with diff ID '{diff_id}'")]
    LayerNotFound { image: String, diff_id: String },

    /// Rebase anchor absent from the current layer stack
    #[error("'{diff_id}' not found in '{image}' during rebase")]
    SplitPointNotFound { image: String, diff_id: String },

    #[error("image '{image}' has no layers")]
    EmptyImage { image: String },

    #[error("failed to read base image '{base}': {reason}")]
    BaseImageUnreadable { base: String, reason: String },

    /// Exported archive violates the single-image manifest shape
    #[error("archive for image '{image}' is corrupt: {reason}")]
    ArchiveCorrupt { image: String, reason: String },

    /// Post-save confirmation failed
    #[error("save image '{image}': {reason}")]
    SaveFailed { image: String, reason: String },

    #[error("{operation} is not supported: {reason}")]
    BackendUnsupported { operation: String, reason: String },

    #[error("invalid reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("{context}: {source}")]
    Json {
        context: String,
        #[source]
        source: Arc<serde_json::Error>,
    },

    /// Failure reported by the container daemon
    #[error("daemon error in {context}: {message}")]
    Daemon { context: String, message: String },

    /// Failure reported by the registry
    #[error("registry error in {context}: {message}")]
    Registry { context: String, message: String },
}

pub type Result<T> = std::result::Result<T, ImageError>;

impl ImageError {
    pub fn io(context: impl Into<String>, err: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source: Arc::new(err),
        }
    }

    pub fn json(context: impl Into<String>, err: serde_json::Error) -> Self {
        Self::Json {
            context: context.into(),
            source: Arc::new(err),
        }
    }

    pub fn daemon(context: impl Into<String>, message: impl ToString) -> Self {
        Self::Daemon {
            context: context.into(),
            message: message.to_string(),
        }
    }

    pub fn registry(context: impl Into<String>, message: impl ToString) -> Self {
        Self::Registry {
            context: context.into(),
            message: message.to_string(),
        }
    }

    pub fn not_found(image: &str, what: &str) -> Self {
        Self::NotFound {
            image: image.to_string(),
            what: what.to_string(),
        }
    }
}

/// Attach context to a std::io result, like `anyhow::Context` does.
pub(crate) trait IoContext<T> {
    fn io_context<C: Into<String>>(self, context: impl FnOnce() -> C) -> Result<T>;
}

impl<T> IoContext<T> for std::result::Result<T, std::io::Error> {
    fn io_context<C: Into<String>>(self, context: impl FnOnce() -> C) -> Result<T> {
        self.map_err(|e| ImageError::io(context(), e))
    }
}
