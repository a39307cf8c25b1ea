use thiserror::Error;

use crate::query::PixelLayout;

/// Errors produced while configuring a client or talking to the inference service.
///
/// Fire-and-forget queries never return this type to the caller. Backends turn it
/// into an [`crate::InferenceEvent::Error`] and route it through the dispatch bridge.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The port is outside `1..=65535`.
    #[error("port must be in range 1-65535, got {0}")]
    InvalidPort(u16),

    /// The pixel buffer does not match the declared image dimensions.
    #[error(
        "pixel buffer holds {actual} bytes, expected {expected} for a {width}x{height} {layout:?} image"
    )]
    PixelBuffer {
        width: u32,
        height: u32,
        layout: PixelLayout,
        expected: usize,
        actual: usize,
    },

    /// The requested image format is neither JPEG nor PNG.
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("failed to encode image: {0}")]
    Encode(#[from] image::ImageError),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "http")]
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// The inference service answered with a non-success status.
    #[error("inference service returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed OSC packet: {0}")]
    Osc(&'static str),

    #[error("could not resolve host {0}")]
    Unresolved(String),

    /// The backend worker is no longer running.
    #[error("backend worker has stopped")]
    Stopped,

    /// A blocking call was made from a callback running on the backend's own worker,
    /// which would wait on itself forever.
    #[error("blocking call made from inside a callback on the backend worker")]
    Reentrant,
}

/// Error returned by a host callback to signal that it could not handle an event.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Outcome of a single host callback invocation.
pub type CallbackResult = Result<(), CallbackError>;
