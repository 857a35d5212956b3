//! Router and sink errors

use thiserror::Error;

/// Errors a sink may return from an event handler.
///
/// The router logs these and moves on to the next sink; they never stop a
/// watch loop.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Snapshot could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Local storage failure (e.g. the recycle bin directory)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The sink's backend rejected the call
    #[error("{sink} backend error: {message}")]
    Backend {
        /// Sink that failed
        sink: &'static str,
        /// Backend specific message
        message: String,
    },
}

/// Errors that end a router.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The watch stream terminated
    #[error("{0} watch stream ended")]
    StreamEnded(String),

    /// The watch task was aborted from outside
    #[error("{0} watch task was aborted")]
    Aborted(String),
}
