//! Daemon error types.

use kube::Error as KubeError;
use thiserror::Error;

/// Errors that stop the kubed daemon.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Signal handler could not be installed
    #[error("Signal error: {0}")]
    Signal(#[from] std::io::Error),
}
