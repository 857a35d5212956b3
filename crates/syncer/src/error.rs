//! Syncer errors

use crate::object::ObjectKey;
use std::time::Duration;
use thiserror::Error;

/// Reasons a namespace selector annotation is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectorError {
    /// Two commas in a row, or a trailing comma
    #[error("empty requirement in selector")]
    EmptyRequirement,

    /// Parentheses do not pair up
    #[error("unbalanced parentheses in selector")]
    UnbalancedParentheses,

    /// Label key with characters a label key cannot hold
    #[error("invalid label key {0:?}")]
    InvalidKey(String),

    /// Label value with characters a label value cannot hold
    #[error("invalid label value {0:?}")]
    InvalidValue(String),

    /// `in`/`notin` with nothing between the parentheses
    #[error("empty value set for key {0:?}")]
    EmptySet(String),

    /// Something other than `=`, `==`, `!=`, `in` or `notin`
    #[error("unknown operator in requirement {0:?}")]
    UnknownOperator(String),
}

/// Errors returned by a [`ReplicaWriter`](crate::ReplicaWriter).
#[derive(Debug, Error)]
pub enum WriteError {
    /// The API server rejected the write
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The replica could not be rendered
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The write did not finish in time
    #[error("write timed out after {0:?}")]
    Timeout(Duration),

    /// The target holds an object this source does not own: not a replica
    /// at all, or a replica of another source
    #[error("{0} is not a replica of this source, left untouched")]
    NotReplica(ObjectKey),

    /// Shutdown was requested while the write was in flight
    #[error("write cancelled by shutdown")]
    Cancelled,

    /// Any other backend failure
    #[error("{0}")]
    Backend(String),
}
