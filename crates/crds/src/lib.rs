//! kubed CRD definitions
//!
//! Custom resources kubed watches but does not own. Their controllers live in
//! other operators; kubed only indexes them and keeps deleted copies.

pub mod cluster_alert;
pub mod dormant_database;

pub use cluster_alert::*;
pub use dormant_database::*;
