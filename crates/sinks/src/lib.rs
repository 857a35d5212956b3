//! kubed sinks
//!
//! Non-authoritative consumers of watch events:
//! - `search_index`: keeps a queryable mirror of current object state
//! - `recycle_bin`: keeps snapshots of objects before they were deleted or changed
//!
//! Both receive [`Snapshot::redacted`] copies, so secret values never leave
//! the cluster through them.

pub mod recycle_bin;
pub mod search_index;
pub mod snapshot;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use recycle_bin::{FsRecycleBin, RecycleBin, RecycleBinError, RecycleBinSink, RecycledDocument};
pub use search_index::{DocumentKey, MemorySearchIndex, SearchIndex, SearchIndexSink};
pub use snapshot::{ContentDigest, REDACTED, Snapshot};
#[cfg(any(test, feature = "test-util"))]
pub use mock::{MemoryRecycleBin, RecycledEntry};
