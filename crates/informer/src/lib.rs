//! Resource event routing for kubed
//!
//! One [`Router`] runs per watched kind. It lists and watches the kind through
//! the API server, keeps a local copy of every object so it can hand sinks
//! typed `(old, new)` pairs, redelivers everything on each resync tick, and
//! fans every event out to the sinks registered for that kind.
//!
//! # Example
//!
//! ```no_run
//! use informer::{ApiSurface, Router};
//! use k8s_openapi::api::core::v1::Secret;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(client: kube::Client) -> Result<(), informer::RouterError> {
//! let surface = ApiSurface::discover(&client, &[""]).await;
//! let router = Router::<Secret>::new(
//!     client,
//!     Vec::new(),
//!     Duration::from_secs(300),
//!     CancellationToken::new(),
//! );
//! router.run(&surface).await
//! # }
//! ```

pub mod cache;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod router;
pub mod sink;

pub use cache::{Notification, ObjectCache};
pub use discovery::ApiSurface;
pub use dispatch::Dispatcher;
pub use error::{RouterError, SinkError};
pub use identity::ObjectIdentity;
pub use router::{EventStream, Router};
pub use sink::{EventSink, WatchedResource};
