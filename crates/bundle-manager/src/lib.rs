//! Manages access to code intelligence bundles.
//!
//! Each upload of code intelligence data is stored as a bundle file in the bundle directory. The
//! [`BundleManager`] answers queries against these bundles. It opens bundles on demand through a
//! [`StoreOpener`], shares open bundles between concurrent queries, and closes them according to
//! the configured [`CachePolicy`](config::CachePolicy).

pub mod config;
pub mod logging;
mod manager;
pub mod metrics;
mod store;
pub mod types;

pub use bundle_cache::{CacheError, CancellationToken, RequestContext, Resource};
pub use manager::*;
pub use store::*;
pub use types::*;
