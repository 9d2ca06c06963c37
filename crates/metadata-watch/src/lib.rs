//! Instance metadata watch loop.
//!
//! [`MetadataWatcher::watch`] blocks on the metadata server's
//! `wait_for_change` long poll and returns a [`ContainerDirective`] only when
//! the server reports new content (a new `etag`).

mod directive;
mod error;
mod watcher;

pub use directive::ContainerDirective;
pub use error::WatchError;
pub use watcher::{
    DEFAULT_METADATA_URL, HANG_TIMEOUT, MetadataWatcher, NO_TOKEN, REQUEST_TIMEOUT, RETRY_PAUSE,
    WatchConfig,
};
