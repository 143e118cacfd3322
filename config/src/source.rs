//! # Configuration Sources
//!
//! The contract every configuration origin implements, plus the optional
//! capabilities a source may expose.
//!
//! Capabilities are discovered through the `as_*` accessors on [`Source`]; each
//! defaults to `None`, so a source only opts into what it supports.

use crate::value::ConfigMap;
use async_trait::async_trait;
use errors::ConfigResult;
use std::sync::Arc;
use tokio::sync::watch;

/// Priority of the environment variable source.
pub const ENV_PRIORITY: i32 = 100;

/// Priority of file sources.
pub const FILE_PRIORITY: i32 = 50;

/// Priority of the static defaults source.
pub const DEFAULT_PRIORITY: i32 = 10;

/// Callback invoked by a watchable source with its freshly loaded values.
pub type WatchCallback = Arc<dyn Fn(ConfigMap) + Send + Sync>;

/// A configuration origin contributing flattened key/value pairs.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Abstracts environment variables, files and static defaults behind one
/// loading contract so the aggregator can merge them by priority.
///
/// ## Contract
/// - `load` returns an already-flattened `dotted.key -> value` map owned by
///   the caller; it must not hand out references into source state.
/// - `priority` is fixed for the lifetime of the source; higher wins.
#[async_trait]
pub trait Source: Send + Sync {
    /// Stable name used in logs and error messages.
    fn name(&self) -> String;

    /// Merge priority (higher overrides lower on key collision).
    fn priority(&self) -> i32;

    /// Loads the current values of this source.
    async fn load(&self) -> ConfigResult<ConfigMap>;

    fn as_watchable(&self) -> Option<&dyn Watchable> {
        None
    }

    fn as_validatable(&self) -> Option<&dyn Validatable> {
        None
    }

    fn as_writable(&self) -> Option<&dyn Writable> {
        None
    }

    fn as_stoppable(&self) -> Option<&dyn Stoppable> {
        None
    }
}

/// Push-style change notification.
#[async_trait]
pub trait Watchable: Send + Sync {
    /// Registers `callback` and starts watching until `shutdown` flips to
    /// `true` or the source is stopped.
    async fn watch(
        &self,
        shutdown: watch::Receiver<bool>,
        callback: WatchCallback
    ) -> ConfigResult<()>;
}

/// Self-check run when the source is admitted into a [`crate::Config`].
pub trait Validatable: Send + Sync {
    fn validate(&self) -> ConfigResult<()>;
}

/// Persistence of flat values back into the origin.
#[async_trait]
pub trait Writable: Send + Sync {
    async fn write_config(&self, values: &ConfigMap) -> ConfigResult<()>;
}

/// Teardown of background work owned by the source.
pub trait Stoppable: Send + Sync {
    fn stop(&self);
}
