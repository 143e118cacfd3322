//! # Change Detection and Notification
//!
//! Diffs two merged snapshots and fans the resulting change set out to
//! registered watchers, each on its own supervised task.

use crate::value::{ConfigMap, Value};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error};

/// Source label attached to changes produced by a merged reload.
pub const MERGED_SOURCE_LABEL: &str = "merged";

/// Changes of one reload, keyed by dotted key.
pub type ChangeSet = HashMap<String, ConfigChange>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeAction {
    Add,
    Update,
    Delete
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeAction::Add => write!(f, "add"),
            ChangeAction::Update => write!(f, "update"),
            ChangeAction::Delete => write!(f, "delete")
        }
    }
}

/// A single key transition between two snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigChange {
    pub key: String,
    /// `None` for [`ChangeAction::Add`].
    pub old_value: Option<Value>,
    /// `None` for [`ChangeAction::Delete`].
    pub new_value: Option<Value>,
    pub source: String,
    pub action: ChangeAction
}

/// Observer of configuration reloads.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Receives the change set of every reload that actually changed something.
///
/// ## Usage
/// Closures taking `&ChangeSet` implement this trait directly:
/// ```rust,no_run
/// use tbp_config::{ChangeSet, Config, LoadOptions};
///
/// # async fn run(config: Config) {
/// config.add_watcher(|changes: &ChangeSet| {
///     for change in changes.values() {
///         println!("{} {}", change.action, change.key);
///     }
/// });
/// # }
/// ```
///
/// ## Isolation
/// Each watcher runs on its own task; a panic is logged and never reaches
/// sibling watchers or the caller of `load`.
#[async_trait]
pub trait Watcher: Send + Sync {
    async fn on_config_change(&self, changes: &ChangeSet);
}

#[async_trait]
impl<F> Watcher for F
where
    F: Fn(&ChangeSet) + Send + Sync
{
    async fn on_config_change(&self, changes: &ChangeSet) {
        (self)(changes);
    }
}

/// Structural diff of two snapshots.
pub fn detect_changes(old: &ConfigMap, new: &ConfigMap) -> ChangeSet {
    let mut changes = ChangeSet::new();

    for (key, new_value) in new {
        match old.get(key) {
            Some(old_value) if same_value(old_value, new_value) => {}
            Some(old_value) => {
                changes.insert(key.clone(), ConfigChange {
                    key: key.clone(),
                    old_value: Some(old_value.clone()),
                    new_value: Some(new_value.clone()),
                    source: MERGED_SOURCE_LABEL.to_string(),
                    action: ChangeAction::Update
                });
            }
            None => {
                changes.insert(key.clone(), ConfigChange {
                    key: key.clone(),
                    old_value: None,
                    new_value: Some(new_value.clone()),
                    source: MERGED_SOURCE_LABEL.to_string(),
                    action: ChangeAction::Add
                });
            }
        }
    }

    for (key, old_value) in old {
        if !new.contains_key(key) {
            changes.insert(key.clone(), ConfigChange {
                key: key.clone(),
                old_value: Some(old_value.clone()),
                new_value: None,
                source: MERGED_SOURCE_LABEL.to_string(),
                action: ChangeAction::Delete
            });
        }
    }

    changes
}

/// Structural equality where floats compare by bit pattern, so `NaN` equals itself.
fn same_value(old: &Value, new: &Value) -> bool {
    match (old, new) {
        (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| same_value(x, y))
        }
        (Value::Map(a), Value::Map(b)) => {
            a.len() == b.len()
                && a
                    .iter()
                    .zip(b)
                    .all(|((ka, va), (kb, vb))| ka == kb && same_value(va, vb))
        }
        _ => old == new
    }
}

/// Dispatches `changes` to every watcher without waiting for them.
pub(crate) fn notify_watchers(watchers: Vec<Arc<dyn Watcher>>, changes: ChangeSet) {
    let changes = Arc::new(changes);
    debug!(
        watchers = watchers.len(),
        changes = changes.len(),
        "Notifying configuration watchers"
    );

    for watcher in watchers {
        let changes = Arc::clone(&changes);
        spawn_supervised("config watcher", async move {
            watcher.on_config_change(&changes).await;
        });
    }
}

/// Runs `future` on its own task and logs it if it panics.
pub(crate) fn spawn_supervised<F>(label: &'static str, future: F)
where
    F: Future<Output = ()> + Send + 'static
{
    let handle = tokio::spawn(future);
    tokio::spawn(async move {
        if let Err(e) = handle.await {
            if e.is_panic() {
                error!(task = label, "Configuration callback panicked: {}", e);
            }
        }
    });
}
