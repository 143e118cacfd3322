//! # Configuration System
//!
//! Multi-source configuration aggregation for TBP services.
//!
//! This crate provides:
//! - Environment variable, file (TOML/YAML/JSON) and default value sources
//! - Priority merge into one flat, dotted-key snapshot
//! - Typed getters and serde struct binding
//! - Schema validation with custom validator functions
//! - Change detection, watchers and polling hot reload
//!
//! # Best Practices
//!
//! - Uses `validator` crate for source option validation
//! - Follows 12-factor app configuration principles
//! - Never publishes a partially loaded snapshot
//! - Thread-safe configuration access

mod binding;
pub mod config;
pub mod defaults;
pub mod env;
pub mod file;
pub mod metadata;
pub mod source;
pub mod value;
pub mod watcher;

pub use config::{Config, DEFAULT_ENVIRONMENT, LoadOptions};
pub use defaults::DefaultSource;
pub use env::{DEFAULT_ENV_PREFIX, DEFAULT_SEPARATOR, EnvSource, EnvSourceOptions};
pub use errors::{ConfigError, ConfigResult};
pub use file::{
    DEFAULT_POLL_INTERVAL, FileSource, FileSourceOptions, Format, flatten, interpolate_env,
    unflatten
};
pub use metadata::{Field, Metadata, ValidatorFn};
pub use source::{
    DEFAULT_PRIORITY, ENV_PRIORITY, FILE_PRIORITY, Source, Stoppable, Validatable, WatchCallback,
    Watchable, Writable
};
pub use validator::Validate;
pub use value::{ConfigMap, Value};
pub use watcher::{ChangeAction, ChangeSet, ConfigChange, Watcher, detect_changes};
