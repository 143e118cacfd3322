//! # Configuration Aggregator
//!
//! Merges every registered source into one flat snapshot, by priority.
//!
//! The aggregator owns:
//! - the source list, kept sorted by descending priority
//! - the merged snapshot and the registered watchers
//! - the schema [`Metadata`] used by [`Config::validate`]
//! - the shutdown channel shared by every polling task it started

use crate::binding;
use crate::defaults::DefaultSource;
use crate::env::{EnvSource, EnvSourceOptions};
use crate::file::{FileSource, FileSourceOptions};
use crate::metadata::{Field, Metadata, ValidatorFn};
use crate::source::{Source, WatchCallback};
use crate::value::{ConfigMap, Value};
use crate::watcher::{Watcher, detect_changes, notify_watchers};
use chrono::{DateTime, Utc};
use errors::{ConfigError, ConfigResult};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

pub const DEFAULT_ENVIRONMENT: &str = "development";

/// Options for [`Config::new`].
///
/// With an empty `sources` list an [`EnvSource`] for `env_prefix` and one
/// optional [`FileSource`] per entry of `config_paths` are created. Non-empty
/// `defaults` always add a [`DefaultSource`].
#[derive(Default, Clone)]
pub struct LoadOptions {
    pub sources: Vec<Arc<dyn Source>>,
    /// Falls back to [`DEFAULT_ENVIRONMENT`] when empty.
    pub environment: String,
    pub config_paths: Vec<String>,
    /// Falls back to [`crate::env::DEFAULT_ENV_PREFIX`] when empty.
    pub env_prefix: String,
    pub defaults: ConfigMap,
    /// Run [`Config::validate`] after the first load.
    pub validation: bool,
    /// Run [`Config::start_watching`] after the first load; config path
    /// sources are created with polling enabled.
    pub hot_reload: bool,
    pub metadata: Option<Metadata>
}

struct ConfigState {
    sources: Vec<Arc<dyn Source>>,
    values: ConfigMap,
    watchers: Vec<Arc<dyn Watcher>>,
    metadata: Metadata,
    watching: bool,
    closed: bool
}

struct ConfigInner {
    state: RwLock<ConfigState>,
    load_lock: Mutex<()>,
    shutdown: watch::Sender<bool>
}

/// Multi-source configuration with priority merge and hot reload.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Combines environment variables, files, defaults and custom sources into a
/// single view where the highest priority source wins per key.
///
/// ## Usage
/// ```rust,no_run
/// use tbp_config::{Config, LoadOptions};
///
/// # async fn run() -> Result<(), tbp_config::ConfigError> {
/// let config = Config::new(LoadOptions {
///     env_prefix: "APP".to_string(),
///     config_paths: vec!["config/app.toml".to_string()],
///     ..Default::default()
/// })
/// .await?;
///
/// let port = config.get_int_with_default("server.port", 8080);
/// println!("listening on {port}");
/// config.close();
/// # Ok(())
/// # }
/// ```
///
/// ## Consistency
/// `load` never publishes a partial snapshot: if any source fails, the
/// previous snapshot stays in place. Loads are serialized so every change
/// set describes exactly one transition.
///
/// ## Lifecycle
/// Cloning is cheap and clones share state. After [`Config::close`] every
/// operation fails with [`ConfigError::Closed`].
#[derive(Clone)]
pub struct Config {
    inner: Arc<ConfigInner>
}

impl Default for Config {
    fn default() -> Self {
        Self::with_metadata(Metadata::new(DEFAULT_ENVIRONMENT))
    }
}

impl Config {
    /// Empty configuration without sources.
    pub fn with_metadata(metadata: Metadata) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(ConfigInner {
                state: RwLock::new(ConfigState {
                    sources: Vec::new(),
                    values: ConfigMap::new(),
                    watchers: Vec::new(),
                    metadata,
                    watching: false,
                    closed: false
                }),
                load_lock: Mutex::new(()),
                shutdown
            })
        }
    }

    /// Builds, loads and optionally validates and watches a configuration.
    pub async fn new(options: LoadOptions) -> ConfigResult<Self> {
        let LoadOptions {
            sources,
            environment,
            config_paths,
            env_prefix,
            defaults,
            validation,
            hot_reload,
            metadata
        } = options;

        let environment = if environment.is_empty() {
            DEFAULT_ENVIRONMENT.to_string()
        } else {
            environment
        };
        let config = Self::with_metadata(
            metadata.unwrap_or_else(|| Metadata::new(environment.clone()))
        );

        let sources = if sources.is_empty() {
            let env = EnvSource::new(EnvSourceOptions {
                prefix: env_prefix,
                ..Default::default()
            })?;
            let mut built: Vec<Arc<dyn Source>> = Vec::with_capacity(config_paths.len() + 1);
            built.push(Arc::new(env));
            for path in config_paths {
                built.push(Arc::new(FileSource::new(FileSourceOptions {
                    path,
                    optional: true,
                    watch_enabled: hot_reload,
                    ..Default::default()
                })?));
            }
            built
        } else {
            sources
        };

        for source in sources {
            config.add_source(source)?;
        }
        if !defaults.is_empty() {
            config.add_source(Arc::new(DefaultSource::new(defaults)))?;
        }

        config.load().await?;
        if validation {
            config.validate()?;
        }
        if hot_reload {
            config.start_watching().await?;
        }

        info!(
            environment = %environment,
            sources = config.source_names().len(),
            "Configuration initialized"
        );
        Ok(config)
    }

    /// Registers a source.
    ///
    /// A source that can validate itself is checked first and rejected on
    /// failure, leaving the source list untouched. Sources with equal
    /// priority keep their insertion order.
    pub fn add_source(&self, source: Arc<dyn Source>) -> ConfigResult<()> {
        if self.is_closed() {
            return Err(ConfigError::Closed);
        }

        let name = source.name();
        if let Some(validatable) = source.as_validatable() {
            if let Err(e) = validatable.validate() {
                warn!(source = %name, error = %e, "Configuration source rejected");
                return Err(ConfigError::SourceRejected {
                    source_name: name,
                    cause: Box::new(e)
                });
            }
        }

        let priority = source.priority();
        let mut state = self.inner.state.write();
        if state.closed {
            return Err(ConfigError::Closed);
        }
        let position = state
            .sources
            .iter()
            .position(|existing| existing.priority() < priority)
            .unwrap_or(state.sources.len());
        state.sources.insert(position, source);

        debug!(source = %name, priority, "Configuration source added");
        Ok(())
    }

    /// Reloads every source and publishes the merged snapshot.
    ///
    /// Sources are merged from lowest to highest priority. Watchers are
    /// notified in the background when the snapshot changed.
    pub async fn load(&self) -> ConfigResult<()> {
        let _serialized = self.inner.load_lock.lock().await;

        let sources = {
            let state = self.inner.state.read();
            if state.closed {
                return Err(ConfigError::Closed);
            }
            state.sources.clone()
        };

        let mut merged = ConfigMap::new();
        for source in sources.iter().rev() {
            let values = source
                .load()
                .await
                .map_err(|e| ConfigError::SourceLoad {
                    source_name: source.name(),
                    cause: Box::new(e)
                })?;
            merged.extend(values);
        }

        let (changes, watchers, keys) = {
            let mut state = self.inner.state.write();
            if state.closed {
                return Err(ConfigError::Closed);
            }
            let previous = std::mem::replace(&mut state.values, merged);
            let changes = detect_changes(&previous, &state.values);
            (changes, state.watchers.clone(), state.values.len())
        };

        debug!(
            sources = sources.len(),
            keys,
            changes = changes.len(),
            "Configuration loaded"
        );

        if !watchers.is_empty() && !changes.is_empty() {
            notify_watchers(watchers, changes);
        }
        Ok(())
    }

    /// Checks the snapshot against the field schema and custom validators.
    ///
    /// Every violation is reported; several are combined into
    /// [`ConfigError::Validation`].
    pub fn validate(&self) -> ConfigResult<()> {
        let state = self.inner.state.read();
        if state.closed {
            return Err(ConfigError::Closed);
        }

        match ConfigError::combine(state.metadata.validate(&state.values)) {
            None => Ok(()),
            Some(e) => Err(e)
        }
    }

    /// Binds the snapshot to `T`.
    ///
    /// A field named `port` inside a field named `server` reads the key
    /// `server.port`. Absent keys bind to their zero value unless the field
    /// metadata marks them required; see the `binding` module docs.
    pub fn unmarshal<T: DeserializeOwned>(&self) -> ConfigResult<T> {
        let state = self.inner.state.read();
        if state.closed {
            return Err(ConfigError::Closed);
        }
        binding::bind(&state.values, &state.metadata)
    }

    /// Starts change polling on every watchable source.
    ///
    /// Any change reported by a source triggers a full [`Config::load`], so
    /// priorities stay correct when only one source changed. Calling it
    /// again while already watching does nothing.
    pub async fn start_watching(&self) -> ConfigResult<()> {
        let (sources, shutdown) = {
            let mut state = self.inner.state.write();
            if state.closed {
                return Err(ConfigError::Closed);
            }
            if state.watching {
                debug!("Configuration sources already watched");
                return Ok(());
            }
            state.watching = true;
            (state.sources.clone(), self.inner.shutdown.subscribe())
        };

        for source in sources {
            let Some(watchable) = source.as_watchable() else {
                continue;
            };

            let name = source.name();
            let inner = Arc::downgrade(&self.inner);
            let reload_source = name.clone();
            let callback: WatchCallback = Arc::new(move |_: ConfigMap| {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                let config = Config { inner };
                let source_name = reload_source.clone();
                tokio::spawn(async move {
                    match config.load().await {
                        Ok(()) => debug!(source = %source_name, "Configuration reloaded"),
                        Err(ConfigError::Closed) => {}
                        Err(e) => {
                            warn!(source = %source_name, error = %e, "Configuration reload failed")
                        }
                    }
                });
            });

            watchable.watch(shutdown.clone(), callback).await?;
            debug!(source = %name, "Watching configuration source");
        }
        Ok(())
    }

    /// Persists `values` through the named source.
    pub async fn write_to_source(&self, source_name: &str, values: &ConfigMap) -> ConfigResult<()> {
        let source = {
            let state = self.inner.state.read();
            if state.closed {
                return Err(ConfigError::Closed);
            }
            state
                .sources
                .iter()
                .find(|source| source.name() == source_name)
                .cloned()
        }
        .ok_or_else(|| ConfigError::SourceNotFound {
            source_name: source_name.to_string()
        })?;

        let writable = source
            .as_writable()
            .ok_or_else(|| ConfigError::WriteUnsupported {
                source_name: source_name.to_string()
            })?;
        writable.write_config(values).await?;

        info!(source = source_name, keys = values.len(), "Configuration written to source");
        Ok(())
    }

    /// Stops every source and clears all state. Idempotent.
    pub fn close(&self) {
        let sources = {
            let mut state = self.inner.state.write();
            if state.closed {
                return;
            }
            state.closed = true;
            state.values.clear();
            state.watchers.clear();
            state.metadata.fields.clear();
            state.metadata.validators.clear();
            std::mem::take(&mut state.sources)
        };

        self.inner.shutdown.send_replace(true);
        for source in &sources {
            if let Some(stoppable) = source.as_stoppable() {
                stoppable.stop();
            }
        }

        info!(sources = sources.len(), "Configuration closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.read().closed
    }

    /// Source names in merge precedence order (highest priority first).
    pub fn source_names(&self) -> Vec<String> {
        self.inner
            .state
            .read()
            .sources
            .iter()
            .map(|source| source.name())
            .collect()
    }

    pub fn add_watcher<W: Watcher + 'static>(&self, watcher: W) {
        self.inner.state.write().watchers.push(Arc::new(watcher));
    }

    pub fn add_field_metadata(&self, key: impl Into<String>, field: Field) {
        self.inner.state.write().metadata.add_field(key, field);
    }

    pub fn add_validator(&self, validator: ValidatorFn) {
        self.inner.state.write().metadata.add_validator(validator);
    }

    pub fn metadata(&self) -> Metadata {
        self.inner.state.read().metadata.clone()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let state = self.inner.state.read();
        if state.closed {
            return None;
        }
        state.values.get(key).cloned()
    }

    /// Copy of the merged snapshot.
    pub fn get_all(&self) -> ConfigMap {
        self.inner.state.read().values.clone()
    }

    /// Copy of the merged snapshot with sensitive fields masked.
    pub fn get_all_redacted(&self) -> ConfigMap {
        let state = self.inner.state.read();
        state.metadata.redact(&state.values)
    }

    fn lookup(&self, key: &str) -> ConfigResult<Value> {
        let state = self.inner.state.read();
        if state.closed {
            return Err(ConfigError::Closed);
        }
        state
            .values
            .get(key)
            .cloned()
            .ok_or_else(|| ConfigError::KeyNotFound {
                key: key.to_string()
            })
    }

    fn convert<T>(
        &self,
        key: &str,
        target: &str,
        convert: impl FnOnce(&Value) -> Option<T>
    ) -> ConfigResult<T> {
        let value = self.lookup(key)?;
        convert(&value).ok_or_else(|| ConfigError::TypeConversion {
            key: key.to_string(),
            value: value.to_string(),
            target: target.to_string()
        })
    }

    /// Any scalar is rendered as text.
    pub fn get_string(&self, key: &str) -> ConfigResult<String> {
        self.convert(key, "string", |value| match value {
            Value::String(s) => Some(s.clone()),
            Value::Array(_) | Value::Map(_) => None,
            other => Some(other.to_string())
        })
    }

    pub fn get_int(&self, key: &str) -> ConfigResult<i64> {
        self.convert(key, "int", Value::to_i64)
    }

    pub fn get_float(&self, key: &str) -> ConfigResult<f64> {
        self.convert(key, "float64", Value::to_f64)
    }

    pub fn get_bool(&self, key: &str) -> ConfigResult<bool> {
        self.convert(key, "bool", Value::to_bool)
    }

    /// Integers are read as seconds; strings use the `1h30m` notation.
    pub fn get_duration(&self, key: &str) -> ConfigResult<Duration> {
        self.convert(key, "duration", Value::to_duration)
    }

    pub fn get_timestamp(&self, key: &str) -> ConfigResult<DateTime<Utc>> {
        self.convert(key, "time", Value::to_timestamp)
    }

    /// Arrays render element-wise; a string is split on commas.
    pub fn get_string_slice(&self, key: &str) -> ConfigResult<Vec<String>> {
        self.convert(key, "[]string", |value| match value {
            Value::Array(items) => Some(items.iter().map(ToString::to_string).collect()),
            Value::String(s) => Some(
                s.split(',')
                    .map(str::trim)
                    .filter(|part| !part.is_empty())
                    .map(str::to_string)
                    .collect()
            ),
            _ => None
        })
    }

    pub fn get_string_with_default(&self, key: &str, default: &str) -> String {
        self.get_string(key).unwrap_or_else(|_| default.to_string())
    }

    pub fn get_int_with_default(&self, key: &str, default: i64) -> i64 {
        self.get_int(key).unwrap_or(default)
    }

    pub fn get_float_with_default(&self, key: &str, default: f64) -> f64 {
        self.get_float(key).unwrap_or(default)
    }

    pub fn get_bool_with_default(&self, key: &str, default: bool) -> bool {
        self.get_bool(key).unwrap_or(default)
    }

    pub fn get_duration_with_default(&self, key: &str, default: Duration) -> Duration {
        self.get_duration(key).unwrap_or(default)
    }

    pub fn get_string_slice_with_default(&self, key: &str, default: &[&str]) -> Vec<String> {
        self.get_string_slice(key)
            .unwrap_or_else(|_| default.iter().map(|s| (*s).to_string()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Watchable;
    use crate::watcher::{ChangeAction, ChangeSet};
    use async_trait::async_trait;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct StaticSource {
        name: String,
        priority: i32,
        values: RwLock<ConfigMap>,
        failing: AtomicBool
    }

    impl StaticSource {
        fn new(name: &str, priority: i32, entries: &[(&str, Value)]) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                priority,
                values: RwLock::new(values(entries)),
                failing: AtomicBool::new(false)
            })
        }

        fn set(&self, key: &str, value: Value) {
            self.values.write().insert(key.to_string(), value);
        }
    }

    #[async_trait]
    impl Source for StaticSource {
        fn name(&self) -> String {
            self.name.clone()
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        async fn load(&self) -> ConfigResult<ConfigMap> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(ConfigError::InvalidSource {
                    reason: "backend unavailable".to_string()
                });
            }
            Ok(self.values.read().clone())
        }
    }

    fn values(entries: &[(&str, Value)]) -> ConfigMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn change_channel(config: &Config) -> mpsc::UnboundedReceiver<ChangeSet> {
        let (tx, rx) = mpsc::unbounded_channel();
        config.add_watcher(move |changes: &ChangeSet| {
            let _ = tx.send(changes.clone());
        });
        rx
    }

    #[tokio::test]
    async fn test_priority_is_independent_of_insertion_order() {
        for reversed in [false, true] {
            let low = StaticSource::new("low", 10, &[("k", Value::from("a"))]);
            let high = StaticSource::new("high", 100, &[("k", Value::from("b"))]);

            let config = Config::default();
            if reversed {
                config.add_source(high).unwrap();
                config.add_source(low).unwrap();
            } else {
                config.add_source(low).unwrap();
                config.add_source(high).unwrap();
            }
            config.load().await.unwrap();

            assert_eq!(config.get("k"), Some(Value::from("b")));
            assert_eq!(config.source_names(), vec!["high", "low"]);
        }
    }

    #[tokio::test]
    async fn test_equal_priority_keeps_insertion_order() {
        let config = Config::default();
        config
            .add_source(StaticSource::new("first", 50, &[("k", Value::from("first"))]))
            .unwrap();
        config
            .add_source(StaticSource::new("second", 50, &[("k", Value::from("second"))]))
            .unwrap();
        config.load().await.unwrap();

        assert_eq!(config.source_names(), vec!["first", "second"]);
        assert_eq!(config.get("k"), Some(Value::from("first")));
    }

    #[tokio::test]
    async fn test_failed_load_keeps_previous_snapshot() {
        let source = StaticSource::new("flaky", 50, &[("k", Value::Int(1))]);
        let config = Config::default();
        config.add_source(source.clone()).unwrap();
        config.load().await.unwrap();

        source.set("k", Value::Int(2));
        source.failing.store(true, Ordering::SeqCst);
        let err = config.load().await.unwrap_err();
        assert!(matches!(err, ConfigError::SourceLoad { ref source_name, .. } if source_name == "flaky"));
        assert_eq!(config.get("k"), Some(Value::Int(1)));
    }

    #[tokio::test]
    async fn test_reload_without_changes_does_not_notify() {
        let config = Config::default();
        config
            .add_source(StaticSource::new("static", 50, &[("k", Value::Int(1))]))
            .unwrap();
        config.load().await.unwrap();
        let snapshot = config.get_all();

        let mut rx = change_channel(&config);
        config.load().await.unwrap();

        assert_eq!(config.get_all(), snapshot);
        assert!(
            timeout(Duration::from_millis(200), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_override_notifies_single_update() {
        let config = Config::default();
        config
            .add_source(StaticSource::new("base", 10, &[("test.key", Value::from("old"))]))
            .unwrap();
        config.load().await.unwrap();

        let mut rx = change_channel(&config);
        config
            .add_source(StaticSource::new("override", 100, &[("test.key", Value::from("new"))]))
            .unwrap();
        config.load().await.unwrap();

        let changes = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(changes.len(), 1);
        let change = &changes["test.key"];
        assert_eq!(change.action, ChangeAction::Update);
        assert_eq!(change.old_value, Some(Value::from("old")));
        assert_eq!(change.new_value, Some(Value::from("new")));
        assert!(
            timeout(Duration::from_millis(200), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_typed_getters() {
        let config = Config::default();
        config
            .add_source(StaticSource::new("static", 50, &[
                ("port", Value::Float(8080.0)),
                ("workers", Value::from("16")),
                ("debug", Value::from("on")),
                ("timeout", Value::from("1m30s")),
                ("retry", Value::Int(5)),
                ("hosts", Value::from(vec!["a", "b"])),
                ("tags", Value::from("x, y")),
                ("name", Value::from("svc")),
            ]))
            .unwrap();
        config.load().await.unwrap();

        assert_eq!(config.get_int("port").unwrap(), 8080);
        assert_eq!(config.get_int("workers").unwrap(), 16);
        assert_eq!(config.get_float("workers").unwrap(), 16.0);
        assert!(config.get_bool("debug").unwrap());
        assert_eq!(config.get_duration("timeout").unwrap(), Duration::from_secs(90));
        assert_eq!(config.get_duration("retry").unwrap(), Duration::from_secs(5));
        assert_eq!(config.get_string("port").unwrap(), "8080");
        assert_eq!(config.get_string_slice("hosts").unwrap(), vec!["a", "b"]);
        assert_eq!(config.get_string_slice("tags").unwrap(), vec!["x", "y"]);

        let err = config.get_int("name").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::TypeConversion { ref key, ref value, .. } if key == "name" && value == "svc"
        ));
        assert!(matches!(
            config.get_bool("missing").unwrap_err(),
            ConfigError::KeyNotFound { .. }
        ));

        assert_eq!(config.get_int_with_default("name", 7), 7);
        assert_eq!(config.get_string_with_default("missing", "x"), "x");
        assert!(config.get_bool_with_default("missing", true));
        assert_eq!(
            config.get_duration_with_default("missing", Duration::from_secs(3)),
            Duration::from_secs(3)
        );
        assert_eq!(config.get_string_slice_with_default("missing", &["z"]), vec!["z"]);
    }

    #[tokio::test]
    async fn test_validate_required_field() {
        let config = Config::default();
        config.add_field_metadata("required.field", Field::new("required.field", "string").required());
        config.load().await.unwrap();

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("required.field"));

        config
            .add_source(StaticSource::new("supplier", 50, &[("required.field", Value::from("present"))]))
            .unwrap();
        config.load().await.unwrap();
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_validate_runs_custom_validators() {
        let config = Config::default();
        config
            .add_source(StaticSource::new("static", 50, &[("a", Value::Int(-1)), ("b", Value::Int(-2))]))
            .unwrap();
        config.add_validator(Arc::new(|key: &str, value: &Value| {
            if value.to_i64().is_some_and(|v| v < 0) {
                anyhow::bail!("{key} must not be negative");
            }
            Ok(())
        }));
        config.load().await.unwrap();

        let err = config.validate().unwrap_err();
        assert_eq!(err.errors().len(), 2);
    }

    #[tokio::test]
    async fn test_redacted_snapshot() {
        let config = Config::default();
        config
            .add_source(StaticSource::new("static", 50, &[
                ("db.password", Value::from("hunter2")),
                ("db.host", Value::from("localhost")),
            ]))
            .unwrap();
        config.add_field_metadata("db.password", Field::new("db.password", "string").sensitive());
        config.load().await.unwrap();

        let redacted = config.get_all_redacted();
        assert_eq!(redacted["db.password"], Value::from("***"));
        assert_eq!(redacted["db.host"], Value::from("localhost"));
        assert_eq!(config.get_all()["db.password"], Value::from("hunter2"));
    }

    #[tokio::test]
    async fn test_unmarshal() {
        #[derive(Debug, Deserialize)]
        struct Server {
            host: String,
            port: u16
        }

        #[derive(Debug, Deserialize)]
        struct App {
            server: Server,
            #[serde(default)]
            debug: bool
        }

        let config = Config::default();
        config
            .add_source(StaticSource::new("static", 50, &[
                ("server.host", Value::from("localhost")),
                ("server.port", Value::Int(9090)),
            ]))
            .unwrap();
        config.load().await.unwrap();

        let app: App = config.unmarshal().unwrap();
        assert_eq!(app.server.host, "localhost");
        assert_eq!(app.server.port, 9090);
        assert!(!app.debug);
    }

    #[tokio::test]
    async fn test_unmarshal_missing_keys_follow_field_metadata() {
        #[derive(Debug, Deserialize)]
        struct Server {
            host: String,
            port: u16
        }

        let config = Config::default();
        config
            .add_source(StaticSource::new("static", 50, &[("host", Value::from("x"))]))
            .unwrap();
        config.load().await.unwrap();

        let server: Server = config.unmarshal().unwrap();
        assert_eq!(server.host, "x");
        assert_eq!(server.port, 0);

        config.add_field_metadata("port", Field::new("port", "int").required());
        let err = config.unmarshal::<Server>().unwrap_err();
        assert!(matches!(err, ConfigError::RequiredFieldMissing { ref key } if key == "port"));
    }

    #[tokio::test]
    async fn test_reload_with_nan_does_not_notify() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.toml");
        std::fs::write(&path, "ratio = nan\nweights = [1.0, nan]\n").unwrap();

        let file = FileSource::new(FileSourceOptions {
            path: path.to_string_lossy().into_owned(),
            ..Default::default()
        })
        .unwrap();

        let config = Config::default();
        config.add_source(Arc::new(file)).unwrap();
        config.load().await.unwrap();
        assert!(config.get_float("ratio").unwrap().is_nan());

        let mut rx = change_channel(&config);
        config.load().await.unwrap();
        assert!(
            timeout(Duration::from_millis(200), rx.recv())
                .await
                .is_err()
        );
    }

    struct RegistrationCounter {
        registrations: AtomicUsize
    }

    #[async_trait]
    impl Source for RegistrationCounter {
        fn name(&self) -> String {
            "counter".to_string()
        }

        fn priority(&self) -> i32 {
            50
        }

        async fn load(&self) -> ConfigResult<ConfigMap> {
            Ok(ConfigMap::new())
        }

        fn as_watchable(&self) -> Option<&dyn Watchable> {
            Some(self)
        }
    }

    #[async_trait]
    impl Watchable for RegistrationCounter {
        async fn watch(
            &self,
            _shutdown: watch::Receiver<bool>,
            _callback: WatchCallback
        ) -> ConfigResult<()> {
            self.registrations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_start_watching_registers_once() {
        let counter = Arc::new(RegistrationCounter {
            registrations: AtomicUsize::new(0)
        });
        let config = Config::default();
        config.add_source(counter.clone()).unwrap();
        config.load().await.unwrap();

        config.start_watching().await.unwrap();
        config.start_watching().await.unwrap();
        assert_eq!(counter.registrations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_source_is_rejected() {
        let config = Config::default();
        let missing = FileSource::new(FileSourceOptions {
            path: "/nonexistent/app.toml".to_string(),
            ..Default::default()
        })
        .unwrap();

        let err = config.add_source(Arc::new(missing)).unwrap_err();
        assert!(matches!(err, ConfigError::SourceRejected { .. }));
        assert!(config.source_names().is_empty());
    }

    #[tokio::test]
    async fn test_write_to_source() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.toml");
        std::fs::write(&path, "[server]\nport = 8080\n").unwrap();

        let file = FileSource::new(FileSourceOptions {
            path: path.to_string_lossy().into_owned(),
            ..Default::default()
        })
        .unwrap();
        let file_name = file.name();

        let config = Config::default();
        config.add_source(Arc::new(file)).unwrap();
        config
            .add_source(StaticSource::new("static", 10, &[]))
            .unwrap();
        config.load().await.unwrap();

        let update = values(&[("server.port", Value::Int(9090))]);
        config.write_to_source(&file_name, &update).await.unwrap();
        config.load().await.unwrap();
        assert_eq!(config.get("server.port"), Some(Value::Int(9090)));

        assert!(matches!(
            config.write_to_source("static", &update).await.unwrap_err(),
            ConfigError::WriteUnsupported { .. }
        ));
        assert!(matches!(
            config.write_to_source("unknown", &update).await.unwrap_err(),
            ConfigError::SourceNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_hot_reload_through_file_polling() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.yaml");
        std::fs::write(&path, "feature:\n  enabled: false\n").unwrap();

        let file = FileSource::new(FileSourceOptions {
            path: path.to_string_lossy().into_owned(),
            watch_enabled: true,
            poll_interval: Some(Duration::from_millis(50)),
            ..Default::default()
        })
        .unwrap();

        let config = Config::default();
        config.add_source(Arc::new(file)).unwrap();
        config.load().await.unwrap();
        let mut rx = change_channel(&config);
        config.start_watching().await.unwrap();

        let staging = dir.path().join("app.yaml.staging");
        std::fs::write(&staging, "feature:\n  enabled: true\n").unwrap();
        let future = std::time::SystemTime::now() + Duration::from_secs(5);
        std::fs::File::options()
            .write(true)
            .open(&staging)
            .unwrap()
            .set_modified(future)
            .unwrap();
        std::fs::rename(&staging, &path).unwrap();

        let changes = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(changes["feature.enabled"].new_value, Some(Value::Bool(true)));
        assert_eq!(config.get("feature.enabled"), Some(Value::Bool(true)));

        config.close();
    }

    #[tokio::test]
    async fn test_close_is_terminal_and_idempotent() {
        let config = Config::default();
        config
            .add_source(StaticSource::new("static", 50, &[("k", Value::Int(1))]))
            .unwrap();
        config.load().await.unwrap();

        config.close();
        config.close();

        assert!(config.is_closed());
        assert!(config.source_names().is_empty());
        assert_eq!(config.get("k"), None);
        assert!(matches!(config.get_int("k").unwrap_err(), ConfigError::Closed));
        assert!(matches!(config.load().await.unwrap_err(), ConfigError::Closed));
        assert!(matches!(
            config
                .add_source(StaticSource::new("late", 50, &[]))
                .unwrap_err(),
            ConfigError::Closed
        ));
        assert!(matches!(config.start_watching().await.unwrap_err(), ConfigError::Closed));
    }
}
