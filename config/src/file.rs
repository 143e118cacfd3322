//! # Configuration File Source
//!
//! Loads configuration from TOML, YAML or JSON files.
//!
//! - Format is taken from the options or detected from the file extension
//! - `${VAR}` and `${VAR:-default}` are substituted before parsing
//! - Nested tables are flattened into dotted keys
//! - Changes are picked up by polling the modification time

use crate::source::{
    FILE_PRIORITY, Source, Stoppable, Validatable, WatchCallback, Watchable, Writable
};
use crate::value::{ConfigMap, Value};
use crate::watcher::spawn_supervised;
use async_trait::async_trait;
use errors::{ConfigError, ConfigResult};
use parking_lot::RwLock;
use regex::{Captures, Regex};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use validator::Validate;

/// Interval between modification-time checks of a watched file.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

static ENV_REFERENCE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}"));

/// On-disk configuration format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// Detect from the file extension; unknown extensions read as TOML.
    #[default]
    Auto,
    Toml,
    Yaml,
    Json
}

impl Format {
    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Auto => "auto",
            Format::Toml => "toml",
            Format::Yaml => "yaml",
            Format::Json => "json"
        }
    }

    /// Format implied by the extension of `path`.
    pub fn detect(path: &Path) -> Format {
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();

        match extension.as_str() {
            "yaml" | "yml" => Format::Yaml,
            "json" => Format::Json,
            _ => Format::Toml
        }
    }

    fn resolve(self, path: &Path) -> Format {
        match self {
            Format::Auto => Format::detect(path),
            other => other
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Format {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "" | "auto" => Ok(Format::Auto),
            "toml" => Ok(Format::Toml),
            "yaml" => Ok(Format::Yaml),
            "json" => Ok(Format::Json),
            other => Err(ConfigError::UnsupportedFormat {
                format: other.to_string()
            })
        }
    }
}

/// Options for [`FileSource::new`].
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct FileSourceOptions {
    #[validate(length(min = 1))]
    pub path: String,

    /// `auto`, `toml`, `yaml` or `json`; empty means `auto`.
    #[serde(default)]
    #[validate(custom(function = "validate_format"))]
    pub format: String,

    #[serde(default)]
    pub optional: bool,

    #[serde(default)]
    pub watch_enabled: bool,

    #[serde(default)]
    pub priority: Option<i32>,

    #[serde(default)]
    pub poll_interval: Option<Duration>
}

fn validate_format(value: &str) -> Result<(), validator::ValidationError> {
    if value.parse::<Format>().is_err() {
        return Err(validator::ValidationError::new("unsupported file format"));
    }
    Ok(())
}

#[derive(Debug, Default)]
struct FileCache {
    values: ConfigMap,
    last_modified: Option<SystemTime>
}

struct FileInner {
    path: PathBuf,
    format: Format,
    options: FileSourceOptions,
    priority: i32,
    poll_interval: Duration,
    cache: RwLock<FileCache>,
    callbacks: RwLock<Vec<WatchCallback>>,
    polling: AtomicBool,
    stop_tx: watch::Sender<bool>
}

/// File backed configuration source.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Reads a structured configuration file and exposes it as flat dotted keys.
/// Arrays are kept under their own key and additionally exploded into
/// indexed keys (`servers.0.host`).
///
/// ## Usage
/// ```rust,no_run
/// use tbp_config::{FileSource, FileSourceOptions, Source};
///
/// # async fn run() -> Result<(), tbp_config::ConfigError> {
/// let source = FileSource::new(FileSourceOptions {
///     path: "config/app.yaml".to_string(),
///     optional: true,
///     ..Default::default()
/// })?;
/// let values = source.load().await?;
/// # Ok(())
/// # }
/// ```
///
/// ## Caching
/// A load returns the cached snapshot while the file's modification time is
/// not newer than the one recorded by the previous parse.
#[derive(Clone)]
pub struct FileSource {
    inner: Arc<FileInner>
}

impl fmt::Debug for FileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSource")
            .field("path", &self.inner.path)
            .field("format", &self.inner.format)
            .field("optional", &self.inner.options.optional)
            .field("watch_enabled", &self.inner.options.watch_enabled)
            .finish()
    }
}

impl FileSource {
    pub fn new(options: FileSourceOptions) -> ConfigResult<Self> {
        options.validate().map_err(|e| ConfigError::InvalidSource {
            reason: e.to_string()
        })?;
        let format = options.format.parse::<Format>()?;
        let (stop_tx, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(FileInner {
                path: PathBuf::from(&options.path),
                format,
                priority: options.priority.unwrap_or(FILE_PRIORITY),
                poll_interval: options.poll_interval.unwrap_or(DEFAULT_POLL_INTERVAL),
                options,
                cache: RwLock::new(FileCache::default()),
                callbacks: RwLock::new(Vec::new()),
                polling: AtomicBool::new(false),
                stop_tx
            })
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Declared format; may be [`Format::Auto`].
    pub fn format(&self) -> Format {
        self.inner.format
    }

    /// Format actually used for parsing and writing.
    pub fn resolved_format(&self) -> Format {
        self.inner.format.resolve(&self.inner.path)
    }

    pub fn is_optional(&self) -> bool {
        self.inner.options.optional
    }

    pub fn is_watch_enabled(&self) -> bool {
        self.inner.options.watch_enabled
    }

    /// Modification time recorded by the last parse, if any.
    pub fn last_modified(&self) -> Option<SystemTime> {
        self.inner.cache.read().last_modified
    }

    /// Interpolates, parses and flattens `content` without touching the cache.
    pub fn load_from_str(&self, content: &str, format: Format) -> ConfigResult<ConfigMap> {
        self.inner.parse(content, format.resolve(&self.inner.path))
    }
}

impl FileInner {
    async fn load(&self) -> ConfigResult<ConfigMap> {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if self.options.optional {
                    debug!(path = %self.path.display(), "Optional configuration file not present");
                    return Ok(ConfigMap::new());
                }
                return Err(ConfigError::FileNotFound {
                    path: self.path.clone()
                });
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: self.path.clone(),
                    source
                });
            }
        };
        let modified = metadata.modified().ok();

        {
            let cache = self.cache.read();
            if let (Some(cached), Some(current)) = (cache.last_modified, modified) {
                if current <= cached {
                    return Ok(cache.values.clone());
                }
            }
        }

        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| ConfigError::Io {
                path: self.path.clone(),
                source
            })?;
        let values = self.parse(&content, self.format.resolve(&self.path))?;

        let mut cache = self.cache.write();
        cache.values = values.clone();
        cache.last_modified = modified;
        debug!(path = %self.path.display(), keys = values.len(), "Parsed configuration file");

        Ok(values)
    }

    fn parse(&self, content: &str, format: Format) -> ConfigResult<ConfigMap> {
        let content = interpolate_env(content)?;
        let parse_error = |reason: String| ConfigError::Parse {
            path: self.path.clone(),
            format: format.to_string(),
            reason
        };

        let root = match format {
            Format::Toml => {
                let table: toml::Table =
                    toml::from_str(&content).map_err(|e| parse_error(e.to_string()))?;
                table
                    .into_iter()
                    .map(|(k, v)| (k, from_toml(v)))
                    .collect()
            }
            Format::Yaml => {
                let value: serde_yaml::Value =
                    serde_yaml::from_str(&content).map_err(|e| parse_error(e.to_string()))?;
                match from_yaml(value).map_err(parse_error)? {
                    Value::Map(map) => map,
                    Value::Null => BTreeMap::new(),
                    other => {
                        return Err(parse_error(format!(
                            "top-level value must be a mapping, found {}",
                            other.type_name()
                        )));
                    }
                }
            }
            Format::Json => {
                let value: serde_json::Value =
                    serde_json::from_str(&content).map_err(|e| parse_error(e.to_string()))?;
                match from_json(value) {
                    Value::Map(map) => map,
                    other => {
                        return Err(parse_error(format!(
                            "top-level value must be an object, found {}",
                            other.type_name()
                        )));
                    }
                }
            }
            Format::Auto => {
                return Err(ConfigError::UnsupportedFormat {
                    format: format.to_string()
                });
            }
        };

        Ok(flatten(root))
    }

    async fn poll(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        mut stop: watch::Receiver<bool>
    ) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;

        info!(path = %self.path.display(), "Watching configuration file");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.check_for_changes().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        self.polling.store(false, Ordering::SeqCst);
        info!(path = %self.path.display(), "Stopped watching configuration file");
    }

    async fn check_for_changes(&self) {
        let modified = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata.modified().ok(),
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "Failed to check configuration file");
                }
                return;
            }
        };

        let last_modified = self.cache.read().last_modified;
        let changed = match (modified, last_modified) {
            (Some(current), Some(cached)) => current > cached,
            _ => true
        };
        if !changed {
            return;
        }

        let values = match self.load().await {
            Ok(values) => values,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to reload configuration file");
                return;
            }
        };

        info!(path = %self.path.display(), "Configuration file changed");
        let callbacks = self.callbacks.read().clone();
        for callback in callbacks {
            let values = values.clone();
            spawn_supervised("file watch callback", async move {
                callback(values);
            });
        }
    }
}

#[async_trait]
impl Source for FileSource {
    fn name(&self) -> String {
        format!("file:{}", self.inner.path.display())
    }

    fn priority(&self) -> i32 {
        self.inner.priority
    }

    async fn load(&self) -> ConfigResult<ConfigMap> {
        self.inner.load().await
    }

    fn as_watchable(&self) -> Option<&dyn Watchable> {
        Some(self)
    }

    fn as_validatable(&self) -> Option<&dyn Validatable> {
        Some(self)
    }

    fn as_writable(&self) -> Option<&dyn Writable> {
        Some(self)
    }

    fn as_stoppable(&self) -> Option<&dyn Stoppable> {
        Some(self)
    }
}

#[async_trait]
impl Watchable for FileSource {
    /// Registers `callback`; the first call starts the polling task.
    ///
    /// Does nothing when watching is disabled for this source.
    async fn watch(
        &self,
        shutdown: watch::Receiver<bool>,
        callback: WatchCallback
    ) -> ConfigResult<()> {
        if !self.inner.options.watch_enabled {
            return Ok(());
        }
        let stop = self.inner.stop_tx.subscribe();
        if *stop.borrow() {
            return Err(ConfigError::InvalidSource {
                reason: format!("{} has been stopped", self.name())
            });
        }

        self.inner.callbacks.write().push(callback);

        if !self.inner.polling.swap(true, Ordering::SeqCst) {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(inner.poll(shutdown, stop));
        }
        Ok(())
    }
}

impl Validatable for FileSource {
    fn validate(&self) -> ConfigResult<()> {
        self.inner
            .options
            .validate()
            .map_err(|e| ConfigError::InvalidSource {
                reason: e.to_string()
            })?;

        if !self.inner.options.optional {
            match std::fs::metadata(&self.inner.path) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(ConfigError::FileNotFound {
                        path: self.inner.path.clone()
                    });
                }
                Err(source) => {
                    return Err(ConfigError::Io {
                        path: self.inner.path.clone(),
                        source
                    });
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Writable for FileSource {
    async fn write_config(&self, values: &ConfigMap) -> ConfigResult<()> {
        let format = self.resolved_format();
        let nested = Value::Map(unflatten(values));
        let serialize_error = |reason: String| ConfigError::Serialize {
            format: format.to_string(),
            reason
        };

        let content = match format {
            Format::Toml => {
                toml::to_string(&strip_nulls(nested)).map_err(|e| serialize_error(e.to_string()))?
            }
            Format::Yaml => {
                serde_yaml::to_string(&nested).map_err(|e| serialize_error(e.to_string()))?
            }
            Format::Json => serde_json::to_string_pretty(&nested)
                .map_err(|e| serialize_error(e.to_string()))?,
            Format::Auto => {
                return Err(ConfigError::UnsupportedFormat {
                    format: format.to_string()
                });
            }
        };

        tokio::fs::write(&self.inner.path, content)
            .await
            .map_err(|source| ConfigError::Io {
                path: self.inner.path.clone(),
                source
            })?;

        // The next load must re-read even when the mtime did not advance.
        self.inner.cache.write().last_modified = None;
        info!(path = %self.inner.path.display(), keys = values.len(), "Wrote configuration file");
        Ok(())
    }
}

impl Stoppable for FileSource {
    fn stop(&self) {
        self.inner.stop_tx.send_replace(true);
    }
}

/// Replaces `${NAME}` and `${NAME:-default}` with environment values.
///
/// A set, non-empty variable wins, then a non-empty default; otherwise the
/// reference is left untouched.
pub fn interpolate_env(content: &str) -> ConfigResult<String> {
    let pattern = ENV_REFERENCE
        .as_ref()
        .map_err(|e| ConfigError::InvalidSource {
            reason: e.to_string()
        })?;

    let result = pattern.replace_all(content, |caps: &Captures<'_>| {
        let reference = &caps[1];
        let (name, default) = match reference.split_once(":-") {
            Some((name, default)) => (name, default),
            None => (reference, "")
        };

        match std::env::var(name) {
            Ok(value) if !value.is_empty() => value,
            _ if !default.is_empty() => default.to_string(),
            _ => caps[0].to_string()
        }
    });

    Ok(result.into_owned())
}

/// Flattens nested maps into dotted keys.
///
/// Arrays stay under their own key and are also exploded into `key.N`
/// entries, recursing into array elements. Empty maps are kept as leaves.
pub fn flatten(nested: BTreeMap<String, Value>) -> ConfigMap {
    let mut out = ConfigMap::new();
    for (key, value) in nested {
        flatten_value(&mut out, key, value);
    }
    out
}

fn flatten_value(out: &mut ConfigMap, key: String, value: Value) {
    match value {
        Value::Map(entries) if !entries.is_empty() => {
            for (child, value) in entries {
                flatten_value(out, format!("{key}.{child}"), value);
            }
        }
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                flatten_value(out, format!("{key}.{index}"), item.clone());
            }
            out.insert(key, Value::Array(items));
        }
        other => {
            out.insert(key, other);
        }
    }
}

/// Rebuilds the nested structure from dotted keys.
///
/// Keys are applied in sorted order; a key whose parent already holds a
/// non-map value is skipped, so indexed `key.N` entries never overwrite the
/// array they were exploded from.
pub fn unflatten(flat: &ConfigMap) -> BTreeMap<String, Value> {
    let mut keys: Vec<&String> = flat.keys().collect();
    keys.sort();

    let mut root = BTreeMap::new();
    for key in keys {
        let segments: Vec<&str> = key.split('.').collect();
        insert_nested(&mut root, &segments, &flat[key]);
    }
    root
}

fn insert_nested(map: &mut BTreeMap<String, Value>, segments: &[&str], value: &Value) {
    let Some((last, parents)) = segments.split_last() else {
        return;
    };

    let mut current = map;
    for segment in parents {
        let entry = current
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Map(BTreeMap::new()));
        match entry {
            Value::Map(child) => current = child,
            _ => return
        }
    }

    let keeps_existing = matches!(current.get(*last), Some(Value::Map(_)))
        && matches!(value, Value::Map(m) if m.is_empty());
    if !keeps_existing {
        current.insert((*last).to_string(), value.clone());
    }
}

fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Map(entries) => Value::Map(
            entries
                .into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, strip_nulls(v)))
                .collect()
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .filter(|v| !v.is_null())
                .map(strip_nulls)
                .collect()
        ),
        other => other
    }
}

fn from_toml(value: toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::Int(i),
        toml::Value::Float(f) => Value::Float(f),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => {
            let text = dt.to_string();
            match chrono::DateTime::parse_from_rfc3339(&text) {
                Ok(parsed) => Value::Timestamp(parsed.with_timezone(&chrono::Utc)),
                Err(_) => Value::String(text)
            }
        }
        toml::Value::Array(items) => Value::Array(items.into_iter().map(from_toml).collect()),
        toml::Value::Table(table) => Value::Map(
            table
                .into_iter()
                .map(|(k, v)| (k, from_toml(v)))
                .collect()
        )
    }
}

fn from_yaml(value: serde_yaml::Value) -> Result<Value, String> {
    Ok(match value {
        serde_yaml::Value::Null => Value::Null,
        serde_yaml::Value::Bool(b) => Value::Bool(b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(u) = n.as_u64() {
                Value::UInt(u)
            } else {
                Value::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_yaml::Value::String(s) => Value::String(s),
        serde_yaml::Value::Sequence(items) => Value::Array(
            items
                .into_iter()
                .map(from_yaml)
                .collect::<Result<Vec<_>, _>>()?
        ),
        serde_yaml::Value::Mapping(mapping) => {
            let mut map = BTreeMap::new();
            for (key, value) in mapping {
                map.insert(yaml_key(key)?, from_yaml(value)?);
            }
            Value::Map(map)
        }
        serde_yaml::Value::Tagged(tagged) => from_yaml(tagged.value)?
    })
}

fn yaml_key(key: serde_yaml::Value) -> Result<String, String> {
    match key {
        serde_yaml::Value::String(s) => Ok(s),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::Null => Ok("null".to_string()),
        other => Err(format!("unsupported mapping key: {other:?}"))
    }
}

fn from_json(value: serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        serde_json::Value::String(s) => Value::String(s),
        serde_json::Value::Array(items) => Value::Array(items.into_iter().map(from_json).collect()),
        serde_json::Value::Object(object) => Value::Map(
            object
                .into_iter()
                .map(|(k, v)| (k, from_json(v)))
                .collect()
        )
    }
}
