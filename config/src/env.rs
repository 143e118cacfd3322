//! # Environment Variable Source
//!
//! Loads configuration from environment variables following 12-factor app
//! principles.
//!
//! # Naming Convention
//! - Variables must start with `<PREFIX><SEPARATOR>` (default `TBP_`)
//! - `TBP_SERVER_PORT` becomes the dotted key `server.port`
//! - Explicit key mappings override the derived key for a raw variable name

use crate::source::{ENV_PRIORITY, Source};
use crate::value::{ConfigMap, Value, parse_bool, parse_duration, parse_timestamp};
use async_trait::async_trait;
use errors::{ConfigError, ConfigResult};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use validator::Validate;

/// Prefix used when none is configured.
pub const DEFAULT_ENV_PREFIX: &str = "TBP";

/// Separator between prefix and key segments when none is configured.
pub const DEFAULT_SEPARATOR: &str = "_";

const SUPPORTED_TYPES: [&str; 36] = [
    "string",
    "str",
    "int",
    "integer",
    "int8",
    "int16",
    "int32",
    "int64",
    "uint",
    "unsigned",
    "uint8",
    "uint16",
    "uint32",
    "uint64",
    "float32",
    "float",
    "float64",
    "bool",
    "boolean",
    "duration",
    "time",
    "timestamp",
    "stringslice",
    "[]string",
    "strings",
    "intslice",
    "[]int",
    "integers",
    "floatslice",
    "[]float64",
    "floats",
    "boolslice",
    "[]bool",
    "booleans",
    "[]float",
    "float64slice",
];

/// Options for [`EnvSource::new`].
///
/// Empty `prefix`/`separator` and a missing `priority` fall back to
/// [`DEFAULT_ENV_PREFIX`], [`DEFAULT_SEPARATOR`] and [`ENV_PRIORITY`].
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct EnvSourceOptions {
    #[serde(default)]
    #[validate(custom(function = "validate_env_fragment"))]
    pub prefix: String,

    #[serde(default)]
    #[validate(custom(function = "validate_env_fragment"))]
    pub separator: String,

    /// Raw variable name -> dotted configuration key.
    #[serde(default)]
    pub key_mapping: HashMap<String, String>,

    /// Dotted configuration key -> type hint (see [`EnvSource::supported_types`]).
    #[serde(default)]
    pub type_hints: HashMap<String, String>,

    #[serde(default)]
    pub case_sensitive: bool,

    #[serde(default)]
    pub priority: Option<i32>
}

fn validate_env_fragment(value: &str) -> Result<(), validator::ValidationError> {
    if value.contains('=') || value.contains('\0') {
        return Err(validator::ValidationError::new(
            "must not contain '=' or NUL characters"
        ));
    }
    Ok(())
}

/// Environment variable backed configuration source.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Collects every variable carrying the configured prefix, derives a dotted
/// key for it and coerces the raw string into a typed [`Value`].
///
/// ## Usage
/// ```rust,no_run
/// use tbp_config::{EnvSource, EnvSourceOptions, Source};
///
/// # async fn run() -> Result<(), tbp_config::ConfigError> {
/// let source = EnvSource::new(EnvSourceOptions {
///     prefix: "APP".to_string(),
///     ..Default::default()
/// })?;
/// let values = source.load().await?;
/// println!("server.port = {:?}", values.get("server.port"));
/// # Ok(())
/// # }
/// ```
///
/// ## Type Coercion
/// Values with a type hint are converted strictly and any failure aborts the
/// whole load. Without a hint the value is auto-detected in this order:
/// boolean, integer (no decimal point), float, duration, comma-separated
/// list, string.
#[derive(Debug)]
pub struct EnvSource {
    prefix: String,
    separator: String,
    case_sensitive: bool,
    priority: i32,
    key_mapping: RwLock<HashMap<String, String>>,
    type_hints: RwLock<HashMap<String, String>>
}

impl EnvSource {
    pub fn new(options: EnvSourceOptions) -> ConfigResult<Self> {
        options.validate().map_err(|e| ConfigError::InvalidSource {
            reason: e.to_string()
        })?;

        let separator = if options.separator.is_empty() {
            DEFAULT_SEPARATOR.to_string()
        } else {
            options.separator
        };
        let mut prefix = if options.prefix.is_empty() {
            DEFAULT_ENV_PREFIX.to_string()
        } else {
            options.prefix
        };
        if !prefix.ends_with(&separator) {
            prefix.push_str(&separator);
        }

        Ok(Self {
            prefix,
            separator,
            case_sensitive: options.case_sensitive,
            priority: options.priority.unwrap_or(ENV_PRIORITY),
            key_mapping: RwLock::new(options.key_mapping),
            type_hints: RwLock::new(options.type_hints)
        })
    }

    /// Prefix without the trailing separator.
    pub fn prefix(&self) -> &str {
        self.prefix
            .strip_suffix(&self.separator)
            .unwrap_or(&self.prefix)
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    pub fn add_key_mapping(&self, env_key: impl Into<String>, config_key: impl Into<String>) {
        self.key_mapping
            .write()
            .insert(env_key.into(), config_key.into());
    }

    pub fn add_type_hint(&self, config_key: impl Into<String>, type_hint: impl Into<String>) {
        self.type_hints
            .write()
            .insert(config_key.into(), type_hint.into());
    }

    pub fn key_mappings(&self) -> HashMap<String, String> {
        self.key_mapping.read().clone()
    }

    pub fn type_hints(&self) -> HashMap<String, String> {
        self.type_hints.read().clone()
    }

    /// Every type hint accepted by the strict conversion path.
    pub fn supported_types() -> &'static [&'static str] {
        &SUPPORTED_TYPES
    }

    /// All set variables carrying this source's prefix, with raw values.
    pub fn list_environment_variables(&self) -> HashMap<String, String> {
        environment()
            .filter(|(name, _)| self.matches_prefix(name))
            .collect()
    }

    /// Canonical variable name for a dotted key (reverse of the load mapping).
    pub fn env_var_name(&self, config_key: &str) -> String {
        let mapping = self.key_mapping.read();
        let mut mapped: Vec<&String> = mapping
            .iter()
            .filter(|(_, mapped_key)| mapped_key.as_str() == config_key)
            .map(|(env_key, _)| env_key)
            .collect();
        mapped.sort();
        if let Some(env_key) = mapped.first() {
            return (*env_key).clone();
        }

        format!(
            "{}{}",
            self.prefix,
            config_key.to_uppercase().replace('.', &self.separator)
        )
    }

    pub fn is_set(&self, config_key: &str) -> bool {
        env::var_os(self.env_var_name(config_key)).is_some()
    }

    /// Raw string value of the variable behind `config_key`.
    pub fn get_raw(&self, config_key: &str) -> Option<String> {
        env::var(self.env_var_name(config_key)).ok()
    }

    /// Sets the variable behind `config_key`.
    ///
    /// # Safety
    ///
    /// Mutates the process environment; the caller must guarantee no other
    /// thread reads or writes the environment concurrently.
    pub unsafe fn set_environment_variable(&self, config_key: &str, value: &str) {
        let name = self.env_var_name(config_key);
        unsafe { env::set_var(name, value) };
    }

    /// Removes the variable behind `config_key`.
    ///
    /// # Safety
    ///
    /// Same requirements as [`EnvSource::set_environment_variable`].
    pub unsafe fn unset_environment_variable(&self, config_key: &str) {
        let name = self.env_var_name(config_key);
        unsafe { env::remove_var(name) };
    }

    /// Checks that every key has its variable set, reporting all missing names at once.
    pub fn validate_environment(&self, required_keys: &[&str]) -> ConfigResult<()> {
        let missing: Vec<String> = required_keys
            .iter()
            .map(|key| self.env_var_name(key))
            .filter(|name| env::var_os(name).is_none())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::MissingEnvironment { names: missing })
        }
    }

    fn matches_prefix(&self, env_key: &str) -> bool {
        if self.case_sensitive {
            env_key.starts_with(&self.prefix)
        } else {
            env_key
                .to_uppercase()
                .starts_with(&self.prefix.to_uppercase())
        }
    }

    fn config_key_for(&self, env_key: &str) -> Option<String> {
        if let Some(mapped) = self.key_mapping.read().get(env_key) {
            return Some(mapped.clone());
        }

        let stripped = if self.case_sensitive {
            env_key.strip_prefix(&self.prefix)?.to_string()
        } else {
            env_key
                .to_uppercase()
                .strip_prefix(&self.prefix.to_uppercase())?
                .to_string()
        };

        let key = stripped.to_lowercase().replace(&self.separator, ".");
        if key.is_empty() { None } else { Some(key) }
    }

    fn convert_value(&self, env_key: &str, config_key: &str, raw: &str) -> ConfigResult<Value> {
        let hint = self.type_hints.read().get(config_key).cloned();
        match hint {
            Some(hint) => convert_by_type(env_key, raw, &hint),
            None => Ok(auto_convert(raw))
        }
    }
}

#[async_trait]
impl Source for EnvSource {
    fn name(&self) -> String {
        format!("env:{}", self.prefix())
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn load(&self) -> ConfigResult<ConfigMap> {
        let mut values = ConfigMap::new();

        for (env_key, raw) in environment() {
            if !self.matches_prefix(&env_key) {
                continue;
            }
            let Some(config_key) = self.config_key_for(&env_key) else {
                continue;
            };

            let value = self.convert_value(&env_key, &config_key, &raw)?;
            values.insert(config_key, value);
        }

        tracing::debug!(source = %self.name(), keys = values.len(), "Loaded environment variables");
        Ok(values)
    }
}

/// Process environment, skipping entries that are not valid UTF-8.
fn environment() -> impl Iterator<Item = (String, String)> {
    env::vars_os().filter_map(|(name, value)| Some((name.into_string().ok()?, value.into_string().ok()?)))
}

fn auto_convert(raw: &str) -> Value {
    if raw.is_empty() {
        return Value::String(String::new());
    }

    if let Some(b) = parse_bool(raw) {
        return Value::Bool(b);
    }

    if !raw.contains('.') {
        if let Ok(i) = raw.parse::<i64>() {
            return Value::Int(i);
        }
    }

    if let Ok(f) = raw.parse::<f64>() {
        if f.is_finite() {
            return Value::Float(f);
        }
    }

    if looks_like_duration(raw) {
        if let Some(d) = parse_duration(raw) {
            return Value::Duration(d);
        }
    }

    if raw.contains(',') {
        let parts = split_list(raw);
        if parts.len() > 1 {
            return Value::Array(parts.into_iter().map(Value::String).collect());
        }
    }

    Value::String(raw.to_string())
}

fn looks_like_duration(raw: &str) -> bool {
    raw.contains(['h', 'm', 's'])
        || raw.ends_with("us")
        || raw.ends_with("ns")
        || raw.ends_with("µs")
}

/// Comma split with trimming; empty elements are dropped.
fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

fn convert_by_type(env_key: &str, raw: &str, hint: &str) -> ConfigResult<Value> {
    let conversion_error = || ConfigError::TypeConversion {
        key: env_key.to_string(),
        value: raw.to_string(),
        target: hint.to_string()
    };

    let value = match hint.to_lowercase().as_str() {
        "string" | "str" => Value::String(raw.to_string()),
        "int" | "integer" | "int64" => Value::Int(parse_number::<i64>(raw).ok_or_else(conversion_error)?),
        "int8" => Value::Int(i64::from(parse_number::<i8>(raw).ok_or_else(conversion_error)?)),
        "int16" => Value::Int(i64::from(parse_number::<i16>(raw).ok_or_else(conversion_error)?)),
        "int32" => Value::Int(i64::from(parse_number::<i32>(raw).ok_or_else(conversion_error)?)),
        "uint" | "unsigned" | "uint64" => {
            Value::UInt(parse_number::<u64>(raw).ok_or_else(conversion_error)?)
        }
        "uint8" => Value::UInt(u64::from(parse_number::<u8>(raw).ok_or_else(conversion_error)?)),
        "uint16" => Value::UInt(u64::from(parse_number::<u16>(raw).ok_or_else(conversion_error)?)),
        "uint32" => Value::UInt(u64::from(parse_number::<u32>(raw).ok_or_else(conversion_error)?)),
        "float32" => Value::Float(parse_float::<f32>(raw).ok_or_else(conversion_error)?),
        "float" | "float64" => Value::Float(parse_float::<f64>(raw).ok_or_else(conversion_error)?),
        "bool" | "boolean" => Value::Bool(parse_bool(raw).ok_or_else(conversion_error)?),
        "duration" => Value::Duration(parse_duration(raw.trim()).ok_or_else(conversion_error)?),
        "time" | "timestamp" => Value::Timestamp(parse_timestamp(raw.trim()).ok_or_else(conversion_error)?),
        "stringslice" | "[]string" | "strings" => {
            Value::Array(split_list(raw).into_iter().map(Value::String).collect())
        }
        "intslice" | "[]int" | "integers" => {
            parse_list(env_key, raw, "integer", |part| parse_number::<i64>(part).map(Value::Int))?
        }
        "floatslice" | "[]float64" | "[]float" | "float64slice" | "floats" => {
            parse_list(env_key, raw, "float", |part| parse_float::<f64>(part).map(Value::Float))?
        }
        "boolslice" | "[]bool" | "booleans" => {
            parse_list(env_key, raw, "boolean", |part| parse_bool(part).map(Value::Bool))?
        }
        _ => {
            return Err(ConfigError::UnsupportedTypeHint {
                key: env_key.to_string(),
                hint: hint.to_string()
            });
        }
    };

    Ok(value)
}

fn parse_number<T: FromStr>(raw: &str) -> Option<T> {
    raw.trim().parse::<T>().ok()
}

/// Out-of-range input parses to infinity; only a literal `inf`/`nan` may be non-finite.
fn parse_float<T: FromStr + Into<f64>>(raw: &str) -> Option<f64> {
    let value: f64 = parse_number::<T>(raw)?.into();
    if value.is_finite() || is_non_finite_literal(raw) {
        Some(value)
    } else {
        None
    }
}

fn is_non_finite_literal(raw: &str) -> bool {
    let unsigned = raw.trim().trim_start_matches(['+', '-']).to_lowercase();
    matches!(unsigned.as_str(), "inf" | "infinity" | "nan")
}

/// Typed comma list; the first bad element fails the whole value with its index.
fn parse_list(
    env_key: &str,
    raw: &str,
    target: &str,
    parse: impl Fn(&str) -> Option<Value>
) -> ConfigResult<Value> {
    let mut items = Vec::new();
    for (index, part) in raw.split(',').enumerate() {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let item = parse(part).ok_or_else(|| ConfigError::SliceElement {
            key: env_key.to_string(),
            index,
            value: part.to_string(),
            target: target.to_string()
        })?;
        items.push(item);
    }
    Ok(Value::Array(items))
}
