//! # Configuration Schema
//!
//! Declarative field descriptions and the validation pass run over a merged
//! snapshot.

use crate::value::{ConfigMap, Value, parse_duration, parse_timestamp};
use errors::ConfigError;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Name given to metadata created without an explicit schema.
pub const DEFAULT_METADATA_NAME: &str = "tbp-config";

/// Replacement shown for sensitive values.
pub const REDACTED: &str = "***";

/// Custom check run against every merged key during validation.
pub type ValidatorFn = Arc<dyn Fn(&str, &Value) -> anyhow::Result<()> + Send + Sync>;

/// Schema entry for one dotted key.
///
/// Constraints only apply when [`crate::Config::validate`] runs; reads are
/// never blocked by them.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Field {
    pub name: String,

    /// Expected type name (`string`, `int`, `uint`, `float`, `number`,
    /// `bool`, `duration`, `time`, `array`, `map`); empty accepts anything.
    #[serde(rename = "type")]
    pub type_name: String,

    pub required: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,

    pub sensitive: bool,

    pub deprecated: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,

    /// Allowed values, compared against the value's string form.
    #[serde(rename = "enum", skip_serializing_if = "Vec::is_empty")]
    pub allowed_values: Vec<String>,

    /// Regular expression the value's string form must match.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>
}

impl Field {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            ..Default::default()
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn deprecated(mut self) -> Self {
        self.deprecated = true;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    pub fn with_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn with_allowed_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>
    {
        self.allowed_values = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    /// Checks a present value against the field's constraints.
    fn check(&self, key: &str, value: &Value, errors: &mut Vec<ConfigError>) {
        let violation = |reason: String| ConfigError::ConstraintViolation {
            key: key.to_string(),
            reason
        };

        if !self.type_name.is_empty() {
            match type_matches(&self.type_name, value) {
                Some(true) => {}
                Some(false) => {
                    errors.push(violation(format!(
                        "expected type {}, found {}",
                        self.type_name,
                        value.type_name()
                    )));
                    return;
                }
                None => {
                    errors.push(violation(format!("unknown field type {}", self.type_name)));
                    return;
                }
            }
        }

        if value.is_numeric() {
            if let Some(number) = value.to_f64() {
                if let Some(min) = self.min {
                    if number < min {
                        errors.push(violation(format!("value {value} is below minimum {min}")));
                    }
                }
                if let Some(max) = self.max {
                    if number > max {
                        errors.push(violation(format!("value {value} is above maximum {max}")));
                    }
                }
            }
        }

        if !self.allowed_values.is_empty() {
            let text = value.to_string();
            if !self.allowed_values.iter().any(|allowed| *allowed == text) {
                errors.push(violation(format!(
                    "value {text} is not one of [{}]",
                    self.allowed_values.join(", ")
                )));
            }
        }

        if let Some(pattern) = &self.pattern {
            match Regex::new(pattern) {
                Ok(regex) => {
                    let text = value.to_string();
                    if !regex.is_match(&text) {
                        errors.push(violation(format!(
                            "value {text} does not match pattern {pattern}"
                        )));
                    }
                }
                Err(e) => {
                    errors.push(violation(format!("invalid pattern {pattern}: {e}")));
                }
            }
        }
    }
}

/// `None` when the type name is not recognized.
fn type_matches(type_name: &str, value: &Value) -> Option<bool> {
    let matches = match type_name.to_lowercase().as_str() {
        "any" => true,
        "string" | "str" => matches!(value, Value::String(_)),
        "int" | "integer" | "int8" | "int16" | "int32" | "int64" => match value {
            Value::Int(_) | Value::UInt(_) => true,
            Value::Float(f) => f.fract() == 0.0,
            _ => false
        },
        "uint" | "unsigned" | "uint8" | "uint16" | "uint32" | "uint64" => match value {
            Value::UInt(_) => true,
            Value::Int(i) => *i >= 0,
            Value::Float(f) => f.fract() == 0.0 && *f >= 0.0,
            _ => false
        },
        "float" | "float32" | "float64" | "number" => value.is_numeric(),
        "bool" | "boolean" => matches!(value, Value::Bool(_)),
        "duration" => match value {
            Value::Duration(_) => true,
            Value::String(s) => parse_duration(s.trim()).is_some(),
            _ => false
        },
        "time" | "timestamp" => match value {
            Value::Timestamp(_) => true,
            Value::String(s) => parse_timestamp(s.trim()).is_some(),
            _ => false
        },
        "array" | "slice" | "list" => matches!(value, Value::Array(_)),
        "map" | "object" => matches!(value, Value::Map(_)),
        other if other.starts_with("[]") => matches!(value, Value::Array(_)),
        _ => return None
    };
    Some(matches)
}

/// Schema and custom validators of a [`crate::Config`].
#[derive(Clone, Serialize)]
pub struct Metadata {
    pub name: String,
    pub version: String,
    pub environment: String,
    pub fields: HashMap<String, Field>,
    #[serde(skip)]
    pub validators: Vec<ValidatorFn>
}

impl fmt::Debug for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metadata")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("environment", &self.environment)
            .field("fields", &self.fields)
            .field("validators", &self.validators.len())
            .finish()
    }
}

impl Metadata {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            name: DEFAULT_METADATA_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: environment.into(),
            fields: HashMap::new(),
            validators: Vec::new()
        }
    }

    pub fn add_field(&mut self, key: impl Into<String>, field: Field) {
        self.fields.insert(key.into(), field);
    }

    pub fn add_validator(&mut self, validator: ValidatorFn) {
        self.validators.push(validator);
    }

    pub fn is_sensitive(&self, key: &str) -> bool {
        self.fields.get(key).is_some_and(|field| field.sensitive)
    }

    /// Copy of `values` with sensitive fields replaced by [`REDACTED`].
    pub fn redact(&self, values: &ConfigMap) -> ConfigMap {
        values
            .iter()
            .map(|(key, value)| {
                if self.is_sensitive(key) {
                    (key.clone(), Value::String(REDACTED.to_string()))
                } else {
                    (key.clone(), value.clone())
                }
            })
            .collect()
    }

    /// Runs every field check, then every custom validator over every key.
    ///
    /// Nothing short-circuits; the returned list holds all violations in
    /// key order.
    pub fn validate(&self, values: &ConfigMap) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        let mut keys: Vec<&String> = self.fields.keys().collect();
        keys.sort();
        for key in keys {
            let field = &self.fields[key];
            match values.get(key.as_str()) {
                None | Some(Value::Null) => {
                    if field.required {
                        errors.push(ConfigError::RequiredFieldMissing { key: key.clone() });
                    }
                }
                Some(value) => {
                    if field.deprecated {
                        warn!(key = %key, "Deprecated configuration field is set");
                    }
                    field.check(key, value, &mut errors);
                }
            }
        }

        if !self.validators.is_empty() {
            let mut keys: Vec<&String> = values.keys().collect();
            keys.sort();
            for key in keys {
                let value = &values[key.as_str()];
                for validator in &self.validators {
                    if let Err(e) = validator(key, value) {
                        errors.push(ConfigError::ConstraintViolation {
                            key: key.clone(),
                            reason: e.to_string()
                        });
                    }
                }
            }
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn values(entries: &[(&str, Value)]) -> ConfigMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_new_metadata_defaults() {
        let metadata = Metadata::new("staging");
        assert_eq!(metadata.name, "tbp-config");
        assert_eq!(metadata.environment, "staging");
        assert!(!metadata.version.is_empty());
        assert!(metadata.fields.is_empty());
    }

    #[test]
    fn test_required_field_missing() {
        let mut metadata = Metadata::new("test");
        metadata.add_field("required.field", Field::new("required.field", "string").required());
        metadata.add_field("optional.field", Field::new("optional.field", "string"));

        let errors = metadata.validate(&ConfigMap::new());
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("required.field"));

        let errors = metadata.validate(&values(&[("required.field", Value::from("x"))]));
        assert!(errors.is_empty());
    }

    #[test]
    fn test_null_counts_as_missing() {
        let mut metadata = Metadata::new("test");
        metadata.add_field("db.host", Field::new("db.host", "").required());

        let errors = metadata.validate(&values(&[("db.host", Value::Null)]));
        assert!(matches!(errors[0], ConfigError::RequiredFieldMissing { .. }));
    }

    #[test]
    fn test_type_checks() {
        let mut metadata = Metadata::new("test");
        metadata.add_field("port", Field::new("port", "int"));
        metadata.add_field("json_port", Field::new("json_port", "int"));
        metadata.add_field("name", Field::new("name", "string"));
        metadata.add_field("timeout", Field::new("timeout", "duration"));
        metadata.add_field("started", Field::new("started", "timestamp"));
        metadata.add_field("hosts", Field::new("hosts", "[]string"));

        let ok = values(&[
            ("port", Value::Int(8080)),
            ("json_port", Value::Float(8080.0)),
            ("name", Value::from("svc")),
            ("timeout", Value::from("30s")),
            ("started", Value::from("2024-01-15T10:30:00Z")),
            ("hosts", Value::from(vec!["a"])),
        ]);
        assert!(metadata.validate(&ok).is_empty());

        let bad = values(&[
            ("port", Value::from("eighty")),
            ("json_port", Value::Float(80.5)),
            ("name", Value::Int(1)),
            ("timeout", Value::Duration(Duration::from_secs(1))),
        ]);
        let errors = metadata.validate(&bad);
        assert_eq!(errors.len(), 3);
        assert!(
            errors
                .iter()
                .all(|e| matches!(e, ConfigError::ConstraintViolation { .. }))
        );
    }

    #[test]
    fn test_unknown_type_is_reported() {
        let mut metadata = Metadata::new("test");
        metadata.add_field("k", Field::new("k", "complex"));
        let errors = metadata.validate(&values(&[("k", Value::Int(1))]));
        assert!(errors[0].to_string().contains("unknown field type"));
    }

    #[test]
    fn test_range_checks_across_numeric_types() {
        let mut metadata = Metadata::new("test");
        metadata.add_field(
            "workers",
            Field::new("workers", "number").with_range(Some(1.0), Some(64.0))
        );

        for ok in [Value::Int(8), Value::UInt(64), Value::Float(1.0)] {
            assert!(metadata.validate(&values(&[("workers", ok)])).is_empty());
        }
        for bad in [Value::Int(0), Value::UInt(65), Value::Float(64.5)] {
            assert_eq!(metadata.validate(&values(&[("workers", bad)])).len(), 1);
        }
    }

    #[test]
    fn test_enum_compares_string_forms() {
        let mut metadata = Metadata::new("test");
        metadata.add_field(
            "log.level",
            Field::new("log.level", "").with_allowed_values(["debug", "info", "warn"])
        );
        metadata.add_field("mode", Field::new("mode", "").with_allowed_values(["1", "2"]));

        assert!(
            metadata
                .validate(&values(&[("log.level", Value::from("info")), ("mode", Value::Int(2))]))
                .is_empty()
        );
        let errors = metadata.validate(&values(&[("log.level", Value::from("trace"))]));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("not one of"));
    }

    #[test]
    fn test_pattern_is_a_real_regex() {
        let mut metadata = Metadata::new("test");
        metadata.add_field(
            "service.name",
            Field::new("service.name", "string").with_pattern(r"^[a-z][a-z0-9-]*$")
        );

        assert!(
            metadata
                .validate(&values(&[("service.name", Value::from("billing-api"))]))
                .is_empty()
        );
        assert_eq!(
            metadata
                .validate(&values(&[("service.name", Value::from("Billing API"))]))
                .len(),
            1
        );
        assert_eq!(
            metadata
                .validate(&values(&[("service.name", Value::from(""))]))
                .len(),
            1
        );
    }

    #[test]
    fn test_invalid_pattern_is_a_violation() {
        let mut metadata = Metadata::new("test");
        metadata.add_field("k", Field::new("k", "").with_pattern("(unclosed"));
        let errors = metadata.validate(&values(&[("k", Value::from("x"))]));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("invalid pattern"));
    }

    #[test]
    fn test_custom_validators_run_on_every_key() {
        let mut metadata = Metadata::new("test");
        metadata.add_validator(Arc::new(|key: &str, value: &Value| {
            if key.ends_with(".url") && !value.to_string().starts_with("https://") {
                anyhow::bail!("must use https");
            }
            Ok(())
        }));
        metadata.add_field("name", Field::new("name", "string").required());

        let errors = metadata.validate(&values(&[
            ("api.url", Value::from("http://insecure")),
            ("cdn.url", Value::from("https://cdn")),
        ]));
        assert_eq!(errors.len(), 2);
        assert!(matches!(errors[0], ConfigError::RequiredFieldMissing { .. }));
        match &errors[1] {
            ConfigError::ConstraintViolation { key, reason } => {
                assert_eq!(key, "api.url");
                assert_eq!(reason, "must use https");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_redact_sensitive_fields() {
        let mut metadata = Metadata::new("test");
        metadata.add_field("db.password", Field::new("db.password", "string").sensitive());

        let redacted = metadata.redact(&values(&[
            ("db.password", Value::from("hunter2")),
            ("db.user", Value::from("app")),
        ]));
        assert_eq!(redacted["db.password"], Value::from("***"));
        assert_eq!(redacted["db.user"], Value::from("app"));
    }

    #[test]
    fn test_field_serializes_without_empty_constraints() {
        let field = Field::new("port", "int").required().with_default(8080);
        let json = serde_json::to_value(&field).unwrap();
        assert_eq!(json["type"], "int");
        assert_eq!(json["default_value"], 8080);
        assert!(json.get("pattern").is_none());
        assert!(json.get("enum").is_none());
    }
}
