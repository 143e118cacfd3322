//! # TBP Configuration Errors
//!
//! Error taxonomy for the configuration aggregation engine.
//!
//! - Uses `thiserror` for structured error definitions
//! - Every variant names the offending key, source, field or path
//! - Combined validation failures keep every individual error

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the configuration crates.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load from source {source_name}: {cause}")]
    SourceLoad {
        source_name: String,
        #[source]
        cause: Box<ConfigError>
    },

    #[error("configuration file {} does not exist", path.display())]
    FileNotFound { path: PathBuf },

    #[error("failed to access configuration file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error
    },

    #[error("failed to parse {} as {format}: {reason}", path.display())]
    Parse {
        path: PathBuf,
        format: String,
        reason: String
    },

    #[error("failed to encode {format}: {reason}")]
    Serialize { format: String, reason: String },

    #[error("unsupported configuration format: {format}")]
    UnsupportedFormat { format: String },

    #[error("invalid source configuration: {reason}")]
    InvalidSource { reason: String },

    #[error("cannot convert '{value}' to {target} for '{key}'")]
    TypeConversion {
        key: String,
        value: String,
        target: String
    },

    #[error("cannot convert element {index} ('{value}') of '{key}' to {target}")]
    SliceElement {
        key: String,
        index: usize,
        value: String,
        target: String
    },

    #[error("unsupported type hint '{hint}' for '{key}'")]
    UnsupportedTypeHint { key: String, hint: String },

    #[error("configuration key '{key}' not found")]
    KeyNotFound { key: String },

    #[error("required configuration field '{key}' is missing")]
    RequiredFieldMissing { key: String },

    #[error("configuration field '{key}' is invalid: {reason}")]
    ConstraintViolation { key: String, reason: String },

    #[error("source {source_name} rejected: {cause}")]
    SourceRejected {
        source_name: String,
        #[source]
        cause: Box<ConfigError>
    },

    #[error("source {source_name} does not support writing")]
    WriteUnsupported { source_name: String },

    #[error("source {source_name} not found")]
    SourceNotFound { source_name: String },

    #[error("missing required environment variables: {}", names.join(", "))]
    MissingEnvironment { names: Vec<String> },

    #[error("failed to bind configuration: {message}")]
    Binding { message: String },

    #[error("configuration validation failed: {}", join_errors(errors))]
    Validation { errors: Vec<ConfigError> },

    #[error("configuration has been closed")]
    Closed
}

impl ConfigError {
    /// Builds a combined error, or `None` when nothing was collected.
    ///
    /// A single collected error is returned as-is instead of being wrapped.
    pub fn combine(mut errors: Vec<ConfigError>) -> Option<ConfigError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(ConfigError::Validation { errors })
        }
    }

    /// Flattened view of the individual errors carried by this one.
    pub fn errors(&self) -> Vec<&ConfigError> {
        match self {
            ConfigError::Validation { errors } => {
                errors.iter().flat_map(ConfigError::errors).collect()
            }
            other => vec![other]
        }
    }
}

fn join_errors(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_empty_is_none() {
        assert!(ConfigError::combine(Vec::new()).is_none());
    }

    #[test]
    fn test_combine_single_is_unwrapped() {
        let err = ConfigError::combine(vec![ConfigError::RequiredFieldMissing {
            key: "a.b".to_string()
        }])
        .unwrap();
        assert!(matches!(err, ConfigError::RequiredFieldMissing { .. }));
    }

    #[test]
    fn test_combined_message_names_every_key() {
        let err = ConfigError::combine(vec![
            ConfigError::RequiredFieldMissing {
                key: "server.port".to_string()
            },
            ConfigError::ConstraintViolation {
                key: "log.level".to_string(),
                reason: "value 'loud' not in [debug, info]".to_string()
            },
        ])
        .unwrap();

        let message = err.to_string();
        assert!(message.contains("server.port"));
        assert!(message.contains("log.level"));
        assert_eq!(err.errors().len(), 2);
    }

    #[test]
    fn test_source_load_keeps_cause() {
        let err = ConfigError::SourceLoad {
            source_name: "file:app.toml".to_string(),
            cause: Box::new(ConfigError::FileNotFound {
                path: PathBuf::from("app.toml")
            })
        };
        let message = err.to_string();
        assert!(message.contains("file:app.toml"));
        assert!(message.contains("app.toml does not exist"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_missing_environment_lists_all_names() {
        let err = ConfigError::MissingEnvironment {
            names: vec!["TBP_A".to_string(), "TBP_B".to_string()]
        };
        assert_eq!(
            err.to_string(),
            "missing required environment variables: TBP_A, TBP_B"
        );
    }
}
