//! # Default Values
//!
//! Static, lowest-priority configuration source.

use crate::source::{DEFAULT_PRIORITY, Source};
use crate::value::{ConfigMap, Value};
use async_trait::async_trait;
use errors::ConfigResult;
use parking_lot::RwLock;

/// Source backed by an in-memory map of default values.
#[derive(Debug, Default)]
pub struct DefaultSource {
    values: RwLock<ConfigMap>
}

impl DefaultSource {
    pub fn new(defaults: ConfigMap) -> Self {
        Self {
            values: RwLock::new(defaults)
        }
    }

    /// Adds or replaces a default value.
    pub fn add_default(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.write().insert(key.into(), value.into());
    }

    pub fn remove_default(&self, key: &str) {
        self.values.write().remove(key);
    }

    pub fn values(&self) -> ConfigMap {
        self.values.read().clone()
    }
}

#[async_trait]
impl Source for DefaultSource {
    fn name(&self) -> String {
        "defaults".to_string()
    }

    fn priority(&self) -> i32 {
        DEFAULT_PRIORITY
    }

    async fn load(&self) -> ConfigResult<ConfigMap> {
        Ok(self.values.read().clone())
    }
}
