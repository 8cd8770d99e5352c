use crate::utils::error::{DsiError, Result};
use crate::utils::validation::{validate_non_empty_string, Validate};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::Path;

fn default_dsi_studio_cmd() -> String {
    "dsi_studio".to_string()
}

fn default_timeout_seconds() -> u64 {
    7200
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchConfiguration {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

/// Connectometry 批次設定。
///
/// 參數區段的每個項目可以是 `{ "value": v, "description": ... }` 或直接是值。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectometryConfig {
    #[serde(default = "default_dsi_studio_cmd")]
    pub dsi_studio_cmd: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub core_parameters: Map<String, Value>,
    #[serde(default)]
    pub threshold_parameters: Map<String, Value>,
    #[serde(default)]
    pub analysis_parameters: Map<String, Value>,
    #[serde(default)]
    pub optional_parameters: Map<String, Value>,
    #[serde(default)]
    pub batch_configurations: Vec<BatchConfiguration>,
}

impl Default for ConnectometryConfig {
    fn default() -> Self {
        Self {
            dsi_studio_cmd: default_dsi_studio_cmd(),
            timeout_seconds: default_timeout_seconds(),
            core_parameters: Map::new(),
            threshold_parameters: Map::new(),
            analysis_parameters: Map::new(),
            optional_parameters: Map::new(),
            batch_configurations: Vec::new(),
        }
    }
}

/// 取出參數項目的值：物件取 `value` 欄位，其餘原樣回傳
pub fn parameter_value(item: &Value) -> Option<&Value> {
    match item {
        Value::Object(map) => map.get("value"),
        other => Some(other),
    }
}

impl ConnectometryConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DsiError::config(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }

        let content = std::fs::read_to_string(path)?;
        let config: ConnectometryConfig = serde_json::from_str(&content)?;
        tracing::info!(
            "📋 Loaded connectometry config with {} batch configuration(s)",
            config.batch_configurations.len()
        );
        Ok(config)
    }

    /// 四個參數區段依序合併，後面的區段覆蓋前面的同名參數
    pub fn defaults(&self) -> Map<String, Value> {
        let mut defaults = Map::new();
        for section in [
            &self.core_parameters,
            &self.threshold_parameters,
            &self.analysis_parameters,
            &self.optional_parameters,
        ] {
            for (key, item) in section {
                if let Some(value) = parameter_value(item) {
                    defaults.insert(key.clone(), value.clone());
                }
            }
        }
        defaults
    }

    /// core_parameters 裡的值，空值與 null 視為不存在
    pub fn core_value(&self, key: &str) -> Option<&Value> {
        self.core_parameters
            .get(key)
            .and_then(parameter_value)
            .filter(|value| !value.is_null())
    }

    pub fn find_batch(&self, name: &str) -> Option<&BatchConfiguration> {
        self.batch_configurations
            .iter()
            .find(|batch| batch.name == name)
    }
}

impl Validate for ConnectometryConfig {
    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for (index, batch) in self.batch_configurations.iter().enumerate() {
            validate_non_empty_string(&format!("batch_configurations[{}].name", index), &batch.name)?;
            if !seen.insert(batch.name.as_str()) {
                return Err(DsiError::ConfigValidationError {
                    field: format!("batch_configurations[{}].name", index),
                    message: format!("Duplicate batch name '{}'", batch.name),
                });
            }
        }
        Ok(())
    }
}
