use crate::utils::error::{DsiError, Result};
use regex::{Captures, Regex};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;

/// 將 overlay 遞迴合併進 base。
///
/// 物件逐鍵合併；陣列與純量整個取代；overlay 中的 `null` 保留 base 原值。
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (_, Value::Null) => {}
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        if !value.is_null() {
                            base_map.insert(key, value);
                        }
                    }
                }
            }
        }
        (base_slot, overlay_value) => *base_slot = overlay_value,
    }
}

/// 讀取 JSON 或 TOML 設定檔（依副檔名判斷，其餘一律當 JSON）
pub fn load_document(path: &Path) -> Result<Value> {
    if !path.exists() {
        return Err(DsiError::config(format!(
            "Configuration file not found: {}",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(path)?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);

    let mut document = if is_toml {
        let table: toml::Table = toml::from_str(&content)?;
        serde_json::to_value(table)?
    } else {
        serde_json::from_str(&content)?
    };

    let pattern = Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| DsiError::config(format!("Invalid substitution pattern: {}", e)))?;
    substitute_env_vars(&mut document, &pattern);
    Ok(document)
}

/// 替換字串值中的環境變數 (例如 ${DSI_STUDIO_HOME})，未設定的保留原樣
fn substitute_env_vars(value: &mut Value, pattern: &Regex) {
    match value {
        Value::String(text) => {
            if pattern.is_match(text) {
                let replaced = pattern
                    .replace_all(text, |caps: &Captures| {
                        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
                    })
                    .into_owned();
                *text = replaced;
            }
        }
        Value::Array(items) => items
            .iter_mut()
            .for_each(|item| substitute_env_vars(item, pattern)),
        Value::Object(map) => map
            .values_mut()
            .for_each(|item| substitute_env_vars(item, pattern)),
        _ => {}
    }
}

pub fn merged_with_defaults<T>(defaults: &T, overlay: Value) -> Result<T>
where
    T: Serialize + DeserializeOwned,
{
    let mut base = serde_json::to_value(defaults)?;
    deep_merge(&mut base, overlay);
    Ok(serde_json::from_value(base)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn defaults() -> Value {
        json!({
            "track_count": 100000,
            "atlases": ["AAL", "AAL2"],
            "tracking_parameters": {"method": 0, "fa_threshold": 0.0, "turning_angle": 0.0},
            "connectivity_options": {"connectivity_type": "pass"}
        })
    }

    #[test]
    fn test_nested_keys_keep_defaults() {
        let mut base = defaults();
        deep_merge(&mut base, json!({"tracking_parameters": {"fa_threshold": 0.15}}));

        assert_eq!(base["tracking_parameters"]["fa_threshold"], 0.15);
        assert_eq!(base["tracking_parameters"]["method"], 0);
        assert_eq!(base["tracking_parameters"]["turning_angle"], 0.0);
        assert_eq!(base["track_count"], 100000);
    }

    #[test]
    fn test_arrays_are_replaced() {
        let mut base = defaults();
        deep_merge(&mut base, json!({"atlases": ["Schaefer400"]}));
        assert_eq!(base["atlases"], json!(["Schaefer400"]));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let overlay = json!({
            "track_count": 50000,
            "tracking_parameters": {"method": 1},
            "extra": {"nested": [1, 2]}
        });

        let mut once = defaults();
        deep_merge(&mut once, overlay.clone());
        let mut twice = once.clone();
        deep_merge(&mut twice, overlay);

        assert_eq!(once, twice);
    }

    #[test]
    fn test_later_overlay_wins() {
        let mut base = defaults();
        deep_merge(&mut base, json!({"track_count": 1000}));
        deep_merge(&mut base, json!({"track_count": 2000}));
        assert_eq!(base["track_count"], 2000);
    }

    #[test]
    fn test_null_keeps_base_value() {
        let mut base = defaults();
        deep_merge(&mut base, json!({"track_count": null, "new_key": null}));
        assert_eq!(base["track_count"], 100000);
        assert!(base.get("new_key").is_none());
    }

    #[test]
    fn test_load_toml_document() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "track_count = 5000\n[tracking_parameters]\nmethod = 2").unwrap();

        let value = load_document(file.path()).unwrap();
        assert_eq!(value["track_count"], 5000);
        assert_eq!(value["tracking_parameters"]["method"], 2);
    }

    #[test]
    fn test_env_vars_are_substituted_in_strings() {
        std::env::set_var("DSI_TOOLKIT_TEST_HOME", "/opt/dsi");
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"dsi_studio_cmd": "${{DSI_TOOLKIT_TEST_HOME}}/dsi_studio", "atlases": ["${{DSI_TOOLKIT_UNSET_VAR}}"], "track_count": 10}}"#
        )
        .unwrap();

        let value = load_document(file.path()).unwrap();
        assert_eq!(value["dsi_studio_cmd"], "/opt/dsi/dsi_studio");
        assert_eq!(value["atlases"][0], "${DSI_TOOLKIT_UNSET_VAR}");
        assert_eq!(value["track_count"], 10);
    }

    #[test]
    fn test_load_missing_document_fails() {
        let result = load_document(Path::new("/nonexistent/connectivity_config.json"));
        assert!(matches!(result, Err(DsiError::ConfigError { .. })));
    }
}
