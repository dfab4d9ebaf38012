use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// Free-form configuration object handed to plugin factories.
pub type PluginConfig = Map<String, Value>;

/// Shallow merge: every supplied key replaces the default wholesale, nested
/// objects included.
pub fn merge_config(defaults: &PluginConfig, supplied: Option<&PluginConfig>) -> PluginConfig {
    let mut merged = defaults.clone();
    if let Some(supplied) = supplied {
        for (key, value) in supplied {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Deserialize a merged configuration into a plugin's typed config struct.
pub fn parse_config<T: DeserializeOwned>(config: PluginConfig) -> Result<T> {
    serde_json::from_value(Value::Object(config)).context("Invalid plugin configuration")
}

/// Build a [`PluginConfig`] from a `json!` object literal. Non-objects yield an
/// empty config.
pub fn config_from_value(value: Value) -> PluginConfig {
    match value {
        Value::Object(map) => map,
        _ => PluginConfig::new(),
    }
}
