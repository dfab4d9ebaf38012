use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::PluginConfig;
use crate::error::BuildError;

/// Path used for the root node in diagnostics.
pub const ROOT_PATH: &str = "$";

/// Closed set of component discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    Stage,
    Synchronizer,
    Wrap,
    Generator,
}

impl ComponentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Stage => "stage",
            ComponentKind::Synchronizer => "synchronizer",
            ComponentKind::Wrap => "wrap",
            ComponentKind::Generator => "generator",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentKind {
    type Err = BuildError;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "stage" => Ok(ComponentKind::Stage),
            "synchronizer" => Ok(ComponentKind::Synchronizer),
            "wrap" => Ok(ComponentKind::Wrap),
            "generator" => Ok(ComponentKind::Generator),
            other => Err(BuildError::UnsupportedComponent {
                component: other.to_string(),
            }),
        }
    }
}

/// Reference to a registered plugin plus the keys overriding its defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<PluginConfig>,
}

impl PluginRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: None,
        }
    }

    pub fn with_config(mut self, config: PluginConfig) -> Self {
        self.config = Some(config);
        self
    }
}

/// One node of an author-supplied pipeline document.
///
/// The document stays loosely typed on purpose: the discriminant and the
/// per-kind payload are checked by [`Schema::resolve`] at compile time, so a
/// bad node is reported with its position in the tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub library: Vec<Arc<Schema>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Arc<Schema>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child: Option<Arc<Schema>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generator: Option<PluginRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datajet: Option<PluginRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Value>,
}

/// A stage's own settings, carried by the `stage` field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StageConfig {
    /// Stop draining the generator after this many batches.
    pub max_batches: Option<u64>,
    /// Keep transmitting after a failed batch instead of stopping the stage.
    pub continue_on_error: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SynchronizerConfig {
    /// Upper bound on children executing at once. Unbounded when absent.
    pub max_concurrency: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct WrapConfig {
    wrapper: PluginRef,
}

/// Typed view of one schema node, borrowed from the document.
#[derive(Debug)]
pub enum ComponentSpec<'a> {
    Stage {
        generator: &'a PluginRef,
        datajet: &'a PluginRef,
        config: StageConfig,
    },
    Synchronizer {
        children: &'a [Arc<Schema>],
        config: SynchronizerConfig,
    },
    Wrap {
        wrapper: PluginRef,
        child: &'a Arc<Schema>,
    },
    Generator {
        generator: &'a PluginRef,
    },
}

impl ComponentSpec<'_> {
    pub fn kind(&self) -> ComponentKind {
        match self {
            ComponentSpec::Stage { .. } => ComponentKind::Stage,
            ComponentSpec::Synchronizer { .. } => ComponentKind::Synchronizer,
            ComponentSpec::Wrap { .. } => ComponentKind::Wrap,
            ComponentSpec::Generator { .. } => ComponentKind::Generator,
        }
    }
}

impl Schema {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read schema file: {}", path.display()))?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&content)
                .with_context(|| format!("Failed to parse schema JSON: {}", path.display()))
        } else {
            Self::from_yaml_str(&content)
                .with_context(|| format!("Failed to parse schema YAML: {}", path.display()))
        }
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// The node's discriminant; an absent `component` means a stage.
    pub fn kind(&self) -> std::result::Result<ComponentKind, BuildError> {
        match self.component.as_deref() {
            None => Ok(ComponentKind::Stage),
            Some(name) => name.parse(),
        }
    }

    /// Check the node's discriminant and required fields and return its
    /// typed payload. Children are not inspected.
    pub fn resolve(&self, path: &str) -> std::result::Result<ComponentSpec<'_>, BuildError> {
        match self.kind()? {
            ComponentKind::Stage => {
                let generator = self
                    .generator
                    .as_ref()
                    .ok_or_else(|| BuildError::malformed(path, "stage requires 'generator.name'"))?;
                let datajet = self
                    .datajet
                    .as_ref()
                    .ok_or_else(|| BuildError::malformed(path, "stage requires 'datajet.name'"))?;
                let config = typed_field(self.stage.as_ref(), path, "stage")?;
                Ok(ComponentSpec::Stage {
                    generator,
                    datajet,
                    config,
                })
            }
            ComponentKind::Synchronizer => {
                let config: SynchronizerConfig = typed_field(self.config.as_ref(), path, "config")?;
                if config.max_concurrency == Some(0) {
                    return Err(BuildError::malformed(
                        path,
                        "'config.maxConcurrency' must be at least 1",
                    ));
                }
                Ok(ComponentSpec::Synchronizer {
                    children: &self.children,
                    config,
                })
            }
            ComponentKind::Wrap => {
                let child = self
                    .child
                    .as_ref()
                    .ok_or_else(|| BuildError::malformed(path, "wrap requires a 'child'"))?;
                let config = self.config.as_ref().ok_or_else(|| {
                    BuildError::malformed(path, "wrap requires 'config.wrapper.name'")
                })?;
                let WrapConfig { wrapper } = serde_json::from_value(config.clone()).map_err(
                    |err| BuildError::malformed(path, format!("invalid wrap config: {err}")),
                )?;
                Ok(ComponentSpec::Wrap { wrapper, child })
            }
            ComponentKind::Generator => {
                let generator = self.generator.as_ref().ok_or_else(|| {
                    BuildError::malformed(path, "generator component requires 'generator.name'")
                })?;
                Ok(ComponentSpec::Generator { generator })
            }
        }
    }
}

fn typed_field<T: DeserializeOwned + Default>(
    value: Option<&Value>,
    path: &str,
    field: &str,
) -> std::result::Result<T, BuildError> {
    match value {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|err| BuildError::malformed(path, format!("invalid '{field}': {err}"))),
    }
}
