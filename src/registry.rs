use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::config::{PluginConfig, merge_config};
use crate::dependencies::ComponentDependencies;
use crate::error::{BuildError, Result};
use crate::plugin::{Datajet, Generator, Wrapper};
use crate::plugins;
use crate::schema::PluginRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    Generator,
    Wrapper,
    Datajet,
}

impl PluginKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginKind::Generator => "generator",
            PluginKind::Wrapper => "wrapper",
            PluginKind::Datajet => "datajet",
        }
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type PluginConstructor<T> = Arc<
    dyn Fn(PluginConfig, &ComponentDependencies) -> anyhow::Result<Box<T>> + Send + Sync,
>;

/// A named plugin: its default configuration and the factory producing
/// configured instances.
pub struct PluginTemplate<T: ?Sized> {
    name: String,
    default_config: PluginConfig,
    factory: PluginConstructor<T>,
}

impl<T: ?Sized> PluginTemplate<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_config(&self) -> &PluginConfig {
        &self.default_config
    }

    pub fn merged_config(&self, supplied: Option<&PluginConfig>) -> PluginConfig {
        merge_config(&self.default_config, supplied)
    }
}

/// Name-keyed templates of one plugin kind.
pub struct TemplateRegistry<T: ?Sized> {
    kind: PluginKind,
    templates: HashMap<String, PluginTemplate<T>>,
}

impl<T: ?Sized> TemplateRegistry<T> {
    pub fn new(kind: PluginKind) -> Self {
        Self {
            kind,
            templates: HashMap::new(),
        }
    }

    pub fn kind(&self) -> PluginKind {
        self.kind
    }

    /// Register a template. Names are unique per kind; a second registration
    /// under the same name is rejected.
    pub fn register<F>(
        &mut self,
        name: impl Into<String>,
        default_config: PluginConfig,
        factory: F,
    ) -> Result<()>
    where
        F: Fn(PluginConfig, &ComponentDependencies) -> anyhow::Result<Box<T>>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        if self.templates.contains_key(&name) {
            return Err(BuildError::DuplicatePlugin {
                kind: self.kind,
                name,
            });
        }
        self.templates.insert(
            name.clone(),
            PluginTemplate {
                name,
                default_config,
                factory: Arc::new(factory),
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&PluginTemplate<T>> {
        self.templates
            .get(name)
            .ok_or_else(|| BuildError::PluginNotFound {
                kind: self.kind,
                name: name.to_string(),
                available: self.known().join(", "),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    /// Merge the template defaults with the reference's config and run the
    /// factory against `dependencies`.
    ///
    /// A factory may fail with a [`BuildError`] of its own (for instance an
    /// unresolved library reference); that error is surfaced unchanged.
    pub fn create(&self, plugin: &PluginRef, dependencies: &ComponentDependencies) -> Result<Box<T>> {
        let template = self.get(&plugin.name)?;
        let merged = template.merged_config(plugin.config.as_ref());
        debug!(
            kind = self.kind.as_str(),
            plugin = plugin.name.as_str(),
            keys = merged.len(),
            "Creating configured plugin"
        );
        (template.factory)(merged, dependencies).map_err(|source| {
            match source.downcast::<BuildError>() {
                Ok(build_error) => build_error,
                Err(source) => BuildError::PluginFactory {
                    kind: self.kind,
                    name: plugin.name.clone(),
                    source,
                },
            }
        })
    }

    pub fn known(&self) -> Vec<String> {
        let mut names: Vec<_> = self.templates.keys().cloned().collect();
        names.sort();
        names
    }
}

/// The three template registries consulted by the compiler.
pub struct PluginRegistry {
    generators: TemplateRegistry<dyn Generator>,
    wrappers: TemplateRegistry<dyn Wrapper>,
    datajets: TemplateRegistry<dyn Datajet>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            generators: TemplateRegistry::new(PluginKind::Generator),
            wrappers: TemplateRegistry::new(PluginKind::Wrapper),
            datajets: TemplateRegistry::new(PluginKind::Datajet),
        }
    }

    /// A registry holding the built-in plugins.
    pub fn with_defaults() -> Result<Self> {
        let mut registry = Self::new();
        plugins::register_defaults(&mut registry)?;
        Ok(registry)
    }

    pub fn generators(&self) -> &TemplateRegistry<dyn Generator> {
        &self.generators
    }

    pub fn generators_mut(&mut self) -> &mut TemplateRegistry<dyn Generator> {
        &mut self.generators
    }

    pub fn wrappers(&self) -> &TemplateRegistry<dyn Wrapper> {
        &self.wrappers
    }

    pub fn wrappers_mut(&mut self) -> &mut TemplateRegistry<dyn Wrapper> {
        &mut self.wrappers
    }

    pub fn datajets(&self) -> &TemplateRegistry<dyn Datajet> {
        &self.datajets
    }

    pub fn datajets_mut(&mut self) -> &mut TemplateRegistry<dyn Datajet> {
        &mut self.datajets
    }

    /// Registered names for one kind, sorted.
    pub fn known(&self, kind: PluginKind) -> Vec<String> {
        match kind {
            PluginKind::Generator => self.generators.known(),
            PluginKind::Wrapper => self.wrappers.known(),
            PluginKind::Datajet => self.datajets.known(),
        }
    }

    pub fn merged_config(&self, kind: PluginKind, plugin: &PluginRef) -> Result<PluginConfig> {
        let supplied = plugin.config.as_ref();
        match kind {
            PluginKind::Generator => Ok(self.generators.get(&plugin.name)?.merged_config(supplied)),
            PluginKind::Wrapper => Ok(self.wrappers.get(&plugin.name)?.merged_config(supplied)),
            PluginKind::Datajet => Ok(self.datajets.get(&plugin.name)?.merged_config(supplied)),
        }
    }
}
