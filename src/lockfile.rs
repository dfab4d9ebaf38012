use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::PluginConfig;
use crate::registry::{PluginKind, PluginRegistry};
use crate::schema::{ComponentKind, ComponentSpec, PluginRef, ROOT_PATH, Schema};

#[derive(Debug, Serialize)]
pub struct SchemaLock {
    pub generated_at: DateTime<Utc>,
    pub nodes: Vec<NodeLock>,
}

#[derive(Debug, Serialize)]
pub struct NodeLock {
    pub path: String,
    pub component: ComponentKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub plugins: Vec<PluginLock>,
}

#[derive(Debug, Serialize)]
pub struct PluginLock {
    pub kind: PluginKind,
    pub name: String,
    pub config_hash: String,
}

/// Pin every node of `schema` together with a digest of each plugin's merged
/// configuration. Nodes are listed depth first, library entries before
/// children.
pub fn build_lock(schema: &Schema, registry: &PluginRegistry) -> Result<SchemaLock> {
    let mut nodes = Vec::new();
    lock_node(schema, registry, ROOT_PATH, &mut nodes)?;
    Ok(SchemaLock {
        generated_at: Utc::now(),
        nodes,
    })
}

pub fn generate_lock(schema: &Schema, registry: &PluginRegistry, path: &Path) -> Result<()> {
    let lock = build_lock(schema, registry)?;
    let file = File::create(path)
        .with_context(|| format!("Failed to create lockfile: {}", path.display()))?;
    serde_yaml::to_writer(file, &lock)
        .with_context(|| format!("Failed to write lockfile: {}", path.display()))?;
    Ok(())
}

fn lock_node(
    schema: &Schema,
    registry: &PluginRegistry,
    path: &str,
    nodes: &mut Vec<NodeLock>,
) -> Result<()> {
    let spec = schema.resolve(path)?;
    let plugins = match &spec {
        ComponentSpec::Stage {
            generator, datajet, ..
        } => vec![
            lock_plugin(registry, PluginKind::Generator, generator)?,
            lock_plugin(registry, PluginKind::Datajet, datajet)?,
        ],
        ComponentSpec::Synchronizer { .. } => Vec::new(),
        ComponentSpec::Wrap { wrapper, .. } => {
            vec![lock_plugin(registry, PluginKind::Wrapper, wrapper)?]
        }
        ComponentSpec::Generator { generator } => {
            vec![lock_plugin(registry, PluginKind::Generator, generator)?]
        }
    };
    nodes.push(NodeLock {
        path: path.to_string(),
        component: spec.kind(),
        reference_id: schema.reference_id.clone(),
        plugins,
    });

    for (idx, entry) in schema.library.iter().enumerate() {
        lock_node(entry, registry, &format!("{path}.library[{idx}]"), nodes)?;
    }
    match spec {
        ComponentSpec::Synchronizer { children, .. } => {
            for (idx, child) in children.iter().enumerate() {
                lock_node(child, registry, &format!("{path}.children[{idx}]"), nodes)?;
            }
        }
        ComponentSpec::Wrap { child, .. } => {
            lock_node(child, registry, &format!("{path}.child"), nodes)?;
        }
        ComponentSpec::Stage { .. } | ComponentSpec::Generator { .. } => {}
    }
    Ok(())
}

fn lock_plugin(registry: &PluginRegistry, kind: PluginKind, plugin: &PluginRef) -> Result<PluginLock> {
    let merged = registry.merged_config(kind, plugin)?;
    Ok(PluginLock {
        kind,
        name: plugin.name.clone(),
        config_hash: hash_config(kind, &plugin.name, &merged)?,
    })
}

fn hash_config(kind: PluginKind, name: &str, config: &PluginConfig) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(name.as_bytes());
    // serde_json maps are key-ordered, so equal configs hash equally.
    hasher.update(serde_json::to_vec(config)?);
    Ok(format!("{:x}", hasher.finalize()))
}
