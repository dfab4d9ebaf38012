//! Recursive schema compilation.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::dependencies::ComponentDependencies;
use crate::error::{BuildError, Result};
use crate::pipeline::{BuiltNode, GeneratorNode, StageNode, SynchronizerNode, WrapNode};
use crate::registry::PluginRegistry;
use crate::schema::{ComponentKind, ComponentSpec, ROOT_PATH, Schema};

/// Compile `schema` into an executable pipeline.
///
/// Without `dependencies` a default context is synthesized from the
/// environment. Recursive steps always receive the context derived by their
/// parent.
#[instrument(skip_all)]
pub fn build_pipeline(
    registry: &PluginRegistry,
    schema: impl Into<Arc<Schema>>,
    dependencies: Option<ComponentDependencies>,
) -> Result<BuiltNode> {
    let schema = schema.into();
    let dependencies = dependencies
        .unwrap_or_else(ComponentDependencies::from_env)
        .with_root_schema(schema.clone());
    let node = compile(registry, &schema, &dependencies, ROOT_PATH)?;
    debug!(
        kind = node.kind().as_str(),
        name = node.descriptor().name.as_str(),
        "Pipeline built"
    );
    Ok(node)
}

fn compile(
    registry: &PluginRegistry,
    schema: &Arc<Schema>,
    inherited: &ComponentDependencies,
    path: &str,
) -> Result<BuiltNode> {
    // Shape errors surface before any plugin is constructed.
    let spec = schema.resolve(path)?;
    let dependencies = derive_dependencies(registry, schema, spec.kind(), inherited, path)?;
    let _entered = dependencies.span().enter();

    match spec {
        ComponentSpec::Stage {
            generator,
            datajet,
            config,
        } => {
            let generator = registry.generators().create(generator, &dependencies)?;
            let datajet = registry.datajets().create(datajet, &dependencies)?;
            Ok(BuiltNode::Stage(StageNode::new(path, generator, datajet, config)))
        }
        ComponentSpec::Synchronizer { children, config } => {
            let children = children
                .iter()
                .enumerate()
                .map(|(idx, child)| {
                    compile(registry, child, &dependencies, &format!("{path}.children[{idx}]"))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(BuiltNode::Synchronizer(SynchronizerNode::new(children, config)))
        }
        ComponentSpec::Wrap { wrapper, child } => {
            let wrapper = registry.wrappers().create(&wrapper, &dependencies)?;
            let child = compile(registry, child, &dependencies, &format!("{path}.child"))?;
            Ok(BuiltNode::Wrap(WrapNode::new(wrapper, child)))
        }
        ComponentSpec::Generator { generator } => {
            let generator = registry.generators().create(generator, &dependencies)?;
            Ok(BuiltNode::Generator(GeneratorNode::new(generator)))
        }
    }
}

/// Build the node's `library` against the incoming context, so entries see
/// neither each other nor themselves, then layer them for the subtree.
fn derive_dependencies(
    registry: &PluginRegistry,
    schema: &Arc<Schema>,
    kind: ComponentKind,
    inherited: &ComponentDependencies,
    path: &str,
) -> Result<ComponentDependencies> {
    let mut entries: Vec<(String, BuiltNode)> = Vec::with_capacity(schema.library.len());
    for (idx, entry) in schema.library.iter().enumerate() {
        let entry_path = format!("{path}.library[{idx}]");
        let reference_id = entry
            .reference_id
            .as_deref()
            .ok_or_else(|| BuildError::malformed(&entry_path, "library entries require a 'referenceId'"))?;
        if entries.iter().any(|(id, _)| id == reference_id) {
            return Err(BuildError::DuplicateReference {
                reference_id: reference_id.to_string(),
                path: entry_path,
            });
        }
        let node = compile(registry, entry, inherited, &entry_path)?;
        debug!(reference_id, path = entry_path.as_str(), "Library entry built");
        entries.push((reference_id.to_string(), node));
    }
    Ok(inherited.derive(schema, kind, entries))
}
