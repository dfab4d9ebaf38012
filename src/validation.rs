use serde::Serialize;
use serde_json::Value;

use crate::registry::{PluginKind, PluginRegistry};
use crate::schema::{ComponentSpec, PluginRef, ROOT_PATH, Schema};

/// Config key by which plugins name a library entry they consume.
pub const REFERENCE_CONFIG_KEY: &str = "referenceId";

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Check a schema without building it.
///
/// Unlike compilation this does not stop at the first problem: every node is
/// visited and all findings are collected.
pub fn validate_schema(schema: &Schema, registry: &PluginRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();
    validate_node(schema, registry, ROOT_PATH, &[], &mut report);
    report
}

fn validate_node(
    schema: &Schema,
    registry: &PluginRegistry,
    path: &str,
    visible: &[String],
    report: &mut ValidationReport,
) {
    let spec = match schema.resolve(path) {
        Ok(spec) => spec,
        Err(err) => {
            report.errors.push(err.to_string());
            return;
        }
    };

    let mut scope = visible.to_vec();
    let mut declared: Vec<&str> = Vec::new();
    for (idx, entry) in schema.library.iter().enumerate() {
        let entry_path = format!("{path}.library[{idx}]");
        validate_node(entry, registry, &entry_path, visible, report);
        let Some(reference_id) = entry.reference_id.as_deref() else {
            report
                .errors
                .push(format!("{entry_path}: library entries require a 'referenceId'"));
            continue;
        };
        if declared.contains(&reference_id) {
            report.errors.push(format!(
                "{entry_path}: duplicate library referenceId '{reference_id}'"
            ));
            continue;
        }
        if visible.iter().any(|id| id == reference_id) {
            report.warnings.push(format!(
                "{entry_path}: referenceId '{reference_id}' shadows an entry from an enclosing scope"
            ));
        }
        declared.push(reference_id);
        scope.push(reference_id.to_string());
    }

    match spec {
        ComponentSpec::Stage {
            generator, datajet, ..
        } => {
            report.merge(validate_plugin(registry, PluginKind::Generator, generator, path, &scope));
            report.merge(validate_plugin(registry, PluginKind::Datajet, datajet, path, &scope));
        }
        ComponentSpec::Synchronizer { children, .. } => {
            if children.is_empty() {
                report.warnings.push(format!(
                    "{path}: synchronizer has no children and will do nothing"
                ));
            }
            for (idx, child) in children.iter().enumerate() {
                validate_node(child, registry, &format!("{path}.children[{idx}]"), &scope, report);
            }
        }
        ComponentSpec::Wrap { wrapper, child } => {
            report.merge(validate_plugin(registry, PluginKind::Wrapper, &wrapper, path, &scope));
            validate_node(child, registry, &format!("{path}.child"), &scope, report);
        }
        ComponentSpec::Generator { generator } => {
            if schema.reference_id.is_none() {
                report.warnings.push(format!(
                    "{path}: generator component without a referenceId cannot be consumed"
                ));
            }
            report.merge(validate_plugin(registry, PluginKind::Generator, generator, path, &scope));
        }
    }
}

fn validate_plugin(
    registry: &PluginRegistry,
    kind: PluginKind,
    plugin: &PluginRef,
    path: &str,
    scope: &[String],
) -> ValidationReport {
    let mut report = ValidationReport::default();
    let merged = match registry.merged_config(kind, plugin) {
        Ok(merged) => merged,
        Err(err) => {
            report.errors.push(format!("{path}: {err}"));
            return report;
        }
    };

    match merged.get(REFERENCE_CONFIG_KEY) {
        Some(Value::String(reference_id)) if !scope.iter().any(|id| id == reference_id) => {
            report.errors.push(format!(
                "{path}: {kind} '{}' references '{reference_id}', which is not declared in an enclosing library",
                plugin.name
            ));
        }
        Some(Value::String(_)) | None => {}
        Some(other) => report.errors.push(format!(
            "{path}: {kind} '{}' has a non-string '{REFERENCE_CONFIG_KEY}': {other}",
            plugin.name
        )),
    }

    report
}
