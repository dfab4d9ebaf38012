//! Compile-time error taxonomy.

use crate::registry::PluginKind;

/// Structural errors raised while turning a schema into a built pipeline.
///
/// Execution failures never use this type; they are reported through
/// [`ExecutionResult`](crate::pipeline::ExecutionResult).
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// The `component` discriminant is not one of the known kinds.
    #[error("Unsupported pipeline component in schema: '{component}'")]
    UnsupportedComponent { component: String },

    /// A generator, wrapper or datajet name has no registry entry.
    #[error("Unknown {kind} '{name}'. Available {kind}s: {available}")]
    PluginNotFound {
        kind: PluginKind,
        name: String,
        available: String,
    },

    /// A template with the same name was already registered.
    #[error("Duplicate {kind} registration: '{name}'")]
    DuplicatePlugin { kind: PluginKind, name: String },

    /// Required fields are missing or have the wrong shape.
    #[error("Malformed schema at {path}: {reason}")]
    MalformedSchema { path: String, reason: String },

    /// Two entries of the same `library` list share a reference id.
    #[error("Duplicate library referenceId '{reference_id}' at {path}")]
    DuplicateReference { reference_id: String, path: String },

    /// A reference id is not visible from the scope that asked for it.
    #[error("Library reference '{reference_id}' is not visible in this scope")]
    ReferenceNotFound { reference_id: String },

    /// A plugin factory rejected its merged configuration.
    #[error("Failed to create {kind} '{name}': {source:#}")]
    PluginFactory {
        kind: PluginKind,
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

impl BuildError {
    pub(crate) fn malformed(path: &str, reason: impl Into<String>) -> Self {
        Self::MalformedSchema {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;
