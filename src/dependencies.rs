use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{Span, debug};

use crate::error::BuildError;
use crate::pipeline::BuiltNode;
use crate::schema::{ComponentKind, Schema};

pub const DATA_ROOT_ENV: &str = "DATAJET_DATA_ROOT";
pub const WORKSPACE_ROOT_ENV: &str = "DATAJET_WORKSPACE_ROOT";

const DEFAULT_DATA_ROOT: &str = "./data";
const DEFAULT_WORKSPACE_ROOT: &str = "./workspace";

/// Built sub-pipelines published under their reference ids.
#[derive(Clone, Default)]
pub struct Library {
    entries: HashMap<String, Arc<BuiltNode>>,
}

impl Library {
    pub fn get(&self, reference_id: &str) -> Option<&Arc<BuiltNode>> {
        self.entries.get(reference_id)
    }

    pub fn contains(&self, reference_id: &str) -> bool {
        self.entries.contains_key(reference_id)
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<_> = self.entries.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A new library with `entries` laid over this one. Later ids win.
    fn overlay(&self, entries: Vec<(String, BuiltNode)>) -> Library {
        let mut merged = self.entries.clone();
        for (reference_id, node) in entries {
            if merged.contains_key(&reference_id) {
                debug!(reference_id = reference_id.as_str(), "Shadowing inherited library entry");
            }
            merged.insert(reference_id, Arc::new(node));
        }
        Library { entries: merged }
    }
}

impl fmt::Debug for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.ids()).finish()
    }
}

/// Shared context handed to every compile step and plugin factory.
///
/// Values are never mutated in place: each subtree derives its own copy with
/// its library entries layered on top, so siblings cannot observe each other.
#[derive(Debug, Clone)]
pub struct ComponentDependencies {
    span: Span,
    data_root: PathBuf,
    workspace_root: PathBuf,
    library: Arc<Library>,
    root_schema: Option<Arc<Schema>>,
    local_schema: Option<Arc<Schema>>,
}

impl ComponentDependencies {
    pub fn new(data_root: impl Into<PathBuf>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            span: tracing::info_span!("pipeline"),
            data_root: data_root.into(),
            workspace_root: workspace_root.into(),
            library: Arc::new(Library::default()),
            root_schema: None,
            local_schema: None,
        }
    }

    /// Roots from `DATAJET_DATA_ROOT` / `DATAJET_WORKSPACE_ROOT`, falling back
    /// to `./data` and `./workspace`, made absolute against the current
    /// directory.
    pub fn from_env() -> Self {
        let data_root = root_from_env(DATA_ROOT_ENV, DEFAULT_DATA_ROOT);
        let workspace_root = root_from_env(WORKSPACE_ROOT_ENV, DEFAULT_WORKSPACE_ROOT);
        Self::new(data_root, workspace_root)
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Publish an already built node before compilation starts.
    pub fn with_library_entry(mut self, reference_id: impl Into<String>, node: BuiltNode) -> Self {
        self.library = Arc::new(self.library.overlay(vec![(reference_id.into(), node)]));
        self
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn library(&self) -> &Library {
        &self.library
    }

    pub fn root_schema(&self) -> Option<&Arc<Schema>> {
        self.root_schema.as_ref()
    }

    /// The schema node currently being compiled.
    pub fn local_schema(&self) -> Option<&Arc<Schema>> {
        self.local_schema.as_ref()
    }

    pub fn resolve(&self, reference_id: &str) -> Result<Arc<BuiltNode>, BuildError> {
        self.library
            .get(reference_id)
            .cloned()
            .ok_or_else(|| BuildError::ReferenceNotFound {
                reference_id: reference_id.to_string(),
            })
    }

    pub(crate) fn with_root_schema(mut self, schema: Arc<Schema>) -> Self {
        if self.root_schema.is_none() {
            self.root_schema = Some(schema);
        }
        self
    }

    pub(crate) fn derive(
        &self,
        local: &Arc<Schema>,
        kind: ComponentKind,
        entries: Vec<(String, BuiltNode)>,
    ) -> Self {
        let library = if entries.is_empty() {
            self.library.clone()
        } else {
            Arc::new(self.library.overlay(entries))
        };
        Self {
            span: tracing::debug_span!(
                parent: &self.span,
                "component",
                kind = kind.as_str(),
                reference_id = local.reference_id.as_deref()
            ),
            data_root: self.data_root.clone(),
            workspace_root: self.workspace_root.clone(),
            library,
            root_schema: self.root_schema.clone(),
            local_schema: Some(local.clone()),
        }
    }
}

fn root_from_env(var: &str, default: &str) -> PathBuf {
    let raw = std::env::var_os(var)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default));
    std::path::absolute(&raw).unwrap_or(raw)
}
