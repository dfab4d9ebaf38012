use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::dependencies::ComponentDependencies;
use crate::pipeline::PipelineContext;
use crate::plugin::{Batch, Datajet, Validation};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StdoutConfig {
    #[serde(default)]
    pub label: Option<String>,
}

/// Prints each record as a JSON line, optionally prefixed with a label.
pub struct StdoutDatajet {
    label: Option<String>,
}

impl StdoutDatajet {
    pub fn new(config: StdoutConfig) -> Self {
        Self {
            label: config.label,
        }
    }
}

#[async_trait]
impl Datajet for StdoutDatajet {
    fn name(&self) -> &str {
        "stdout"
    }

    async fn transmit(&self, batch: Batch, _ctx: &PipelineContext) -> Result<()> {
        let mut rendered = String::new();
        for record in &batch {
            if let Some(label) = &self.label {
                rendered.push_str(&format!("[{label}] "));
            }
            rendered.push_str(&record.to_string());
            rendered.push('\n');
        }
        let mut stdout = tokio::io::stdout();
        stdout
            .write_all(rendered.as_bytes())
            .await
            .context("Failed to write batch to stdout")?;
        stdout.flush().await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileConfig {
    pub path: PathBuf,
}

/// Appends JSON lines to a file under the workspace root.
pub struct FileDatajet {
    path: PathBuf,
}

impl FileDatajet {
    /// Rejects paths that could leave the workspace root: absolute paths and
    /// any `..` segment.
    pub fn new(config: FileConfig, dependencies: &ComponentDependencies) -> Result<Self> {
        for component in config.path.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                Component::ParentDir => bail!(
                    "file datajet 'path' must stay under the workspace root: {}",
                    config.path.display()
                ),
                Component::RootDir | Component::Prefix(_) => bail!(
                    "file datajet 'path' must be relative to the workspace root: {}",
                    config.path.display()
                ),
            }
        }
        if config.path.file_name().is_none() {
            bail!("file datajet 'path' must name a file");
        }
        Ok(Self {
            path: dependencies.workspace_root().join(config.path),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Datajet for FileDatajet {
    fn name(&self) -> &str {
        "file"
    }

    async fn validate(&self, _ctx: &PipelineContext) -> Validation {
        let Some(parent) = self.path.parent() else {
            return Validation::Passed;
        };
        match tokio::fs::create_dir_all(parent).await {
            Ok(()) => Validation::Passed,
            Err(err) => Validation::Failed(format!(
                "cannot create output directory {}: {err}",
                parent.display()
            )),
        }
    }

    async fn transmit(&self, batch: Batch, _ctx: &PipelineContext) -> Result<()> {
        let mut buffer = Vec::new();
        for record in &batch {
            serde_json::to_writer(&mut buffer, record)?;
            buffer.push(b'\n');
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open output file: {}", self.path.display()))?;
        file.write_all(&buffer)
            .await
            .with_context(|| format!("Failed to write output file: {}", self.path.display()))?;
        file.flush().await?;
        Ok(())
    }
}

/// Drops every batch.
pub struct DiscardDatajet;

#[async_trait]
impl Datajet for DiscardDatajet {
    fn name(&self) -> &str {
        "discard"
    }

    async fn transmit(&self, batch: Batch, _ctx: &PipelineContext) -> Result<()> {
        debug!(records = batch.len(), "Discarding batch");
        Ok(())
    }
}
