use std::sync::Arc;

use anyhow::{Result, anyhow, bail, ensure};
use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::dependencies::ComponentDependencies;
use crate::pipeline::{BuiltNode, PipelineContext};
use crate::plugin::{Batch, BatchStream, Generator, Validation};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncrementConfig {
    pub batch_size: u64,
    pub batch_count: u64,
    pub key: String,
}

/// Emits `{key: n}` records with `n` counting up from zero across batches.
pub struct IncrementGenerator {
    config: IncrementConfig,
}

impl IncrementGenerator {
    pub fn new(config: IncrementConfig) -> Result<Self> {
        if config.batch_size == 0 {
            bail!("increment generator requires 'batchSize' of at least 1");
        }
        Ok(Self { config })
    }

    fn record(&self, value: u64) -> Value {
        let mut record = Map::new();
        record.insert(self.config.key.clone(), Value::from(value));
        Value::Object(record)
    }
}

#[async_trait]
impl Generator for IncrementGenerator {
    fn name(&self) -> &str {
        "increment"
    }

    fn batches<'a>(&'a self, _ctx: &'a PipelineContext) -> BatchStream<'a> {
        let size = self.config.batch_size;
        stream::iter(0..self.config.batch_count)
            .map(move |batch| {
                let start = batch * size;
                Ok::<Batch, anyhow::Error>((start..start + size).map(|n| self.record(n)).collect())
            })
            .boxed()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticConfig {
    pub records: Vec<Value>,
    pub repeat: u64,
}

/// Emits the configured records as one batch, `repeat` times.
pub struct StaticGenerator {
    config: StaticConfig,
}

impl StaticGenerator {
    pub fn new(config: StaticConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Generator for StaticGenerator {
    fn name(&self) -> &str {
        "static"
    }

    async fn validate(&self, _ctx: &PipelineContext) -> Validation {
        if self.config.records.is_empty() {
            Validation::Failed("static generator has no records configured".into())
        } else {
            Validation::Passed
        }
    }

    fn batches<'a>(&'a self, _ctx: &'a PipelineContext) -> BatchStream<'a> {
        stream::iter(0..self.config.repeat)
            .map(move |_| Ok::<Batch, anyhow::Error>(self.config.records.clone()))
            .boxed()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryConfig {
    pub reference_id: String,
}

/// Replays the generator published in the library under `referenceId`.
pub struct LibraryGenerator {
    reference_id: String,
    node: Arc<BuiltNode>,
}

impl LibraryGenerator {
    /// Resolves the reference immediately, so an id outside the current scope
    /// fails compilation.
    pub fn new(config: LibraryConfig, dependencies: &ComponentDependencies) -> Result<Self> {
        let node = dependencies.resolve(&config.reference_id)?;
        ensure!(
            node.generator().is_some(),
            "library entry '{}' is a {} and publishes no generator",
            config.reference_id,
            node.kind()
        );
        Ok(Self {
            reference_id: config.reference_id,
            node,
        })
    }

    pub fn reference_id(&self) -> &str {
        &self.reference_id
    }
}

#[async_trait]
impl Generator for LibraryGenerator {
    fn name(&self) -> &str {
        "library"
    }

    async fn validate(&self, ctx: &PipelineContext) -> Validation {
        match self.node.generator() {
            Some(generator) => generator.validate(ctx).await,
            None => Validation::Failed(format!("'{}' publishes no generator", self.reference_id)),
        }
    }

    fn batches<'a>(&'a self, ctx: &'a PipelineContext) -> BatchStream<'a> {
        match self.node.generator() {
            Some(generator) => generator.batches(ctx),
            None => stream::iter([Err::<Batch, _>(anyhow!(
                "'{}' publishes no generator",
                self.reference_id
            ))])
            .boxed(),
        }
    }
}
