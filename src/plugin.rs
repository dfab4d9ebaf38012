//! Traits implemented by configured plugin instances.
//!
//! The engine never looks inside a plugin; it only drives these entry points.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;

use crate::pipeline::{BuiltNode, ExecutionResult, PipelineConfig, PipelineContext};

/// Ordered records handed from a generator to a datajet.
pub type Batch = Vec<Value>;

pub type BatchStream<'a> = BoxStream<'a, anyhow::Result<Batch>>;

/// Outcome of a single validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Passed,
    Failed(String),
    /// The validator needs confirmation that is not available yet.
    Pending(String),
}

#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;

    async fn validate(&self, _ctx: &PipelineContext) -> Validation {
        Validation::Passed
    }

    /// A fresh stream of batches for one execution.
    fn batches<'a>(&'a self, ctx: &'a PipelineContext) -> BatchStream<'a>;
}

#[async_trait]
pub trait Datajet: Send + Sync {
    fn name(&self) -> &str;

    async fn validate(&self, _ctx: &PipelineContext) -> Validation {
        Validation::Passed
    }

    async fn transmit(&self, batch: Batch, ctx: &PipelineContext) -> anyhow::Result<()>;
}

/// Interposes on one child's execution.
///
/// Implementations may rewrite the context, run the child several times, or
/// decline to run it, but always return a complete [`ExecutionResult`].
#[async_trait]
pub trait Wrapper: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(
        &self,
        child: &BuiltNode,
        config: &PipelineConfig,
        ctx: &PipelineContext,
    ) -> ExecutionResult;
}
