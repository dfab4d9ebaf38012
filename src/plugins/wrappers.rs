use anyhow::{Result, ensure};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::pipeline::{BuiltNode, ExecutionResult, PipelineConfig, PipelineContext, StageDescriptor};
use crate::plugin::Wrapper;
use crate::schema::ComponentKind;

/// Runs the child once and returns its result untouched.
pub struct PassthroughWrapper;

#[async_trait]
impl Wrapper for PassthroughWrapper {
    fn name(&self) -> &str {
        "passthrough"
    }

    async fn execute(
        &self,
        child: &BuiltNode,
        config: &PipelineConfig,
        ctx: &PipelineContext,
    ) -> ExecutionResult {
        child.execute_stage(config, ctx).await
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeatConfig {
    pub times: u32,
}

/// Runs the child `times` times in sequence, exposing the zero-based
/// `iteration` variable, and reports each run as a child result.
pub struct RepeatWrapper {
    times: u32,
}

impl RepeatWrapper {
    pub fn new(config: RepeatConfig) -> Result<Self> {
        ensure!(config.times >= 1, "repeat wrapper requires 'times' of at least 1");
        Ok(Self { times: config.times })
    }
}

#[async_trait]
impl Wrapper for RepeatWrapper {
    fn name(&self) -> &str {
        "repeat"
    }

    async fn execute(
        &self,
        child: &BuiltNode,
        config: &PipelineConfig,
        ctx: &PipelineContext,
    ) -> ExecutionResult {
        let mut iterations = Vec::with_capacity(self.times as usize);
        for iteration in 0..self.times {
            let scoped = ctx.clone().with_variable("iteration", Value::from(iteration));
            iterations.push(child.execute_stage(config, &scoped).await);
        }
        ExecutionResult::aggregate(
            StageDescriptor::new(ComponentKind::Wrap, self.name()),
            iterations,
        )
    }
}
