use std::fmt;
use std::time::Duration;

use futures_util::future::{BoxFuture, join_all};
use futures_util::{FutureExt, StreamExt, stream};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{Instrument, debug, warn};

use crate::observability::MetricsCollector;
use crate::plugin::{Datajet, Generator, Validation, Wrapper};
use crate::schema::{ComponentKind, StageConfig, SynchronizerConfig};

/// Execution-wide settings shared by every node of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    /// Upper bound on one stage's execution. A stage exceeding it fails
    /// instead of stalling its synchronizer.
    pub stage_timeout_ms: Option<u64>,
}

impl PipelineConfig {
    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout_ms = Some(timeout.as_millis().try_into().unwrap_or(u64::MAX));
        self
    }

    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_ms.map(Duration::from_millis)
    }
}

/// Per-run values visible to plugins. Wrappers hand modified copies to their
/// child.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub run_id: String,
    pub variables: Map<String, Value>,
    metrics: MetricsCollector,
}

impl Default for PipelineContext {
    fn default() -> Self {
        Self::new("local")
    }
}

impl PipelineContext {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            variables: Map::new(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }
}

/// Identifies the node an [`ExecutionResult`] belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDescriptor {
    pub kind: ComponentKind,
    pub name: String,
}

impl StageDescriptor {
    pub fn new(kind: ComponentKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub stage: StageDescriptor,
    pub is_validation_success: bool,
    pub is_execution_success: bool,
    /// Validators still waiting on confirmation. The result is not final
    /// while this is non-empty.
    pub pending_validators: Vec<String>,
    pub children: Vec<ExecutionResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl ExecutionResult {
    pub fn new(stage: StageDescriptor) -> Self {
        Self {
            stage,
            is_validation_success: true,
            is_execution_success: true,
            pending_validators: Vec::new(),
            children: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Logical AND of the children's outcomes. Pending validators bubble up so
    /// the root result alone tells whether the run is final.
    pub fn aggregate(stage: StageDescriptor, children: Vec<ExecutionResult>) -> Self {
        let mut result = Self::new(stage);
        for child in &children {
            result.is_validation_success &= child.is_validation_success;
            result.is_execution_success &= child.is_execution_success;
            result
                .pending_validators
                .extend(child.pending_validators.iter().cloned());
        }
        result.children = children;
        result
    }

    pub fn is_success(&self) -> bool {
        self.is_validation_success && self.is_execution_success
    }

    pub fn is_final(&self) -> bool {
        self.pending_validators.is_empty()
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.is_execution_success = false;
        self.errors.push(error.into());
    }

    fn record_validation(&mut self, validator: &str, outcome: Validation) {
        match outcome {
            Validation::Passed => {}
            Validation::Failed(reason) => {
                self.is_validation_success = false;
                self.errors.push(format!("{validator} validation failed: {reason}"));
            }
            Validation::Pending(name) => self.pending_validators.push(name),
        }
    }
}

/// Compiled, executable form of one schema node.
pub enum BuiltNode {
    Stage(StageNode),
    Synchronizer(SynchronizerNode),
    Wrap(WrapNode),
    /// Publishes a generator for library consumers; executing it is a no-op.
    Generator(GeneratorNode),
}

impl BuiltNode {
    pub fn kind(&self) -> ComponentKind {
        match self {
            BuiltNode::Stage(_) => ComponentKind::Stage,
            BuiltNode::Synchronizer(_) => ComponentKind::Synchronizer,
            BuiltNode::Wrap(_) => ComponentKind::Wrap,
            BuiltNode::Generator(_) => ComponentKind::Generator,
        }
    }

    pub fn descriptor(&self) -> StageDescriptor {
        let name = match self {
            BuiltNode::Stage(stage) => {
                format!("{}->{}", stage.generator.name(), stage.datajet.name())
            }
            BuiltNode::Synchronizer(_) => ComponentKind::Synchronizer.to_string(),
            BuiltNode::Wrap(wrap) => wrap.wrapper.name().to_string(),
            BuiltNode::Generator(node) => node.generator.name().to_string(),
        };
        StageDescriptor::new(self.kind(), name)
    }

    pub fn children(&self) -> &[BuiltNode] {
        match self {
            BuiltNode::Synchronizer(sync) => &sync.children,
            BuiltNode::Wrap(wrap) => std::slice::from_ref(wrap.child.as_ref()),
            BuiltNode::Stage(_) | BuiltNode::Generator(_) => &[],
        }
    }

    /// The configured generator carried by stage and generator-only nodes.
    pub fn generator(&self) -> Option<&dyn Generator> {
        match self {
            BuiltNode::Stage(stage) => Some(stage.generator.as_ref()),
            BuiltNode::Generator(node) => Some(node.generator.as_ref()),
            BuiltNode::Synchronizer(_) | BuiltNode::Wrap(_) => None,
        }
    }

    /// Validate and run this node. Failures are reported in the result, never
    /// raised.
    pub fn execute_stage<'a>(
        &'a self,
        config: &'a PipelineConfig,
        ctx: &'a PipelineContext,
    ) -> BoxFuture<'a, ExecutionResult> {
        let descriptor = self.descriptor();
        let span = tracing::debug_span!(
            "execute",
            kind = descriptor.kind.as_str(),
            name = descriptor.name.as_str()
        );
        match self {
            BuiltNode::Stage(stage) => stage.execute(descriptor, config, ctx).instrument(span).boxed(),
            BuiltNode::Synchronizer(sync) => {
                sync.execute(descriptor, config, ctx).instrument(span).boxed()
            }
            BuiltNode::Wrap(wrap) => wrap
                .wrapper
                .execute(&wrap.child, config, ctx)
                .instrument(span)
                .boxed(),
            BuiltNode::Generator(_) => {
                debug!(generator = descriptor.name.as_str(), "Generator-only node has nothing to execute");
                futures_util::future::ready(ExecutionResult::new(descriptor)).boxed()
            }
        }
    }
}

impl fmt::Debug for BuiltNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let descriptor = self.descriptor();
        f.debug_struct("BuiltNode")
            .field("kind", &descriptor.kind)
            .field("name", &descriptor.name)
            .field("children", &self.children())
            .finish()
    }
}

pub struct StageNode {
    path: String,
    generator: Box<dyn Generator>,
    datajet: Box<dyn Datajet>,
    config: StageConfig,
}

impl StageNode {
    /// `path` locates the stage in its schema and keys its metrics.
    pub fn new(
        path: impl Into<String>,
        generator: Box<dyn Generator>,
        datajet: Box<dyn Datajet>,
        config: StageConfig,
    ) -> Self {
        Self {
            path: path.into(),
            generator,
            datajet,
            config,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn datajet(&self) -> &dyn Datajet {
        self.datajet.as_ref()
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    /// Validators and the drain each run under the stage timeout, so a
    /// validator that never settles fails the stage instead of stalling it.
    async fn execute(
        &self,
        descriptor: StageDescriptor,
        config: &PipelineConfig,
        ctx: &PipelineContext,
    ) -> ExecutionResult {
        let limit = config.stage_timeout();
        let mut result = ExecutionResult::new(descriptor);
        let generator_outcome = within(limit, self.generator.validate(ctx))
            .await
            .unwrap_or_else(|| timed_out_validation(limit));
        result.record_validation(self.generator.name(), generator_outcome);
        let datajet_outcome = within(limit, self.datajet.validate(ctx))
            .await
            .unwrap_or_else(|| timed_out_validation(limit));
        result.record_validation(self.datajet.name(), datajet_outcome);

        if !result.is_validation_success {
            result.is_execution_success = false;
            ctx.metrics()
                .record_validation_failure(&self.path, &result.stage.name);
            warn!(
                path = self.path.as_str(),
                stage = result.stage.name.as_str(),
                errors = ?result.errors,
                "Stage validation failed; execution skipped"
            );
            return result;
        }

        let mut timer = ctx.metrics().start_stage(&self.path, &result.stage.name);
        let errors = within(limit, self.drain(&result.stage.name, ctx))
            .await
            .unwrap_or_else(|| vec![format!("Stage timed out after {} ms", timeout_ms(limit))]);

        for error in errors {
            result.fail(error);
        }
        if !result.is_execution_success {
            timer.mark_failed();
            warn!(
                path = self.path.as_str(),
                stage = result.stage.name.as_str(),
                errors = ?result.errors,
                "Stage execution failed"
            );
        }
        result
    }

    /// Pull batches from the generator and hand each to the datajet. Returns
    /// the errors encountered.
    async fn drain(&self, stage_name: &str, ctx: &PipelineContext) -> Vec<String> {
        let mut errors = Vec::new();
        let mut batches = self.generator.batches(ctx);
        let mut pulled = 0u64;

        loop {
            if self.config.max_batches.is_some_and(|max| pulled >= max) {
                debug!(stage = stage_name, pulled, "Batch limit reached");
                break;
            }
            let Some(next) = batches.next().await else {
                break;
            };
            pulled += 1;

            match next {
                Ok(batch) => {
                    let records = batch.len();
                    match self.datajet.transmit(batch, ctx).await {
                        Ok(()) => ctx.metrics().record_batch(&self.path, stage_name, records),
                        Err(err) => errors.push(format!(
                            "{} failed to transmit batch {pulled}: {err:#}",
                            self.datajet.name()
                        )),
                    }
                }
                Err(err) => errors.push(format!(
                    "{} failed to produce batch {pulled}: {err:#}",
                    self.generator.name()
                )),
            }

            if !errors.is_empty() && !self.config.continue_on_error {
                break;
            }
        }
        errors
    }
}

/// Await `future`, giving up after `limit` when one is set.
async fn within<F: Future>(limit: Option<Duration>, future: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, future).await.ok(),
        None => Some(future.await),
    }
}

fn timeout_ms(limit: Option<Duration>) -> u128 {
    limit.map(|limit| limit.as_millis()).unwrap_or_default()
}

fn timed_out_validation(limit: Option<Duration>) -> Validation {
    Validation::Failed(format!("timed out after {} ms", timeout_ms(limit)))
}

pub struct SynchronizerNode {
    children: Vec<BuiltNode>,
    config: SynchronizerConfig,
}

impl SynchronizerNode {
    pub fn new(children: Vec<BuiltNode>, config: SynchronizerConfig) -> Self {
        Self { children, config }
    }

    pub fn config(&self) -> &SynchronizerConfig {
        &self.config
    }

    /// Run every child concurrently; a failing child never cancels the others.
    async fn execute(
        &self,
        descriptor: StageDescriptor,
        config: &PipelineConfig,
        ctx: &PipelineContext,
    ) -> ExecutionResult {
        let pending: Vec<BoxFuture<'_, ExecutionResult>> = self
            .children
            .iter()
            .map(|child| child.execute_stage(config, ctx))
            .collect();
        let children = match self.config.max_concurrency {
            Some(limit) => stream::iter(pending).buffered(limit).collect::<Vec<_>>().await,
            None => join_all(pending).await,
        };
        let result = ExecutionResult::aggregate(descriptor, children);
        debug!(
            children = result.children.len(),
            validation = result.is_validation_success,
            execution = result.is_execution_success,
            "Synchronizer settled"
        );
        result
    }
}

pub struct WrapNode {
    wrapper: Box<dyn Wrapper>,
    child: Box<BuiltNode>,
}

impl WrapNode {
    pub fn new(wrapper: Box<dyn Wrapper>, child: BuiltNode) -> Self {
        Self {
            wrapper,
            child: Box::new(child),
        }
    }

    pub fn wrapper(&self) -> &dyn Wrapper {
        self.wrapper.as_ref()
    }

    pub fn child(&self) -> &BuiltNode {
        &self.child
    }
}

pub struct GeneratorNode {
    generator: Box<dyn Generator>,
}

impl GeneratorNode {
    pub fn new(generator: Box<dyn Generator>) -> Self {
        Self { generator }
    }
}
