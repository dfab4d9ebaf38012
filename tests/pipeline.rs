use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use async_trait::async_trait;
use datajet::config::{PluginConfig, config_from_value};
use datajet::plugin::{Batch, BatchStream, Datajet, Generator, Validation};
use datajet::registry::PluginKind;
use datajet::schema::ComponentKind;
use datajet::{
    BuildError, ComponentDependencies, PipelineConfig, PipelineContext, PluginRegistry, Schema,
    build_pipeline,
};
use futures_util::{StreamExt, stream};
use serde_json::{Value, json};
use tempfile::tempdir;

type Recorded = Arc<Mutex<Vec<Value>>>;

/// Fails every transmit when configured with `fail: true`.
struct FixedDatajet {
    fail: bool,
}

#[async_trait]
impl Datajet for FixedDatajet {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn transmit(&self, _batch: Batch, _ctx: &PipelineContext) -> Result<()> {
        if self.fail {
            bail!("sink rejected batch");
        }
        Ok(())
    }
}

/// Stores every batch along with the `iteration` variable it was sent under.
struct RecordingDatajet {
    seen: Recorded,
}

#[async_trait]
impl Datajet for RecordingDatajet {
    fn name(&self) -> &str {
        "record"
    }

    async fn transmit(&self, batch: Batch, ctx: &PipelineContext) -> Result<()> {
        let iteration = ctx.variables.get("iteration").cloned().unwrap_or(Value::Null);
        self.seen
            .lock()
            .unwrap()
            .push(json!({"iteration": iteration, "batch": batch}));
        Ok(())
    }
}

struct ApprovalDatajet;

#[async_trait]
impl Datajet for ApprovalDatajet {
    fn name(&self) -> &str {
        "approval"
    }

    async fn validate(&self, _ctx: &PipelineContext) -> Validation {
        Validation::Pending("manual-approval".into())
    }

    async fn transmit(&self, _batch: Batch, _ctx: &PipelineContext) -> Result<()> {
        Ok(())
    }
}

/// Sleeps before each of its `count` batches.
struct SlowGenerator {
    delay: Duration,
    count: u64,
}

#[async_trait]
impl Generator for SlowGenerator {
    fn name(&self) -> &str {
        "slow"
    }

    fn batches<'a>(&'a self, _ctx: &'a PipelineContext) -> BatchStream<'a> {
        let delay = self.delay;
        stream::iter(0..self.count)
            .then(move |n| async move {
                tokio::time::sleep(delay).await;
                Ok::<Batch, anyhow::Error>(vec![json!(n)])
            })
            .boxed()
    }
}

/// Its validator never settles.
struct StalledDatajet;

#[async_trait]
impl Datajet for StalledDatajet {
    fn name(&self) -> &str {
        "stalled"
    }

    async fn validate(&self, _ctx: &PipelineContext) -> Validation {
        std::future::pending().await
    }

    async fn transmit(&self, _batch: Batch, _ctx: &PipelineContext) -> Result<()> {
        Ok(())
    }
}

fn registry_with(recorded: &Recorded, probed: &Arc<Mutex<Option<PluginConfig>>>) -> PluginRegistry {
    let mut registry = PluginRegistry::with_defaults().unwrap();
    let datajets = registry.datajets_mut();
    datajets
        .register("fixed", config_from_value(json!({"fail": false})), |config, _| {
            let fail = config.get("fail").and_then(Value::as_bool).unwrap_or(false);
            Ok(Box::new(FixedDatajet { fail }))
        })
        .unwrap();
    let seen = recorded.clone();
    datajets
        .register("record", PluginConfig::new(), move |_, _| {
            Ok(Box::new(RecordingDatajet { seen: seen.clone() }))
        })
        .unwrap();
    datajets
        .register("approval", PluginConfig::new(), |_, _| Ok(Box::new(ApprovalDatajet)))
        .unwrap();
    datajets
        .register("stalled", PluginConfig::new(), |_, _| Ok(Box::new(StalledDatajet)))
        .unwrap();

    let generators = registry.generators_mut();
    generators
        .register(
            "slow",
            config_from_value(json!({"delayMs": 200, "count": 3})),
            |config, _| {
                let ms = config.get("delayMs").and_then(Value::as_u64).unwrap_or(200);
                let count = config.get("count").and_then(Value::as_u64).unwrap_or(3);
                Ok(Box::new(SlowGenerator {
                    delay: Duration::from_millis(ms),
                    count,
                }))
            },
        )
        .unwrap();
    let probe = probed.clone();
    generators
        .register(
            "probe",
            config_from_value(json!({"a": 1, "b": 2})),
            move |config, _| {
                *probe.lock().unwrap() = Some(config);
                Ok(Box::new(SlowGenerator {
                    delay: Duration::ZERO,
                    count: 1,
                }))
            },
        )
        .unwrap();
    registry
}

struct Harness {
    registry: PluginRegistry,
    recorded: Recorded,
    probed: Arc<Mutex<Option<PluginConfig>>>,
    workspace: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        let recorded = Recorded::default();
        let probed = Arc::new(Mutex::new(None));
        Self {
            registry: registry_with(&recorded, &probed),
            recorded,
            probed,
            workspace: tempdir().unwrap(),
        }
    }

    fn deps(&self) -> Option<ComponentDependencies> {
        Some(ComponentDependencies::new(
            self.workspace.path().join("data"),
            self.workspace.path().join("workspace"),
        ))
    }

    fn build(&self, value: Value) -> Result<datajet::BuiltNode, BuildError> {
        let schema = Schema::from_value(value).unwrap();
        build_pipeline(&self.registry, schema, self.deps())
    }

    fn recorded(&self) -> Vec<Value> {
        self.recorded.lock().unwrap().clone()
    }
}

fn stage(generator: Value, datajet: Value) -> Value {
    json!({"generator": generator, "datajet": datajet})
}

#[tokio::test]
async fn synchronizer_reports_every_child() {
    let harness = Harness::new();
    let ok = || stage(json!({"name": "increment"}), json!({"name": "fixed"}));
    let pipeline = harness
        .build(json!({
            "component": "synchronizer",
            "children": [
                ok(),
                stage(json!({"name": "increment"}), json!({"name": "fixed", "config": {"fail": true}})),
                ok(),
            ],
        }))
        .unwrap();

    let result = pipeline
        .execute_stage(&PipelineConfig::default(), &PipelineContext::default())
        .await;

    assert_eq!(result.stage.kind, ComponentKind::Synchronizer);
    assert!(result.is_validation_success);
    assert!(!result.is_execution_success);
    let outcomes: Vec<bool> = result
        .children
        .iter()
        .map(|child| child.is_execution_success)
        .collect();
    assert_eq!(outcomes, vec![true, false, true]);
    assert!(result.children[1].errors[0].contains("sink rejected batch"));
}

#[tokio::test]
async fn passthrough_wrap_is_indistinguishable_from_its_child() {
    let harness = Harness::new();
    let bare = stage(
        json!({"name": "increment", "config": {"batchCount": 2}}),
        json!({"name": "discard"}),
    );
    let wrapped = json!({
        "component": "wrap",
        "config": {"wrapper": {"name": "passthrough"}},
        "child": bare.clone(),
    });
    let config = PipelineConfig::default();
    let ctx = PipelineContext::default();

    let bare_result = harness.build(bare).unwrap().execute_stage(&config, &ctx).await;
    let wrapped_result = harness.build(wrapped).unwrap().execute_stage(&config, &ctx).await;

    assert!(bare_result.is_success());
    assert_eq!(bare_result, wrapped_result);
}

#[test]
fn supplied_config_overrides_template_defaults() {
    let harness = Harness::new();
    harness
        .build(stage(
            json!({"name": "probe", "config": {"b": 3, "c": 4}}),
            json!({"name": "discard"}),
        ))
        .unwrap();

    let seen = harness.probed.lock().unwrap().clone().unwrap();
    assert_eq!(Value::Object(seen), json!({"a": 1, "b": 3, "c": 4}));
}

#[tokio::test]
async fn compiling_twice_yields_equivalent_pipelines() {
    let harness = Harness::new();
    let schema = Arc::new(
        Schema::from_value(json!({
            "component": "synchronizer",
            "children": [
                stage(json!({"name": "increment"}), json!({"name": "discard"})),
                stage(json!({"name": "static", "config": {"records": [{"x": 1}]}}), json!({"name": "discard"})),
            ],
        }))
        .unwrap(),
    );
    let first = build_pipeline(&harness.registry, schema.clone(), harness.deps()).unwrap();
    let second = build_pipeline(&harness.registry, schema.clone(), harness.deps()).unwrap();

    assert_eq!(first.descriptor(), second.descriptor());
    let config = PipelineConfig::default();
    let ctx = PipelineContext::default();
    assert_eq!(
        first.execute_stage(&config, &ctx).await,
        second.execute_stage(&config, &ctx).await
    );
}

#[tokio::test]
async fn library_entries_are_visible_only_to_their_subtree() {
    let harness = Harness::new();
    let scoped = json!({
        "component": "synchronizer",
        "library": [{
            "referenceId": "seq",
            "component": "generator",
            "generator": {"name": "increment", "config": {"batchSize": 2, "batchCount": 2}},
        }],
        "children": [stage(
            json!({"name": "library", "config": {"referenceId": "seq"}}),
            json!({"name": "record"}),
        )],
    });
    let sibling = stage(
        json!({"name": "library", "config": {"referenceId": "seq"}}),
        json!({"name": "discard"}),
    );

    let err = harness
        .build(json!({"component": "synchronizer", "children": [scoped.clone(), sibling]}))
        .unwrap_err();
    assert!(
        matches!(err, BuildError::ReferenceNotFound { ref reference_id } if reference_id == "seq"),
        "got: {err}"
    );

    let pipeline = harness
        .build(json!({"component": "synchronizer", "children": [scoped]}))
        .unwrap();
    let result = pipeline
        .execute_stage(&PipelineConfig::default(), &PipelineContext::default())
        .await;
    assert!(result.is_success(), "{:?}", result);
    let recorded = harness.recorded();
    assert_eq!(recorded.len(), 2);
    assert_eq!(recorded[1]["batch"], json!([{"value": 2}, {"value": 3}]));
}

#[test]
fn unknown_component_is_rejected() {
    let harness = Harness::new();
    let err = harness
        .build(json!({
            "component": "synchronizer",
            "children": [{"component": "fanout"}],
        }))
        .unwrap_err();
    assert!(
        matches!(err, BuildError::UnsupportedComponent { ref component } if component == "fanout"),
        "got: {err}"
    );
}

#[test]
fn unknown_plugin_is_rejected() {
    let harness = Harness::new();
    let err = harness
        .build(stage(json!({"name": "increment"}), json!({"name": "kinesis"})))
        .unwrap_err();
    assert!(
        matches!(
            err,
            BuildError::PluginNotFound { kind: PluginKind::Datajet, ref name, .. } if name == "kinesis"
        ),
        "got: {err}"
    );
}

#[test]
fn factory_rejection_names_the_plugin() {
    let harness = Harness::new();
    let err = harness
        .build(stage(
            json!({"name": "increment", "config": {"batchSize": 0}}),
            json!({"name": "discard"}),
        ))
        .unwrap_err();
    let msg = err.to_string();
    assert!(matches!(err, BuildError::PluginFactory { .. }), "got: {msg}");
    assert!(msg.contains("generator 'increment'"), "got: {msg}");
    assert!(msg.contains("batchSize"), "got: {msg}");
}

#[tokio::test]
async fn repeat_wrapper_runs_child_per_iteration() {
    let harness = Harness::new();
    let pipeline = harness
        .build(json!({
            "component": "wrap",
            "config": {"wrapper": {"name": "repeat", "config": {"times": 3}}},
            "child": stage(
                json!({"name": "static", "config": {"records": [{"id": "a"}]}}),
                json!({"name": "record"}),
            ),
        }))
        .unwrap();

    let result = pipeline
        .execute_stage(&PipelineConfig::default(), &PipelineContext::default())
        .await;

    assert!(result.is_success());
    assert_eq!(result.stage.kind, ComponentKind::Wrap);
    assert_eq!(result.children.len(), 3);
    let iterations: Vec<Value> = harness
        .recorded()
        .into_iter()
        .map(|entry| entry["iteration"].clone())
        .collect();
    assert_eq!(iterations, vec![json!(0), json!(1), json!(2)]);
}

#[tokio::test]
async fn max_batches_caps_the_drain() {
    let harness = Harness::new();
    let pipeline = harness
        .build(json!({
            "generator": {"name": "increment", "config": {"batchSize": 3, "batchCount": 5}},
            "datajet": {"name": "discard"},
            "stage": {"maxBatches": 2},
        }))
        .unwrap();
    let ctx = PipelineContext::default();

    let result = pipeline.execute_stage(&PipelineConfig::default(), &ctx).await;

    assert!(result.is_success());
    let snapshot = ctx.metrics().snapshot();
    let metrics = &snapshot.stages["$"];
    assert_eq!(metrics.stage, "increment->discard");
    assert_eq!(metrics.batches, 2);
    assert_eq!(metrics.records, 6);
}

#[tokio::test]
async fn continue_on_error_keeps_draining() {
    let harness = Harness::new();
    let failing = |continue_on_error: bool| {
        json!({
            "generator": {"name": "increment", "config": {"batchCount": 3}},
            "datajet": {"name": "fixed", "config": {"fail": true}},
            "stage": {"continueOnError": continue_on_error},
        })
    };
    let config = PipelineConfig::default();
    let ctx = PipelineContext::default();

    let stop = harness.build(failing(false)).unwrap().execute_stage(&config, &ctx).await;
    let keep = harness.build(failing(true)).unwrap().execute_stage(&config, &ctx).await;

    assert!(!stop.is_execution_success);
    assert_eq!(stop.errors.len(), 1);
    assert!(!keep.is_execution_success);
    assert_eq!(keep.errors.len(), 3);
}

#[tokio::test]
async fn stalled_stage_times_out_without_blocking_siblings() {
    let harness = Harness::new();
    let pipeline = harness
        .build(json!({
            "component": "synchronizer",
            "children": [
                stage(json!({"name": "slow", "config": {"delayMs": 5000}}), json!({"name": "discard"})),
                stage(json!({"name": "increment"}), json!({"name": "discard"})),
            ],
        }))
        .unwrap();
    let config = PipelineConfig::default().with_stage_timeout(Duration::from_millis(50));

    let result = pipeline.execute_stage(&config, &PipelineContext::default()).await;

    assert!(!result.is_execution_success);
    assert!(result.children[0].errors[0].contains("timed out"));
    assert!(result.children[1].is_success());
}

#[tokio::test]
async fn failed_validation_skips_execution() {
    let harness = Harness::new();
    let pipeline = harness
        .build(stage(json!({"name": "static"}), json!({"name": "record"})))
        .unwrap();

    let result = pipeline
        .execute_stage(&PipelineConfig::default(), &PipelineContext::default())
        .await;

    assert!(!result.is_validation_success);
    assert!(!result.is_execution_success);
    assert!(harness.recorded().is_empty());
}

#[tokio::test]
async fn pending_validators_surface_at_the_root() {
    let harness = Harness::new();
    let pipeline = harness
        .build(json!({
            "component": "synchronizer",
            "children": [stage(json!({"name": "increment"}), json!({"name": "approval"}))],
        }))
        .unwrap();

    let result = pipeline
        .execute_stage(&PipelineConfig::default(), &PipelineContext::default())
        .await;

    assert!(result.is_success());
    assert!(!result.is_final());
    assert_eq!(result.pending_validators, vec!["manual-approval".to_string()]);
}

#[tokio::test]
async fn file_datajet_writes_under_workspace_root() {
    let harness = Harness::new();
    let pipeline = harness
        .build(stage(
            json!({"name": "increment", "config": {"batchSize": 2, "batchCount": 2, "key": "n"}}),
            json!({"name": "file", "config": {"path": "out/seq.jsonl"}}),
        ))
        .unwrap();

    let result = pipeline
        .execute_stage(&PipelineConfig::default(), &PipelineContext::default())
        .await;
    assert!(result.is_success(), "{:?}", result.errors);

    let written =
        std::fs::read_to_string(harness.workspace.path().join("workspace/out/seq.jsonl")).unwrap();
    let lines: Vec<&str> = written.lines().collect();
    assert_eq!(lines, vec![r#"{"n":0}"#, r#"{"n":1}"#, r#"{"n":2}"#, r#"{"n":3}"#]);
}

#[tokio::test]
async fn stalled_validator_times_out() {
    let harness = Harness::new();
    let pipeline = harness
        .build(json!({
            "component": "synchronizer",
            "children": [
                stage(json!({"name": "increment"}), json!({"name": "stalled"})),
                stage(json!({"name": "increment"}), json!({"name": "discard"})),
            ],
        }))
        .unwrap();
    let config = PipelineConfig::default().with_stage_timeout(Duration::from_millis(50));
    let ctx = PipelineContext::default();

    let result = tokio::time::timeout(Duration::from_secs(2), pipeline.execute_stage(&config, &ctx))
        .await
        .expect("stage timeout should bound validation");

    let stalled = &result.children[0];
    assert!(!stalled.is_validation_success);
    assert!(!stalled.is_execution_success);
    assert!(stalled.errors[0].contains("timed out"), "{:?}", stalled.errors);
    assert!(result.children[1].is_success());
}

fn sleeping_children(max_concurrency: Option<usize>) -> Value {
    let child = || stage(json!({"name": "slow", "config": {"delayMs": 300, "count": 1}}), json!({"name": "discard"}));
    let mut schema = json!({
        "component": "synchronizer",
        "children": [child(), child(), child()],
    });
    if let Some(limit) = max_concurrency {
        schema["config"] = json!({"maxConcurrency": limit});
    }
    schema
}

#[tokio::test]
async fn synchronizer_children_run_concurrently() {
    let harness = Harness::new();
    let pipeline = harness.build(sleeping_children(None)).unwrap();

    let started = Instant::now();
    let result = pipeline
        .execute_stage(&PipelineConfig::default(), &PipelineContext::default())
        .await;
    let elapsed = started.elapsed();

    assert!(result.is_success());
    assert_eq!(result.children.len(), 3);
    assert!(elapsed < Duration::from_millis(750), "took {elapsed:?}");
}

#[tokio::test]
async fn max_concurrency_bounds_the_fan_out() {
    let harness = Harness::new();
    let pipeline = harness.build(sleeping_children(Some(1))).unwrap();

    let started = Instant::now();
    let result = pipeline
        .execute_stage(&PipelineConfig::default(), &PipelineContext::default())
        .await;
    let elapsed = started.elapsed();

    assert!(result.is_success());
    assert_eq!(result.children.len(), 3);
    assert!(elapsed >= Duration::from_millis(900), "took {elapsed:?}");
}

#[tokio::test]
async fn sibling_stages_keep_separate_metrics() {
    let harness = Harness::new();
    let pipeline = harness
        .build(json!({
            "component": "synchronizer",
            "children": [
                stage(json!({"name": "increment", "config": {"batchSize": 2}}), json!({"name": "discard"})),
                stage(json!({"name": "increment", "config": {"batchSize": 5}}), json!({"name": "discard"})),
            ],
        }))
        .unwrap();
    let ctx = PipelineContext::default();

    pipeline.execute_stage(&PipelineConfig::default(), &ctx).await;

    let snapshot = ctx.metrics().snapshot();
    assert_eq!(snapshot.stages.len(), 2);
    assert_eq!(snapshot.stages["$.children[0]"].records, 2);
    assert_eq!(snapshot.stages["$.children[1]"].records, 5);
}

#[test]
fn file_datajet_path_must_stay_in_workspace() {
    let harness = Harness::new();
    let err = harness
        .build(stage(
            json!({"name": "increment"}),
            json!({"name": "file", "config": {"path": "../outside.jsonl"}}),
        ))
        .unwrap_err();
    assert!(
        matches!(err, BuildError::PluginFactory { kind: PluginKind::Datajet, ref name, .. } if name == "file"),
        "got: {err}"
    );
}
