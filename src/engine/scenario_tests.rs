// End-to-end scenario tests for the runner against a mock function store
use crate::{
    engine::{
        loader::ScenarioLoader,
        pipeline::{EngineLimits, RunOutcome},
        runner::{PipelineRunner, RunMode},
        storage::InMemoryStorage,
        test_support::scenario_from,
    },
    integrations::{
        http::{CallContext, HttpClient, RetryPolicy},
        metrics::InMemoryMetrics,
        test_support::spawn_server,
        Endpoints, Services,
    },
    models::{DebugAction, Scenario, StepStatus, TaskStatus, Version},
    PipelinerError,
};

use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use serde_json::{json, Map, Value};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use uuid::Uuid;

type Calls = Arc<Mutex<Vec<(String, Value)>>>;

const SLOW_REPLY: Duration = Duration::from_secs(3);

/// Echoes its body, adds `ok` (Input == "Value") and, for a numeric
/// Input n, `Items` holding n copies of n. `Slow` answers after SLOW_REPLY.
async fn call_function(State(calls): State<Calls>, Path(name): Path<String>, Json(body): Json<Value>) -> Json<Value> {
    calls.lock().unwrap().push((name.clone(), body.clone()));
    if name == "Slow" {
        tokio::time::sleep(SLOW_REPLY).await;
    }

    let input = body.get("Input").cloned().unwrap_or(Value::Null);
    let mut reply = body.as_object().cloned().unwrap_or_default();
    reply.insert("ok".to_string(), json!(input == json!("Value")));
    if let Some(n) = input.as_u64() {
        reply.insert("Items".to_string(), json!(vec![n; n as usize]));
    }
    Json(Value::Object(reply))
}

struct TestHarness {
    runner: PipelineRunner,
    calls: Calls,
    metrics: Arc<InMemoryMetrics>,
}

impl TestHarness {
    fn called(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(name, _)| name.clone()).collect()
    }

    fn bodies(&self) -> Vec<Value> {
        self.calls.lock().unwrap().iter().map(|(_, body)| body.clone()).collect()
    }

    async fn approve(&self, scenario: Scenario) -> Version {
        let draft = self.runner.create_pipeline(scenario, "author").await.unwrap();
        self.runner.send_to_approve(draft.version_id).await.unwrap();
        self.runner.approve(draft.version_id, "approver").await.unwrap();
        draft
    }

    async fn run(&self, version: &Version, params: Value) -> crate::Result<Map<String, Value>> {
        let resp = self
            .runner
            .run_pipeline(version.pipeline_id, params, "tester", RunMode::Sync, &CallContext::background())
            .await?;
        assert_eq!(resp.status, TaskStatus::Finished);
        Ok(resp.output.unwrap_or_default())
    }
}

async fn create_test_harness_with_limits(limits: EngineLimits) -> TestHarness {
    let calls: Calls = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/function/:name", post(call_function))
        .with_state(calls.clone());
    let base = spawn_server(app).await;

    let metrics = Arc::new(InMemoryMetrics::new());
    let policy = RetryPolicy {
        max_retries: 1,
        retry_delay: Duration::from_millis(10),
        timeout: Duration::from_secs(5),
    };
    let http = HttpClient::new(policy, metrics.clone()).unwrap();
    let endpoints = Endpoints {
        function_store: base,
        ..Endpoints::default()
    };
    let runner = PipelineRunner::new(
        Arc::new(InMemoryStorage::new()),
        ScenarioLoader::new(http, endpoints),
        Services::default(),
        limits,
    );

    TestHarness { runner, calls, metrics }
}

async fn create_test_harness() -> TestHarness {
    create_test_harness_with_limits(EngineLimits::default()).await
}

fn value(name: &str, global: &str) -> Value {
    json!({ "name": name, "type": "any", "global": global })
}

/// A `python3` block calling function `title`
fn function(title: &str, input: &[(&str, &str)], output: &[(&str, &str)], next: &str) -> Value {
    json!({
        "block_type": "python3", "title": title,
        "input": input.iter().map(|(n, g)| value(n, g)).collect::<Vec<_>>(),
        "output": output.iter().map(|(n, g)| value(n, g)).collect::<Vec<_>>(),
        "next": next
    })
}

fn start(next: &str) -> Value {
    json!({ "block_type": "internal", "title": "input", "next": next })
}

fn for_each(iter: &str, now_on: &str, body: &str, after: &str) -> Value {
    json!({
        "block_type": "internal", "title": "for",
        "input": [ value("iter", iter) ],
        "output": [ value("now_on", now_on) ],
        "body": body, "after": after
    })
}

fn create_test_scenario(name: &str, input: &[&str], output: &[(&str, &str)], blocks: Value) -> Scenario {
    scenario_from(json!({
        "id": Uuid::nil(), "version_id": Uuid::nil(), "name": name, "status": 1,
        "input": input.iter().map(|n| value(n, &format!("{}.{}", name, n))).collect::<Vec<_>>(),
        "output": output.iter().map(|(n, g)| value(n, g)).collect::<Vec<_>>(),
        "pipeline": { "entrypoint": "Start", "blocks": blocks }
    }))
}

fn linear() -> Scenario {
    create_test_scenario(
        "Linear",
        &["Input"],
        &[("Input", "Block3.Input")],
        json!({
            "Start": start("Block1"),
            "Block1": function("Block1", &[("Input", "Linear.Input")], &[("Input", "Block1.Input")], "Block2"),
            "Block2": function("Block2", &[("Input", "Block1.Input")], &[("Input", "Block2.Input")], "Block3"),
            "Block3": function("Block3", &[("Input", "Block2.Input")], &[("Input", "Block3.Input")], ""),
        }),
    )
}

fn branching() -> Scenario {
    create_test_scenario(
        "Branch",
        &["Input"],
        &[],
        json!({
            "Start": start("Block1"),
            "Block1": function("Block1", &[("Input", "Branch.Input")], &[("ok", "Block1.ok")], "If"),
            "If": {
                "block_type": "internal", "title": "if",
                "input": [ value("check", "Block1.ok") ],
                "on_true": "BlockTrue", "on_false": "BlockFalse"
            },
            "BlockTrue": function("BlockTrue", &[("Input", "Branch.Input")], &[], ""),
            "BlockFalse": function("BlockFalse", &[("Input", "Branch.Input")], &[], ""),
        }),
    )
}

fn counted_loop() -> Scenario {
    create_test_scenario(
        "Loop",
        &["Input"],
        &[("Last", "Block2.Input")],
        json!({
            "Start": start("Block1"),
            "Block1": function("Block1", &[("Input", "Loop.Input")], &[("Items", "Block1.Items")], "For"),
            "For": for_each("Block1.Items", "For.now_on", "Block2", "Block3"),
            "Block2": function("Block2", &[("Input", "For.now_on")], &[("Input", "Block2.Input")], "For"),
            "Block3": function("Block3", &[("Input", "Loop.Input")], &[], ""),
        }),
    )
}

#[tokio::test]
async fn test_linear_pipeline() {
    let harness = create_test_harness().await;
    let version = harness.approve(linear()).await;

    let output = harness.run(&version, json!({ "Input": "Value" })).await.unwrap();

    assert_eq!(harness.called(), vec!["Block1", "Block2", "Block3"]);
    for body in harness.bodies() {
        assert_eq!(body, json!({ "Input": "Value" }));
    }
    assert_eq!(Value::Object(output), json!({ "Input": "Value" }));
    assert_eq!(harness.metrics.ok_count("function_store"), 3);
}

#[tokio::test]
async fn test_if_routes_to_true_branch() {
    let harness = create_test_harness().await;
    let version = harness.approve(branching()).await;

    harness.run(&version, json!({ "Input": "Value" })).await.unwrap();
    assert_eq!(harness.called(), vec!["Block1", "BlockTrue"]);
}

#[tokio::test]
async fn test_if_routes_to_false_branch() {
    let harness = create_test_harness().await;
    let version = harness.approve(branching()).await;

    harness.run(&version, json!({ "Input": "Unexpected" })).await.unwrap();
    assert_eq!(harness.called(), vec!["Block1", "BlockFalse"]);
}

#[tokio::test]
async fn test_for_runs_body_once_per_element() {
    let harness = create_test_harness().await;
    let version = harness.approve(counted_loop()).await;

    harness.run(&version, json!({ "Input": 3 })).await.unwrap();
    assert_eq!(harness.called(), vec!["Block1", "Block2", "Block2", "Block2", "Block3"]);
}

#[tokio::test]
async fn test_connector_joins_in_declared_order() {
    let harness = create_test_harness().await;
    let scenario = create_test_scenario(
        "Join",
        &["One", "Two", "Three"],
        &[],
        json!({
            "Start": start("Block1"),
            "Block1": function("Block1", &[("Input", "Join.One")], &[("Input", "Block1.Input")], "Block2"),
            "Block2": function("Block2", &[("Input", "Join.Two")], &[("Input", "Block2.Input")], "Block3"),
            "Block3": function("Block3", &[("Input", "Join.Three")], &[("Input", "Block3.Input")], "Connector"),
            "Connector": {
                "block_type": "internal", "title": "connector",
                "input": [ value("a", "Block1.Input"), value("b", "Block2.Input"), value("c", "Block3.Input") ],
                "output": [ value("Output", "Connector.Output") ],
                "next": "Block4"
            },
            "Block4": function("Block4", &[("Input", "Connector.Output")], &[], ""),
        }),
    );
    let version = harness.approve(scenario).await;

    harness
        .run(&version, json!({ "One": "1", "Two": "2", "Three": "3" }))
        .await
        .unwrap();

    assert_eq!(harness.called(), vec!["Block1", "Block2", "Block3", "Block4"]);
    assert_eq!(harness.bodies()[3], json!({ "Input": ["1", "2", "3"] }));
}

#[tokio::test]
async fn test_nested_for_in_for() {
    let harness = create_test_harness().await;
    let scenario = create_test_scenario(
        "Nested",
        &["Input"],
        &[],
        json!({
            "Start": start("MasGen"),
            "MasGen": function("MasGen", &[("Input", "Nested.Input")], &[("Items", "MasGen.Items")], "Outer"),
            "Outer": for_each("MasGen.Items", "Outer.now_on", "InnerGen", ""),
            "InnerGen": function("MasGen", &[("Input", "Outer.now_on")], &[("Items", "InnerGen.Items")], "Inner"),
            "Inner": for_each("InnerGen.Items", "Inner.now_on", "Block1", "Outer"),
            "Block1": function("Block1", &[("Input", "Inner.now_on")], &[], "Inner"),
        }),
    );
    let version = harness.approve(scenario).await;

    harness.run(&version, json!({ "Input": 3 })).await.unwrap();

    let mut expected = vec!["MasGen"];
    for _ in 0..3 {
        expected.extend(["MasGen", "Block1", "Block1", "Block1"]);
    }
    assert_eq!(harness.called(), expected);
}

#[tokio::test]
async fn test_steps_are_dense_and_last_snapshot_has_outputs() {
    let harness = create_test_harness().await;
    let version = harness.approve(counted_loop()).await;

    let resp = harness
        .runner
        .run_pipeline(version.pipeline_id, json!({ "Input": 2 }), "tester", RunMode::Sync, &CallContext::background())
        .await
        .unwrap();
    let task = harness.runner.get_task_with_steps(resp.task_id).await.unwrap();

    let content = harness.runner.get_version(version.version_id).await.unwrap().content;
    for (i, step) in task.steps.iter().enumerate() {
        assert_eq!(step.index, i as u64);
        assert_eq!(step.status, StepStatus::Finished);
        assert!(content.pipeline.blocks.contains_key(&step.block_name));
    }
    let last = task.steps.last().unwrap();
    for out in &content.output {
        assert!(last.snapshot.values.contains_key(out.global.as_deref().unwrap()));
    }
}

#[tokio::test]
async fn test_sub_pipeline_runs_as_child_task() {
    let harness = create_test_harness().await;
    harness
        .approve(create_test_scenario(
            "Sub",
            &["Input"],
            &[("Input", "Block1.Input")],
            json!({
                "Start": start("Block1"),
                "Block1": function("SubBlock", &[("Input", "Sub.Input")], &[("Input", "Block1.Input")], ""),
            }),
        ))
        .await;
    let parent = harness
        .approve(create_test_scenario(
            "Parent",
            &["Input"],
            &[("Input", "Nested.Input")],
            json!({
                "Start": start("Nested"),
                "Nested": {
                    "block_type": "scenario", "title": "Sub",
                    "input": [ value("Input", "Parent.Input") ],
                    "output": [ value("Input", "Nested.Input") ],
                    "next": "Block2"
                },
                "Block2": function("Block2", &[("Input", "Nested.Input")], &[], ""),
            }),
        ))
        .await;

    let resp = harness
        .runner
        .run_pipeline(parent.pipeline_id, json!({ "Input": "Value" }), "tester", RunMode::Sync, &CallContext::background())
        .await
        .unwrap();

    assert_eq!(resp.output.unwrap()["Input"], "Value");
    assert_eq!(harness.called(), vec!["SubBlock", "Block2"]);

    let tasks = harness.runner.list_tasks(None).await.unwrap();
    assert_eq!(tasks.len(), 2);
    let child = tasks.iter().find(|t| t.id != resp.task_id).unwrap();
    assert_eq!(child.parent_task, Some(resp.task_id));
    assert_eq!(child.status, TaskStatus::Finished);

    // The parent step remembers the sub-task
    let steps = harness.runner.get_task_with_steps(resp.task_id).await.unwrap().steps;
    let nested = steps.iter().find(|s| s.block_name == "Nested").unwrap();
    assert_eq!(nested.state["Nested"]["sub_task_id"], json!(child.id));
}

#[tokio::test]
async fn test_self_recursion_hits_depth_limit() {
    let harness = create_test_harness_with_limits(EngineLimits {
        max_steps: 100,
        max_depth: 3,
    })
    .await;
    let version = harness
        .approve(create_test_scenario(
            "Recursive",
            &[],
            &[],
            json!({
                "Start": start("Again"),
                "Again": { "block_type": "scenario", "title": "Recursive" },
            }),
        ))
        .await;

    let err = harness.run(&version, json!({})).await.unwrap_err();
    assert!(matches!(err, PipelinerError::PipelineExecution(_)));
    assert!(err.to_string().contains("nesting depth"));
}

#[tokio::test]
async fn test_upstream_failure_marks_task_error() {
    let harness = create_test_harness().await;
    // Point the only function at a route the mock does not serve
    let scenario = create_test_scenario(
        "Broken",
        &["Input"],
        &[],
        json!({
            "Start": start("Block1"),
            "Block1": function("missing/route", &[("Input", "Broken.Input")], &[], ""),
        }),
    );
    let version = harness.approve(scenario).await;

    let err = harness.run(&version, json!({ "Input": "Value" })).await.unwrap_err();
    assert!(matches!(err, PipelinerError::PipelineExecution(_)));

    let task = &harness.runner.list_tasks(Some(version.version_id)).await.unwrap()[0];
    assert_eq!(task.status, TaskStatus::Error);
    assert_eq!(harness.metrics.fail_count("function_store"), 1);
}

async fn last_values(runner: &PipelineRunner, task_id: Uuid) -> BTreeMap<String, Value> {
    let task = runner.get_task_with_steps(task_id).await.unwrap();
    task.steps.last().unwrap().snapshot.values.clone()
}

#[tokio::test]
async fn test_step_by_step_debug_matches_straight_run() {
    let harness = create_test_harness().await;
    let version = harness.approve(counted_loop()).await;
    let params = json!({ "Input": 3 });

    let straight = harness
        .runner
        .run_pipeline(version.pipeline_id, params.clone(), "tester", RunMode::Sync, &CallContext::background())
        .await
        .unwrap();

    let task = harness
        .runner
        .create_debug_task(version.version_id, params, "tester")
        .await
        .unwrap();
    let call = CallContext::background();
    let mut rounds = 0;
    loop {
        let result = harness
            .runner
            .debug_run(task.id, vec![], DebugAction::StepOver, &call)
            .await
            .unwrap();
        rounds += 1;
        if result.outcome == RunOutcome::Finished {
            assert_eq!(result.task.status, TaskStatus::Finished);
            break;
        }
        assert_eq!(result.task.status, TaskStatus::Stopped);
        assert!(rounds < 50, "debug session does not terminate");
    }

    // Start, Block1, For + Block2 three times, For, Block3
    assert_eq!(rounds, 10);
    assert_eq!(
        last_values(&harness.runner, task.id).await,
        last_values(&harness.runner, straight.task_id).await
    );
}

#[tokio::test]
async fn test_breakpoint_pauses_before_block_and_resume_continues() {
    let harness = create_test_harness().await;
    let version = harness.approve(linear()).await;
    let task = harness
        .runner
        .create_debug_task(version.version_id, json!({ "Input": "Value" }), "tester")
        .await
        .unwrap();
    let call = CallContext::background();

    let paused = harness
        .runner
        .debug_run(task.id, vec!["Block3".to_string()], DebugAction::Resume, &call)
        .await
        .unwrap();
    assert_eq!(paused.outcome, RunOutcome::Paused { at: "Block3".to_string() });
    assert_eq!(paused.task.status, TaskStatus::Stopped);
    assert_eq!(harness.called(), vec!["Block1", "Block2"]);

    let done = harness
        .runner
        .debug_run(task.id, vec!["Block3".to_string()], DebugAction::Resume, &call)
        .await
        .unwrap();
    assert_eq!(done.outcome, RunOutcome::Finished);
    assert_eq!(harness.called(), vec!["Block1", "Block2", "Block3"]);

    let steps = harness.runner.get_task_with_steps(task.id).await.unwrap().steps;
    let statuses: Vec<_> = steps.iter().map(|s| (s.block_name.as_str(), s.status)).collect();
    assert_eq!(
        statuses,
        vec![
            ("Start", StepStatus::Finished),
            ("Block1", StepStatus::Finished),
            ("Block2", StepStatus::Finished),
            ("Block3", StepStatus::Paused),
            ("Block3", StepStatus::Finished),
        ]
    );
}

#[tokio::test]
async fn test_dropped_caller_cancels_sync_run() {
    let harness = create_test_harness().await;
    let version = harness
        .approve(create_test_scenario(
            "Stalled",
            &["Input"],
            &[],
            json!({
                "Start": start("Block1"),
                "Block1": function("Slow", &[("Input", "Stalled.Input")], &[], ""),
            }),
        ))
        .await;

    let runner = harness.runner.clone();
    let pipeline_id = version.pipeline_id;
    let caller = tokio::spawn(async move {
        let call = CallContext::background();
        let _guard = call.cancel.clone().drop_guard();
        runner
            .run_pipeline(pipeline_id, json!({ "Input": "Value" }), "tester", RunMode::Sync, &call)
            .await
    });

    while harness.called().is_empty() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    caller.abort();

    let mut task = harness.runner.list_tasks(Some(version.version_id)).await.unwrap().remove(0);
    for _ in 0..100 {
        if task.status == TaskStatus::Error {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        task = harness.runner.get_task(task.id).await.unwrap();
    }
    assert_eq!(task.status, TaskStatus::Error);

    let steps = harness.runner.get_task_with_steps(task.id).await.unwrap().steps;
    assert_eq!(steps.last().unwrap().status, StepStatus::Error);

    // The spawned run deregisters itself right after the status update
    let mut deregistered = false;
    for _ in 0..100 {
        if harness.runner.cancel_task(task.id).is_err() {
            deregistered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(deregistered);
}
