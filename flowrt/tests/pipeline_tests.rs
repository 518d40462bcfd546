use flowlang::CompareOp;
use flowrt::{
    Entity, EntityKind, ExecuteOptions, Runtime, RuntimeConfig, RuntimeError, StreamEvent,
    StreamSink, StubProvider, Value, Workspace,
};
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A step that produces `output` without calling a model.
fn transform(name: &str, output: Value) -> Entity {
    Entity::new(EntityKind::Step, name).with_property("output", output)
}

/// A step whose output expression always fails with a type error.
fn broken(name: &str) -> Entity {
    transform(name, Value::call("len", vec![Value::Number(5.0)]))
}

fn runtime(entities: Vec<Entity>) -> Runtime {
    Runtime::new(Workspace::from_entities(entities), RuntimeConfig::default())
}

#[tokio::test]
async fn steps_run_in_order_and_see_earlier_outputs() {
    let pipeline = Entity::new(EntityKind::Pipeline, "chain")
        .with_child(transform("a", Value::from("alpha")))
        .with_child(transform("b", Value::from("{{step.a.output}}-beta")))
        .with_child(transform("c", Value::property_access("step", &["b", "output"])));
    let rt = runtime(vec![pipeline.clone()]);

    let result = rt.execute(&pipeline, ExecuteOptions::default()).await.unwrap();
    assert_eq!(result.output, Value::from("alpha-beta"));
    let names: Vec<&str> = result.steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b", "c"]);
    assert!(result.steps.iter().all(|s| s.success));
    assert_eq!(result.kind, "pipeline");
}

#[tokio::test]
async fn failing_step_stops_the_pipeline_and_keeps_partial_results() {
    let pipeline = Entity::new(EntityKind::Pipeline, "abc")
        .with_child(transform("a", Value::from("A")))
        .with_child(broken("b"))
        .with_child(transform("c", Value::from("C")));
    let rt = runtime(vec![pipeline.clone()]);

    let failure = rt
        .execute(&pipeline, ExecuteOptions::default())
        .await
        .unwrap_err();
    assert_eq!(failure.error.failed_step(), Some("b"));
    assert!(matches!(
        failure.error,
        RuntimeError::StepFailed { ref source, .. } if matches!(**source, RuntimeError::TypeError(_))
    ));
    let partial = failure.partial;
    assert_eq!(partial.output, Value::from("A"));
    assert!(partial.step("a").map(|s| s.success).unwrap_or(false));
    assert!(!partial.step("b").map(|s| s.success).unwrap_or(true));
    assert!(partial.step("c").is_none());
}

#[tokio::test]
async fn set_binds_variables_from_the_step_output() {
    let pipeline = Entity::new(EntityKind::Pipeline, "vars")
        .with_child(
            transform("fetch", Value::from("42")).with_property(
                "set",
                Value::object([("answer", Value::variable("output"))]),
            ),
        )
        .with_child(transform("use", Value::from("answer is {{answer}}")));
    let rt = runtime(vec![pipeline.clone()]);

    let result = rt.execute(&pipeline, ExecuteOptions::default()).await.unwrap();
    assert_eq!(result.output, Value::from("answer is 42"));
}

#[tokio::test]
async fn pipeline_output_property_overrides_last_step() {
    let pipeline = Entity::new(EntityKind::Pipeline, "out")
        .with_child(transform("a", Value::from("A")))
        .with_child(transform("b", Value::from("B")))
        .with_property("output", Value::from("{{step.a.output}}"));
    let rt = runtime(vec![pipeline.clone()]);

    let result = rt.execute(&pipeline, ExecuteOptions::default()).await.unwrap();
    assert_eq!(result.output, Value::from("A"));
}

#[tokio::test]
async fn parallel_block_collects_child_outputs() {
    let block = Entity::new(EntityKind::Parallel, "fan")
        .with_child(transform("left", Value::from("L")))
        .with_child(transform("right", Value::from("R")));
    let rt = runtime(vec![]);

    let result = rt.execute(&block, ExecuteOptions::default()).await.unwrap();
    assert_eq!(
        result.output,
        Value::object([("left", Value::from("L")), ("right", Value::from("R"))])
    );
    assert_eq!(result.steps.len(), 2);
}

#[tokio::test]
async fn parallel_failure_keeps_sibling_results() {
    let block = Entity::new(EntityKind::Parallel, "fan")
        .with_child(transform("ok", Value::from("fine")))
        .with_child(broken("bad"));
    let pipeline = Entity::new(EntityKind::Pipeline, "fanout")
        .with_property("parallel", Value::entity(block));
    let rt = runtime(vec![pipeline.clone()]);

    let failure = rt
        .execute(&pipeline, ExecuteOptions::default())
        .await
        .unwrap_err();
    assert_eq!(failure.error.failed_step(), Some("bad"));
    let ok = failure.partial.step("ok").unwrap();
    assert!(ok.success);
    assert_eq!(ok.output, "fine");
}

#[tokio::test]
async fn parallel_failure_among_three_children_keeps_both_siblings() {
    let block = Entity::new(EntityKind::Parallel, "fan")
        .with_child(transform("first", Value::from("one")))
        .with_child(broken("middle"))
        .with_child(transform("last", Value::from("three")));
    let pipeline = Entity::new(EntityKind::Pipeline, "fanout")
        .with_property("parallel", Value::entity(block));
    let rt = runtime(vec![pipeline.clone()]);

    let failure = rt
        .execute(&pipeline, ExecuteOptions::default())
        .await
        .unwrap_err();
    assert_eq!(failure.error.failed_step(), Some("middle"));
    assert!(failure.partial.step("middle").is_some_and(|s| !s.success));
    for (name, output) in [("first", "one"), ("last", "three")] {
        let step = failure.partial.step(name).unwrap();
        assert!(step.success);
        assert_eq!(step.output, output);
    }
}

fn triage_pipeline(with_default: bool) -> Entity {
    let mut cases = HashMap::new();
    cases.insert("bug".to_string(), transform("fix", Value::from("patched")));
    if with_default {
        cases.insert("default".to_string(), transform("triage", Value::from("queued")));
    }
    Entity::new(EntityKind::Pipeline, "triage").with_property(
        "branch",
        Value::Branch {
            condition: Box::new(Value::variable("input")),
            cases,
        },
    )
}

#[tokio::test]
async fn branch_runs_the_matching_case() {
    let pipeline = triage_pipeline(true);
    let rt = runtime(vec![]);
    let result = rt
        .execute(&pipeline, ExecuteOptions::with_input(Value::from("bug")))
        .await
        .unwrap();
    assert_eq!(result.output, Value::from("patched"));
    assert!(result.step("fix").is_some());
}

#[tokio::test]
async fn branch_falls_back_to_default() {
    let pipeline = triage_pipeline(true);
    let rt = runtime(vec![]);
    let result = rt
        .execute(&pipeline, ExecuteOptions::with_input(Value::from("feature")))
        .await
        .unwrap();
    assert_eq!(result.output, Value::from("queued"));
}

#[tokio::test]
async fn branch_without_match_or_default_is_a_no_op() {
    let pipeline = triage_pipeline(false);
    let rt = runtime(vec![]);
    let result = rt
        .execute(&pipeline, ExecuteOptions::with_input(Value::from("feature")))
        .await
        .unwrap();
    assert_eq!(result.output, Value::from(""));
    assert!(result.steps.is_empty());
}

fn counting_loop(max: i64, break_when: Option<Value>) -> Entity {
    Entity::new(EntityKind::Pipeline, "repeat").with_property(
        "loop",
        Value::Loop {
            max,
            body: vec![transform("tick", Value::variable("iteration"))],
            break_when: break_when.map(Box::new),
        },
    )
}

#[tokio::test]
async fn loop_runs_up_to_max_iterations() {
    let rt = runtime(vec![]);
    let result = rt
        .execute(&counting_loop(3, None), ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(result.steps.len(), 3);
    assert_eq!(result.output, Value::Number(2.0));
}

#[tokio::test]
async fn loop_stops_when_break_condition_holds() {
    let stop_after_second = Value::compare(
        Value::variable("iteration"),
        CompareOp::Eq,
        Value::from("1"),
    );
    let rt = runtime(vec![]);
    let result = rt
        .execute(
            &counting_loop(5, Some(stop_after_second)),
            ExecuteOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.steps.len(), 2);
    assert_eq!(result.output, Value::Number(1.0));
}

#[tokio::test]
async fn loop_break_is_checked_after_each_iteration() {
    let rt = runtime(vec![]);
    let result = rt
        .execute(
            &counting_loop(3, Some(Value::Bool(true))),
            ExecuteOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.steps.len(), 1);
}

#[tokio::test]
async fn blocks_run_parallel_then_branch_then_loop() {
    let mut cases = HashMap::new();
    cases.insert(
        "default".to_string(),
        transform("branched", Value::from("after {{step.fanned.output}}")),
    );
    let pipeline = Entity::new(EntityKind::Pipeline, "ordered")
        .with_property(
            "loop",
            Value::Loop {
                max: 1,
                body: vec![transform("looped", Value::from("{{step.branched.output}}!"))],
                break_when: None,
            },
        )
        .with_property(
            "branch",
            Value::Branch {
                condition: Box::new(Value::from("anything")),
                cases,
            },
        )
        .with_property(
            "parallel",
            Value::entity(
                Entity::new(EntityKind::Parallel, "fan")
                    .with_child(transform("fanned", Value::from("parallel"))),
            ),
        );
    let rt = runtime(vec![]);

    let result = rt.execute(&pipeline, ExecuteOptions::default()).await.unwrap();
    let names: Vec<&str> = result.steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["fanned", "branched", "looped"]);
    assert_eq!(result.output, Value::from("after parallel!"));
}

#[tokio::test]
async fn non_positive_loop_max_uses_default_bound() {
    let rt = runtime(vec![]);
    let result = rt
        .execute(&counting_loop(0, None), ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(result.steps.len(), 10);
}

#[tokio::test]
async fn run_step_executes_a_nested_pipeline() {
    let inner = Entity::new(EntityKind::Pipeline, "inner")
        .with_child(transform("echo", Value::from("got {{input}}")));
    let outer = Entity::new(EntityKind::Pipeline, "outer").with_child(
        Entity::new(EntityKind::Step, "delegate")
            .with_property("run", Value::reference("pipeline", "inner"))
            .with_property("input", Value::from("payload")),
    );
    let rt = runtime(vec![inner, outer.clone()]);

    let result = rt.execute(&outer, ExecuteOptions::default()).await.unwrap();
    assert_eq!(result.output, Value::from("got payload"));
}

#[tokio::test]
async fn non_executable_kinds_are_rejected() {
    let agent = Entity::new(EntityKind::Agent, "helper");
    let rt = runtime(vec![agent.clone()]);
    let failure = rt
        .execute(&agent, ExecuteOptions::default())
        .await
        .unwrap_err();
    assert_eq!(
        failure.error,
        RuntimeError::UnsupportedEntityType("agent".to_string())
    );
}

#[tokio::test]
async fn model_steps_stream_chunks_and_lifecycle_events() {
    let agent = Entity::new(EntityKind::Agent, "writer")
        .with_property("instruction", Value::from("Be brief."));
    let pipeline = Entity::new(EntityKind::Pipeline, "story")
        .with_property("use", Value::reference("agent", "writer"))
        .with_child(Entity::new(EntityKind::Step, "draft").with_property("prompt", Value::from("go")));
    let rt = runtime(vec![agent, pipeline.clone()]);
    let stub = Arc::new(StubProvider::new());
    stub.push_text("hello streaming world");
    rt.register_provider(stub.clone());

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink_events = events.clone();
    let sink: StreamSink = Arc::new(move |event: StreamEvent| {
        sink_events.lock().unwrap().push(event)
    });
    let options = ExecuteOptions {
        stream: Some(sink),
        ..Default::default()
    };
    let result = rt.execute(&pipeline, options).await.unwrap();
    assert_eq!(result.output, Value::from("hello streaming world"));
    assert_eq!(result.usage.total_tokens, 15);

    let events = events.lock().unwrap().clone();
    assert!(matches!(events.first(), Some(StreamEvent::Started { .. })));
    assert!(events.contains(&StreamEvent::StepStarted {
        step: "draft".to_string()
    }));
    let streamed: String = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Chunk { content } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(streamed, "hello streaming world");
    assert_eq!(
        events.last(),
        Some(&StreamEvent::Finished {
            output: "hello streaming world".to_string()
        })
    );

    let request = &stub.requests()[0];
    assert_eq!(request.system.as_deref(), Some("Be brief."));
}
