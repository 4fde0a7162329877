mod common;

use std::collections::BTreeSet;

use common::*;
use flowgate::engine::{
    Executor, ExecutorError, InvocationOutcome, InvocationRequest, PlanError, ProfileError,
    ScriptStatus, SkipReason,
};
use flowgate::workflow::codec;
use flowgate::workflow::{BatchGraph, Phase, ScriptKind};
use futures::future::join_all;

#[tokio::test]
async fn test_batch_runs_flows_in_blocker_order() {
    let dir = create_test_dir();
    let calls = recorder();
    let executor = Executor::new(recording_profile(dir.path()))
        .with_registry(recording_registry(RecordingHandler::new(calls.clone())));

    let result = executor
        .run(&InvocationRequest::batch("nightly"), &diamond_store())
        .await
        .unwrap();

    assert!(result.success);
    let calls = calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 12);

    let (_, testing_end) = span(&calls_of(&calls, "testing"));
    let (left_start, left_end) = span(&calls_of(&calls, "left"));
    let (right_start, right_end) = span(&calls_of(&calls, "right"));
    let (last_start, _) = span(&calls_of(&calls, "last"));
    assert!(testing_end < left_start);
    assert!(testing_end < right_start);
    assert!(left_end < last_start);
    assert!(right_end < last_start);

    let InvocationOutcome::Batch(batch) = &result.outcome else {
        panic!("expected a batch outcome");
    };
    assert_eq!(batch.execution_order.first().map(String::as_str), Some("testing"));
    assert_eq!(batch.execution_order.last().map(String::as_str), Some("last"));

    let execution_ids: BTreeSet<&str> = batch
        .flows
        .values()
        .map(|f| f.execution_id.as_str())
        .collect();
    assert_eq!(execution_ids.len(), 4);
    for call in &calls {
        assert_eq!(call.batch_id, "nightly");
        assert_eq!(call.execution_id, batch.flows[&call.flow_id].execution_id);
        assert_eq!(call.environment["EXECUTION_ID"], call.execution_id);
    }
}

#[tokio::test]
async fn test_flow_mode_runs_only_that_flow() {
    let dir = create_test_dir();
    let calls = recorder();
    let executor = Executor::new(recording_profile(dir.path()))
        .with_registry(recording_registry(RecordingHandler::new(calls.clone())));

    let request = InvocationRequest::flow("nightly", "right").with_execution_id("exec-right-1");
    let result = executor.run(&request, &diamond_store()).await.unwrap();

    assert!(result.success);
    let calls = calls.lock().unwrap().clone();
    let flows: BTreeSet<&str> = calls.iter().map(|c| c.flow_id.as_str()).collect();
    assert_eq!(flows, ["right"].into_iter().collect());
    assert_eq!(calls.len(), 3);
    for call in &calls {
        assert_eq!(call.execution_id, "exec-right-1");
        assert_eq!(call.environment["EXECUTION_ID"], "exec-right-1");
    }

    let main = calls.iter().find(|c| c.script_id == "right-main").unwrap();
    assert_eq!(main.phase, Some(Phase::Main));
    assert_eq!(main.command[2], "exec-right-1");
}

#[tokio::test]
async fn test_flow_mode_phases_run_in_order() {
    let dir = create_test_dir();
    let calls = recorder();
    let executor = Executor::new(recording_profile(dir.path()))
        .with_registry(recording_registry(RecordingHandler::new(calls.clone())));

    let request = InvocationRequest::flow("nightly", "left");
    executor.run(&request, &diamond_store()).await.unwrap();

    let calls = calls.lock().unwrap().clone();
    let phases: Vec<Option<Phase>> = calls.iter().map(|c| c.phase).collect();
    assert_eq!(
        phases,
        vec![Some(Phase::Import), Some(Phase::Main), Some(Phase::Cleanup)]
    );
    // Generated when the request has none
    assert!(!calls[0].execution_id.is_empty());
}

#[tokio::test]
async fn test_handler_environment_resolves_placeholders() {
    let dir = create_test_dir();
    let calls = recorder();
    let executor = Executor::new(recording_profile(dir.path()))
        .with_registry(recording_registry(RecordingHandler::new(calls.clone())));

    let request = InvocationRequest::flow("nightly", "testing").with_execution_id("e1");
    executor.run(&request, &diamond_store()).await.unwrap();

    let calls = calls.lock().unwrap().clone();
    let main = calls.iter().find(|c| c.script_id == "testing-main").unwrap();
    assert_eq!(
        main.command,
        vec!["/opt/asakusa/bin/run.sh", "testing", "e1"]
    );
    assert_eq!(main.environment["ASAKUSA_HOME"], "/opt/asakusa");
}

#[test]
fn test_missing_handler_environment_fails_profile_loading() {
    let dir = create_test_dir();
    let err = load_profile(&recording_profile_store(dir.path()), &[]).unwrap_err();
    match err {
        ProfileError::Unresolved { key, source } => {
            assert!(key.contains("ASAKUSA_HOME"));
            assert!(source.to_string().contains("ASAKUSA_HOME"));
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_disabled_kind_never_runs() {
    let dir = create_test_dir();
    let calls = recorder();
    let executor = Executor::new(recording_profile(dir.path()))
        .with_registry(recording_registry(RecordingHandler::new(calls.clone())));

    let enabled = [ScriptKind::Command].into_iter().collect();
    let batch = BatchGraph::build(vec![flow(
        "mixed",
        &[],
        vec![(
            Phase::Main,
            vec![
                cluster_job("job", &[], "com.example.Job"),
                command("after", &["job"], &["echo", "done"]),
            ],
        )],
        enabled,
    )])
    .unwrap();

    let request = InvocationRequest::flow("b", "mixed");
    let result = executor
        .run(&request, &codec::encode_batch(&batch))
        .await
        .unwrap();

    assert!(result.success);
    let flow = result.flows()[0];
    assert_eq!(
        flow.script("job").unwrap().status,
        ScriptStatus::Skipped(SkipReason::Disabled)
    );
    assert_eq!(flow.script("after").unwrap().status, ScriptStatus::Succeeded);
    let ids: Vec<String> = calls.lock().unwrap().iter().map(|c| c.script_id.clone()).collect();
    assert_eq!(ids, vec!["after"]);
}

#[tokio::test]
async fn test_failed_flow_skips_its_dependents() {
    let dir = create_test_dir();
    let calls = recorder();
    let handler = RecordingHandler::new(calls.clone()).failing(&["left-main"]);
    let executor =
        Executor::new(recording_profile(dir.path())).with_registry(recording_registry(handler));

    let result = executor
        .run(&InvocationRequest::batch("nightly"), &diamond_store())
        .await
        .unwrap();

    assert!(!result.success);
    let InvocationOutcome::Batch(batch) = &result.outcome else {
        panic!("expected a batch outcome");
    };
    assert!(batch.flows["testing"].success);
    assert!(batch.flows["right"].success);
    assert!(!batch.flows["left"].success);
    assert_eq!(
        batch.flows["left"].script("left-cleanup").unwrap().status,
        ScriptStatus::Skipped(SkipReason::PhaseAborted)
    );
    assert!(batch.flows["last"].skipped);
    assert!(!batch.flows["last"].success);
    assert_eq!(batch.skipped_flows, vec!["last"]);

    let calls = calls.lock().unwrap().clone();
    assert!(calls_of(&calls, "last").is_empty());

    let failures = result.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].script_id, "left-main");
    assert!(failures[0].message.contains("failed on purpose"));
}

#[tokio::test]
async fn test_skip_flows_definition() {
    let dir = create_test_dir();
    let calls = recorder();
    let executor = Executor::new(recording_profile(dir.path()))
        .with_registry(recording_registry(RecordingHandler::new(calls.clone())));

    let request = InvocationRequest::batch("nightly").with_definition("skipFlows", "testing,right");
    let result = executor.run(&request, &diamond_store()).await.unwrap();

    assert!(result.success);
    let calls = calls.lock().unwrap().clone();
    let flows: BTreeSet<&str> = calls.iter().map(|c| c.flow_id.as_str()).collect();
    assert_eq!(flows, ["last", "left"].into_iter().collect());
}

#[tokio::test]
async fn test_serialized_flows_do_not_overlap() {
    let dir = create_test_dir();
    let calls = recorder();
    let executor = Executor::new(recording_profile(dir.path()))
        .with_registry(recording_registry(RecordingHandler::new(calls.clone())));

    let request = InvocationRequest::batch("nightly").with_definition("serializeFlows", "true");
    executor.run(&request, &diamond_store()).await.unwrap();

    let calls = calls.lock().unwrap().clone();
    let (left_start, left_end) = span(&calls_of(&calls, "left"));
    let (right_start, right_end) = span(&calls_of(&calls, "right"));
    assert!(left_end < right_start || right_end < left_start);
}

#[tokio::test]
async fn test_phase_mode_runs_one_phase() {
    let dir = create_test_dir();
    let calls = recorder();
    let executor = Executor::new(recording_profile(dir.path()))
        .with_registry(recording_registry(RecordingHandler::new(calls.clone())));

    let request = InvocationRequest::phase("nightly", "left", "exec-9", Phase::Cleanup);
    let result = executor.run(&request, &diamond_store()).await.unwrap();

    assert!(result.success);
    let calls = calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].script_id, "left-cleanup");
    assert_eq!(calls[0].phase, Some(Phase::Cleanup));
    assert_eq!(calls[0].execution_id, "exec-9");
}

#[tokio::test]
async fn test_conflicting_invocations_are_serialized_by_locks() {
    let dir = create_test_dir();
    let calls = recorder();
    let handler = RecordingHandler::new(calls.clone());
    let store = diamond_store();

    // Same batch, same default resource: the second waits for the first
    let executors: Vec<Executor> = (0..2)
        .map(|_| {
            Executor::new(recording_profile(dir.path()))
                .with_registry(recording_registry(handler.clone()))
        })
        .collect();
    let requests = [
        InvocationRequest::flow("nightly", "left"),
        InvocationRequest::flow("nightly", "right"),
    ];

    let results = join_all(
        executors
            .iter()
            .zip(requests.iter())
            .map(|(executor, request)| executor.run(request, &store)),
    )
    .await;

    assert!(results.iter().all(|r| r.as_ref().unwrap().success));
    let calls = calls.lock().unwrap().clone();
    let (left_start, left_end) = span(&calls_of(&calls, "left"));
    let (right_start, right_end) = span(&calls_of(&calls, "right"));
    assert!(left_end < right_start || right_end < left_start);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_unrelated_batches_run_concurrently() {
    let dir = create_test_dir();
    let calls = recorder();
    let handler = RecordingHandler::new(calls.clone());
    let store = diamond_store();

    // Batch-scoped locks: different batches never wait on each other
    let executors: Vec<Executor> = (0..2)
        .map(|_| {
            Executor::new(recording_profile(dir.path()))
                .with_registry(recording_registry(handler.clone()))
        })
        .collect();
    let requests = [
        InvocationRequest::flow("nightly", "left"),
        InvocationRequest::flow("weekly", "left"),
    ];

    let results = join_all(
        executors
            .iter()
            .zip(requests.iter())
            .map(|(executor, request)| executor.run(request, &store)),
    )
    .await;

    assert!(results.iter().all(|r| r.as_ref().unwrap().success));
    let calls = calls.lock().unwrap().clone();
    let of_batch =
        |batch: &str| calls.iter().filter(|c| c.batch_id == batch).collect::<Vec<_>>();
    let (nightly_start, nightly_end) = span(&of_batch("nightly"));
    let (weekly_start, weekly_end) = span(&of_batch("weekly"));
    assert_eq!(of_batch("nightly").len(), 3);
    assert_eq!(of_batch("weekly").len(), 3);
    assert!(nightly_start < weekly_end && weekly_start < nightly_end);
}

#[tokio::test]
async fn test_oversized_parallelism_is_configuration_error() {
    let dir = create_test_dir();
    let calls = recorder();
    let executor = Executor::new(recording_profile(dir.path()))
        .with_registry(recording_registry(RecordingHandler::new(calls.clone())));

    let request =
        InvocationRequest::batch("nightly").with_definition("parallelism", usize::MAX.to_string());
    let err = executor.run(&request, &diamond_store()).await.unwrap_err();

    assert!(err.is_configuration());
    assert!(matches!(
        err,
        ExecutorError::Plan(PlanError::InvalidDefinition { .. })
    ));
    assert!(calls.lock().unwrap().is_empty());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_run_file_with_block_on() {
    let dir = create_test_dir();
    let path = dir.path().join("batch.properties");
    codec::encode_batch(&diamond_batch()).save(&path).unwrap();

    let calls = recorder();
    let executor = Executor::new(recording_profile(dir.path()))
        .with_registry(recording_registry(RecordingHandler::new(calls.clone())));
    let request = InvocationRequest::phase("nightly", "testing", "e-7", Phase::Import);

    let result = tokio_test::block_on(executor.run_file(&request, &path)).unwrap();

    assert!(result.success);
    let flow = result.flows()[0];
    assert_eq!(flow.scripts.len(), 1);
    assert_eq!(flow.scripts[0].status, ScriptStatus::Succeeded);
    assert_eq!(calls.lock().unwrap()[0].command, vec!["import", "testing"]);
}

#[tokio::test]
async fn test_missing_handler_is_configuration_error() {
    let dir = create_test_dir();
    let store = [
        ("handler.command", "recording".to_string()),
        ("lock.directory", dir.path().display().to_string()),
    ]
    .into_iter()
    .collect();
    let profile = load_profile(&store, &[]).unwrap();
    let executor = Executor::new(profile)
        .with_registry(recording_registry(RecordingHandler::new(recorder())));

    let batch = BatchGraph::build(vec![flow(
        "jobs",
        &[],
        vec![(Phase::Main, vec![cluster_job("job", &[], "com.example.Job")])],
        all_kinds(),
    )])
    .unwrap();

    let err = executor
        .run(&InvocationRequest::batch("b"), &codec::encode_batch(&batch))
        .await
        .unwrap_err();
    assert!(err.is_configuration());
    assert!(err.to_string().contains("cluster-job"));
}
