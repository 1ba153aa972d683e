//! Two-stage pipelines: gating, retargeting and the single-active rule.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use reconpipe::pipeline::{PipelineOutcome, PipelineState};
use reconpipe::task::Stage;
use reconpipe::{Error, TaskError};

use crate::fixtures::*;

/// Wait until the engine reports a finished pipeline.
async fn settled(env: &TestEngine) -> PipelineState {
    let mut watch = env.engine.watch_pipeline();
    let state = tokio::time::timeout(
        DEADLINE,
        watch.wait_for(|s| matches!(s, PipelineState::Done(_))),
    )
    .await
    .expect("pipeline did not settle in time")
    .expect("pipeline state sender dropped");
    *state
}

#[tokio::test]
async fn test_failed_first_stage_never_builds_second() {
    let env = TestEngine::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let first = env.task(FAIL, "example.com");
    let first_id = first.id;

    let counter = calls.clone();
    let rx = env
        .engine
        .run_pipeline(
            first,
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::UnknownTool("unused".to_string()))
            },
            CancellationToken::new(),
        )
        .expect("Failed to start pipeline");

    let results = collect(rx).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(results.iter().all(|r| r.task_id == first_id));
    assert!(results.iter().all(|r| r.stage == Stage::First));
    assert_eq!(
        results.last().unwrap().error,
        Some(TaskError::CommandFailed { code: Some(7) })
    );
    assert_eq!(
        settled(&env).await,
        PipelineState::Done(PipelineOutcome::FirstFailed)
    );
}

#[tokio::test]
async fn test_successful_first_stage_feeds_second() {
    let env = TestEngine::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let first = env.task(SUBDOMAINS, "example.com");
    let first_id = first.id;
    let second = env.task(PROBE, "placeholder.com");

    let counter = calls.clone();
    let rx = env
        .engine
        .run_pipeline(
            first,
            move |upstream| {
                counter.fetch_add(1, Ordering::SeqCst);
                assert!(upstream.is_final);
                assert_eq!(upstream.output_text(), "api.example.com\nwww.example.com\n");
                Ok(reconpipe::pipeline::retarget_from(&second, upstream))
            },
            CancellationToken::new(),
        )
        .expect("Failed to start pipeline");

    let results = collect(rx).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        env.engine.pipeline_state(),
        PipelineState::Done(PipelineOutcome::Completed)
    );

    let first_snapshots = for_task(&results, first_id);
    assert_well_ordered(&first_snapshots);
    assert!(first_snapshots.iter().all(|r| r.stage == Stage::First));

    let second_id = results
        .iter()
        .find(|r| r.stage == Stage::Second)
        .expect("second stage never reported")
        .task_id;
    let second_snapshots = for_task(&results, second_id);
    assert_well_ordered(&second_snapshots);
    assert_eq!(
        second_snapshots.last().unwrap().output_text(),
        "probe api.example.com\nprobe www.example.com\n"
    );

    // Every first-stage snapshot arrives before any second-stage one.
    let last_first = results.iter().rposition(|r| r.task_id == first_id).unwrap();
    let first_second = results.iter().position(|r| r.task_id == second_id).unwrap();
    assert!(last_first < first_second);
}

#[tokio::test]
async fn test_run_piped_retargets_template() {
    let env = TestEngine::new();
    let probe = env
        .engine
        .build_task(PROBE, "placeholder.com", "", &env.dir())
        .expect("Failed to build task");
    let first = env.task(SUBDOMAINS, "example.com,test.org").with_pipe_target(probe);

    let rx = env
        .engine
        .run_piped(first, CancellationToken::new())
        .expect("Failed to start pipeline");
    let results = collect(rx).await;

    let last = results.last().expect("no results");
    assert_eq!(last.stage, Stage::Second);
    assert!(last.is_final);
    assert!(last.succeeded());
    assert_eq!(
        last.output_text(),
        "probe api.example.com\nprobe www.example.com\nprobe api.test.org\nprobe www.test.org\n"
    );
}

#[tokio::test]
async fn test_run_piped_requires_pipe_target() {
    let env = TestEngine::new();
    let first = env.task(SUBDOMAINS, "example.com");
    let err = env
        .engine
        .run_piped(first, CancellationToken::new())
        .unwrap_err();
    assert!(err.to_string().contains("subdomains"));
    assert_eq!(env.engine.pipeline_state(), PipelineState::Idle);
}

#[tokio::test]
async fn test_build_failure_reports_second_stage_error() {
    let env = TestEngine::new();
    let first = env.task(ECHO_ARGS, "example.com");

    let dir = env.dir();
    let rx = env
        .engine
        .run_pipeline(
            first,
            move |_| Err(Error::UnknownTool(format!("[scanning] nope in {}", dir))),
            CancellationToken::new(),
        )
        .expect("Failed to start pipeline");
    let results = collect(rx).await;

    let last = results.last().expect("no results");
    assert_eq!(last.stage, Stage::Second);
    assert!(last.is_final);
    assert!(last.output.is_empty());
    assert!(matches!(&last.error, Some(TaskError::Build(msg)) if msg.contains("nope")));
    assert_eq!(
        env.engine.pipeline_state(),
        PipelineState::Done(PipelineOutcome::BuildFailed)
    );
}

#[tokio::test]
async fn test_second_pipeline_rejected_while_active() {
    let env = TestEngine::new();
    let cancel = CancellationToken::new();
    let first = env.task(SLEEPER, "example.com");
    let rx = env
        .engine
        .run_pipeline(first, |_| unreachable!(), cancel.clone())
        .expect("Failed to start pipeline");
    assert!(env.engine.pipeline_state().is_active());

    let other = env.task(ECHO_ARGS, "example.com");
    let err = env
        .engine
        .run_pipeline(other, |_| unreachable!(), CancellationToken::new())
        .unwrap_err();
    assert!(matches!(err, Error::PipelineActive));

    cancel.cancel();
    collect(rx).await;
    assert_eq!(
        settled(&env).await,
        PipelineState::Done(PipelineOutcome::FirstFailed)
    );

    // A finished pipeline frees the coordinator.
    let again = env.task(FAIL, "example.com");
    let rx = env
        .engine
        .run_pipeline(again, |_| unreachable!(), CancellationToken::new())
        .expect("coordinator should accept a new pipeline");
    collect(rx).await;
}

#[tokio::test]
async fn test_cancel_during_first_stage() {
    let env = TestEngine::new();
    let cancel = CancellationToken::new();
    let first = env.task(SLEEPER, "example.com");
    let rx = env
        .engine
        .run_pipeline(first, |_| unreachable!(), cancel.clone())
        .expect("Failed to start pipeline");

    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();

    let results = collect(rx).await;
    let last = results.last().expect("no results");
    assert_eq!(last.stage, Stage::First);
    assert_eq!(last.error, Some(TaskError::Canceled));
    assert_eq!(
        settled(&env).await,
        PipelineState::Done(PipelineOutcome::FirstFailed)
    );
}

#[tokio::test]
async fn test_state_changes_are_observable() {
    let env = TestEngine::new();
    let mut watch = env.engine.watch_pipeline();
    let probe = env.task(PROBE, "placeholder.com");
    let first = env.task(SUBDOMAINS, "example.com").with_pipe_target(probe);

    let rx = env
        .engine
        .run_piped(first, CancellationToken::new())
        .expect("Failed to start pipeline");

    let observed = tokio::spawn(async move {
        let mut states = vec![*watch.borrow_and_update()];
        while watch.changed().await.is_ok() {
            let state = *watch.borrow_and_update();
            states.push(state);
            if matches!(state, PipelineState::Done(_)) {
                break;
            }
        }
        states
    });

    collect(rx).await;
    let states = tokio::time::timeout(DEADLINE, observed)
        .await
        .expect("watcher did not finish")
        .expect("watcher panicked");
    assert_eq!(
        states.last(),
        Some(&PipelineState::Done(PipelineOutcome::Completed))
    );
    assert!(states.iter().all(|s| *s != PipelineState::FirstFailed));
}

#[tokio::test]
async fn test_panicking_builder_does_not_block_next_pipeline() {
    let env = TestEngine::new();
    let first = env.task(ECHO_ARGS, "example.com");
    let rx = env
        .engine
        .run_pipeline(first, |_| panic!("caller bug"), CancellationToken::new())
        .expect("Failed to start pipeline");

    let results = collect(rx).await;
    let last = results.last().expect("no results");
    assert_eq!(last.stage, Stage::Second);
    assert!(matches!(&last.error, Some(TaskError::Build(msg)) if msg.contains("caller bug")));
    assert_eq!(
        settled(&env).await,
        PipelineState::Done(PipelineOutcome::BuildFailed)
    );

    let next = env.task(ECHO_ARGS, "example.com");
    let rx = env
        .engine
        .run_pipeline(
            next,
            |_| Err(Error::UnknownTool("[scanning] none".to_string())),
            CancellationToken::new(),
        )
        .expect("coordinator should accept a new pipeline");
    collect(rx).await;
}
