//! Several producers on one channel, and slow consumers.

use std::collections::HashSet;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use reconpipe::config::EngineConfig;
use reconpipe::TaskError;

use crate::fixtures::*;

#[tokio::test]
async fn test_shared_channel_keeps_tasks_apart() {
    let env = TestEngine::new();
    let (tx, rx) = env.engine.result_channel();
    let cancel = CancellationToken::new();

    let echo = env.task(ECHO_ARGS, "a.example.com");
    let chunks = env.task(CHUNKS, "b.example.com");
    let fail = env.task(FAIL, "c.example.com");
    let ids = [echo.id, chunks.id, fail.id];

    env.engine.run_into(echo, cancel.clone(), tx.clone());
    env.engine.run_into(chunks, cancel.clone(), tx.clone());
    env.engine.run_into(fail, cancel.clone(), tx);

    let results = collect(rx).await;
    let seen: HashSet<_> = results.iter().map(|r| r.task_id).collect();
    assert_eq!(seen, ids.iter().copied().collect());

    for id in ids {
        assert_well_ordered(&for_task(&results, id));
    }

    let echo_final = for_task(&results, ids[0]).last().copied().unwrap();
    assert_eq!(echo_final.output_text(), "--domain\na.example.com\n");
    assert!(echo_final.succeeded());

    let chunks_final = for_task(&results, ids[1]).last().copied().unwrap();
    assert_eq!(
        chunks_final.output_text(),
        "chunk-1;chunk-2;chunk-3;chunk-4;chunk-5;"
    );

    let fail_final = for_task(&results, ids[2]).last().copied().unwrap();
    assert_eq!(
        fail_final.error,
        Some(TaskError::CommandFailed { code: Some(7) })
    );
}

#[tokio::test]
async fn test_cancel_reaches_every_task_on_a_token() {
    let env = TestEngine::new();
    let (tx, rx) = env.engine.result_channel();
    let cancel = CancellationToken::new();

    for _ in 0..3 {
        let task = env.task(SLEEPER, "example.com");
        env.engine.run_into(task, cancel.clone(), tx.clone());
    }
    drop(tx);

    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();

    let results = collect(rx).await;
    let finals: Vec<_> = results.iter().filter(|r| r.is_final).collect();
    assert_eq!(finals.len(), 3);
    assert!(finals.iter().all(|r| r.error == Some(TaskError::Canceled)));
}

#[tokio::test]
async fn test_slow_consumer_loses_nothing() {
    let env = TestEngine::with_config(EngineConfig {
        result_buffer: 1,
        chunk_size: 16,
        ..EngineConfig::default()
    });
    let task = env.task(FLOOD, "example.com");
    let id = task.id;
    let mut rx = env.engine.run(task, CancellationToken::new());

    let mut results = Vec::new();
    let drained = tokio::time::timeout(DEADLINE, async {
        while let Some(result) = rx.recv().await {
            tokio::time::sleep(Duration::from_millis(1)).await;
            results.push(result);
        }
    })
    .await;
    assert!(drained.is_ok(), "slow consumer did not finish in time");

    let snapshots = for_task(&results, id);
    assert_well_ordered(&snapshots);

    let last = snapshots.last().unwrap();
    assert!(last.succeeded());
    let lines: Vec<_> = last.output_text().lines().map(str::to_string).collect();
    assert_eq!(lines.len(), 200);
    assert_eq!(lines[0], "line-0");
    assert_eq!(lines[199], "line-199");
}

#[tokio::test]
async fn test_dropped_receiver_does_not_stall_the_tool() {
    let env = TestEngine::with_config(EngineConfig {
        result_buffer: 1,
        chunk_size: 16,
        ..EngineConfig::default()
    });
    let (tx, rx) = env.engine.result_channel();
    drop(rx);

    let task = env.task(FLOOD, "example.com");
    let done = tokio::time::timeout(
        DEADLINE,
        executor_of(&env).execute(task, CancellationToken::new(), tx),
    )
    .await
    .expect("tool stalled after the receiver went away");

    assert!(done.is_finished());
    assert!(done.succeeded());
    assert_eq!(done.output().iter().filter(|b| **b == b'\n').count(), 200);
}

fn executor_of(env: &TestEngine) -> reconpipe::executor::ProcessExecutor {
    reconpipe::executor::ProcessExecutor::new(env.engine.config())
}
