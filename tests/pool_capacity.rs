//! Pool capacity management: bounded growth, parked submitters, lease
//! semantics, and shutdown/kill behaviour.

mod common;

use std::time::Duration;

use common::{Echo, SleepReturn, WaitForFile};
use offload::pool::{Pool, PoolConfig};
use offload::Error;
use serde_json::json;

#[tokio::test]
async fn capacity_two_runs_two_at_a_time() {
    let pool = Pool::thread_pool(
        PoolConfig::default().with_max_workers(2),
        common::registry(),
    );

    let dir = tempfile::tempdir().unwrap();
    let gate = dir.path().join("release-the-tasks");

    let mut handles = Vec::new();
    let mut submitters = Vec::new();
    for value in 1..=4 {
        // With both workers busy, the third and fourth submissions park
        // until a worker frees up; submit from tasks so the test can watch
        // the pool while they wait.
        let gate = gate.clone();
        let pool = pool.clone();
        submitters.push(tokio::spawn(async move {
            pool.enqueue(WaitForFile { path: gate, value }).await
        }));
    }

    // Give the first two submissions time to occupy both workers.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(pool.worker_count(), 2, "growth stops at the cap");
    assert_eq!(pool.idle_count(), 0, "both workers are busy");

    std::fs::write(&gate, b"go").unwrap();

    for submitter in submitters {
        let handle = submitter.await.unwrap().unwrap();
        handles.push(handle);
    }
    let mut values = Vec::new();
    for handle in handles {
        values.push(handle.join().await.unwrap());
    }
    values.sort_unstable();
    assert_eq!(values, vec![1, 2, 3, 4]);

    pool.shutdown().await.unwrap();
    assert_eq!(pool.worker_count(), 0);
}

#[tokio::test]
async fn parked_submitter_resumes_when_a_worker_frees_up() {
    let pool = Pool::thread_pool(
        PoolConfig::default().with_max_workers(1),
        common::registry(),
    );

    let slow = pool
        .enqueue(SleepReturn {
            millis: 200,
            value: 1,
        })
        .await
        .unwrap();

    // The pool is saturated; this submission parks, then lands on the same
    // worker once the slow task settles.
    let queued = pool.enqueue(Echo { value: json!("next") }).await.unwrap();

    assert_eq!(slow.join().await.unwrap(), 1);
    assert_eq!(queued.join().await.unwrap(), json!("next"));
    assert_eq!(pool.worker_count(), 1);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn per_worker_concurrency_shares_one_worker() {
    let pool = Pool::thread_pool(
        PoolConfig::default()
            .with_max_workers(1)
            .with_per_worker_concurrency(3),
        common::registry(),
    );

    let first = pool
        .enqueue(SleepReturn {
            millis: 150,
            value: 1,
        })
        .await
        .unwrap();
    // The worker is busy but below its concurrency cap, so these do not
    // park even though the pool cannot grow.
    let second = pool
        .enqueue(SleepReturn {
            millis: 50,
            value: 2,
        })
        .await
        .unwrap();
    let third = pool
        .enqueue(SleepReturn {
            millis: 100,
            value: 3,
        })
        .await
        .unwrap();

    assert_eq!(pool.worker_count(), 1);
    assert_eq!(second.join().await.unwrap(), 2);
    assert_eq!(third.join().await.unwrap(), 3);
    assert_eq!(first.join().await.unwrap(), 1);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn kill_fails_outstanding_tasks() {
    let pool = Pool::thread_pool(
        PoolConfig::default().with_max_workers(2),
        common::registry(),
    );

    let stuck = pool
        .enqueue(SleepReturn {
            millis: 10_000,
            value: 1,
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    pool.kill().await.unwrap();

    let err = stuck.join().await.unwrap_err();
    assert!(
        matches!(err, Error::Context(_) | Error::Worker(_)),
        "got: {err}"
    );

    let err = pool.enqueue(Echo { value: json!(1) }).await.unwrap_err();
    assert!(matches!(err, Error::Status(_)), "got: {err}");
}

#[tokio::test]
async fn shutdown_drains_outstanding_work_first() {
    let pool = Pool::thread_pool(
        PoolConfig::default().with_max_workers(2),
        common::registry(),
    );

    let mut handles = Vec::new();
    for value in 1..=2 {
        handles.push(
            pool.enqueue(SleepReturn {
                millis: 150,
                value,
            })
            .await
            .unwrap(),
        );
    }

    pool.shutdown().await.unwrap();

    let mut values = Vec::new();
    for handle in handles {
        values.push(handle.join().await.unwrap());
    }
    values.sort_unstable();
    assert_eq!(values, vec![1, 2]);
}
