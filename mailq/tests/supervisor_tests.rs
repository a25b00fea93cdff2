//! Supervisor lifecycle: start, shut down on request, surface store failures
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use mailq::{Mailq, Supervisor};
use mailq_delivery::{DryRunTransport, ItemStatus, QueueConfig, QueueManager};
use mailq_store::{StoreConfig, TestQueueStore};
use pretty_assertions::assert_eq;
use tokio::sync::oneshot;

fn config() -> QueueConfig {
    QueueConfig {
        poll_interval_secs: 0.01,
        shutdown_timeout_secs: 1.0,
        ..QueueConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_runs_until_shutdown_is_requested() {
    let store = TestQueueStore::new();
    let manager = QueueManager::new(
        config(),
        Arc::new(store.clone()),
        Arc::new(DryRunTransport),
        None,
    )
    .unwrap();
    let supervisor = Supervisor::new(Arc::new(manager));

    supervisor.manager().enqueue("msg-1").await.unwrap();

    let (trigger, shutdown) = oneshot::channel::<()>();
    let running = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            supervisor
                .run(async move {
                    shutdown.await?;
                    Ok(())
                })
                .await
        })
    };

    store
        .wait_until_settled(Duration::from_secs(10))
        .await
        .unwrap();
    assert!(supervisor.is_running());

    trigger.send(()).unwrap();
    running.await.unwrap().unwrap();

    assert!(!supervisor.is_running());
    assert_eq!(store.items()[0].status, ItemStatus::Sent);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_store_failure_ends_the_run_with_an_error() {
    let store = TestQueueStore::new();
    let manager = QueueManager::new(
        config(),
        Arc::new(store.clone()),
        Arc::new(DryRunTransport),
        None,
    )
    .unwrap();
    let supervisor = Supervisor::new(Arc::new(manager));

    let running = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.run(std::future::pending()).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    store.set_unavailable(true);

    let result = tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .expect("supervisor should stop on its own")
        .unwrap();

    let err = result.unwrap_err();
    assert!(err.to_string().contains("unavailable"), "{err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_built_from_file_config() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mailq = Mailq::from_ron(&format!(
        r#"Mailq (
            queue: (poll_interval_secs: 0.01, shutdown_timeout_secs: 1.0),
            store: (type: "File", path: "{}"),
        )"#,
        dir.path().display()
    ))
    .unwrap();
    assert!(matches!(mailq.store(), StoreConfig::File { .. }));

    let supervisor = mailq.build(Arc::new(DryRunTransport)).unwrap();
    let item = supervisor.manager().enqueue("msg-1").await.unwrap();

    let store = Arc::clone(supervisor.manager().store());
    let (trigger, shutdown) = oneshot::channel::<()>();
    let running = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            supervisor
                .run(async move {
                    shutdown.await?;
                    Ok(())
                })
                .await
        })
    };

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let current = store.get(&item.id).await.unwrap().unwrap();
            if current.status == ItemStatus::Sent {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("item should be sent");

    trigger.send(()).unwrap();
    running.await.unwrap().unwrap();

    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
}
