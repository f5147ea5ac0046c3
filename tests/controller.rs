//! Cross-component scenarios: a controller wired to scripted retrievers,
//! observed through recording handlers.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{advance, sleep, Instant};
use tokio_util::sync::CancellationToken;

use controller_runtime::leader::{LeaseConfig, LeaseElector, LeaseLock};
use controller_runtime::testing::{FixtureRetriever, InMemoryLeaseLock, RecordingHandler, TestObject};
use controller_runtime::{
    Config, Controller, Event, MultiRetriever, ObjectKey, ResourceObject, Retriever,
};

fn namespace_objects(count: usize) -> Vec<TestObject> {
    (0..count)
        .map(|i| {
            TestObject::cluster_scoped("Namespace", format!("testing-{i}"))
                .with_resource_version("1")
        })
        .collect()
}

fn controller(
    name: &str,
    retriever: Arc<FixtureRetriever<TestObject>>,
    handler: Arc<RecordingHandler>,
) -> Config<TestObject> {
    Config::new(name, retriever, handler)
}

/// Spawn the controller and hand back its join handle.
fn spawn_run(
    controller: Controller<TestObject>,
    ctx: &CancellationToken,
) -> tokio::task::JoinHandle<Result<(), controller_runtime::Error>> {
    static TRACING: std::sync::Once = std::sync::Once::new();
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
    let ctx = ctx.clone();
    tokio::spawn(async move { controller.run(&ctx).await })
}

/// Busy-wait (in virtual time) until `predicate` holds.
async fn wait_until(mut predicate: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if predicate() {
            return;
        }
        sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test(start_paused = true)]
async fn processes_every_listed_object() {
    let retriever = FixtureRetriever::new(namespace_objects(10));
    let handler = RecordingHandler::new();
    let ctx = CancellationToken::new();
    let run = spawn_run(
        Controller::new(controller("list", retriever, Arc::clone(&handler))).unwrap(),
        &ctx,
    );

    wait_until(|| handler.adds().len() == 10).await;

    let mut seen: Vec<String> = handler.adds().iter().map(ToString::to_string).collect();
    seen.sort();
    let mut expected: Vec<String> = (0..10).map(|i| format!("testing-{i}")).collect();
    expected.sort();
    assert_eq!(seen, expected);
    assert!(handler.deletes().is_empty());

    ctx.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn propagates_deletes_to_the_handler() {
    let retriever = FixtureRetriever::new(namespace_objects(10));
    let handler = RecordingHandler::new();
    let ctx = CancellationToken::new();
    let run = spawn_run(
        Controller::new(controller("deletes", Arc::clone(&retriever), Arc::clone(&handler)))
            .unwrap(),
        &ctx,
    );
    wait_until(|| handler.adds().len() == 10).await;

    for name in ["testing-0", "testing-4", "testing-1"] {
        retriever
            .emit(Event::Deleted(
                TestObject::cluster_scoped("Namespace", name).with_resource_version("1"),
            ))
            .await;
    }
    wait_until(|| handler.deletes().len() == 3).await;

    let mut deleted = handler.deletes();
    deleted.sort_by_key(ToString::to_string);
    assert_eq!(
        deleted,
        [
            ObjectKey::cluster_scoped("testing-0"),
            ObjectKey::cluster_scoped("testing-1"),
            ObjectKey::cluster_scoped("testing-4"),
        ]
    );

    ctx.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn failing_handlers_consume_exactly_the_retry_budget() {
    let retriever = FixtureRetriever::new(namespace_objects(11));
    let handler = RecordingHandler::failing();
    let ctx = CancellationToken::new();
    let run = spawn_run(
        Controller::new(
            controller("retries", retriever, Arc::clone(&handler)).processing_job_retries(3),
        )
        .unwrap(),
        &ctx,
    );

    // Every object is attempted once and retried three times.
    wait_until(|| handler.total_calls() == 11 * 4).await;

    // And then the queue goes quiescent: no further attempts.
    sleep(Duration::from_secs(5)).await;
    assert_eq!(handler.total_calls(), 44);

    ctx.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn coalesces_bursts_and_keeps_per_key_processing_serial() {
    let retriever = FixtureRetriever::new(vec![
        TestObject::cluster_scoped("Namespace", "testing-0").with_resource_version("1"),
    ]);
    let handler = RecordingHandler::sleeping(Duration::from_millis(50));
    let ctx = CancellationToken::new();
    let run = spawn_run(
        Controller::new(
            controller("serial", Arc::clone(&retriever), Arc::clone(&handler))
                .concurrent_workers(5),
        )
        .unwrap(),
        &ctx,
    );
    wait_until(|| handler.total_calls() >= 1).await;

    // A burst of updates lands while the first processing is in flight.
    for version in 2..7 {
        retriever
            .emit(Event::Modified(
                TestObject::cluster_scoped("Namespace", "testing-0")
                    .with_resource_version(version.to_string()),
            ))
            .await;
    }
    sleep(Duration::from_millis(500)).await;

    // The burst coalesced into at most one further processing, and the key
    // was never handled by two workers at once.
    assert!(handler.total_calls() <= 3, "calls: {}", handler.total_calls());
    assert_eq!(handler.max_in_flight(), 1);

    ctx.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn workers_process_in_parallel() {
    async fn run_with_workers(workers: usize) -> Duration {
        let retriever = FixtureRetriever::new(
            (0..100)
                .map(|i| {
                    TestObject::cluster_scoped("Event", format!("evt-{i}"))
                        .with_resource_version("1")
                })
                .collect(),
        );
        let handler = RecordingHandler::sleeping(Duration::from_millis(10));
        let ctx = CancellationToken::new();
        let started = Instant::now();
        let run = spawn_run(
            Controller::new(
                controller("speed", retriever, Arc::clone(&handler)).concurrent_workers(workers),
            )
            .unwrap(),
            &ctx,
        );
        wait_until(|| handler.total_calls() == 100).await;
        let elapsed = started.elapsed();
        ctx.cancel();
        run.await.unwrap().unwrap();
        elapsed
    }

    let serial = run_with_workers(1).await;
    let parallel = run_with_workers(5).await;

    // 100 handler sleeps of 10 ms: one worker needs about a second, five
    // workers about a fifth of it. Virtual time keeps this deterministic.
    assert!(
        serial >= Duration::from_millis(950) && serial <= Duration::from_millis(1500),
        "serial took {serial:?}"
    );
    assert!(
        parallel >= Duration::from_millis(190) && parallel <= Duration::from_millis(700),
        "parallel took {parallel:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn shutdown_completes_shortly_after_cancellation() {
    let retriever = FixtureRetriever::new(namespace_objects(50));
    let handler = RecordingHandler::sleeping(Duration::from_millis(100));
    let ctx = CancellationToken::new();
    let run = spawn_run(
        Controller::new(controller("shutdown", retriever, Arc::clone(&handler))).unwrap(),
        &ctx,
    );
    wait_until(|| handler.total_calls() >= 1).await;

    let cancelled_at = Instant::now();
    ctx.cancel();
    run.await.unwrap().unwrap();

    // Bounded by the in-flight handler sleeps plus a small delta; the 47
    // still-queued keys are not drained.
    assert!(cancelled_at.elapsed() <= Duration::from_millis(300));
    assert!(handler.total_calls() < 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_election_gates_all_but_one_controller() {
    let lock = Arc::new(InMemoryLeaseLock::default());
    let lease_cfg = LeaseConfig {
        lease_duration: Duration::from_millis(400),
        renew_deadline: Duration::from_millis(300),
        retry_period: Duration::from_millis(50),
    };

    let mut handlers = Vec::new();
    let mut runs = Vec::new();
    let ctx = CancellationToken::new();
    for i in 0..3 {
        let handler = RecordingHandler::new();
        let elector = LeaseElector::new(
            "shared-controller",
            "default",
            Arc::clone(&lock) as Arc<dyn LeaseLock>,
            lease_cfg.clone(),
        )
        .unwrap();
        let controller = Controller::new(
            Config::new(
                format!("gated-{i}"),
                FixtureRetriever::new(namespace_objects(5)),
                Arc::clone(&handler) as Arc<dyn controller_runtime::Handler<TestObject>>,
            )
            .leader_elector(Arc::new(elector)),
        )
        .unwrap();
        handlers.push(handler);
        runs.push(spawn_run(controller, &ctx));

        if i == 0 {
            // Head start so the first instance reliably takes the lease.
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    tokio::time::sleep(Duration::from_millis(500)).await;

    let calls: Vec<usize> = handlers.iter().map(|h| h.total_calls()).collect();
    assert_eq!(calls[0], 5, "the leader processes every object: {calls:?}");
    assert_eq!(
        calls[1] + calls[2],
        0,
        "gated controllers must not reconcile: {calls:?}"
    );

    ctx.cancel();
    let mut results = Vec::new();
    for run in runs {
        results.push(run.await.unwrap());
    }
    assert!(results[0].is_ok(), "leader run failed: {:?}", results[0]);
    // The gated instances normally exit without ever leading; one of them
    // may briefly win the released lease during shutdown, in which case it
    // reports the cancelled sync instead.
    for result in &results[1..] {
        assert!(
            matches!(result, Ok(()) | Err(controller_runtime::Error::SyncTimeout)),
            "unexpected gated result: {result:?}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn multi_retriever_feeds_one_controller() {
    let children: Vec<_> = (0..3)
        .map(|c| {
            FixtureRetriever::new(vec![TestObject::cluster_scoped(
                "Thing",
                format!("child{c}-seed"),
            )
            .with_resource_version("1")])
        })
        .collect();
    let multi = MultiRetriever::new(
        children
            .iter()
            .map(|c| Arc::clone(c) as Arc<dyn Retriever<TestObject>>)
            .collect(),
    )
    .unwrap();

    let handler = RecordingHandler::new();
    let ctx = CancellationToken::new();
    let run = spawn_run(
        Controller::new(Config::new(
            "multi",
            Arc::new(multi) as Arc<dyn Retriever<TestObject>>,
            Arc::clone(&handler) as Arc<dyn controller_runtime::Handler<TestObject>>,
        ))
        .unwrap(),
        &ctx,
    );
    wait_until(|| handler.adds().len() == 3).await;

    // 3 + 2 + 2 events across the children all reach the handler.
    let emitted: &[usize] = &[3, 2, 2];
    for (c, (child, count)) in children.iter().zip(emitted).enumerate() {
        for i in 0..*count {
            child
                .emit(Event::Added(
                    TestObject::cluster_scoped("Thing", format!("child{c}-{i}"))
                        .with_resource_version("1"),
                ))
                .await;
        }
    }
    wait_until(|| handler.adds().len() == 3 + 7).await;

    let seen: std::collections::HashSet<String> =
        handler.adds().iter().map(ToString::to_string).collect();
    for expected in [
        "child0-0", "child0-1", "child0-2", "child1-0", "child1-1", "child2-0", "child2-1",
    ] {
        assert!(seen.contains(expected), "missing {expected}");
    }

    ctx.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn resync_replays_every_object() {
    let retriever = FixtureRetriever::new(namespace_objects(4));
    let handler = RecordingHandler::new();
    let ctx = CancellationToken::new();
    let run = spawn_run(
        Controller::new(
            controller("resync", retriever, Arc::clone(&handler))
                .resync_interval(Duration::from_secs(30)),
        )
        .unwrap(),
        &ctx,
    );
    wait_until(|| handler.adds().len() == 4).await;

    advance(Duration::from_secs(31)).await;
    wait_until(|| handler.adds().len() == 8).await;

    ctx.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn a_panicking_handler_consumes_its_budget_without_killing_the_controller() {
    use async_trait::async_trait;
    use controller_runtime::BoxError;

    struct PanicsOnOne {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl controller_runtime::Handler<TestObject> for PanicsOnOne {
        async fn add(
            &self,
            _ctx: &CancellationToken,
            obj: Arc<TestObject>,
        ) -> Result<(), BoxError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if obj.name() == "testing-1" {
                panic!("handler bug");
            }
            Ok(())
        }

        async fn delete(
            &self,
            _ctx: &CancellationToken,
            _key: &ObjectKey,
        ) -> Result<(), BoxError> {
            Ok(())
        }
    }

    let handler = Arc::new(PanicsOnOne {
        calls: std::sync::atomic::AtomicUsize::new(0),
    });
    let retriever = FixtureRetriever::new(namespace_objects(3));
    let ctx = CancellationToken::new();
    let run = spawn_run(
        Controller::new(
            Config::new(
                "panics",
                retriever,
                Arc::clone(&handler) as Arc<dyn controller_runtime::Handler<TestObject>>,
            )
            .processing_job_retries(2),
        )
        .unwrap(),
        &ctx,
    );

    // Two healthy objects once each, the panicking one 1 + 2 times.
    wait_until(|| handler.calls.load(std::sync::atomic::Ordering::SeqCst) == 5).await;
    sleep(Duration::from_secs(3)).await;
    assert_eq!(handler.calls.load(std::sync::atomic::Ordering::SeqCst), 5);

    ctx.cancel();
    run.await.unwrap().unwrap();
}
