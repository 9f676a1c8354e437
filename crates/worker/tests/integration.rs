//! Integration tests for workers and pools

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use serde_json::json;
    use tokio_util::sync::CancellationToken;
    use workhive_config::HubConfig;
    use workhive_errors::{ConfigError, Error, TaskFailureKind, WorkerError};
    use workhive_events::{AppEvent, PoolEvent, WorkerEvent};
    use workhive_ipc::{Context, Hub, RemoteChannel, ThreadContext};
    use workhive_worker::fixtures::{
        AwaitCancel, Echo, Exit, Fail, Panic, Recall, Remember, Sleep, Unencodable,
    };
    use workhive_worker::{
        fixtures, Pool, ProcessWorkerFactory, Request, Task, ThreadWorkerFactory, Worker,
        WorkerFactory, WorkerOptions,
    };

    const FIXTURE_WORKER: &str = env!("CARGO_BIN_EXE_workhive-fixture-worker");

    fn hub() -> Hub {
        Hub::bind(HubConfig::default()).unwrap()
    }

    fn threads(hub: &Hub) -> ThreadWorkerFactory {
        ThreadWorkerFactory::new(hub.clone(), fixtures::registry())
    }

    fn processes(hub: &Hub) -> ProcessWorkerFactory {
        ProcessWorkerFactory::new(hub.clone(), FIXTURE_WORKER)
    }

    fn sleep(millis: u64, label: &str) -> Sleep {
        Sleep {
            millis,
            label: label.to_string(),
        }
    }

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        check()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_completion_order_follows_task_duration() {
        let hub = hub();
        let pool = Pool::new(3, threads(&hub)).unwrap();
        let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();

        for (label, millis) in [("A", 300), ("B", 600), ("C", 50)] {
            let pool = pool.clone();
            let done = done_tx.clone();
            tokio::spawn(async move {
                let result = pool.enqueue(&sleep(millis, label), token()).await.unwrap();
                done.send(result).unwrap();
            });
        }
        drop(done_tx);

        let mut order = Vec::new();
        while let Some(label) = done_rx.recv().await {
            order.push(label);
        }
        assert_eq!(order, ["C", "A", "B"]);
        assert_eq!(pool.shutdown().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_busy_workers_never_exceed_max_size() {
        let hub = hub();
        let pool = Pool::new(2, threads(&hub)).unwrap();
        assert!(pool.is_idle());

        let started = Instant::now();
        let tasks: Vec<_> = (0..6)
            .map(|i| {
                let pool = pool.clone();
                tokio::spawn(async move {
                    pool.enqueue(&sleep(100, &i.to_string()), token()).await
                })
            })
            .collect();

        let mut peak = 0;
        while tasks.iter().any(|task| !task.is_finished()) {
            peak = peak.max(pool.worker_count());
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert!(peak <= 2);
        assert_eq!(pool.worker_count(), 2);
        assert!(started.elapsed() >= Duration::from_millis(290));
        assert!(eventually(|| pool.idle_worker_count() == 2).await);
        assert_eq!(pool.shutdown().await, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_worker_shutdown_is_memoized() {
        let hub = hub();
        let worker = threads(&hub).create().await.unwrap();

        let echoed = worker
            .enqueue(&Echo { value: json!({"n": 1}) }, token())
            .await
            .unwrap();
        assert_eq!(echoed, json!({"n": 1}));

        assert_eq!(worker.shutdown().await.unwrap(), 0);
        assert_eq!(worker.shutdown().await.unwrap(), 0);
        assert!(!worker.is_running());

        let err = worker
            .enqueue(&Echo { value: json!(1) }, token())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Status(ref message) if message == "The worker has been shut down"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pool_rejects_work_after_shutdown() {
        let hub = hub();
        let pool = Pool::new(1, threads(&hub)).unwrap();
        pool.enqueue(&Echo { value: json!(1) }, token()).await.unwrap();

        let first = pool.shutdown().await;
        let second = pool.shutdown().await;
        assert_eq!(first, 0);
        assert_eq!(first, second);
        assert!(!pool.is_running());

        let err = pool
            .enqueue(&Echo { value: json!(2) }, token())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Status(ref message) if message == "The pool was shutdown"));
        assert!(matches!(pool.worker().await.unwrap_err(), Error::Status(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_kill_is_immediate() {
        let hub = hub();
        let pool = Pool::new(2, threads(&hub)).unwrap();

        let running = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.enqueue(&sleep(10_000, "never"), token()).await })
        };
        assert!(eventually(|| pool.worker_count() == 1).await);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        pool.kill();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(!pool.is_running());
        assert_eq!(pool.worker_count(), 0);

        let err = tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_waiters_fail_when_pool_stops() {
        let hub = hub();

        for kill in [false, true] {
            let pool = Pool::new(1, threads(&hub)).unwrap();
            let busy = {
                let pool = pool.clone();
                tokio::spawn(async move { pool.enqueue(&sleep(400, "busy"), token()).await })
            };
            assert!(eventually(|| pool.worker_count() == 1).await);

            let waiting = {
                let pool = pool.clone();
                tokio::spawn(async move { pool.enqueue(&sleep(10, "late"), token()).await })
            };
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(!waiting.is_finished());

            if kill {
                pool.kill();
                let err = waiting.await.unwrap().unwrap_err();
                assert!(matches!(err, Error::Worker(WorkerError::PoolKilled)));
                assert!(busy.await.unwrap().is_err());
            } else {
                let shutdown = {
                    let pool = pool.clone();
                    tokio::spawn(async move { pool.shutdown().await })
                };
                let err = waiting.await.unwrap().unwrap_err();
                assert!(matches!(err, Error::Worker(WorkerError::PoolShutdown)));
                assert_eq!(busy.await.unwrap().unwrap(), "busy");
                assert_eq!(shutdown.await.unwrap(), 0);
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_crashed_process_worker_is_replaced() {
        let hub = hub();
        let (events, mut received) = workhive_events::channel();
        let pool = Pool::with_events(1, processes(&hub), events).unwrap();

        assert_eq!(
            pool.enqueue(&Echo { value: json!("before") }, token())
                .await
                .unwrap(),
            json!("before")
        );

        let err = pool.enqueue(&Exit { code: 3 }, token()).await.unwrap_err();
        assert!(err.is_disconnect(), "unexpected error: {err}");

        assert_eq!(
            pool.enqueue(&Echo { value: json!("after") }, token())
                .await
                .unwrap(),
            json!("after")
        );
        assert!(pool.worker_count() <= 1);

        let crashed = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(message) = received.recv().await {
                if let AppEvent::Pool(PoolEvent::WorkerCrashed { worker_id, .. }) = message.event {
                    return Some(worker_id);
                }
            }
            None
        })
        .await
        .unwrap();
        assert!(crashed.is_some());

        assert_eq!(pool.shutdown().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_process_pool_round_trip() {
        let hub = hub();
        let pool = Pool::new(2, processes(&hub)).unwrap();

        let job_a = sleep(50, "a");
        let job_b = sleep(50, "b");
        let (a, b) = tokio::join!(
            pool.enqueue(&job_a, token()),
            pool.enqueue(&job_b, token()),
        );
        assert_eq!(a.unwrap(), "a");
        assert_eq!(b.unwrap(), "b");
        assert_eq!(pool.worker_count(), 2);

        assert_eq!(pool.shutdown().await, 0);
        assert_eq!(pool.worker_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_remote_failures_keep_type_and_causes() {
        let hub = hub();
        let worker = threads(&hub).create().await.unwrap();

        let err = worker
            .enqueue(
                &Fail {
                    message: "bad input".to_string(),
                    cause: Some("missing field".to_string()),
                },
                token(),
            )
            .await
            .unwrap_err();
        let Error::Task(failure) = err else {
            panic!("expected a task failure, got {err}");
        };
        assert_eq!(failure.kind(), TaskFailureKind::Exception);
        assert_eq!(failure.original_type_name(), "FixtureError");
        assert_eq!(failure.original_message(), "bad input");
        assert_eq!(
            failure.previous().unwrap().original_type_name(),
            "FixtureCause"
        );

        let err = worker
            .enqueue(
                &Panic {
                    message: "kaboom".to_string(),
                },
                token(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Task(ref failure)
                if failure.kind() == TaskFailureKind::Panic && failure.original_message() == "kaboom"
        ));

        // Neither failure took the worker down
        assert!(worker.is_running());
        assert_eq!(
            worker.enqueue(&Echo { value: json!(5) }, token()).await.unwrap(),
            json!(5)
        );
        assert_eq!(worker.shutdown().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_task_is_a_programming_error() {
        let hub = hub();
        let worker = threads(&hub).create().await.unwrap();

        let err = worker
            .execute("not_registered", json!({}), token())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Task(ref failure)
                if failure.kind() == TaskFailureKind::Error
                    && failure.original_message().contains("not_registered")
        ));
        assert!(worker.is_running());
        worker.kill();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_serialization_failures_do_not_poison_worker() {
        let hub = hub();
        let worker = threads(&hub).create().await.unwrap();

        let mut keys = std::collections::BTreeMap::new();
        keys.insert(vec![1u8], 1u8);
        let err = worker
            .enqueue(&Unencodable { keys }, token())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Serialization { .. }));

        let err = worker
            .enqueue(&Unencodable::default(), token())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Serialization { .. }));

        let err = worker
            .execute(<Sleep as Task>::NAME, json!({"millis": "soon"}), token())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Serialization { .. }));

        assert!(worker.is_idle());
        assert_eq!(
            worker.enqueue(&Echo { value: json!("ok") }, token()).await.unwrap(),
            json!("ok")
        );
        worker.kill();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_environment_persists_across_tasks() {
        let hub = hub();
        let pool = Pool::new(1, threads(&hub)).unwrap();

        pool.enqueue(
            &Remember {
                key: "greeting".to_string(),
                value: json!("hello"),
                ttl: None,
            },
            token(),
        )
        .await
        .unwrap();
        let recalled = pool
            .enqueue(
                &Recall {
                    key: "greeting".to_string(),
                },
                token(),
            )
            .await
            .unwrap();
        assert_eq!(recalled, Some(json!("hello")));

        let err = pool
            .enqueue(
                &Remember {
                    key: "bad".to_string(),
                    value: json!(1),
                    ttl: Some(0),
                },
                token(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Task(ref failure) if failure.kind() == TaskFailureKind::Error
        ));
        assert_eq!(pool.shutdown().await, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancelled_task_keeps_worker_reserved() {
        let hub = hub();
        let worker = Arc::new(threads(&hub).create().await.unwrap());
        let cancel = token();

        let pending = {
            let worker = Arc::clone(&worker);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                worker
                    .enqueue(
                        &AwaitCancel {
                            acknowledge: false,
                            linger_millis: 500,
                        },
                        cancel,
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let cancelled_at = Instant::now();
        cancel.cancel();
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(cancelled_at.elapsed() < Duration::from_millis(300));
        assert!(!worker.is_idle());

        tokio::time::timeout(Duration::from_secs(2), worker.wait_idle())
            .await
            .unwrap();
        assert!(worker.is_running());
        assert_eq!(
            worker.enqueue(&Echo { value: json!(1) }, token()).await.unwrap(),
            json!(1)
        );
        assert_eq!(worker.shutdown().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cooperative_cancel_is_acknowledged() {
        let hub = hub();
        let pool = Pool::new(1, threads(&hub)).unwrap();
        let cancel = token();

        let pending = {
            let pool = pool.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                pool.enqueue(
                    &AwaitCancel {
                        acknowledge: true,
                        linger_millis: 0,
                    },
                    cancel,
                )
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        assert!(matches!(pending.await.unwrap(), Err(Error::Cancelled)));

        // The same worker serves the next task once it acknowledged
        assert_eq!(
            pool.enqueue(&Echo { value: json!(2) }, token()).await.unwrap(),
            json!(2)
        );
        assert_eq!(pool.worker_count(), 1);
        assert_eq!(pool.shutdown().await, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unacknowledged_cancel_kills_worker() {
        let hub = hub();
        let options = WorkerOptions {
            cancel_ack_timeout: Duration::from_millis(200),
            events: None,
        };
        let worker = Arc::new(threads(&hub).options(options).create().await.unwrap());
        let cancel = token();

        let pending = {
            let worker = Arc::clone(&worker);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                worker
                    .enqueue(
                        &AwaitCancel {
                            acknowledge: false,
                            linger_millis: 10_000,
                        },
                        cancel,
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        assert!(matches!(pending.await.unwrap(), Err(Error::Cancelled)));

        assert!(eventually(|| !worker.is_running()).await);
        assert!(eventually(|| worker.is_idle()).await);
    }

    /// A bare worker that ignores tasks and exits with `code` when told to
    /// shut down
    fn exiting_with(hub: &Hub, code: i64) -> Arc<dyn Context> {
        Arc::new(ThreadContext::new(hub.clone(), move |remote: RemoteChannel| async move {
            loop {
                if let Request::Shutdown = remote.receive::<Request>().await? {
                    return Ok::<_, Error>(json!(code));
                }
            }
        }))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_nonzero_exit_fails_pool_shutdown() {
        let hub = hub();
        let pool = Pool::new(0, threads(&hub)).unwrap();

        let clean = Worker::start(exiting_with(&hub, 0), WorkerOptions::default())
            .await
            .unwrap();
        let failing = Worker::start(exiting_with(&hub, 3), WorkerOptions::default())
            .await
            .unwrap();
        pool.adopt(clean).unwrap();
        pool.adopt(failing).unwrap();
        assert_eq!(pool.worker_count(), 2);

        assert_eq!(pool.shutdown().await, 1);
        assert_eq!(pool.shutdown().await, 1);
        assert_eq!(pool.worker_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancelled_token_never_dispatches() {
        let hub = hub();
        let (events, mut received) = workhive_events::channel();
        let worker = threads(&hub)
            .options(WorkerOptions::default().with_events(events))
            .create()
            .await
            .unwrap();

        let cancel = token();
        cancel.cancel();
        let err = worker
            .enqueue(&sleep(10, "unwanted"), cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(worker.is_idle());

        while let Ok(message) = received.try_recv() {
            assert!(
                !matches!(
                    message.event,
                    AppEvent::Worker(
                        WorkerEvent::TaskDispatched { .. } | WorkerEvent::TaskCancelled { .. }
                    )
                ),
                "unexpected event: {:?}",
                message.event
            );
        }

        assert_eq!(
            worker.enqueue(&Echo { value: json!(1) }, token()).await.unwrap(),
            json!(1)
        );
        assert_eq!(worker.shutdown().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancel_while_waiting_for_a_worker() {
        let hub = hub();
        let pool = Pool::new(0, threads(&hub)).unwrap();
        let cancel = token();

        let waiting = {
            let pool = pool.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.enqueue(&Echo { value: json!(1) }, cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        assert!(matches!(waiting.await.unwrap(), Err(Error::Cancelled)));
        pool.kill();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_zero_size_pool_runs_on_adopted_workers() {
        let hub = hub();
        let factory = threads(&hub);
        let pool = Pool::new(0, factory.clone()).unwrap();
        assert_eq!(pool.max_size(), 0);

        let waiting = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.enqueue(&Echo { value: json!("adopted") }, token()).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!waiting.is_finished());
        assert_eq!(pool.worker_count(), 0);

        pool.adopt(factory.create().await.unwrap()).unwrap();
        let value = tokio::time::timeout(Duration::from_secs(2), waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(value, json!("adopted"));
        assert_eq!(pool.worker_count(), 1);
        assert_eq!(pool.shutdown().await, 0);
    }

    #[tokio::test]
    async fn test_negative_max_size_is_rejected() {
        let factory = || async { Err::<Worker, Error>(Error::internal("unused")) };
        let err = Pool::new(-1, factory).unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::InvalidMaxSize { value: -1 })
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_non_running_worker_is_not_viable() {
        let hub = hub();
        let threads = threads(&hub);
        let factory = move || {
            let threads = threads.clone();
            async move {
                let worker = threads.create().await?;
                worker.kill();
                Ok::<_, Error>(worker)
            }
        };
        let pool = Pool::new(1, factory).unwrap();

        let err = pool
            .enqueue(&Echo { value: json!(1) }, token())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Worker(WorkerError::NotViable)));
        assert_eq!(pool.worker_count(), 0);
        pool.kill();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_leased_worker_returns_on_drop() {
        let hub = hub();
        let pool = Pool::new(1, threads(&hub)).unwrap();

        let lease = pool.worker().await.unwrap();
        assert!(!pool.is_idle());
        assert_eq!(
            lease.enqueue(&Echo { value: json!(3) }, token()).await.unwrap(),
            json!(3)
        );
        let leased_id = lease.id();
        drop(lease);
        assert!(pool.is_idle());
        assert_eq!(pool.idle_worker_count(), 1);

        let lease = pool.worker().await.unwrap();
        assert_eq!(lease.id(), leased_id);

        // A killed lease is replaced by the next pull
        lease.kill();
        let replacement = pool.worker().await.unwrap();
        assert_ne!(replacement.id(), leased_id);
        drop(replacement);
        assert_eq!(pool.shutdown().await, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dropping_running_pool_kills_workers() {
        let hub = hub();
        let pool = Pool::new(1, threads(&hub)).unwrap();
        let lease = pool.worker().await.unwrap();
        assert!(lease.is_running());

        drop(pool);
        assert!(!lease.is_running());
    }
}
