//! Integration tests for events

#[cfg(test)]
mod tests {
    use workhive_errors::{Error, WorkerError};
    use workhive_events::*;

    #[tokio::test]
    async fn test_event_sender_ext() {
        let (tx, mut rx) = channel();

        tx.emit_error("test error");
        tx.emit_debug("test debug");

        let event1 = rx.recv().await.unwrap();
        assert!(matches!(
            event1.event,
            AppEvent::General(GeneralEvent::Error { .. })
        ));
        assert_eq!(event1.meta.level, EventLevel::Error);

        let event2 = rx.recv().await.unwrap();
        assert!(matches!(
            event2.event,
            AppEvent::General(GeneralEvent::DebugLog { .. })
        ));
        assert_eq!(event2.meta.source, EventSource::General);
    }

    #[tokio::test]
    async fn test_dropped_receiver() {
        let (tx, rx) = channel();
        drop(rx);

        // Should not panic when receiver is dropped
        tx.emit_warning("ignored");
    }

    #[test]
    fn test_emitter_without_sender() {
        let emitter: Option<EventSender> = None;
        emitter.emit(AppEvent::Pool(PoolEvent::ShutdownCompleted { exit_code: 0 }));
    }

    #[tokio::test]
    async fn test_source_and_level_follow_domain() {
        let (tx, mut rx) = channel();

        tx.emit(AppEvent::Pool(PoolEvent::WorkerCrashed {
            worker_id: 3,
            exit_code: Some(1),
            error: None,
        }));
        tx.emit(AppEvent::Hub(HubEvent::HandshakeCompleted { request_id: 7 }));

        let crashed = rx.recv().await.unwrap();
        assert_eq!(crashed.meta.source, EventSource::Pool);
        assert_eq!(crashed.meta.level, EventLevel::Warn);
        assert_eq!(crashed.event.log_target(), "workhive::events::pool");

        let handshake = rx.recv().await.unwrap();
        assert_eq!(handshake.meta.source, EventSource::Hub);
        assert_eq!(handshake.meta.level, EventLevel::Debug);
    }

    #[test]
    fn test_failure_context_from_error() {
        let err: Error = WorkerError::PoolKilled.into();
        let failure = FailureContext::from_error(&err);
        assert_eq!(failure.code.as_deref(), Some("worker.pool_killed"));
        assert!(!failure.retryable);
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = AppEvent::Worker(WorkerEvent::Killed { worker_id: 1 });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["domain"], "worker");
        assert_eq!(json["event"]["type"], "Killed");
    }
}
