//! Integration tests for error types

#[cfg(test)]
mod tests {
    use std::error::Error as _;
    use workhive_errors::*;

    #[test]
    fn test_error_conversion() {
        let ctx_err = ContextError::StartupTimeout;
        let err: Error = ctx_err.into();
        assert!(matches!(err, Error::Context(ContextError::StartupTimeout)));
    }

    #[test]
    fn test_error_display() {
        let err = ConfigError::InvalidMaxSize { value: -1 };
        assert_eq!(
            err.to_string(),
            "maximum size must be a non-negative integer, got -1"
        );

        let err = Error::status("the worker has been shut down");
        assert_eq!(err.to_string(), "the worker has been shut down");
    }

    #[test]
    fn test_task_error_chain() {
        let cause = TaskError::new(TaskFailureKind::Exception, "io", "disk full");
        let err = TaskError::new(TaskFailureKind::Error, "write", "could not persist")
            .with_previous(cause);

        assert_eq!(err.original_type_name(), "write");
        assert_eq!(err.previous().unwrap().original_message(), "disk full");
        assert_eq!(err.chain().count(), 2);
        assert!(err.source().is_some());
    }

    #[test]
    fn test_disconnect_classification() {
        let err: Error = ContextError::stopped_responding("eof").into();
        assert!(err.is_disconnect());
        assert!(!Error::Cancelled.is_disconnect());
    }

    #[test]
    fn test_json_error_is_serialization() {
        let json_err = serde_json::from_str::<u32>("nope").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization { .. }));
        assert_eq!(err.user_code(), Some("error.serialization"));
    }

    #[test]
    fn test_task_error_from_error_keeps_causes() {
        let inner = TaskError::new(TaskFailureKind::Exception, "io", "disk full");
        let outer = TaskError::new(TaskFailureKind::Error, "write", "could not persist")
            .with_previous(inner);
        let err = TaskError::from_error(TaskFailureKind::Exception, &outer);

        assert_eq!(err.kind(), TaskFailureKind::Exception);
        assert!(err.original_type_name().ends_with("TaskError"));
        assert_eq!(
            err.original_message(),
            "uncaught write in worker: could not persist"
        );
        let cause = err.previous().unwrap();
        assert_eq!(cause.original_message(), "uncaught io in worker: disk full");
        assert!(cause.previous().is_none());

        let exception = TaskError::exception("ValueError", "bad input");
        assert_eq!(exception.kind(), TaskFailureKind::Exception);
        assert_eq!(
            exception.to_string(),
            "uncaught ValueError in worker: bad input"
        );
    }
}
