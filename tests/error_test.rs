//! Tests for [`OrreryError`] classification and display.

use std::time::Duration;

use orrery::{ErrorKind, OrreryError};

#[test]
fn display_messages() {
    let err = OrreryError::AdmissionRejected {
        client_id: "alice".into(),
        limit: 60.0,
        retry_after: Duration::from_secs(2),
    };
    assert_eq!(
        err.to_string(),
        "rate limited: client 'alice' exceeded 60 tokens, retry after 2s"
    );
    assert_eq!(
        OrreryError::ExecutorSaturated { capacity: 64 }.to_string(),
        "compute executor saturated (64 jobs queued)"
    );
    assert_eq!(
        OrreryError::ComputeFailed("bad date".into()).to_string(),
        "computation failed: bad date"
    );
    assert_eq!(OrreryError::NoCalculator.to_string(), "no calculator configured");
}

#[test]
fn kinds() {
    let cases = [
        (
            OrreryError::AdmissionRejected {
                client_id: "a".into(),
                limit: 1.0,
                retry_after: Duration::ZERO,
            },
            ErrorKind::AdmissionRejected,
        ),
        (
            OrreryError::ExecutorSaturated { capacity: 1 },
            ErrorKind::ExecutorSaturated,
        ),
        (OrreryError::ComputeFailed("x".into()), ErrorKind::ComputeFailed),
        (
            OrreryError::ComputeTimeout {
                budget: Duration::from_secs(1),
            },
            ErrorKind::ComputeTimeout,
        ),
        (
            OrreryError::CacheBackendUnavailable("down".into()),
            ErrorKind::CacheBackendUnavailable,
        ),
        (OrreryError::ExecutorClosed, ErrorKind::Internal),
        (OrreryError::Configuration("x".into()), ErrorKind::Internal),
    ];
    for (err, kind) in cases {
        assert_eq!(err.kind(), kind, "{err}");
    }
    assert_eq!(ErrorKind::ExecutorSaturated.as_str(), "executor_saturated");
}

#[test]
fn transient_errors() {
    assert!(OrreryError::ExecutorSaturated { capacity: 1 }.is_transient());
    assert!(
        OrreryError::ComputeTimeout {
            budget: Duration::from_secs(1)
        }
        .is_transient()
    );
    assert!(!OrreryError::ComputeFailed("x".into()).is_transient());
    assert!(!OrreryError::NoCalculator.is_transient());
}

#[test]
fn retry_after_only_for_admission() {
    let rejected = OrreryError::AdmissionRejected {
        client_id: "a".into(),
        limit: 1.0,
        retry_after: Duration::from_millis(1500),
    };
    assert_eq!(rejected.retry_after(), Some(Duration::from_millis(1500)));
    assert_eq!(OrreryError::ExecutorSaturated { capacity: 1 }.retry_after(), None);
}

#[test]
fn json_errors_convert() {
    let err: OrreryError = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
    assert!(matches!(err, OrreryError::Json(_)));
}

#[test]
fn errors_are_clone_for_fan_out() {
    let err = OrreryError::ComputeFailed("shared".into());
    let copy = err.clone();
    assert_eq!(err.to_string(), copy.to_string());
}
