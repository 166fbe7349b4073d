#![allow(clippy::unwrap_used, clippy::expect_used)]

use quorum_core::*;

// ---------------------------------------------------------------------------
// 1. Every error maps to a stable kind
// ---------------------------------------------------------------------------

#[test]
fn every_error_has_a_kind() {
    let cases = vec![
        (QuorumError::Validation("missing id".into()), ErrorKind::Validation),
        (QuorumError::Resource("gpu".into()), ErrorKind::Resource),
        (
            QuorumError::NoCapableWorker("login".into()),
            ErrorKind::NoCapableWorker,
        ),
        (QuorumError::Health("probe failed".into()), ErrorKind::Health),
        (QuorumError::Timeout(250), ErrorKind::Timeout),
        (
            QuorumError::DependencyCycle("a -> a".into()),
            ErrorKind::DependencyCycle,
        ),
        (
            QuorumError::WorkerExecution("boom".into()),
            ErrorKind::WorkerExecution,
        ),
        (QuorumError::Cancelled, ErrorKind::Cancelled),
        (QuorumError::Lifecycle("stopped".into()), ErrorKind::Lifecycle),
        (QuorumError::Config("bad".into()), ErrorKind::Config),
        (QuorumError::Store("disk".into()), ErrorKind::Store),
    ];

    for (err, kind) in cases {
        assert_eq!(err.kind(), kind, "wrong kind for {err}");
    }
}

// ---------------------------------------------------------------------------
// 2. Attempt errors survive the outcome log format
// ---------------------------------------------------------------------------

#[test]
fn attempt_error_json_roundtrip() {
    let original = AttemptError::from(QuorumError::Timeout(1500));
    assert_eq!(original.message, "Timeout after 1500 ms");

    let json = serde_json::to_string(&original).unwrap();
    assert!(json.contains("\"timeout\""));
    let parsed: AttemptError = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, original);
}

// ---------------------------------------------------------------------------
// 3. Display formats used in logs
// ---------------------------------------------------------------------------

#[test]
fn error_display_messages() {
    assert_eq!(
        QuorumError::NoCapableWorker("ocr".into()).to_string(),
        "No capable worker for task type 'ocr'"
    );
    let attempt = AttemptError::new(ErrorKind::Health, "gpu offline");
    assert_eq!(attempt.to_string(), "health: gpu offline");
}

#[test]
fn json_error_converts() {
    let bad: Result<serde_json::Value, _> = serde_json::from_str("{not json");
    let err: QuorumError = bad.unwrap_err().into();
    assert!(matches!(err, QuorumError::Json(_)));
    assert!(!err.is_setup_error());
}
