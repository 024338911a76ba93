//! End-to-end tests for the execution pipeline.
//!
//! Tiers and probes are injected through their traits, so these tests never
//! need a container runtime, cgroup delegation or real rlimit changes.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;
use sandbox_runtime::{
    AuditDecision, BreakerState, ErrorKind, ExecutionRequest, HealthCheckable, ResourceLimits,
    SandboxEvent,
};
use serde_json::json;

/// The reference engine doubles its input through the full pipeline.
#[tokio::test]
async fn test_doubles_input() {
    let (_root, config) = fixture();
    let sandbox = orchestrator(config, in_process_tier()).await;

    let result = sandbox
        .run(ExecutionRequest::new("alice/double.py", "double", "alice").with_param("x", json!(21)))
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.value, Some(json!(42)));
    assert!(sandbox.registry().is_empty());
}

/// Loader → scanner → execute returns structured input unchanged.
#[tokio::test]
async fn test_round_trip_preserves_input() {
    let (_root, config) = fixture();
    let sandbox = orchestrator(config, in_process_tier()).await;
    let payload = json!({
        "symbol": "BTC-USD",
        "levels": [42000.5, 42001, -3],
        "meta": {"live": false, "note": null, "tags": ["a", "b"]}
    });

    let result = sandbox
        .run(ExecutionRequest::new("alice/echo.py", "echo", "alice").with_param("value", payload.clone()))
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.value, Some(payload));
}

/// Unsafe scripts are rejected before any tier is invoked.
#[tokio::test]
async fn test_unsafe_script_never_runs() {
    let (root, config) = fixture();
    write_script(
        root.path(),
        "alice/exfil.py",
        "import socket\n\ndef run(x):\n    s = socket.socket()\n    s.connect(('10.0.0.1', 4444))\n    return x\n",
    );
    let tier = TestTier::new(Behaviour::Succeed);
    let sandbox = orchestrator(config, tier.clone()).await;

    let result = sandbox
        .run(ExecutionRequest::new("alice/exfil.py", "run", "alice"))
        .await;

    assert_eq!(result.error_kind(), Some(ErrorKind::ThreatDetected));
    assert_eq!(tier.calls(), 0);
    let events = sandbox.audit_log().unwrap().events();
    assert!(events
        .iter()
        .any(|e| matches!(e, SandboxEvent::ThreatBlocked { blocking_findings, .. } if *blocking_findings > 0)));
}

/// Traversal is refused by the loader, so the scanner never sees it.
#[tokio::test]
async fn test_path_traversal_rejected_before_scan() {
    let (_root, config) = fixture();
    let tier = TestTier::new(Behaviour::Succeed);
    let sandbox = orchestrator(config, tier.clone()).await;

    let result = sandbox
        .run(ExecutionRequest::new("alice/../bob/private.py", "double", "alice"))
        .await;

    assert_eq!(result.error_kind(), Some(ErrorKind::AccessDenied));
    assert_eq!(tier.calls(), 0);
    let log = sandbox.audit_log().unwrap();
    assert!(!log
        .events()
        .iter()
        .any(|e| matches!(e, SandboxEvent::ThreatBlocked { .. })));
    let decisions: Vec<AuditDecision> = log.audit_events().into_iter().map(|e| e.decision).collect();
    assert_eq!(decisions, vec![AuditDecision::Denied]);
}

/// Another user's script and a role without execute rights are both denied
/// and audited.
#[tokio::test]
async fn test_access_denied_is_audited() {
    let (_root, config) = fixture();
    let tier = TestTier::new(Behaviour::Succeed);
    let sandbox = orchestrator(config, tier.clone()).await;

    let foreign = sandbox
        .run(ExecutionRequest::new("bob/private.py", "double", "alice"))
        .await;
    let viewer = sandbox
        .run(ExecutionRequest::new("victor/any.py", "run", "victor"))
        .await;
    let unknown = sandbox
        .run(ExecutionRequest::new("mallory/x.py", "run", "mallory"))
        .await;

    for result in [&foreign, &viewer, &unknown] {
        assert_eq!(result.error_kind(), Some(ErrorKind::AccessDenied));
    }
    assert_eq!(tier.calls(), 0);
    let denied = sandbox
        .audit_log()
        .unwrap()
        .audit_events()
        .into_iter()
        .filter(|e| e.decision == AuditDecision::Denied)
        .count();
    assert_eq!(denied, 3);
}

/// Limits over the administrative ceiling are rejected, never clamped.
#[tokio::test]
async fn test_limits_above_ceiling_rejected() {
    let (_root, config) = fixture();
    let tier = TestTier::new(Behaviour::Succeed);
    let sandbox = orchestrator(config, tier.clone()).await;
    let limits = ResourceLimits {
        memory_mb: 4096,
        ..ResourceLimits::default()
    };

    let result = sandbox
        .run(ExecutionRequest::new("alice/double.py", "double", "alice").with_limits(limits))
        .await;

    assert_eq!(result.error_kind(), Some(ErrorKind::ValidationFailed));
    assert_eq!(tier.calls(), 0);
}

/// Twenty submissions against five slots: five run, fifteen fail fast, and
/// nothing is left in the registry.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_ceiling_holds() {
    let (_root, config) = fixture();
    let tier = TestTier::new(Behaviour::Block);
    let sandbox = Arc::new(orchestrator(config, tier.clone()).await);
    let finished = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..20 {
        let sandbox = Arc::clone(&sandbox);
        let finished = Arc::clone(&finished);
        handles.push(tokio::spawn(async move {
            let result = sandbox
                .run(ExecutionRequest::new("alice/double.py", "double", "alice").with_param("x", json!(1)))
                .await;
            finished.fetch_add(1, Ordering::SeqCst);
            result
        }));
    }

    // The five holders only return once released.
    wait_until(|| finished.load(Ordering::SeqCst) == 15 && tier.running() == 5).await;
    assert_eq!(sandbox.registry().len(), 5);
    tier.release.cancel();

    let mut succeeded = 0;
    let mut rejected = 0;
    for handle in handles {
        let result = handle.await.unwrap();
        match result.error_kind() {
            None => succeeded += 1,
            Some(ErrorKind::ConcurrencyExceeded) => rejected += 1,
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!((succeeded, rejected), (5, 15));
    assert_eq!(tier.max_running.load(Ordering::SeqCst), 5);
    assert!(sandbox.registry().is_empty());
}

/// A hung execution surfaces as a timeout within limit + sampling interval.
#[tokio::test]
async fn test_timeout_surfaces_promptly() {
    let (_root, config) = fixture();
    let interval = config.monitor.sample_interval();
    let sandbox = orchestrator(config, TestTier::new(Behaviour::Hang)).await;

    let started = Instant::now();
    let result = sandbox
        .run(ExecutionRequest::new("alice/double.py", "double", "alice").with_timeout(0.2))
        .await;
    let elapsed = started.elapsed();

    assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
    assert!(
        elapsed < Duration::from_millis(200) + interval + Duration::from_millis(250),
        "took {elapsed:?}"
    );
    assert!(sandbox.registry().is_empty());
}

/// Three machinery faults open the breaker, which then fails closed without
/// touching the tier.
#[tokio::test]
async fn test_machinery_faults_open_breaker() {
    let (_root, config) = fixture();
    let tier = TestTier::new(Behaviour::MachineryFault);
    let sandbox = orchestrator(config, tier.clone()).await;
    let request = ExecutionRequest::new("alice/double.py", "double", "alice");

    for _ in 0..3 {
        let result = sandbox.run(request.clone()).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::InternalError));
        assert_eq!(result.error.unwrap().message, "Isolation tier failed");
    }
    assert_eq!(sandbox.breaker().state(), BreakerState::Open);

    let result = sandbox.run(request).await;
    assert_eq!(result.error_kind(), Some(ErrorKind::InternalError));
    assert_eq!(tier.calls(), 3);
    assert!(!sandbox.health_check().await.healthy);
}

/// Script bugs are the script's problem, not the sandbox's.
#[tokio::test]
async fn test_script_faults_leave_breaker_closed() {
    let (_root, config) = fixture();
    let tier = TestTier::new(Behaviour::ScriptFault);
    let sandbox = orchestrator(config, tier.clone()).await;

    for _ in 0..5 {
        let result = sandbox
            .run(ExecutionRequest::new("alice/double.py", "double", "alice"))
            .await;
        assert_eq!(result.error_kind(), Some(ErrorKind::InternalError));
    }
    assert_eq!(tier.calls(), 5);
    assert_eq!(sandbox.breaker().state(), BreakerState::Closed);
}

/// Emergency stop cancels what is running and refuses new work until
/// cleared.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_emergency_stop_cancels_and_blocks() {
    let (_root, config) = fixture();
    let tier = TestTier::new(Behaviour::Block);
    let sandbox = Arc::new(orchestrator(config, tier.clone()).await);

    let running = {
        let sandbox = Arc::clone(&sandbox);
        tokio::spawn(async move {
            sandbox
                .run(ExecutionRequest::new("alice/double.py", "double", "alice"))
                .await
        })
    };
    wait_until(|| sandbox.registry().len() == 1).await;

    assert_eq!(sandbox.emergency_stop("operator request"), 1);
    let result = running.await.unwrap();
    assert_eq!(result.error_kind(), Some(ErrorKind::InternalError));
    assert!(result.error.unwrap().message.contains("emergency stop"));

    let refused = sandbox
        .run(ExecutionRequest::new("alice/double.py", "double", "alice"))
        .await;
    assert_eq!(refused.error_kind(), Some(ErrorKind::InternalError));
    assert_eq!(tier.calls(), 1);

    sandbox.clear_emergency_stop();
    tier.release.cancel();
    let resumed = sandbox
        .run(ExecutionRequest::new("alice/double.py", "double", "alice"))
        .await;
    assert!(resumed.success, "{:?}", resumed.error);

    let events = sandbox.audit_log().unwrap().events();
    assert!(events
        .iter()
        .any(|e| matches!(e, SandboxEvent::EmergencyStop { cancelled: 1, .. })));
}

/// After shutdown the sandbox admits nothing.
#[tokio::test]
async fn test_shutdown_refuses_new_work() {
    let (_root, config) = fixture();
    let sandbox = orchestrator(config, TestTier::new(Behaviour::Succeed)).await;

    sandbox.shutdown(Duration::from_millis(50)).await;
    let result = sandbox
        .run(ExecutionRequest::new("alice/double.py", "double", "alice"))
        .await;

    assert_eq!(result.error_kind(), Some(ErrorKind::InternalError));
    assert!(result.error.unwrap().message.contains("shutting down"));
}

/// Health lists every component and is clean on a fresh sandbox.
#[tokio::test]
async fn test_health_reports_components() {
    let (_root, config) = fixture();
    let sandbox = orchestrator(config, TestTier::new(Behaviour::Succeed)).await;

    let components: Vec<String> = sandbox.health().into_iter().map(|c| c.component).collect();
    for expected in ["tier", "breaker:execution", "breaker:monitor", "emergency_stop", "registry", "baseline"] {
        assert!(components.iter().any(|c| c == expected), "missing {expected}");
    }
    assert!(sandbox.health_check().await.healthy);
}
