//! Sovereign-phase monitoring and the stability check.

use std::sync::Arc;

use sentinel::config::SentinelConfig;
use sentinel::ledger::{Ledger, DEFAULT_POINTER};
use sentinel::metrics::TraitVector;
use sentinel::narrator::TraitTable;
use sentinel::sentinel::{Phase, Sentinel};

use crate::support::{center, envelope, fast_outcome, sentinel_with, ScriptedRunner};

fn traits(speed_ms: f64, memory_mb: f64, reliability: f64) -> TraitVector {
    TraitVector::from([
        ("speed_ms".to_owned(), speed_ms),
        ("memory_mb".to_owned(), memory_mb),
        ("reliability".to_owned(), reliability),
    ])
}

#[test]
fn in_envelope_operation_is_not_a_violation() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let mut sentinel = sentinel_with(tmp.path(), Arc::new(ScriptedRunner::new(fast_outcome())));

    let verdict = sentinel.monitor(&traits(2.0, 0.5, 1.0), &center(), &envelope());
    assert!(!verdict.violation);
    assert!((verdict.vp - 0.45).abs() < 1e-12);
}

#[test]
fn vp_equal_to_threshold_is_not_a_violation() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let mut sentinel = sentinel_with(tmp.path(), Arc::new(ScriptedRunner::new(fast_outcome())));

    let verdict = sentinel.monitor(&traits(5.0, 1.0, 1.0), &center(), &envelope());
    assert_eq!(verdict.vp, 1.0);
    assert!(!verdict.violation);
}

#[test]
fn unreliable_operation_is_a_violation() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let mut sentinel = sentinel_with(tmp.path(), Arc::new(ScriptedRunner::new(fast_outcome())));

    let verdict = sentinel.monitor(&traits(1.0, 0.1, 0.0), &center(), &envelope());
    assert!(verdict.violation);
    assert!(verdict.vp > 1.0);
}

#[test]
fn nan_vp_is_a_violation() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let mut sentinel = sentinel_with(tmp.path(), Arc::new(ScriptedRunner::new(fast_outcome())));

    let verdict = sentinel.monitor(&traits(f64::NAN, 0.1, 1.0), &center(), &envelope());
    assert!(verdict.vp.is_nan());
    assert!(verdict.violation);
}

#[test]
fn monitoring_appends_sovereign_history() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let mut sentinel = sentinel_with(tmp.path(), Arc::new(ScriptedRunner::new(fast_outcome())));

    sentinel.monitor(&traits(1.0, 0.1, 1.0), &center(), &envelope());
    sentinel.monitor(&traits(50.0, 0.1, 1.0), &center(), &envelope());

    let history = sentinel.history();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|s| s.phase == Phase::Sovereign));
    assert_eq!(history[1].traits.get("speed_ms"), Some(&50.0));
}

#[test]
fn critical_mass_needs_enough_stable_samples() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let ledger = Ledger::open(tmp.path(), DEFAULT_POINTER).expect("ledger opens");
    let settings = SentinelConfig {
        vp_threshold: 1.0,
        critical_mass_sample_size: 3,
    };
    let mut sentinel = Sentinel::new(
        ledger,
        Arc::new(ScriptedRunner::new(fast_outcome())),
        Arc::new(TraitTable::default()),
        settings,
    );

    sentinel.monitor(&traits(2.0, 0.5, 1.0), &center(), &envelope());
    sentinel.monitor(&traits(2.0, 0.5, 1.0), &center(), &envelope());
    assert!(!sentinel.critical_mass(), "two samples are below the window");

    sentinel.monitor(&traits(2.0, 0.5, 1.0), &center(), &envelope());
    assert!(sentinel.critical_mass());

    // A wildly different sample makes the trailing window unstable.
    sentinel.monitor(&traits(100.0, 0.5, 0.0), &center(), &envelope());
    assert!(!sentinel.critical_mass());
}
