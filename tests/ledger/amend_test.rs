//! Append semantics and persistence.

use sentinel::identity::SovereignId;
use sentinel::ledger::{Ledger, DEFAULT_POINTER, VERSIONS_DIR};

fn id(hex: &str) -> SovereignId {
    SovereignId::parse(hex).expect("well-formed identifier")
}

#[test]
fn fresh_ledger_is_empty_without_version() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let ledger = Ledger::open(tmp.path(), DEFAULT_POINTER).expect("opens");
    assert!(ledger.identifiers().is_empty());
    assert!(ledger.current_version().is_none());
    assert!(ledger.versions().expect("lists").is_empty());
    assert!(tmp.path().join(VERSIONS_DIR).is_dir());
}

#[test]
fn amend_twice_is_idempotent() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let mut ledger = Ledger::open(tmp.path(), DEFAULT_POINTER).expect("opens");
    let x = id("aaaaaaaaaaaaaaaa");

    assert!(ledger.amend(&x).expect("first amend"));
    let after_first = ledger.identifiers().to_vec();
    let version_after_first = ledger.current_version().map(str::to_owned);

    assert!(!ledger.amend(&x).expect("second amend"));
    assert_eq!(ledger.identifiers(), after_first.as_slice());
    assert_eq!(ledger.current_version().map(str::to_owned), version_after_first);
    assert_eq!(ledger.versions().expect("lists").len(), 1);
}

#[test]
fn each_amend_writes_full_snapshot() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let mut ledger = Ledger::open(tmp.path(), DEFAULT_POINTER).expect("opens");
    ledger.amend(&id("aaaaaaaaaaaaaaaa")).expect("amend");
    ledger.amend(&id("bbbbbbbbbbbbbbbb")).expect("amend");

    let current = ledger.current_version().expect("has version").to_owned();
    let raw = std::fs::read_to_string(tmp.path().join(VERSIONS_DIR).join(&current))
        .expect("snapshot readable");
    let stored: Vec<String> = serde_json::from_str(&raw).expect("json array");
    assert_eq!(stored, ["aaaaaaaaaaaaaaaa", "bbbbbbbbbbbbbbbb"]);

    let pointer = std::fs::read_to_string(tmp.path().join(DEFAULT_POINTER)).expect("pointer");
    assert_eq!(pointer.trim(), current);
}

#[test]
fn snapshot_names_sort_chronologically() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let mut ledger = Ledger::open(tmp.path(), DEFAULT_POINTER).expect("opens");
    let mut written = Vec::new();
    for hex in ["1111111111111111", "2222222222222222", "3333333333333333"] {
        ledger.amend(&id(hex)).expect("amend");
        written.push(ledger.current_version().expect("version").to_owned());
    }
    assert_eq!(ledger.versions().expect("lists"), written);
}

#[test]
fn reopen_restores_current_version() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    {
        let mut ledger = Ledger::open(tmp.path(), DEFAULT_POINTER).expect("opens");
        ledger.amend(&id("aaaaaaaaaaaaaaaa")).expect("amend");
        ledger.amend(&id("bbbbbbbbbbbbbbbb")).expect("amend");
    }
    let reopened = Ledger::open(tmp.path(), DEFAULT_POINTER).expect("reopens");
    assert_eq!(reopened.identifiers().len(), 2);
    assert!(reopened.contains(&id("bbbbbbbbbbbbbbbb")));
}

#[test]
fn retract_writes_version_without_identifier() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let mut ledger = Ledger::open(tmp.path(), DEFAULT_POINTER).expect("opens");
    let a = id("aaaaaaaaaaaaaaaa");
    let b = id("bbbbbbbbbbbbbbbb");
    ledger.amend(&a).expect("amend");
    ledger.amend(&b).expect("amend");

    assert!(ledger.retract(&a).expect("retract"));
    assert_eq!(ledger.identifiers(), [b.clone()]);
    assert_eq!(ledger.versions().expect("lists").len(), 3);

    assert!(!ledger.retract(&a).expect("second retract is a no-op"));
    assert_eq!(ledger.versions().expect("lists").len(), 3);
}
