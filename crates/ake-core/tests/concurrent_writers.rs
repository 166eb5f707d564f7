//! Concurrency tests for per-key locking.
//!
//! Validates:
//! - N concurrent upserts of one pattern record N occurrences (threads)
//! - a held lock on one pattern never blocks writes to another
//! - concurrent `ake-core reflect` processes never lose an occurrence

use ake_common::{AgentId, Fingerprint};
use ake_config::LockSettings;
use ake_core::pattern::{Outcome, OccurrenceDraft, PatternDraft, PatternRegistry, RegistryError};
use ake_core::storage::lock::{lock_path_for, KeyLock};
use ake_core::storage::{StorageError, Store, StoreKey};
use chrono::Utc;
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn patient() -> LockSettings {
    LockSettings {
        lock_attempts: 50,
        attempt_timeout_ms: 500,
        ..LockSettings::default()
    }
}

fn occurrence(key: &str) -> OccurrenceDraft {
    OccurrenceDraft {
        key: key.to_string(),
        timestamp: Utc::now(),
        reporting_agent: AgentId::parse("scout").unwrap(),
        outcome: Outcome::Success,
        note: None,
    }
}

#[test]
fn test_concurrent_upserts_never_lose_occurrences() {
    const WRITERS: usize = 16;
    let dir = tempdir().unwrap();
    let registry = PatternRegistry::new(Store::new(dir.path(), patient()));
    let barrier = Arc::new(Barrier::new(WRITERS));

    let handles: Vec<_> = (0..WRITERS)
        .map(|i| {
            let registry = registry.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                registry
                    .upsert(
                        &PatternDraft::named("Retry flaky network calls"),
                        occurrence(&format!("evt-{i}#0")),
                    )
                    .unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let fp = Fingerprint::from_name("Retry flaky network calls").unwrap();
    let p = registry.get(&fp).unwrap().unwrap();
    assert_eq!(p.occurrences().len(), WRITERS);
    assert_eq!(p.success_rate(), 1.0);
}

#[cfg(unix)]
#[test]
fn test_held_lock_only_blocks_its_own_pattern() {
    let dir = tempdir().unwrap();
    let strict = LockSettings {
        lock_attempts: 2,
        attempt_timeout_ms: 20,
        backoff_base_ms: 1,
        backoff_max_ms: 2,
    };
    let store = Store::new(dir.path(), strict);
    let registry = PatternRegistry::new(store.clone());

    let busy = Fingerprint::from_name("busy pattern").unwrap();
    let busy_key = StoreKey::pattern(&busy);
    std::fs::create_dir_all(store.path_of(&busy_key).parent().unwrap()).unwrap();
    let held = KeyLock::acquire(
        &lock_path_for(&store.path_of(&busy_key)),
        busy_key.as_str(),
        store.lock_settings(),
    )
    .unwrap();

    let started = Instant::now();
    registry
        .upsert(&PatternDraft::named("idle pattern"), occurrence("evt-idle#0"))
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));

    let err = registry
        .upsert(&PatternDraft::named("busy pattern"), occurrence("evt-busy#0"))
        .unwrap_err();
    assert!(matches!(
        err,
        RegistryError::Storage(StorageError::ConcurrencyExhausted { .. })
    ));

    drop(held);
    registry
        .upsert(&PatternDraft::named("busy pattern"), occurrence("evt-busy#0"))
        .unwrap();
    assert_eq!(registry.get(&busy).unwrap().unwrap().occurrences().len(), 1);
}

#[test]
fn test_concurrent_reflect_processes_never_lose_occurrences() {
    const PROCESSES: usize = 6;
    let dir = tempdir().unwrap();
    let store_dir = dir.path().join("store");
    let config = dir.path().join("config.json");
    std::fs::write(
        &config,
        r#"{"storage": {"lock_attempts": 50, "attempt_timeout_ms": 500}}"#,
    )
    .unwrap();

    let children: Vec<_> = (0..PROCESSES)
        .map(|i| {
            let mut child = Command::new(env!("CARGO_BIN_EXE_ake-core"))
                .arg("--store")
                .arg(&store_dir)
                .arg("--config")
                .arg(&config)
                .arg("reflect")
                .stdin(Stdio::piped())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .unwrap();
            let event = serde_json::json!({
                "eventId": format!("evt-proc-{i}"),
                "agent": "scout",
                "reportText": "PATTERN: Bisect failing migration\nOUTCOME: success\n",
            });
            child
                .stdin
                .take()
                .unwrap()
                .write_all(event.to_string().as_bytes())
                .unwrap();
            child
        })
        .collect();

    for child in children {
        let status = child.wait_with_output().unwrap().status;
        assert_eq!(status.code(), Some(0));
    }

    let registry = PatternRegistry::new(Store::new(&store_dir, patient()));
    let fp = Fingerprint::from_name("Bisect failing migration").unwrap();
    let p = registry.get(&fp).unwrap().unwrap();
    assert_eq!(p.occurrences().len(), PROCESSES);
}
