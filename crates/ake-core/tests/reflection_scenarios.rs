//! End-to-end reflection scenarios against a temporary store.
//!
//! Validates:
//! - repeated successes establish a pattern; later failures keep it established
//! - re-processing an event leaves the store untouched
//! - a lost marker replays without duplicating occurrences or messages
//! - addressed messages reach the recipient inbox exactly once per event
//! - the shared feed keeps only the newest entries
//! - a promoted pattern always has its capability artifact

use ake_common::{AgentId, EventId, Fingerprint};
use ake_config::Config;
use ake_core::controller::{ReflectionController, ReflectionOutcome};
use ake_core::event::EventDescriptor;
use ake_core::pattern::{LifecyclePolicy, PatternRegistry, PatternState, PromotionEngine};
use ake_core::relay::{FeedStore, InboxStore};
use ake_core::storage::{Store, StoreKey};
use chrono::{Duration, TimeZone, Utc};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tempfile::{tempdir, TempDir};

// ============================================================================
// Helpers
// ============================================================================

fn setup() -> (ReflectionController, Store, TempDir) {
    let dir = tempdir().unwrap();
    let config = Config::default();
    let store = Store::new(dir.path(), config.storage.clone());
    (ReflectionController::new(store.clone(), &config), store, dir)
}

fn event(id: &str, agent: &str, text: &str) -> EventDescriptor {
    EventDescriptor {
        event_id: EventId::parse(id).unwrap(),
        agent: AgentId::parse(agent).unwrap(),
        report_text: text.to_string(),
        timestamp: None,
    }
}

fn report(outcome: &str) -> String {
    format!(
        "Investigated the heap growth in the worker pool.\n\
         \n\
         PATTERN: Debug memory leak\n\
         CONTEXT: RSS grows steadily under constant load\n\
         STEP: take two heap snapshots a minute apart\n\
         STEP: diff retained objects\n\
         OUTCOME: {outcome}\n"
    )
}

fn leak() -> Fingerprint {
    Fingerprint::parse("debug-memory-leak").unwrap()
}

/// Every file under `root` with its contents, keyed by relative path.
fn snapshot(root: &Path) -> BTreeMap<String, Vec<u8>> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<String, Vec<u8>>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                let rel = path.strip_prefix(root).unwrap().to_string_lossy().into_owned();
                out.insert(rel, fs::read(&path).unwrap());
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(root, root, &mut out);
    out
}

// ============================================================================
// Lifecycle scenarios
// ============================================================================

#[test]
fn test_four_successes_establish_pattern() {
    let (controller, store, _dir) = setup();
    for i in 0..4 {
        controller
            .reflect(&event(&format!("evt-s{i}"), "scout", &report("success")))
            .unwrap();
    }

    let p = PatternRegistry::new(store).get(&leak()).unwrap().unwrap();
    assert_eq!(p.state(), PatternState::Established);
    assert_eq!(p.occurrences().len(), 4);
    assert_eq!(p.success_rate(), 1.0);
    assert_eq!(p.context_description, "RSS grows steadily under constant load");
    assert_eq!(p.steps_summary.len(), 2);
}

#[test]
fn test_later_failures_keep_pattern_established() {
    let (controller, store, _dir) = setup();
    for i in 0..4 {
        controller
            .reflect(&event(&format!("evt-s{i}"), "scout", &report("success")))
            .unwrap();
    }
    for i in 0..3 {
        controller
            .reflect(&event(&format!("evt-f{i}"), "vera", &report("failure")))
            .unwrap();
    }

    let p = PatternRegistry::new(store).get(&leak()).unwrap().unwrap();
    assert_eq!(p.occurrences().len(), 7);
    assert_eq!(p.stats().successes, 4);
    assert!((p.success_rate() - 4.0 / 7.0).abs() < 1e-9);
    assert_eq!(p.state(), PatternState::Established);
}

#[test]
fn test_mostly_failing_pattern_is_deprecated() {
    let (controller, store, _dir) = setup();
    let outcomes = ["success", "failure", "failure", "failure"];
    for (i, outcome) in outcomes.iter().enumerate() {
        controller
            .reflect(&event(&format!("evt-{i}"), "scout", &report(outcome)))
            .unwrap();
    }

    let registry = PatternRegistry::new(store);
    let p = registry.get(&leak()).unwrap().unwrap();
    assert_eq!(p.state(), PatternState::Deprecated);

    // Terminal: further successes never revive it.
    for i in 0..6 {
        controller
            .reflect(&event(&format!("evt-late{i}"), "scout", &report("success")))
            .unwrap();
    }
    let p = registry.get(&leak()).unwrap().unwrap();
    assert_eq!(p.state(), PatternState::Deprecated);
    assert_eq!(p.occurrences().len(), 10);
}

// ============================================================================
// Idempotence
// ============================================================================

#[test]
fn test_reprocessing_event_leaves_store_identical() {
    let (controller, _store, dir) = setup();
    let text = format!(
        "{}\n@kai: check the new endpoint\nLEARNING: the pool must never exceed 64 workers\n",
        report("success")
    );
    let e = event("evt-idem", "scout", &text);

    assert!(matches!(
        controller.reflect(&e).unwrap(),
        ReflectionOutcome::Processed(_)
    ));
    let after_first = snapshot(dir.path());

    assert!(matches!(
        controller.reflect(&e).unwrap(),
        ReflectionOutcome::AlreadyProcessed { .. }
    ));
    let after_second = snapshot(dir.path());

    assert_eq!(after_first, after_second);
    let markers = after_second
        .keys()
        .filter(|k| k.starts_with("processed-events") && k.ends_with(".marker"))
        .count();
    assert_eq!(markers, 1);
}

#[test]
fn test_lost_marker_replays_without_duplicates() {
    let (controller, store, _dir) = setup();
    let text = format!("{}\n@kai: check the new endpoint\n", report("success"));
    let e = event("evt-replay", "scout", &text);
    controller.reflect(&e).unwrap();

    // Simulate a crash between the relay phase and the marker commit.
    fs::remove_file(store.path_of(&StoreKey::processed_event(&e.event_id))).unwrap();

    let outcome = controller.reflect(&e).unwrap();
    let ReflectionOutcome::Processed(summary) = outcome else {
        panic!("expected the event to be replayed");
    };
    assert!(!summary.patterns[0].appended);
    assert_eq!(summary.messages_delivered, 0);
    assert_eq!(summary.messages_skipped, 1);

    let p = PatternRegistry::new(store.clone()).get(&leak()).unwrap().unwrap();
    assert_eq!(p.occurrences().len(), 1);
    let kai = AgentId::parse("kai").unwrap();
    assert_eq!(InboxStore::new(store.clone()).list(&kai).unwrap().len(), 1);
    assert!(store.exists(&StoreKey::processed_event(&e.event_id)));
}

// ============================================================================
// Relay
// ============================================================================

#[test]
fn test_message_delivered_once_per_event() {
    let (controller, store, _dir) = setup();
    let e = event("evt-m1", "scout", "Endpoint migrated.\n@kai: check the new endpoint\n");

    controller.reflect(&e).unwrap();
    // Retrying the same event, even after a lost marker, delivers nothing new.
    fs::remove_file(store.path_of(&StoreKey::processed_event(&e.event_id))).unwrap();
    controller.reflect(&e).unwrap();

    let kai = AgentId::parse("kai").unwrap();
    let inbox = InboxStore::new(store).list(&kai).unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].from.as_str(), "scout");
    assert_eq!(inbox[0].body, "check the new endpoint");
    assert!(inbox[0].delivered);
    assert!(inbox[0].read_at.is_none());
}

#[test]
fn test_same_message_in_later_event_is_delivered_again() {
    let (controller, store, _dir) = setup();
    let text = "@kai: rerun the migrations";

    controller.reflect(&event("evt-monday", "scout", text)).unwrap();
    controller.reflect(&event("evt-friday", "scout", text)).unwrap();

    let kai = AgentId::parse("kai").unwrap();
    let inbox = InboxStore::new(store).list(&kai).unwrap();
    assert_eq!(inbox.len(), 2);
    assert_ne!(inbox[0].id, inbox[1].id);
    assert!(inbox.iter().all(|m| m.body == "rerun the migrations"));
}

#[test]
fn test_feed_keeps_newest_twenty_entries() {
    let (controller, store, _dir) = setup();
    let base = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
    for i in 0..21 {
        let mut e = event(
            &format!("evt-feed-{i:02}"),
            "sage",
            &format!("LEARNING: batch size {i} keeps the queue under its latency budget"),
        );
        e.timestamp = Some(base + Duration::minutes(i));
        controller.reflect(&e).unwrap();
    }

    let feed = FeedStore::new(store, 20).load().unwrap();
    let dates: Vec<_> = feed.entries().map(|e| e.date).collect();
    assert_eq!(dates.len(), 20);
    let expected: Vec<_> = (1..21).map(|i| base + Duration::minutes(i)).collect();
    assert_eq!(dates, expected);
    assert!(feed
        .entries()
        .all(|e| !e.learning_snippet.contains("batch size 0 ")));
}

// ============================================================================
// Promotion safety
// ============================================================================

#[test]
fn test_promoted_patterns_always_have_artifacts() {
    let (controller, store, dir) = setup();
    for i in 0..5 {
        controller
            .reflect(&event(&format!("evt-p{i}"), "scout", &report("success")))
            .unwrap();
    }
    let registry = PatternRegistry::new(store.clone());
    let engine = PromotionEngine::new(
        registry.clone(),
        LifecyclePolicy::from_config(&Config::default()),
    );
    let promoted = engine.promote_explicit(&leak()).unwrap();
    assert_eq!(promoted.state(), PatternState::Promoted);

    for p in registry.list_by_state(PatternState::Promoted).unwrap() {
        let artifact = p.promoted_artifact_ref().expect("promoted without artifact");
        let text = fs::read_to_string(dir.path().join(artifact)).unwrap();
        assert!(text.contains("debug-memory-leak"));
    }

    // Reports after promotion still add history but never change the state.
    controller
        .reflect(&event("evt-after", "scout", &report("failure")))
        .unwrap();
    let p = registry.get(&leak()).unwrap().unwrap();
    assert_eq!(p.state(), PatternState::Promoted);
    assert_eq!(p.occurrences().len(), 6);
}
