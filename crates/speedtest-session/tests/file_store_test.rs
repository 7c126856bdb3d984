//! File-backed store and the complete-then-save flow.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use serde_json::json;
use speedtest_core::{
    ClientMessage, MessageDispatcher, PushChannel, StoreLimits, TestConfig, TestStarter,
    traits::{StartError, TaskId},
};
use speedtest_session::{
    ExportFormat, SessionController, SessionMeta, SessionPhase, SessionStore, storage::FileSlot,
};

struct AcceptAll;

#[async_trait]
impl TestStarter for AcceptAll {
    async fn start(&self, _config: &TestConfig) -> Result<TaskId, StartError> {
        Ok("task-1".to_string())
    }
}

struct AlwaysOpen(AtomicBool);

impl PushChannel for AlwaysOpen {
    fn is_connected(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn connect(&self) {}

    fn send(&self, _message: &ClientMessage) -> bool {
        true
    }
}

fn frame(kind: &str, data: serde_json::Value) -> String {
    json!({"type": kind, "timestamp": "2025-03-01T10:00:00Z", "data": data}).to_string()
}

#[tokio::test]
async fn test_completed_session_is_saved_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(FileSlot::in_dir(dir.path()), StoreLimits::default());

    let dispatcher = Arc::new(MessageDispatcher::new());
    let controller = Arc::new(SessionController::new(
        AcceptAll,
        AlwaysOpen(AtomicBool::new(true)),
        Arc::clone(&dispatcher),
    ));
    let watcher = controller.spawn_watcher();

    let config = TestConfig::new("/srv/clash.yaml", ["a", "b", "c"]);
    controller.start(config).await.unwrap();

    // The legacy runner spelling decodes the same way.
    dispatcher.dispatch(&frame(
        "test_start",
        json!({"total_proxies": 3, "config": {"config_paths": "/srv/clash.yaml", "test_mode": "speed_only"}}),
    ));
    for name in ["a", "b", "c"] {
        dispatcher.dispatch(&frame(
            "test_result",
            json!({"proxy_name": name, "proxy_type": "trojan", "status": "success", "download_speed_mbps": 25.0}),
        ));
    }
    dispatcher.dispatch(&frame(
        "test_complete",
        json!({"total_tested": 3, "successful_tests": 3, "failed_tests": 0, "total_duration": "14s", "best_proxy": "b"}),
    ));

    let mut phase = controller.subscribe_phase();
    tokio::time::timeout(
        std::time::Duration::from_secs(5),
        phase.wait_for(|p| *p == SessionPhase::Completed),
    )
    .await
    .unwrap()
    .unwrap();

    let session = controller.completed_session().unwrap();
    let meta = SessionMeta::derive(&session.start, &session.results, &session.completion);
    let id = store
        .save(session.start, session.results, session.completion, meta)
        .await
        .unwrap();

    let summaries = store.list_summaries().await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].id, id);
    assert_eq!(summaries[0].best_target, "b");
    assert_eq!(summaries[0].duration, "14s");

    let record = store.get(id).await.unwrap().unwrap();
    assert_eq!(record.results.len(), 3);
    watcher.abort();
}

#[tokio::test]
async fn test_file_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let first = SessionStore::new(FileSlot::in_dir(dir.path()), StoreLimits::default());

    let start = serde_json::from_value(json!({"total_targets": 2, "config": {"configPaths": "sub.yaml"}})).unwrap();
    let completion = serde_json::from_value(json!({
        "total_tested": 2, "successful": 1, "failed": 1, "duration": "3s"
    }))
    .unwrap();
    let meta = SessionMeta::derive(&start, &[], &completion).with_tags(["nightly"]);
    let id = first.save(start, Vec::new(), completion, meta).await.unwrap();

    let raw = std::fs::read_to_string(dir.path().join("clash-speedtest-sessions.json")).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(doc["version"], "1.0.0");
    assert!(doc["lastCleanup"].is_i64());
    assert_eq!(doc["sessions"][0]["meta"]["tags"], json!(["nightly"]));

    let reopened = SessionStore::new(FileSlot::in_dir(dir.path()), StoreLimits::default());
    let record = reopened.get(id).await.unwrap().unwrap();
    assert_eq!(record.config_path(), "sub.yaml");

    let exported = reopened.export(None, ExportFormat::Json).await.unwrap();
    let other_dir = tempfile::tempdir().unwrap();
    let other = SessionStore::new(FileSlot::in_dir(other_dir.path()), StoreLimits::default());
    assert_eq!(other.import(&exported).await.unwrap(), 1);
    assert_eq!(other.get(id).await.unwrap(), Some(record));

    reopened.clear_all().await.unwrap();
    assert!(!dir.path().join("clash-speedtest-sessions.json").exists());
}
