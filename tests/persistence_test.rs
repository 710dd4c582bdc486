use chrono::Utc;
use powershare::Config;
use powershare::dispatcher::StationEvent;
use powershare::persistence::{JsonLinesStore, LifecycleStore};
use powershare::session::{ChargingSession, FinishReason, LifecycleEvent, LifecycleKind};
use powershare::station::Station;

#[tokio::test]
async fn missing_file_loads_empty() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonLinesStore::new(dir.path().join("absent.jsonl"));
    assert!(store.load().await.unwrap().is_empty());
}

#[tokio::test]
async fn corrupt_lines_are_skipped_on_load() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let store = JsonLinesStore::new(tmp.path());
    let session = ChargingSession::connect("CP001", 11.0, Utc::now());
    store
        .append(&LifecycleEvent::new(&session, LifecycleKind::Connected, Utc::now()))
        .await
        .unwrap();
    tokio::fs::write(
        tmp.path(),
        format!("{}garbage\n", tokio::fs::read_to_string(tmp.path()).await.unwrap()),
    )
    .await
    .unwrap();
    let events = store.load().await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].session_id, session.id);
}

#[tokio::test]
async fn station_writes_configured_jsonl_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sessions.jsonl");

    let mut cfg = Config::default();
    cfg.allocation.debounce_ms = 0;
    cfg.persistence.enabled = true;
    cfg.persistence.file = path.to_string_lossy().to_string();

    let (station, handle) = Station::new(&cfg, None).unwrap();
    let task = tokio::spawn(station.run());
    let tx = handle.sender();
    let t0 = Utc::now() - chrono::Duration::minutes(30);
    tx.dispatch(StationEvent::Connect {
        charger_id: "CP001".to_string(),
        requested_power_kw: 30.0,
        at: t0,
    })
    .await
    .unwrap();
    tx.dispatch(StationEvent::Disconnect {
        charger_id: "CP001".to_string(),
        reason: FinishReason::Disconnected,
        energy_delivered_kwh: Some(14.2),
        at: Utc::now(),
    })
    .await
    .unwrap();

    handle.request_shutdown();
    task.await.unwrap().unwrap();

    let events = JsonLinesStore::new(&path).load().await.unwrap();
    let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![LifecycleKind::Connected, LifecycleKind::Finished]);
    let finished = &events[1];
    assert_eq!(finished.reason, Some(FinishReason::Disconnected));
    assert_eq!(finished.energy_delivered_kwh, Some(14.2));
    assert!(finished.duration_seconds.unwrap() >= 30 * 60);
}
