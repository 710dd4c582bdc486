use powershare::Config;
use powershare::config::ChargerConfig;
use powershare::station::Station;
use powershare::telemetry::{EgressMessage, TelemetryDecoder, TopicScheme, run_line_egress, run_line_ingress};
use std::time::Duration;
use tokio::sync::broadcast;

fn config() -> Config {
    let mut cfg = Config::default();
    cfg.station.station_id = "s1".to_string();
    cfg.station.chargers = vec![ChargerConfig {
        id: "CP1".to_string(),
        max_power_kw: 50.0,
    }];
    cfg.allocation.debounce_ms = 10;
    cfg.persistence.enabled = false;
    cfg
}

#[tokio::test]
async fn lines_flow_from_ingress_to_allocation() {
    let cfg = config();
    let (station, handle) = Station::new(&cfg, None).unwrap();
    let _task = tokio::spawn(station.run());

    let input = concat!(
        r#"{"topic":"ems/s1/charger/CP1/session/start","payload":{"charger_id":"CP1","requested_power_kw":80,"timestamp":"2030-01-01T00:00:00Z"}}"#,
        "\n",
        "this line is not json\n",
        "\n",
        r#"{"topic":"ems/s1/charger/CP1/telemetry","payload":{"charger_id":"CP2","requested_power_kw":10,"timestamp":"2030-01-01T00:00:01Z"}}"#,
        "\n",
        r#"{"topic":"ems/s1/charger/CP1/heartbeat","payload":{"charger_id":"CP1","timestamp":"2030-01-01T00:00:02Z"}}"#,
        "\n",
    );
    let decoder = TelemetryDecoder::new(TopicScheme::new("ems", "s1"));
    let accepted = run_line_ingress(input.as_bytes(), decoder, handle.sender())
        .await
        .unwrap();
    // The garbage line and the mismatched charger id are dropped
    assert_eq!(accepted, 2);

    let mut rx = handle.subscribe_snapshot();
    let snap = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| !s.plan.entries.is_empty()))
        .await
        .unwrap()
        .unwrap()
        .clone();
    // Request clamped to the 50 kW charger ceiling
    assert_eq!(snap.plan.entries[0].allocated_kw, 50.0);
}

#[tokio::test]
async fn egress_writes_one_json_line_per_message() {
    let (tx, rx) = broadcast::channel::<EgressMessage>(8);
    let mut out = Vec::new();
    let writer = tokio::spawn(async move {
        run_line_egress(rx, &mut out).await.unwrap();
        out
    });

    tx.send(EgressMessage {
        topic: "ems/s1/charger/CP1/power_limit".to_string(),
        payload: serde_json::json!({"charger_id": "CP1", "allocated_power_kw": 22.0}),
    })
    .unwrap();
    tx.send(EgressMessage {
        topic: "ems/s1/bess/command".to_string(),
        payload: serde_json::json!({"command": "idle", "power_kw": 0.0}),
    })
    .unwrap();
    drop(tx);

    let out = writer.await.unwrap();
    let text = String::from_utf8(out).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    let first: EgressMessage = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(first.topic, "ems/s1/charger/CP1/power_limit");
    assert_eq!(first.payload["allocated_power_kw"], 22.0);
}
