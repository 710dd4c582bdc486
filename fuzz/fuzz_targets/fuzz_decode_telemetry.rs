#![no_main]
use libfuzzer_sys::fuzz_target;
use powershare::telemetry::{TelemetryDecoder, TopicScheme};

const TOPICS: &[&str] = &[
    "ems/s1/charger/CP1/session/start",
    "ems/s1/charger/CP1/session/stop",
    "ems/s1/charger/CP1/telemetry",
    "ems/s1/charger/CP1/heartbeat",
    "ems/s1/charger/CP1/status",
    "ems/s1/bess/status",
];

fuzz_target!(|data: &[u8]| {
    let decoder = TelemetryDecoder::new(TopicScheme::new("ems", "s1"));

    // First byte picks a topic, the rest is the payload
    if let Some((&selector, payload)) = data.split_first() {
        let topic = TOPICS[usize::from(selector) % TOPICS.len()];
        let _ = decoder.decode(topic, payload);
    }

    // Arbitrary topics must never panic the parser
    if let Ok(text) = std::str::from_utf8(data) {
        let _ = decoder.scheme().parse(text);
    }
});
