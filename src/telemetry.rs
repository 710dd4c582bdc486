//! Telemetry adapters
//!
//! Topic scheme, ingress message validation and egress message shapes. Ingress
//! messages are checked here and turned into [`StationEvent`]s; nothing
//! malformed reaches the station queue.
//!
//! Topics (`{prefix}` and `{station}` from configuration):
//!
//! ```text
//! {prefix}/{station}/charger/{id}/session/start   ingress
//! {prefix}/{station}/charger/{id}/session/stop    ingress
//! {prefix}/{station}/charger/{id}/telemetry       ingress
//! {prefix}/{station}/charger/{id}/heartbeat       ingress
//! {prefix}/{station}/charger/{id}/status          ingress
//! {prefix}/{station}/bess/status                  ingress
//! {prefix}/{station}/charger/{id}/power_limit     egress
//! {prefix}/{station}/bess/command                 egress
//! ```

use crate::bess::BessCommand;
use crate::dispatcher::{EventSender, StationEvent};
use crate::error::{PowershareError, Result};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use crate::session::FinishReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;

/// Parsed ingress topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngressTopic {
    SessionStart { charger_id: String },
    SessionStop { charger_id: String },
    Telemetry { charger_id: String },
    Heartbeat { charger_id: String },
    Status { charger_id: String },
    BessStatus,
}

/// Topic naming for one station
#[derive(Debug, Clone)]
pub struct TopicScheme {
    prefix: String,
    station_id: String,
}

impl TopicScheme {
    pub fn new(prefix: &str, station_id: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            station_id: station_id.to_string(),
        }
    }

    fn charger_topic(&self, charger_id: &str, suffix: &str) -> String {
        format!(
            "{}/{}/charger/{charger_id}/{suffix}",
            self.prefix, self.station_id
        )
    }

    pub fn power_limit(&self, charger_id: &str) -> String {
        self.charger_topic(charger_id, "power_limit")
    }

    pub fn bess_command(&self) -> String {
        format!("{}/{}/bess/command", self.prefix, self.station_id)
    }

    pub fn session_start(&self, charger_id: &str) -> String {
        self.charger_topic(charger_id, "session/start")
    }

    pub fn telemetry(&self, charger_id: &str) -> String {
        self.charger_topic(charger_id, "telemetry")
    }

    pub fn bess_status(&self) -> String {
        format!("{}/{}/bess/status", self.prefix, self.station_id)
    }

    /// Parse an ingress topic belonging to this station
    pub fn parse(&self, topic: &str) -> Result<IngressTopic> {
        let parts: Vec<&str> = topic.split('/').collect();
        let unknown = || PowershareError::invalid_telemetry("topic", format!("unrecognised topic {topic}"));

        let [prefix, station, rest @ ..] = parts.as_slice() else {
            return Err(unknown());
        };
        if *prefix != self.prefix || *station != self.station_id {
            return Err(unknown());
        }

        match rest {
            ["bess", "status"] => Ok(IngressTopic::BessStatus),
            ["charger", id, tail @ ..] if !id.is_empty() => {
                let charger_id = (*id).to_string();
                match tail {
                    ["session", "start"] => Ok(IngressTopic::SessionStart { charger_id }),
                    ["session", "stop"] => Ok(IngressTopic::SessionStop { charger_id }),
                    ["telemetry"] => Ok(IngressTopic::Telemetry { charger_id }),
                    ["heartbeat"] => Ok(IngressTopic::Heartbeat { charger_id }),
                    ["status"] => Ok(IngressTopic::Status { charger_id }),
                    _ => Err(unknown()),
                }
            }
            _ => Err(unknown()),
        }
    }
}

/// Demand report (`session/start` and `telemetry`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargerDemandMessage {
    pub charger_id: String,
    pub requested_power_kw: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub energy_delivered_kwh: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStopMessage {
    pub charger_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub total_energy_kwh: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    pub charger_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargerStatusMessage {
    pub charger_id: String,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BessStatusMessage {
    pub soc_percent: f64,
    pub max_discharge_kw: f64,
    pub max_charge_kw: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub status: Option<String>,
}

fn is_fault_status(status: &str) -> bool {
    matches!(
        status.to_ascii_lowercase().as_str(),
        "fault" | "faulted" | "error" | "offline"
    )
}

fn check_power(field: &str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(PowershareError::invalid_telemetry(
            field,
            format!("{value} is not a non-negative number"),
        ))
    }
}

fn check_charger(topic_id: &str, payload_id: &str) -> Result<()> {
    if topic_id == payload_id {
        Ok(())
    } else {
        Err(PowershareError::invalid_telemetry(
            "charger_id",
            format!("payload names {payload_id} on topic for {topic_id}"),
        ))
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(payload: serde_json::Value) -> Result<T> {
    serde_json::from_value(payload)
        .map_err(|e| PowershareError::invalid_telemetry("payload", e.to_string()))
}

/// Turns (topic, payload) pairs into station events
#[derive(Debug, Clone)]
pub struct TelemetryDecoder {
    scheme: TopicScheme,
}

impl TelemetryDecoder {
    pub const fn new(scheme: TopicScheme) -> Self {
        Self { scheme }
    }

    pub const fn scheme(&self) -> &TopicScheme {
        &self.scheme
    }

    /// Decode a raw JSON payload
    pub fn decode(&self, topic: &str, payload: &[u8]) -> Result<StationEvent> {
        let value: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| PowershareError::invalid_telemetry("payload", e.to_string()))?;
        self.decode_value(topic, value)
    }

    pub fn decode_value(&self, topic: &str, payload: serde_json::Value) -> Result<StationEvent> {
        match self.scheme.parse(topic)? {
            IngressTopic::SessionStart { charger_id } => {
                let msg: ChargerDemandMessage = parse_payload(payload)?;
                check_charger(&charger_id, &msg.charger_id)?;
                check_power("requested_power_kw", msg.requested_power_kw)?;
                Ok(StationEvent::Connect {
                    charger_id,
                    requested_power_kw: msg.requested_power_kw,
                    at: msg.timestamp,
                })
            }
            IngressTopic::Telemetry { charger_id } => {
                let msg: ChargerDemandMessage = parse_payload(payload)?;
                check_charger(&charger_id, &msg.charger_id)?;
                check_power("requested_power_kw", msg.requested_power_kw)?;
                if let Some(energy) = msg.energy_delivered_kwh {
                    check_power("energy_delivered_kwh", energy)?;
                }
                Ok(StationEvent::DemandChange {
                    charger_id,
                    requested_power_kw: msg.requested_power_kw,
                    energy_delivered_kwh: msg.energy_delivered_kwh,
                    at: msg.timestamp,
                })
            }
            IngressTopic::SessionStop { charger_id } => {
                let msg: SessionStopMessage = parse_payload(payload)?;
                check_charger(&charger_id, &msg.charger_id)?;
                if let Some(energy) = msg.total_energy_kwh {
                    check_power("total_energy_kwh", energy)?;
                }
                let reason = match msg.reason.as_deref() {
                    Some(r) if is_fault_status(r) => FinishReason::ChargerFault,
                    _ => FinishReason::Disconnected,
                };
                Ok(StationEvent::Disconnect {
                    charger_id,
                    reason,
                    energy_delivered_kwh: msg.total_energy_kwh,
                    at: msg.timestamp,
                })
            }
            IngressTopic::Heartbeat { charger_id } => {
                let msg: HeartbeatMessage = parse_payload(payload)?;
                check_charger(&charger_id, &msg.charger_id)?;
                Ok(StationEvent::Heartbeat {
                    charger_id,
                    at: msg.timestamp,
                })
            }
            IngressTopic::Status { charger_id } => {
                let msg: ChargerStatusMessage = parse_payload(payload)?;
                check_charger(&charger_id, &msg.charger_id)?;
                // Any status report proves the charger is alive
                if is_fault_status(&msg.status) {
                    Ok(StationEvent::ChargerFault {
                        charger_id,
                        at: msg.timestamp,
                    })
                } else {
                    Ok(StationEvent::Heartbeat {
                        charger_id,
                        at: msg.timestamp,
                    })
                }
            }
            IngressTopic::BessStatus => {
                let msg: BessStatusMessage = parse_payload(payload)?;
                if !msg.soc_percent.is_finite() || !(0.0..=100.0).contains(&msg.soc_percent) {
                    return Err(PowershareError::invalid_telemetry(
                        "soc_percent",
                        format!("{} outside 0..=100", msg.soc_percent),
                    ));
                }
                check_power("max_discharge_kw", msg.max_discharge_kw)?;
                check_power("max_charge_kw", msg.max_charge_kw)?;
                Ok(StationEvent::SocUpdate {
                    soc_percent: msg.soc_percent,
                    max_discharge_kw: msg.max_discharge_kw,
                    max_charge_kw: msg.max_charge_kw,
                    faulted: msg.status.as_deref().is_some_and(is_fault_status),
                    at: msg.timestamp,
                })
            }
        }
    }
}

/// Power limit for one charger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetpointMessage {
    pub charger_id: String,
    pub allocated_power_kw: f64,
    pub effective_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BessCommandMessage {
    /// `discharge`, `charge` or `idle`
    pub command: String,
    pub power_kw: f64,
    pub effective_at: DateTime<Utc>,
}

impl BessCommandMessage {
    pub fn new(command: &BessCommand, effective_at: DateTime<Utc>) -> Self {
        let name = match command {
            BessCommand::Idle => "idle",
            BessCommand::Discharge { .. } => "discharge",
            BessCommand::Charge { .. } => "charge",
        };
        Self {
            command: name.to_string(),
            power_kw: command.power_kw(),
            effective_at,
        }
    }
}

/// Outbound message ready for a transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EgressMessage {
    pub topic: String,
    pub payload: serde_json::Value,
}

impl EgressMessage {
    pub fn setpoint(scheme: &TopicScheme, msg: &SetpointMessage) -> Result<Self> {
        Ok(Self {
            topic: scheme.power_limit(&msg.charger_id),
            payload: serde_json::to_value(msg)?,
        })
    }

    pub fn bess_command(scheme: &TopicScheme, msg: &BessCommandMessage) -> Result<Self> {
        Ok(Self {
            topic: scheme.bess_command(),
            payload: serde_json::to_value(msg)?,
        })
    }
}

/// One line of the JSON-lines ingress stream
#[derive(Debug, Deserialize)]
struct IngressLine {
    topic: String,
    payload: serde_json::Value,
}

fn ingress_logger(station_id: &str) -> StructuredLogger {
    get_logger_with_context(LogContext::new("telemetry").with_station_id(station_id))
}

/// Feed `{"topic": .., "payload": ..}` lines into the station queue.
///
/// Invalid lines are logged and skipped. Returns the number of events
/// accepted once the reader is exhausted or the station stops accepting.
pub async fn run_line_ingress<R>(reader: R, decoder: TelemetryDecoder, sender: EventSender) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let logger = ingress_logger(&decoder.scheme().station_id);
    let mut lines = LinesStream::new(reader.lines());
    let mut accepted = 0u64;

    while let Some(line) = lines.next().await {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event = serde_json::from_str::<IngressLine>(&line)
            .map_err(|e| PowershareError::invalid_telemetry("line", e.to_string()))
            .and_then(|l| decoder.decode_value(&l.topic, l.payload));
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                logger.warn(&format!("Discarding ingress message: {e}"));
                continue;
            }
        };

        match sender.dispatch(event).await {
            Ok(()) => accepted += 1,
            Err(PowershareError::Shutdown) => {
                logger.info("Station stopped accepting events; ending ingress");
                break;
            }
            // Already logged by the sender
            Err(_) => {}
        }
    }
    Ok(accepted)
}

/// Write egress messages as JSON lines until the channel closes
pub async fn run_line_egress<W>(mut rx: broadcast::Receiver<EgressMessage>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let logger = get_logger_with_context(LogContext::new("telemetry"));
    loop {
        match rx.recv().await {
            Ok(msg) => {
                let mut line = serde_json::to_string(&msg)?;
                line.push('\n');
                writer.write_all(line.as_bytes()).await?;
                writer.flush().await?;
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                logger.warn(&format!("Egress writer lagged, {n} messages skipped"));
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}
