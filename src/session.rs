//! Charging session model for Powershare
//!
//! A session is one charger's demand and allocation record for a single
//! connected vehicle. Status changes go through [`SessionStatus::transition`],
//! which only accepts edges from the transition table below; anything else is
//! rejected and the session keeps its current status.
//!
//! ```text
//! Idle -> Connected -> Charging -> Finished
//!             |           ^  |
//!             |           |  v
//!             +------> Suspended -> Finished
//! ```

use crate::error::{PowershareError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Session status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    /// Record created, vehicle not yet announced
    Idle,
    /// Vehicle plugged in, no power granted yet
    Connected,
    /// Drawing a non-zero allocation
    Charging,
    /// Parked at zero by the engine until budget frees up
    Suspended,
    /// Terminal; handed to persistence and dropped
    Finished,
}

impl SessionStatus {
    /// Edges of the session state machine
    const TRANSITIONS: &'static [(Self, Self)] = &[
        (Self::Idle, Self::Connected),
        (Self::Connected, Self::Charging),
        (Self::Connected, Self::Suspended),
        (Self::Connected, Self::Finished),
        (Self::Charging, Self::Suspended),
        (Self::Charging, Self::Finished),
        (Self::Suspended, Self::Charging),
        (Self::Suspended, Self::Finished),
    ];

    /// Whether `self -> next` is in the transition table
    pub fn can_transition_to(self, next: Self) -> bool {
        Self::TRANSITIONS.contains(&(self, next))
    }

    /// Validate a transition and return the new status
    pub fn transition(self, next: Self) -> Result<Self> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(PowershareError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }

    /// Sessions the allocation engine hands power to
    pub const fn wants_power(self) -> bool {
        matches!(self, Self::Connected | Self::Charging | Self::Suspended)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "Idle",
            Self::Connected => "Connected",
            Self::Charging => "Charging",
            Self::Suspended => "Suspended",
            Self::Finished => "Finished",
        };
        f.write_str(s)
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Charger reported the vehicle unplugged or the session stopped
    Disconnected,
    /// No heartbeat within the configured timeout
    HeartbeatTimeout,
    /// Charger reported a fault
    ChargerFault,
    /// Station de-energized on shutdown
    Shutdown,
}

/// Charging session state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargingSession {
    /// Unique session ID
    pub id: String,

    /// Charger hosting the session
    pub charger_id: String,

    /// Session status
    pub status: SessionStatus,

    /// Demand ceiling requested by the vehicle/charger (kW)
    pub requested_power_kw: f64,

    /// Power granted by the last allocation cycle (kW)
    pub allocated_power_kw: f64,

    /// When the vehicle connected; earliest wins under contention
    pub connected_at: DateTime<Utc>,

    /// Last sign of life from the charger
    pub last_heartbeat_at: DateTime<Utc>,

    /// When the engine last parked the session at zero
    pub suspended_at: Option<DateTime<Utc>>,

    /// Energy delivered so far (kWh)
    pub energy_delivered_kwh: f64,

    /// Point up to which allocated power has been integrated into energy
    #[serde(skip)]
    pub(crate) energy_accounted_at: Option<DateTime<Utc>>,
}

impl ChargingSession {
    /// Create a freshly connected session
    pub fn connect(charger_id: &str, requested_power_kw: f64, at: DateTime<Utc>) -> Self {
        let mut session = Self {
            id: uuid::Uuid::new_v4().to_string(),
            charger_id: charger_id.to_string(),
            status: SessionStatus::Idle,
            requested_power_kw,
            allocated_power_kw: 0.0,
            connected_at: at,
            last_heartbeat_at: at,
            suspended_at: None,
            energy_delivered_kwh: 0.0,
            energy_accounted_at: None,
        };
        // Idle -> Connected is always in the table
        session.status = SessionStatus::Connected;
        session
    }

    /// Move to `next` if the transition table allows it
    pub fn set_status(&mut self, next: SessionStatus) -> Result<()> {
        if self.status == next {
            return Ok(());
        }
        self.status = self.status.transition(next)?;
        Ok(())
    }

    /// Integrate the current allocation up to `now`
    pub fn accrue_energy(&mut self, now: DateTime<Utc>) {
        if let Some(since) = self.energy_accounted_at {
            let seconds = (now - since).num_milliseconds().max(0) as f64 / 1000.0;
            self.energy_delivered_kwh += self.allocated_power_kw * seconds / 3600.0;
        }
        self.energy_accounted_at = Some(now);
    }

    /// Replace the integrated estimate with a meter reading
    pub fn record_meter_reading(&mut self, energy_kwh: f64, at: DateTime<Utc>) {
        self.energy_delivered_kwh = energy_kwh;
        self.energy_accounted_at = Some(at);
    }

    /// Seconds since connect
    pub fn duration_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.connected_at).num_seconds().max(0)
    }

    /// Whether the charger has been silent for longer than `timeout`
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        now - self.last_heartbeat_at > timeout
    }
}

/// Lifecycle record kinds handed to persistence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleKind {
    Connected,
    Suspended,
    Resumed,
    Finished,
}

/// Audit record for one session lifecycle step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub session_id: String,
    pub charger_id: String,
    pub kind: LifecycleKind,
    pub at: DateTime<Utc>,
    pub requested_power_kw: f64,
    pub allocated_power_kw: f64,
    /// Only set on `Finished`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy_delivered_kwh: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FinishReason>,
}

impl LifecycleEvent {
    pub fn new(session: &ChargingSession, kind: LifecycleKind, at: DateTime<Utc>) -> Self {
        Self {
            session_id: session.id.clone(),
            charger_id: session.charger_id.clone(),
            kind,
            at,
            requested_power_kw: session.requested_power_kw,
            allocated_power_kw: session.allocated_power_kw,
            energy_delivered_kwh: None,
            duration_seconds: None,
            reason: None,
        }
    }

    pub fn finished(session: &ChargingSession, reason: FinishReason, at: DateTime<Utc>) -> Self {
        Self {
            energy_delivered_kwh: Some(session.energy_delivered_kwh),
            duration_seconds: Some(session.duration_seconds(at)),
            reason: Some(reason),
            ..Self::new(session, LifecycleKind::Finished, at)
        }
    }
}
