//! Charger state registry
//!
//! Authoritative in-memory record of every charger and the session it hosts.
//! Only the station task mutates it; everyone else works from a
//! [`RegistrySnapshot`].

use crate::allocation::AllocationPlan;
use crate::charger::{Charger, ChargerStatus};
use crate::config::StationConfig;
use crate::error::{PowershareError, Result};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use crate::session::{ChargingSession, FinishReason, LifecycleEvent, LifecycleKind, SessionStatus};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Immutable copy of the registry handed to the allocation engine and readers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    /// Active sessions ordered by charger id
    pub sessions: Vec<ChargingSession>,
    /// Hardware ceiling per charger
    pub charger_max_kw: BTreeMap<String, f64>,
    pub taken_at: DateTime<Utc>,
}

impl RegistrySnapshot {
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn session(&self, charger_id: &str) -> Option<&ChargingSession> {
        self.sessions.iter().find(|s| s.charger_id == charger_id)
    }

    /// Charger ids whose session has been silent longer than `timeout`
    pub fn stale_sessions(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|s| s.is_stale(now, timeout))
            .map(|s| s.charger_id.clone())
            .collect()
    }
}

/// Charger and session registry
#[derive(Debug)]
pub struct ChargerRegistry {
    station_id: String,
    chargers: BTreeMap<String, Charger>,
    /// Keyed by charger id; at most one session per charger
    sessions: BTreeMap<String, ChargingSession>,
    default_charger_max_kw: Option<f64>,
    dirty: bool,
    logger: StructuredLogger,
}

impl ChargerRegistry {
    pub fn new(station_id: &str, default_charger_max_kw: Option<f64>) -> Self {
        Self {
            station_id: station_id.to_string(),
            chargers: BTreeMap::new(),
            sessions: BTreeMap::new(),
            default_charger_max_kw,
            dirty: false,
            logger: get_logger_with_context(
                LogContext::new("registry").with_station_id(station_id),
            ),
        }
    }

    /// Registry seeded with the configured charger inventory
    pub fn from_config(config: &StationConfig) -> Self {
        let mut registry = Self::new(&config.station_id, config.default_charger_max_kw);
        for c in &config.chargers {
            registry.register_charger(Charger::from_config(c, &config.station_id));
        }
        registry
    }

    pub fn register_charger(&mut self, charger: Charger) {
        self.chargers.insert(charger.id.clone(), charger);
    }

    pub fn charger(&self, charger_id: &str) -> Option<&Charger> {
        self.chargers.get(charger_id)
    }

    pub fn chargers(&self) -> impl Iterator<Item = &Charger> {
        self.chargers.values()
    }

    pub fn session(&self, charger_id: &str) -> Option<&ChargingSession> {
        self.sessions.get(charger_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn known_or_implicit(&mut self, charger_id: &str) -> Result<&mut Charger> {
        if !self.chargers.contains_key(charger_id) {
            let Some(max_kw) = self.default_charger_max_kw else {
                return Err(PowershareError::unknown_charger(charger_id));
            };
            self.logger.for_charger(charger_id).info(&format!(
                "Registering unknown charger with default ceiling {max_kw:.1} kW"
            ));
            self.chargers.insert(
                charger_id.to_string(),
                Charger::new(charger_id, &self.station_id, max_kw),
            );
        }
        self.chargers
            .get_mut(charger_id)
            .ok_or_else(|| PowershareError::unknown_charger(charger_id))
    }

    /// Create or update the session on `charger_id`.
    ///
    /// Returns the `Connected` record when a new session was opened.
    pub fn upsert_session(
        &mut self,
        charger_id: &str,
        requested_kw: f64,
        at: DateTime<Utc>,
    ) -> Result<Option<LifecycleEvent>> {
        if !requested_kw.is_finite() || requested_kw < 0.0 {
            return Err(PowershareError::invalid_telemetry(
                "requested_power_kw",
                format!("{requested_kw} is not a non-negative power"),
            ));
        }

        let charger = self.known_or_implicit(charger_id)?;
        let ceiling = charger.max_power_kw;
        let (requested_kw, clamped) = charger.clamp_request(requested_kw);
        if clamped {
            self.logger
                .for_charger(charger_id)
                .debug(&format!("Clamped request to charger ceiling {ceiling:.1} kW"));
        }

        self.dirty = true;
        if let Some(session) = self.sessions.get_mut(charger_id) {
            session.requested_power_kw = requested_kw;
            session.last_heartbeat_at = at;
            return Ok(None);
        }

        if let Some(charger) = self.chargers.get_mut(charger_id) {
            charger.status = ChargerStatus::Connected;
        }
        let session = ChargingSession::connect(charger_id, requested_kw, at);
        self.logger
            .for_session(charger_id, &session.id)
            .info(&format!("Session connected requesting {requested_kw:.1} kW"));
        let event = LifecycleEvent::new(&session, LifecycleKind::Connected, at);
        self.sessions.insert(charger_id.to_string(), session);
        Ok(Some(event))
    }

    /// Override the integrated energy with a meter reading
    pub fn record_energy(&mut self, charger_id: &str, energy_kwh: f64, at: DateTime<Utc>) -> Result<()> {
        if !energy_kwh.is_finite() || energy_kwh < 0.0 {
            return Err(PowershareError::invalid_telemetry(
                "energy_delivered_kwh",
                format!("{energy_kwh} is not a non-negative energy"),
            ));
        }
        let session = self
            .sessions
            .get_mut(charger_id)
            .ok_or_else(|| PowershareError::unknown_charger(charger_id))?;
        session.record_meter_reading(energy_kwh, at);
        Ok(())
    }

    /// End the session on `charger_id` and return its `Finished` record
    pub fn remove_session(
        &mut self,
        charger_id: &str,
        reason: FinishReason,
        at: DateTime<Utc>,
    ) -> Result<LifecycleEvent> {
        let mut session = self
            .sessions
            .remove(charger_id)
            .ok_or_else(|| PowershareError::unknown_charger(charger_id))?;
        self.dirty = true;

        session.accrue_energy(at);
        if let Err(e) = session.set_status(SessionStatus::Finished) {
            self.logger
                .for_session(charger_id, &session.id)
                .warn(&format!("Finishing session: {e}"));
        }
        session.allocated_power_kw = 0.0;
        if let Some(charger) = self.chargers.get_mut(charger_id)
            && charger.status != ChargerStatus::Faulted
        {
            charger.status = ChargerStatus::Idle;
        }

        self.logger.for_session(charger_id, &session.id).info(&format!(
            "Session finished ({reason:?}), {:.3} kWh delivered",
            session.energy_delivered_kwh
        ));
        Ok(LifecycleEvent::finished(&session, reason, at))
    }

    /// Refresh the liveness timestamp of the session on `charger_id`
    pub fn record_heartbeat(&mut self, charger_id: &str, at: DateTime<Utc>) -> Result<()> {
        if !self.chargers.contains_key(charger_id) {
            return Err(PowershareError::unknown_charger(charger_id));
        }
        if let Some(session) = self.sessions.get_mut(charger_id) {
            session.last_heartbeat_at = at;
        }
        self.dirty = true;
        Ok(())
    }

    /// Finish any session on the charger and keep it out of service until it reconnects
    pub fn mark_faulted(&mut self, charger_id: &str, at: DateTime<Utc>) -> Result<Option<LifecycleEvent>> {
        let charger = self
            .chargers
            .get_mut(charger_id)
            .ok_or_else(|| PowershareError::unknown_charger(charger_id))?;
        charger.status = ChargerStatus::Faulted;
        self.dirty = true;
        self.logger.for_charger(charger_id).warn("Charger reported a fault");

        if self.sessions.contains_key(charger_id) {
            return self
                .remove_session(charger_id, FinishReason::ChargerFault, at)
                .map(Some);
        }
        Ok(None)
    }

    /// Whether the session on `charger_id` is still silent past `timeout`
    pub fn is_stale(&self, charger_id: &str, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.sessions
            .get(charger_id)
            .is_some_and(|s| s.is_stale(now, timeout))
    }

    pub fn stale_sessions(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<String> {
        self.sessions
            .values()
            .filter(|s| s.is_stale(now, timeout))
            .map(|s| s.charger_id.clone())
            .collect()
    }

    pub fn snapshot(&self, at: DateTime<Utc>) -> RegistrySnapshot {
        RegistrySnapshot {
            sessions: self.sessions.values().cloned().collect(),
            charger_max_kw: self
                .chargers
                .values()
                .map(|c| (c.id.clone(), c.max_power_kw))
                .collect(),
            taken_at: at,
        }
    }

    /// Write a plan back into the sessions.
    ///
    /// Energy is integrated with the outgoing allocation before the new one
    /// takes effect. Returns the lifecycle records of the transitions made.
    pub fn apply_plan(&mut self, plan: &AllocationPlan, at: DateTime<Utc>) -> Vec<LifecycleEvent> {
        let mut events = Vec::new();
        for entry in &plan.entries {
            let Some(session) = self.sessions.get_mut(&entry.charger_id) else {
                continue;
            };
            if session.id != entry.session_id {
                // Session replaced since the snapshot was taken
                continue;
            }

            session.accrue_energy(at);
            session.allocated_power_kw = entry.allocated_kw;

            let previous = session.status;
            let next = if entry.suspended {
                SessionStatus::Suspended
            } else {
                SessionStatus::Charging
            };
            if previous == next {
                continue;
            }
            if let Err(e) = session.set_status(next) {
                self.logger
                    .for_session(&session.charger_id, &session.id)
                    .warn(&e.to_string());
                continue;
            }

            match (previous, next) {
                (_, SessionStatus::Suspended) => {
                    session.suspended_at = Some(at);
                    self.logger
                        .for_session(&session.charger_id, &session.id)
                        .info("Session suspended");
                    events.push(LifecycleEvent::new(session, LifecycleKind::Suspended, at));
                }
                (SessionStatus::Suspended, SessionStatus::Charging) => {
                    session.suspended_at = None;
                    self.logger
                        .for_session(&session.charger_id, &session.id)
                        .info(&format!("Session resumed at {:.2} kW", entry.allocated_kw));
                    events.push(LifecycleEvent::new(session, LifecycleKind::Resumed, at));
                }
                _ => {}
            }

            if let Some(charger) = self.chargers.get_mut(&entry.charger_id) {
                charger.status = ChargerStatus::from(next);
            }
        }
        events
    }

    /// Finish every session, used when the station de-energizes
    pub fn finish_all(&mut self, reason: &FinishReason, at: DateTime<Utc>) -> Vec<LifecycleEvent> {
        let ids: Vec<String> = self.sessions.keys().cloned().collect();
        ids.iter()
            .filter_map(|id| self.remove_session(id, reason.clone(), at).ok())
            .collect()
    }

    /// Consume the dirty flag
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}
