//! Charger inventory records

use crate::config::ChargerConfig;
use crate::session::SessionStatus;
use serde::{Deserialize, Serialize};

/// Charger-level status, mirroring the hosted session when there is one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargerStatus {
    Idle,
    Connected,
    Charging,
    Suspended,
    /// Reported fault; cleared by the next connect
    Faulted,
}

impl From<SessionStatus> for ChargerStatus {
    fn from(status: SessionStatus) -> Self {
        match status {
            SessionStatus::Connected => Self::Connected,
            SessionStatus::Charging => Self::Charging,
            SessionStatus::Suspended => Self::Suspended,
            SessionStatus::Idle | SessionStatus::Finished => Self::Idle,
        }
    }
}

/// One charge point of the station
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Charger {
    pub id: String,
    pub station_id: String,
    /// Hardware ceiling; requests above it are clamped
    pub max_power_kw: f64,
    pub status: ChargerStatus,
}

impl Charger {
    pub fn new(id: &str, station_id: &str, max_power_kw: f64) -> Self {
        Self {
            id: id.to_string(),
            station_id: station_id.to_string(),
            max_power_kw,
            status: ChargerStatus::Idle,
        }
    }

    pub fn from_config(config: &ChargerConfig, station_id: &str) -> Self {
        Self::new(&config.id, station_id, config.max_power_kw)
    }

    /// Clamp a request to the hardware ceiling, reporting whether it was cut
    pub fn clamp_request(&self, requested_kw: f64) -> (f64, bool) {
        if requested_kw > self.max_power_kw {
            (self.max_power_kw, true)
        } else {
            (requested_kw, false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_to_ceiling() {
        let c = Charger::new("CP001", "s1", 50.0);
        assert_eq!(c.clamp_request(80.0), (50.0, true));
        assert_eq!(c.clamp_request(22.0), (22.0, false));
    }

    #[test]
    fn status_follows_session() {
        assert_eq!(
            ChargerStatus::from(SessionStatus::Suspended),
            ChargerStatus::Suspended
        );
        assert_eq!(ChargerStatus::from(SessionStatus::Finished), ChargerStatus::Idle);
    }
}
