//! Battery energy storage tracking
//!
//! Holds the last trusted battery sample and derives how much power the
//! battery may contribute (boost) or absorb (charge opportunity). Boost tapers
//! linearly to zero over `taper_band_percent` above the reserve floor so the
//! budget does not jump when the state of charge hovers around the reserve.

use crate::config::BessConfig;
use crate::error::{PowershareError, Result};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// What the battery inverter is currently asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BessMode {
    Idle,
    Discharging,
    Charging,
}

/// Setpoint sent to the battery inverter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum BessCommand {
    Idle,
    Discharge { power_kw: f64 },
    Charge { power_kw: f64 },
}

impl BessCommand {
    pub const fn power_kw(&self) -> f64 {
        match self {
            Self::Idle => 0.0,
            Self::Discharge { power_kw } | Self::Charge { power_kw } => *power_kw,
        }
    }

    pub const fn mode(&self) -> BessMode {
        match self {
            Self::Idle => BessMode::Idle,
            Self::Discharge { .. } => BessMode::Discharging,
            Self::Charge { .. } => BessMode::Charging,
        }
    }
}

/// Last accepted battery sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BessState {
    pub soc_percent: f64,
    pub max_discharge_kw: f64,
    pub max_charge_kw: f64,
    pub reserve_soc_percent: f64,
    pub mode: BessMode,
    /// `None` until the first sample arrives
    pub last_update: Option<DateTime<Utc>>,
    pub faulted: bool,
}

/// Read-only view served to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BessStatus {
    pub soc_percent: f64,
    pub reserve_soc_percent: f64,
    pub max_discharge_kw: f64,
    pub max_charge_kw: f64,
    pub mode: BessMode,
    /// Boost the engine may use right now (0 when unavailable)
    pub available_boost_kw: f64,
    /// Telemetry is fresh and the unit is healthy
    pub available: bool,
    pub faulted: bool,
    pub last_update: Option<DateTime<Utc>>,
}

/// Battery state tracker
#[derive(Debug)]
pub struct BessTracker {
    config: BessConfig,
    state: BessState,
    logger: StructuredLogger,
}

impl BessTracker {
    /// Tracker seeded with the configured ceilings and initial state of charge.
    ///
    /// The seed is not telemetry: boost stays unavailable until the first
    /// sample is accepted.
    pub fn new(config: &BessConfig, station_id: &str) -> Self {
        Self {
            state: BessState {
                soc_percent: config.initial_soc_percent,
                max_discharge_kw: config.max_discharge_kw,
                max_charge_kw: config.max_charge_kw,
                reserve_soc_percent: config.reserve_soc_percent,
                mode: BessMode::Idle,
                last_update: None,
                faulted: false,
            },
            config: config.clone(),
            logger: get_logger_with_context(LogContext::new("bess").with_station_id(station_id)),
        }
    }

    pub const fn state(&self) -> &BessState {
        &self.state
    }

    /// Accept a telemetry sample.
    ///
    /// Out-of-range or out-of-order samples are rejected and the previous
    /// state is kept.
    pub fn update_state(
        &mut self,
        soc_percent: f64,
        max_discharge_kw: f64,
        max_charge_kw: f64,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if !soc_percent.is_finite() || !(0.0..=100.0).contains(&soc_percent) {
            return Err(PowershareError::invalid_telemetry(
                "soc_percent",
                format!("{soc_percent} outside 0..=100"),
            ));
        }
        for (field, value) in [
            ("max_discharge_kw", max_discharge_kw),
            ("max_charge_kw", max_charge_kw),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(PowershareError::invalid_telemetry(
                    field,
                    format!("{value} is not a non-negative power"),
                ));
            }
        }
        if let Some(previous) = self.state.last_update
            && at < previous
        {
            return Err(PowershareError::invalid_telemetry(
                "timestamp",
                "sample older than the current state",
            ));
        }

        self.state.soc_percent = soc_percent;
        // Reported inverter limits never exceed the configured ones
        self.state.max_discharge_kw = max_discharge_kw.min(self.config.max_discharge_kw);
        self.state.max_charge_kw = max_charge_kw.min(self.config.max_charge_kw);
        self.state.last_update = Some(at);
        self.logger.trace(&format!(
            "BESS sample: soc {soc_percent:.1}%, discharge {max_discharge_kw:.1} kW, charge {max_charge_kw:.1} kW"
        ));
        Ok(())
    }

    pub fn set_fault(&mut self, faulted: bool) {
        if self.state.faulted != faulted {
            if faulted {
                self.logger.warn("BESS reported a fault; boost withdrawn");
            } else {
                self.logger.info("BESS fault cleared");
            }
        }
        self.state.faulted = faulted;
    }

    pub fn set_mode(&mut self, mode: BessMode) {
        self.state.mode = mode;
    }

    fn check_available(&self, now: DateTime<Utc>) -> Result<()> {
        if self.state.faulted {
            return Err(PowershareError::bess_unavailable("unit faulted"));
        }
        let Some(last_update) = self.state.last_update else {
            return Err(PowershareError::bess_unavailable("no telemetry received yet"));
        };
        let stale_after = Duration::seconds(i64::try_from(self.config.stale_after_seconds).unwrap_or(i64::MAX));
        if now - last_update > stale_after {
            return Err(PowershareError::bess_unavailable(format!(
                "no telemetry since {}",
                last_update.to_rfc3339()
            )));
        }
        Ok(())
    }

    /// Power the battery can add to the grid budget
    pub fn available_boost(&self, now: DateTime<Utc>) -> Result<f64> {
        self.check_available(now)?;

        let headroom = self.state.soc_percent - self.state.reserve_soc_percent;
        if headroom <= 0.0 {
            return Ok(0.0);
        }
        let ramp = if self.config.taper_band_percent > 0.0 {
            (headroom / self.config.taper_band_percent).clamp(0.0, 1.0)
        } else {
            1.0
        };
        let mut boost = self.state.max_discharge_kw * ramp;
        // Usable energy above the reserve, spread over one hour
        if let Some(capacity) = self.config.capacity_kwh {
            boost = boost.min(capacity * headroom / 100.0);
        }
        Ok(boost.clamp(0.0, self.state.max_discharge_kw))
    }

    /// Recommended charge power given the session load and grid budget.
    ///
    /// Only recharges while sessions use less than `charge_below_utilization`
    /// of the grid budget, and never below `min_charge_kw`.
    pub fn charge_opportunity(&self, session_load_kw: f64, grid_budget_kw: f64, now: DateTime<Utc>) -> f64 {
        if self.check_available(now).is_err()
            || self.state.soc_percent >= self.config.max_soc_percent
            || session_load_kw >= grid_budget_kw * self.config.charge_below_utilization
        {
            return 0.0;
        }

        let mut power = (grid_budget_kw - session_load_kw).min(self.state.max_charge_kw);
        if let Some(capacity) = self.config.capacity_kwh {
            power = power.min(capacity * (self.config.max_soc_percent - self.state.soc_percent) / 100.0);
        }
        if power < self.config.min_charge_kw {
            0.0
        } else {
            power
        }
    }

    pub fn status(&self, now: DateTime<Utc>) -> BessStatus {
        let boost = self.available_boost(now);
        BessStatus {
            soc_percent: self.state.soc_percent,
            reserve_soc_percent: self.state.reserve_soc_percent,
            max_discharge_kw: self.state.max_discharge_kw,
            max_charge_kw: self.state.max_charge_kw,
            mode: self.state.mode,
            available: boost.is_ok(),
            available_boost_kw: boost.unwrap_or(0.0),
            faulted: self.state.faulted,
            last_update: self.state.last_update,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BessConfig {
        BessConfig {
            max_discharge_kw: 40.0,
            max_charge_kw: 30.0,
            reserve_soc_percent: 10.0,
            taper_band_percent: 10.0,
            ..BessConfig::default()
        }
    }

    #[test]
    fn full_boost_well_above_reserve() {
        let t0 = Utc::now();
        let mut bess = BessTracker::new(&config(), "s1");
        bess.update_state(80.0, 40.0, 30.0, t0).unwrap();
        assert_eq!(bess.available_boost(t0).unwrap(), 40.0);
    }

    #[test]
    fn boost_tapers_towards_reserve() {
        let t0 = Utc::now();
        let mut bess = BessTracker::new(&config(), "s1");
        let mut last = f64::INFINITY;
        for soc in [20.0, 17.5, 15.0, 12.5, 10.0, 5.0] {
            bess.update_state(soc, 40.0, 30.0, t0).unwrap();
            let boost = bess.available_boost(t0).unwrap();
            assert!(boost <= last);
            last = boost;
        }
        bess.update_state(15.0, 40.0, 30.0, t0).unwrap();
        assert!((bess.available_boost(t0).unwrap() - 20.0).abs() < 1e-9);
        bess.update_state(10.0, 40.0, 30.0, t0).unwrap();
        assert_eq!(bess.available_boost(t0).unwrap(), 0.0);
    }

    #[test]
    fn energy_limits_boost_when_capacity_known() {
        let t0 = Utc::now();
        let cfg = BessConfig {
            capacity_kwh: Some(100.0),
            ..config()
        };
        let mut bess = BessTracker::new(&cfg, "s1");
        // 25 % above reserve of 100 kWh is 25 kWh, i.e. 25 kW for an hour
        bess.update_state(35.0, 40.0, 30.0, t0).unwrap();
        assert!((bess.available_boost(t0).unwrap() - 25.0).abs() < 1e-9);
    }

    #[test]
    fn invalid_sample_keeps_previous_state() {
        let t0 = Utc::now();
        let mut bess = BessTracker::new(&config(), "s1");
        bess.update_state(60.0, 40.0, 30.0, t0).unwrap();
        for (soc, dis) in [(120.0, 40.0), (-3.0, 40.0), (f64::NAN, 40.0), (50.0, -1.0)] {
            let err = bess.update_state(soc, dis, 30.0, t0).unwrap_err();
            assert!(matches!(err, PowershareError::InvalidTelemetry { .. }));
        }
        assert_eq!(bess.state().soc_percent, 60.0);
        assert_eq!(bess.state().max_discharge_kw, 40.0);
    }

    #[test]
    fn stale_or_faulted_tracker_is_unavailable() {
        let t0 = Utc::now();
        let mut bess = BessTracker::new(&config(), "s1");
        bess.update_state(80.0, 40.0, 30.0, t0).unwrap();
        let later = t0 + Duration::seconds(61);
        assert!(matches!(
            bess.available_boost(later),
            Err(PowershareError::BessUnavailable { .. })
        ));

        bess.set_fault(true);
        assert!(bess.available_boost(t0).is_err());
        assert!(!bess.status(t0).available);
        assert_eq!(bess.status(t0).available_boost_kw, 0.0);
    }

    #[test]
    fn no_boost_before_first_sample() {
        let t0 = Utc::now();
        let bess = BessTracker::new(&config(), "s1");
        assert!(matches!(
            bess.available_boost(t0),
            Err(PowershareError::BessUnavailable { .. })
        ));
        assert_eq!(bess.charge_opportunity(0.0, 100.0, t0), 0.0);
        let status = bess.status(t0);
        assert!(!status.available);
        assert!(status.last_update.is_none());
    }

    #[test]
    fn sample_stamped_before_startup_is_accepted() {
        let t0 = Utc::now();
        let mut bess = BessTracker::new(&config(), "s1");
        // Retained status published before the tracker existed
        bess.update_state(10.0, 40.0, 30.0, t0 - Duration::seconds(2))
            .unwrap();
        assert_eq!(bess.state().soc_percent, 10.0);
        assert_eq!(bess.available_boost(t0).unwrap(), 0.0);
    }

    #[test]
    fn out_of_order_sample_is_rejected() {
        let t0 = Utc::now();
        let mut bess = BessTracker::new(&config(), "s1");
        bess.update_state(50.0, 40.0, 30.0, t0).unwrap();
        let err = bess
            .update_state(90.0, 40.0, 30.0, t0 - Duration::seconds(1))
            .unwrap_err();
        assert!(matches!(err, PowershareError::InvalidTelemetry { .. }));
        assert_eq!(bess.state().soc_percent, 50.0);
    }

    #[test]
    fn charge_opportunity_needs_spare_capacity() {
        let t0 = Utc::now();
        let mut bess = BessTracker::new(&config(), "s1");
        bess.update_state(50.0, 40.0, 30.0, t0).unwrap();
        // 20 of 100 kW used: charge at the inverter ceiling
        assert_eq!(bess.charge_opportunity(20.0, 100.0, t0), 30.0);
        // Above 70 % utilization: leave the grid to the sessions
        assert_eq!(bess.charge_opportunity(75.0, 100.0, t0), 0.0);

        bess.update_state(100.0, 40.0, 30.0, t0).unwrap();
        assert_eq!(bess.charge_opportunity(0.0, 100.0, t0), 0.0);
    }

    #[test]
    fn tiny_charge_setpoints_are_suppressed() {
        let t0 = Utc::now();
        let cfg = BessConfig {
            charge_below_utilization: 1.0,
            ..config()
        };
        let mut bess = BessTracker::new(&cfg, "s1");
        bess.update_state(50.0, 40.0, 30.0, t0).unwrap();
        assert_eq!(bess.charge_opportunity(97.0, 100.0, t0), 0.0);
    }
}
