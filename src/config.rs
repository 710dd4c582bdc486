//! Configuration management for Powershare
//!
//! This module handles loading, validation, and management of the station
//! configuration from YAML files. The config path can be overridden with the
//! `POWERSHARE_CONFIG` environment variable.

use crate::error::{PowershareError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

mod defaults;

const CONFIG_ENV_VAR: &str = "POWERSHARE_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Site identity, grid contract and charger inventory
    pub station: StationConfig,

    /// Battery energy storage system; absent when the site has none
    pub bess: Option<BessConfig>,

    /// Allocation engine tuning
    pub allocation: AllocationConfig,

    /// Event queue and heartbeat supervision
    pub dispatcher: DispatcherConfig,

    /// Lifecycle audit trail
    pub persistence: PersistenceConfig,

    /// Topic naming for ingress and egress
    pub transport: TransportConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Site identity and grid contract
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    /// Station identifier used in topics and records
    pub station_id: String,

    /// Contractual grid ceiling in kW
    pub contract_limit_kw: f64,

    /// Station auxiliaries (lighting, cooling) drawn from the same contract
    pub static_load_kw: f64,

    /// Ceiling applied to chargers that report in without being configured.
    /// When unset, telemetry from unknown chargers is ignored.
    pub default_charger_max_kw: Option<f64>,

    /// Known chargers
    pub chargers: Vec<ChargerConfig>,
}

/// One charger of the station
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargerConfig {
    /// Charger identifier (e.g. CP001)
    pub id: String,

    /// Hardware power ceiling in kW
    pub max_power_kw: f64,
}

/// Battery energy storage parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BessConfig {
    /// Usable capacity in kWh; enables the energy-based boost limit
    pub capacity_kwh: Option<f64>,

    /// Inverter discharge ceiling in kW
    pub max_discharge_kw: f64,

    /// Inverter charge ceiling in kW
    pub max_charge_kw: f64,

    /// No discharge at or below this state of charge
    pub reserve_soc_percent: f64,

    /// No charging at or above this state of charge
    pub max_soc_percent: f64,

    /// Width of the band above the reserve over which boost ramps to full
    pub taper_band_percent: f64,

    /// State of charge assumed until the first telemetry sample
    pub initial_soc_percent: f64,

    /// Telemetry older than this makes the boost figure untrustworthy
    pub stale_after_seconds: u64,

    /// Smallest charge setpoint worth sending
    pub min_charge_kw: f64,

    /// Only recharge while session load is below this fraction of the grid budget
    pub charge_below_utilization: f64,
}

/// Allocation engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationConfig {
    /// Floor per active session under contention
    pub min_allocation_kw: f64,

    /// Burst coalescing window in milliseconds
    pub debounce_ms: u64,

    /// Most events folded into a single cycle
    pub max_batch: usize,
}

/// Event queue and heartbeat supervision
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Bounded queue capacity
    pub queue_capacity: usize,

    /// How long a producer may wait for queue space before dropping
    pub enqueue_timeout_ms: u64,

    /// Sessions silent for longer than this are disconnected
    pub heartbeat_timeout_seconds: u64,

    /// Period of the heartbeat sweep
    pub sweep_interval_seconds: u64,
}

/// Lifecycle audit trail
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Whether lifecycle records are written at all
    pub enabled: bool,

    /// JSON-lines file receiving lifecycle records
    pub file: String,

    /// Write attempts per record
    pub retry_attempts: u32,

    /// Delay between attempts in milliseconds
    pub retry_delay_ms: u64,
}

/// Topic naming
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// First topic segment
    pub topic_prefix: String,

    /// Capacity of the egress broadcast channel
    pub egress_capacity: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Optional per-sink level overrides
    pub console_level: Option<String>,
    pub file_level: Option<String>,

    /// Path to log file (directory is used for rotation)
    pub file: String,

    /// Number of rotated files to keep
    pub backup_count: u32,

    /// Whether to log to console
    pub console_output: bool,

    /// Whether to use JSON format
    pub json_format: bool,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration with validation
    pub fn load() -> Result<Self> {
        if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
            let config = Self::from_file(&path)?;
            config.validate()?;
            return Ok(config);
        }

        let default_paths = [
            "powershare.yaml",
            "/data/powershare.yaml",
            "/etc/powershare/config.yaml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                let config = Self::from_file(path)?;
                config.validate()?;
                return Ok(config);
            }
        }

        // Fall back to default configuration
        Ok(Self::default())
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let station = &self.station;
        if station.station_id.trim().is_empty() {
            return Err(PowershareError::validation(
                "station.station_id",
                "Station id cannot be empty",
            ));
        }

        if !station.contract_limit_kw.is_finite() || station.contract_limit_kw <= 0.0 {
            return Err(PowershareError::validation(
                "station.contract_limit_kw",
                "Must be positive",
            ));
        }

        if !station.static_load_kw.is_finite()
            || station.static_load_kw < 0.0
            || station.static_load_kw >= station.contract_limit_kw
        {
            return Err(PowershareError::validation(
                "station.static_load_kw",
                "Must be non-negative and below the contract limit",
            ));
        }

        if let Some(max) = station.default_charger_max_kw
            && (!max.is_finite() || max <= 0.0)
        {
            return Err(PowershareError::validation(
                "station.default_charger_max_kw",
                "Must be positive",
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for charger in &station.chargers {
            if charger.id.trim().is_empty() {
                return Err(PowershareError::validation(
                    "station.chargers.id",
                    "Charger id cannot be empty",
                ));
            }
            if !seen.insert(charger.id.as_str()) {
                return Err(PowershareError::validation(
                    "station.chargers.id",
                    format!("Duplicate charger id {}", charger.id),
                ));
            }
            if !charger.max_power_kw.is_finite() || charger.max_power_kw <= 0.0 {
                return Err(PowershareError::validation(
                    "station.chargers.max_power_kw",
                    format!("Charger {} must have a positive ceiling", charger.id),
                ));
            }
        }

        if let Some(bess) = &self.bess {
            bess.validate()?;
        }

        if !self.allocation.min_allocation_kw.is_finite() || self.allocation.min_allocation_kw < 0.0
        {
            return Err(PowershareError::validation(
                "allocation.min_allocation_kw",
                "Must be non-negative",
            ));
        }

        if self.allocation.debounce_ms > 200 {
            return Err(PowershareError::validation(
                "allocation.debounce_ms",
                "Must not exceed 200 ms",
            ));
        }

        if self.allocation.max_batch == 0 {
            return Err(PowershareError::validation(
                "allocation.max_batch",
                "Must be greater than 0",
            ));
        }

        if self.dispatcher.queue_capacity == 0 {
            return Err(PowershareError::validation(
                "dispatcher.queue_capacity",
                "Must be greater than 0",
            ));
        }

        if self.dispatcher.heartbeat_timeout_seconds == 0
            || self.dispatcher.sweep_interval_seconds == 0
        {
            return Err(PowershareError::validation(
                "dispatcher",
                "Heartbeat timeout and sweep interval must be greater than 0",
            ));
        }

        if self.persistence.enabled && self.persistence.file.trim().is_empty() {
            return Err(PowershareError::validation(
                "persistence.file",
                "File path required when persistence is enabled",
            ));
        }

        if self.transport.topic_prefix.is_empty() || self.transport.topic_prefix.contains('/') {
            return Err(PowershareError::validation(
                "transport.topic_prefix",
                "Must be a single non-empty topic segment",
            ));
        }

        Ok(())
    }
}

impl BessConfig {
    fn validate(&self) -> Result<()> {
        let percent = |v: f64| v.is_finite() && (0.0..=100.0).contains(&v);

        if !self.max_discharge_kw.is_finite()
            || self.max_discharge_kw < 0.0
            || !self.max_charge_kw.is_finite()
            || self.max_charge_kw < 0.0
        {
            return Err(PowershareError::validation(
                "bess.max_discharge_kw",
                "Power ceilings must be non-negative",
            ));
        }

        if !percent(self.reserve_soc_percent)
            || !percent(self.max_soc_percent)
            || !percent(self.initial_soc_percent)
            || self.reserve_soc_percent >= self.max_soc_percent
        {
            return Err(PowershareError::validation(
                "bess.reserve_soc_percent",
                "State of charge bounds must lie in 0..=100 with reserve below max",
            ));
        }

        if !self.taper_band_percent.is_finite() || self.taper_band_percent < 0.0 {
            return Err(PowershareError::validation(
                "bess.taper_band_percent",
                "Must be non-negative",
            ));
        }

        if let Some(capacity) = self.capacity_kwh
            && (!capacity.is_finite() || capacity <= 0.0)
        {
            return Err(PowershareError::validation(
                "bess.capacity_kwh",
                "Must be positive",
            ));
        }

        if !(0.0..=1.0).contains(&self.charge_below_utilization) {
            return Err(PowershareError::validation(
                "bess.charge_below_utilization",
                "Must lie in 0..=1",
            ));
        }

        Ok(())
    }
}
