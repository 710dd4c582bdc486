use super::*;

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            station_id: "station-1".to_string(),
            contract_limit_kw: 100.0,
            static_load_kw: 0.0,
            default_charger_max_kw: None,
            chargers: vec![
                ChargerConfig {
                    id: "CP001".to_string(),
                    max_power_kw: 150.0,
                },
                ChargerConfig {
                    id: "CP002".to_string(),
                    max_power_kw: 150.0,
                },
            ],
        }
    }
}

impl Default for BessConfig {
    fn default() -> Self {
        Self {
            capacity_kwh: None,
            max_discharge_kw: 50.0,
            max_charge_kw: 50.0,
            reserve_soc_percent: 10.0,
            max_soc_percent: 100.0,
            taper_band_percent: 10.0,
            initial_soc_percent: 100.0,
            stale_after_seconds: 60,
            min_charge_kw: 5.0,
            charge_below_utilization: 0.7,
        }
    }
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            min_allocation_kw: 6.0,
            debounce_ms: 100,
            max_batch: 64,
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            enqueue_timeout_ms: 50,
            heartbeat_timeout_seconds: 30,
            sweep_interval_seconds: 5,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            file: "/data/powershare_sessions.jsonl".to_string(),
            retry_attempts: 3,
            retry_delay_ms: 200,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "ems".to_string(),
            egress_capacity: 256,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            console_level: None,
            file_level: None,
            file: "/tmp/powershare.log".to_string(),
            backup_count: 5,
            console_output: true,
            json_format: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            station: StationConfig::default(),
            bess: None,
            allocation: AllocationConfig::default(),
            dispatcher: DispatcherConfig::default(),
            persistence: PersistenceConfig::default(),
            transport: TransportConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
