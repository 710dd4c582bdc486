//! # Powershare - Power allocation for EV fast-charging stations
//!
//! Splits a contractually limited grid connection, optionally augmented by a
//! battery energy storage system (BESS), over the charging sessions of a
//! station. Allocations are recomputed on every burst of telemetry and never
//! exceed the contract limit plus the boost the battery can provide.
//!
//! ## Features
//!
//! - **Single writer**: one station task owns all mutable state
//! - **Fair sharing**: proportional split with a per-session floor, oldest session first
//! - **BESS boost**: battery covers peaks, tapering off towards its reserve
//! - **Backpressure**: bounded event queue with debounced allocation cycles
//! - **Supervision**: heartbeat timeouts and graceful de-energizing shutdown
//! - **Configuration**: YAML-based configuration with validation
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `logging`: Structured logging and tracing
//! - `session`: Charging session model and state machine
//! - `charger`: Charger inventory
//! - `registry`: Charger state registry
//! - `bess`: Battery state tracking and boost derivation
//! - `capacity`: Contract limit and committed draw
//! - `allocation`: Allocation engine
//! - `dispatcher`: Bounded event queue with debouncing
//! - `station`: Station task, query handle and heartbeat sweep
//! - `telemetry`: Topic scheme and ingress/egress messages
//! - `persistence`: Lifecycle record stores

pub mod allocation;
pub mod bess;
pub mod capacity;
pub mod charger;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod persistence;
pub mod registry;
pub mod session;
pub mod station;
pub mod telemetry;


// Re-export commonly used types
pub use config::Config;
pub use error::{PowershareError, Result};
pub use station::{Station, StationHandle};
