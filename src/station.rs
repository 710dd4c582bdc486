//! Station controller
//!
//! The station task is the only writer of the registry, the battery tracker
//! and the capacity model. It pulls debounced batches from the dispatcher,
//! applies them, runs one allocation cycle per batch and publishes:
//!
//! - setpoints and battery commands on the egress broadcast channel,
//! - lifecycle records to the persistence writer,
//! - an `Arc` snapshot on a watch channel for readers.
//!
//! On shutdown the queue is closed, buffered events are applied, and a final
//! zero-demand cycle de-energizes every charger and idles the battery.

use crate::allocation::{Allocation, AllocationEngine, AllocationPlan, EPSILON_KW};
use crate::bess::{BessCommand, BessMode, BessStatus, BessTracker};
use crate::capacity::{CapacityModel, CapacityUsage};
use crate::config::{Config, DispatcherConfig};
use crate::dispatcher::{self, EventReceiver, EventSender, StationEvent};
use crate::error::{PowershareError, Result};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use crate::persistence::{self, JsonLinesStore, LifecycleStore, PersistenceHandle};
use crate::registry::{ChargerRegistry, RegistrySnapshot};
use crate::session::{ChargingSession, FinishReason, LifecycleEvent};
use crate::telemetry::{BessCommandMessage, EgressMessage, SetpointMessage, TopicScheme};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};

/// Station lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StationState {
    Initializing,
    Running,
    /// Queue closed, buffered events being applied
    Draining,
    Stopped,
}

/// Everything a reader may ask about, as of the last cycle
#[derive(Debug, Clone, Serialize)]
pub struct StationSnapshot {
    pub station_id: String,
    pub state: StationState,
    pub registry: RegistrySnapshot,
    pub plan: AllocationPlan,
    pub capacity: CapacityUsage,
    pub bess: Option<BessStatus>,
    pub bess_command: BessCommand,
    /// Allocation cycles run so far
    pub cycles: u64,
    pub taken_at: DateTime<Utc>,
}

/// Cloneable front door to a running station
#[derive(Debug, Clone)]
pub struct StationHandle {
    sender: EventSender,
    shutdown_tx: mpsc::UnboundedSender<()>,
    snapshot_rx: watch::Receiver<Arc<StationSnapshot>>,
    egress_tx: broadcast::Sender<EgressMessage>,
}

impl StationHandle {
    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    pub fn snapshot(&self) -> Arc<StationSnapshot> {
        self.snapshot_rx.borrow().clone()
    }

    pub fn subscribe_snapshot(&self) -> watch::Receiver<Arc<StationSnapshot>> {
        self.snapshot_rx.clone()
    }

    pub fn subscribe_egress(&self) -> broadcast::Receiver<EgressMessage> {
        self.egress_tx.subscribe()
    }

    /// Allocations of the last cycle, ordered by charger id
    pub fn current_allocations(&self) -> Vec<Allocation> {
        self.snapshot().plan.entries.clone()
    }

    pub fn current_capacity_usage(&self) -> CapacityUsage {
        self.snapshot().capacity.clone()
    }

    /// `None` when the station has no battery
    pub fn bess_status(&self) -> Option<BessStatus> {
        self.snapshot().bess.clone()
    }

    pub fn sessions(&self) -> Vec<ChargingSession> {
        self.snapshot().registry.sessions.clone()
    }

    pub fn state(&self) -> StationState {
        self.snapshot_rx.borrow().state
    }

    /// Ask the station to drain and de-energize
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// The station task
pub struct Station {
    station_id: String,
    registry: ChargerRegistry,
    bess: Option<BessTracker>,
    bess_dirty: bool,
    bess_command: BessCommand,
    capacity: CapacityModel,
    engine: AllocationEngine,
    scheme: TopicScheme,
    events: EventReceiver,
    debounce: Duration,
    max_batch: usize,
    heartbeat_timeout: chrono::Duration,
    refresh_period: Duration,
    shutdown_rx: mpsc::UnboundedReceiver<()>,
    egress_tx: broadcast::Sender<EgressMessage>,
    snapshot_tx: watch::Sender<Arc<StationSnapshot>>,
    persistence: Option<(PersistenceHandle, JoinHandle<()>)>,
    last_plan: AllocationPlan,
    cycles: u64,
    state: StationState,
    logger: StructuredLogger,
}

impl Station {
    /// Build a station from a validated configuration.
    ///
    /// `store` overrides the configured JSON-lines file. Must be called inside
    /// a Tokio runtime: the persistence writer is spawned here.
    pub fn new(config: &Config, store: Option<Arc<dyn LifecycleStore>>) -> Result<(Self, StationHandle)> {
        config.validate()?;
        let station_id = config.station.station_id.clone();
        let logger = get_logger_with_context(LogContext::new("station").with_station_id(&station_id));
        let now = Utc::now();

        let store = store.or_else(|| {
            config
                .persistence
                .enabled
                .then(|| Arc::new(JsonLinesStore::new(&config.persistence.file)) as Arc<dyn LifecycleStore>)
        });
        let persistence = store.map(|s| persistence::spawn_writer(s, &config.persistence));

        let (sender, events) = dispatcher::channel(&config.dispatcher, &station_id);
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        let (egress_tx, _) = broadcast::channel(config.transport.egress_capacity.max(1));

        let registry = ChargerRegistry::from_config(&config.station);
        let bess = config
            .bess
            .as_ref()
            .map(|b| BessTracker::new(b, &station_id));
        let capacity = CapacityModel::from_config(config);

        let initial = StationSnapshot {
            station_id: station_id.clone(),
            state: StationState::Initializing,
            registry: registry.snapshot(now),
            plan: AllocationPlan::default(),
            capacity: capacity.usage(),
            bess: bess.as_ref().map(|b| b.status(now)),
            bess_command: BessCommand::Idle,
            cycles: 0,
            taken_at: now,
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(initial));

        logger.info(&format!(
            "Station configured: contract {:.1} kW, static load {:.1} kW, {} chargers, BESS {}",
            config.station.contract_limit_kw,
            config.station.static_load_kw,
            config.station.chargers.len(),
            if bess.is_some() { "present" } else { "absent" }
        ));

        let station = Self {
            engine: AllocationEngine::new(&station_id, config.allocation.min_allocation_kw),
            scheme: TopicScheme::new(&config.transport.topic_prefix, &station_id),
            station_id,
            registry,
            bess,
            bess_dirty: false,
            bess_command: BessCommand::Idle,
            capacity,
            events,
            debounce: Duration::from_millis(config.allocation.debounce_ms),
            max_batch: config.allocation.max_batch,
            heartbeat_timeout: heartbeat_timeout(&config.dispatcher),
            refresh_period: Duration::from_secs(config.dispatcher.sweep_interval_seconds.max(1)),
            shutdown_rx,
            egress_tx: egress_tx.clone(),
            snapshot_tx,
            persistence,
            last_plan: AllocationPlan::default(),
            cycles: 0,
            state: StationState::Initializing,
            logger,
        };
        let handle = StationHandle {
            sender,
            shutdown_tx,
            snapshot_rx,
            egress_tx,
        };
        Ok((station, handle))
    }

    /// Run until shutdown is requested, every handle is dropped, or the queue closes
    pub async fn run(mut self) -> Result<()> {
        self.state = StationState::Running;
        self.publish_snapshot(Utc::now());
        self.logger.info("Station running");

        // Periodic re-evaluation so a battery going stale withdraws its boost
        let mut refresh = interval(self.refresh_period);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);
        refresh.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_rx.recv() => {
                    self.logger.info("Shutdown requested");
                    break;
                }
                batch = self.events.next_batch(self.debounce, self.max_batch) => {
                    let Some(batch) = batch else {
                        self.logger.info("Event queue closed");
                        break;
                    };
                    self.process_batch(batch);
                }
                _ = refresh.tick() => {
                    if self.bess.is_some() {
                        self.bess_dirty = true;
                    }
                    if self.take_dirty() {
                        self.run_cycle(Utc::now());
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    fn take_dirty(&mut self) -> bool {
        let registry_dirty = self.registry.take_dirty();
        let bess_dirty = std::mem::take(&mut self.bess_dirty);
        registry_dirty || bess_dirty
    }

    fn process_batch(&mut self, batch: Vec<StationEvent>) {
        self.logger.trace(&format!("Applying batch of {} events", batch.len()));
        for event in batch {
            self.apply_logged(event);
        }
        if self.take_dirty() {
            self.run_cycle(Utc::now());
        }
    }

    fn apply_logged(&mut self, event: StationEvent) {
        let kind = event.kind();
        if let Err(e) = self.apply_event(event) {
            if e.is_recoverable() {
                self.logger.warn(&format!("Ignoring {kind} event: {e}"));
            } else {
                self.logger.error(&format!("Failed to apply {kind} event: {e}"));
            }
        }
    }

    fn record(&self, event: LifecycleEvent) {
        if let Some((handle, _)) = &self.persistence {
            handle.record(event);
        }
    }

    /// Apply one event to the owned state
    fn apply_event(&mut self, event: StationEvent) -> Result<()> {
        match event {
            StationEvent::Connect {
                charger_id,
                requested_power_kw,
                at,
            } => {
                if let Some(ev) = self.registry.upsert_session(&charger_id, requested_power_kw, at)? {
                    self.record(ev);
                }
            }
            StationEvent::DemandChange {
                charger_id,
                requested_power_kw,
                energy_delivered_kwh,
                at,
            } => {
                if let Some(ev) = self.registry.upsert_session(&charger_id, requested_power_kw, at)? {
                    self.record(ev);
                }
                if let Some(energy) = energy_delivered_kwh {
                    self.registry.record_energy(&charger_id, energy, at)?;
                }
            }
            StationEvent::Disconnect {
                charger_id,
                reason,
                energy_delivered_kwh,
                at,
            } => {
                if reason == FinishReason::HeartbeatTimeout
                    && !self.registry.is_stale(&charger_id, Utc::now(), self.heartbeat_timeout)
                {
                    // A heartbeat arrived after the sweep looked
                    self.logger
                        .debug(&format!("Timeout for {charger_id} superseded by a heartbeat"));
                    return Ok(());
                }
                if reason == FinishReason::HeartbeatTimeout {
                    self.logger
                        .warn(&PowershareError::stale_session(&charger_id).to_string());
                }
                if let Some(energy) = energy_delivered_kwh
                    && let Err(e) = self.registry.record_energy(&charger_id, energy, at)
                {
                    self.logger.debug(&format!("Final meter reading ignored: {e}"));
                }
                let ev = self.registry.remove_session(&charger_id, reason, at)?;
                self.record(ev);
            }
            StationEvent::Heartbeat { charger_id, at } => {
                self.registry.record_heartbeat(&charger_id, at)?;
            }
            StationEvent::ChargerFault { charger_id, at } => {
                if let Some(ev) = self.registry.mark_faulted(&charger_id, at)? {
                    self.record(ev);
                }
            }
            StationEvent::SocUpdate {
                soc_percent,
                max_discharge_kw,
                max_charge_kw,
                faulted,
                at,
            } => {
                let Some(bess) = self.bess.as_mut() else {
                    self.logger.debug("BESS telemetry ignored: no battery configured");
                    return Ok(());
                };
                bess.update_state(soc_percent, max_discharge_kw, max_charge_kw, at)?;
                bess.set_fault(faulted);
                self.bess_dirty = true;
            }
        }
        Ok(())
    }

    /// One allocation cycle
    fn run_cycle(&mut self, now: DateTime<Utc>) {
        let snapshot = self.registry.snapshot(now);
        let boost = self
            .bess
            .as_ref()
            .map_or(Ok(0.0), |b| b.available_boost(now));
        let grid_budget = self.capacity.grid_budget();
        let plan = self.engine.run(&snapshot, boost, grid_budget);

        if let Err(e) = self.capacity.commit(&plan) {
            // The engine never produces this; keep the previous setpoints in force
            self.logger.error(&format!("Rejected allocation plan: {e}"));
            return;
        }

        for ev in self.registry.apply_plan(&plan, now) {
            self.record(ev);
        }
        let command = self.decide_bess_command(&plan, now);

        self.publish_setpoints(&plan, now);
        self.publish_bess_command(command, now);
        self.last_plan = plan;
        self.cycles += 1;
        self.publish_snapshot(now);
    }

    fn decide_bess_command(&mut self, plan: &AllocationPlan, now: DateTime<Utc>) -> Option<BessCommand> {
        let bess = self.bess.as_mut()?;
        let discharge = plan.active_boost_kw();
        let command = if discharge > EPSILON_KW {
            BessCommand::Discharge { power_kw: discharge }
        } else {
            let charge = bess.charge_opportunity(plan.total_allocated_kw, self.capacity.grid_budget(), now);
            if charge > 0.0 && self.capacity.set_bess_charge(charge).is_ok() {
                BessCommand::Charge { power_kw: charge }
            } else {
                BessCommand::Idle
            }
        };
        if !matches!(command, BessCommand::Charge { .. }) {
            // Zero charge always fits
            let _ = self.capacity.set_bess_charge(0.0);
        }
        bess.set_mode(command.mode());
        Some(command)
    }

    fn publish(&self, message: Result<EgressMessage>) {
        match message {
            // No subscribers is fine; nobody is listening yet
            Ok(msg) => {
                let _ = self.egress_tx.send(msg);
            }
            Err(e) => self.logger.error(&format!("Failed to encode egress message: {e}")),
        }
    }

    fn publish_setpoints(&self, plan: &AllocationPlan, now: DateTime<Utc>) {
        for entry in &plan.entries {
            self.publish(EgressMessage::setpoint(
                &self.scheme,
                &SetpointMessage {
                    charger_id: entry.charger_id.clone(),
                    allocated_power_kw: entry.allocated_kw,
                    effective_at: now,
                },
            ));
        }
        // Chargers whose session ended since the last cycle drop to zero
        let current: BTreeSet<&str> = plan.entries.iter().map(|a| a.charger_id.as_str()).collect();
        for gone in self
            .last_plan
            .entries
            .iter()
            .filter(|a| !current.contains(a.charger_id.as_str()))
        {
            self.publish_zero(&gone.charger_id, now);
        }
    }

    fn publish_zero(&self, charger_id: &str, now: DateTime<Utc>) {
        self.publish(EgressMessage::setpoint(
            &self.scheme,
            &SetpointMessage {
                charger_id: charger_id.to_string(),
                allocated_power_kw: 0.0,
                effective_at: now,
            },
        ));
    }

    fn publish_bess_command(&mut self, command: Option<BessCommand>, now: DateTime<Utc>) {
        let Some(command) = command else {
            return;
        };
        if command != self.bess_command {
            self.logger.info(&format!("BESS command: {command:?}"));
        }
        self.bess_command = command;
        self.publish(EgressMessage::bess_command(
            &self.scheme,
            &BessCommandMessage::new(&command, now),
        ));
    }

    fn publish_snapshot(&self, now: DateTime<Utc>) {
        let snapshot = StationSnapshot {
            station_id: self.station_id.clone(),
            state: self.state,
            registry: self.registry.snapshot(now),
            plan: self.last_plan.clone(),
            capacity: self.capacity.usage(),
            bess: self.bess.as_ref().map(|b| b.status(now)),
            bess_command: self.bess_command,
            cycles: self.cycles,
            taken_at: now,
        };
        self.snapshot_tx.send_replace(Arc::new(snapshot));
    }

    /// Drain the queue, then de-energize
    async fn shutdown(&mut self) {
        self.state = StationState::Draining;
        self.publish_snapshot(Utc::now());

        self.events.close();
        let remaining = self.events.drain();
        if !remaining.is_empty() {
            self.logger
                .info(&format!("Applying {} buffered events before shutdown", remaining.len()));
        }
        for event in remaining {
            self.apply_logged(event);
        }

        let now = Utc::now();
        for ev in self.registry.finish_all(&FinishReason::Shutdown, now) {
            self.record(ev);
        }
        self.registry.take_dirty();

        let chargers: Vec<String> = self.registry.chargers().map(|c| c.id.clone()).collect();
        for charger_id in &chargers {
            self.publish_zero(charger_id, now);
        }
        self.capacity.reset();
        if let Some(bess) = self.bess.as_mut() {
            bess.set_mode(BessMode::Idle);
            self.publish_bess_command(Some(BessCommand::Idle), now);
        }
        self.last_plan = AllocationPlan {
            grid_budget_kw: self.capacity.grid_budget(),
            budget_kw: self.capacity.grid_budget(),
            ..AllocationPlan::default()
        };
        self.cycles += 1;

        if let Some((handle, writer)) = self.persistence.take() {
            drop(handle);
            if let Err(e) = writer.await {
                self.logger.error(&format!("Lifecycle writer ended abnormally: {e}"));
            }
        }

        self.state = StationState::Stopped;
        self.publish_snapshot(now);
        self.logger.info("Station stopped; all chargers de-energized");
    }
}

fn heartbeat_timeout(config: &DispatcherConfig) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(config.heartbeat_timeout_seconds).unwrap_or(i64::MAX / 1000))
}

/// Periodically disconnect sessions whose charger went silent.
///
/// Reads the published snapshot and feeds `Disconnect` events with reason
/// `HeartbeatTimeout` through the normal queue; the station re-checks
/// staleness before acting on them. Ends when the station stops.
pub fn spawn_heartbeat_sweep(handle: &StationHandle, config: &DispatcherConfig) -> JoinHandle<()> {
    let snapshots = handle.subscribe_snapshot();
    let sender = handle.sender();
    let timeout = heartbeat_timeout(config);
    let period = Duration::from_secs(config.sweep_interval_seconds.max(1));
    let logger = get_logger_with_context(
        LogContext::new("heartbeat").with_station_id(&snapshots.borrow().station_id),
    );

    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let snapshot = snapshots.borrow().clone();
            if matches!(snapshot.state, StationState::Draining | StationState::Stopped) {
                break;
            }

            let now = Utc::now();
            for charger_id in snapshot.registry.stale_sessions(now, timeout) {
                logger.warn(&format!("No heartbeat from {charger_id} within {}s", timeout.num_seconds()));
                let event = StationEvent::Disconnect {
                    charger_id,
                    reason: FinishReason::HeartbeatTimeout,
                    energy_delivered_kwh: None,
                    at: now,
                };
                if let Err(PowershareError::Shutdown) = sender.try_dispatch(event) {
                    return;
                }
            }
        }
        logger.debug("Heartbeat sweep stopped");
    })
}
