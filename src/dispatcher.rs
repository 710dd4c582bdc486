//! Event dispatcher
//!
//! Bounded FIFO between the telemetry producers and the station task.
//! Producers get an immediate or time-bounded `QueueFull` instead of
//! blocking the caller; the consumer pulls events in debounced batches so a
//! burst of updates costs one allocation cycle.

use crate::config::DispatcherConfig;
use crate::error::{PowershareError, Result};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use crate::session::FinishReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Duration, Instant, timeout, timeout_at};

/// State change delivered to the station task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StationEvent {
    /// Vehicle plugged in and announced its demand
    Connect {
        charger_id: String,
        requested_power_kw: f64,
        at: DateTime<Utc>,
    },
    /// Demand update for an ongoing session, optionally with a meter reading
    DemandChange {
        charger_id: String,
        requested_power_kw: f64,
        energy_delivered_kwh: Option<f64>,
        at: DateTime<Utc>,
    },
    Disconnect {
        charger_id: String,
        reason: FinishReason,
        energy_delivered_kwh: Option<f64>,
        at: DateTime<Utc>,
    },
    Heartbeat {
        charger_id: String,
        at: DateTime<Utc>,
    },
    ChargerFault {
        charger_id: String,
        at: DateTime<Utc>,
    },
    /// Battery telemetry sample
    SocUpdate {
        soc_percent: f64,
        max_discharge_kw: f64,
        max_charge_kw: f64,
        faulted: bool,
        at: DateTime<Utc>,
    },
}

impl StationEvent {
    pub fn charger_id(&self) -> Option<&str> {
        match self {
            Self::Connect { charger_id, .. }
            | Self::DemandChange { charger_id, .. }
            | Self::Disconnect { charger_id, .. }
            | Self::Heartbeat { charger_id, .. }
            | Self::ChargerFault { charger_id, .. } => Some(charger_id.as_str()),
            Self::SocUpdate { .. } => None,
        }
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::DemandChange { .. } => "demand_change",
            Self::Disconnect { .. } => "disconnect",
            Self::Heartbeat { .. } => "heartbeat",
            Self::ChargerFault { .. } => "charger_fault",
            Self::SocUpdate { .. } => "soc_update",
        }
    }
}

/// Create the station queue
pub fn channel(config: &DispatcherConfig, station_id: &str) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let sender = EventSender {
        tx,
        enqueue_timeout: Duration::from_millis(config.enqueue_timeout_ms),
        logger: get_logger_with_context(
            LogContext::new("dispatcher").with_station_id(station_id),
        ),
    };
    let receiver = EventReceiver {
        rx,
        pending: Vec::new(),
        deadline: None,
    };
    (sender, receiver)
}

/// Producer side; cheap to clone
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<StationEvent>,
    enqueue_timeout: Duration,
    logger: StructuredLogger,
}

impl EventSender {
    /// Enqueue without waiting
    pub fn try_dispatch(&self, event: StationEvent) -> Result<()> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => {
                let logger = event
                    .charger_id()
                    .map_or_else(|| self.logger.clone(), |id| self.logger.for_charger(id));
                logger.warn(&format!("Event queue full, dropping {} event", event.kind()));
                Err(PowershareError::queue_full(format!(
                    "{} event dropped",
                    event.kind()
                )))
            }
            Err(TrySendError::Closed(_)) => Err(PowershareError::Shutdown),
        }
    }

    /// Enqueue, waiting at most the configured enqueue timeout for space
    pub async fn dispatch(&self, event: StationEvent) -> Result<()> {
        let kind = event.kind();
        match timeout(self.enqueue_timeout, self.tx.send(event)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(PowershareError::Shutdown),
            Err(_) => {
                self.logger.warn(&format!(
                    "Event queue still full after {:?}, dropping {kind} event",
                    self.enqueue_timeout
                ));
                Err(PowershareError::queue_full(format!(
                    "{kind} event dropped after {} ms",
                    self.enqueue_timeout.as_millis()
                )))
            }
        }
    }
}

/// Consumer side, owned by the station task
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::Receiver<StationEvent>,
    /// Batch under construction; survives a cancelled `next_batch`
    pending: Vec<StationEvent>,
    deadline: Option<Instant>,
}

impl EventReceiver {
    /// Wait for the next burst of events.
    ///
    /// After the first event arrives, keeps collecting until `debounce` has
    /// elapsed or `max_batch` events are buffered. With a zero debounce only
    /// events already queued join the batch. Returns `None` once the queue is
    /// closed and empty.
    ///
    /// Cancel safe: events collected before a cancellation are returned by the
    /// next call.
    pub async fn next_batch(&mut self, debounce: Duration, max_batch: usize) -> Option<Vec<StationEvent>> {
        let max_batch = max_batch.max(1);
        if self.pending.is_empty() {
            let first = self.rx.recv().await?;
            self.pending.push(first);
            self.deadline = Some(Instant::now() + debounce);
        }

        let deadline = self.deadline.unwrap_or_else(Instant::now);
        while self.pending.len() < max_batch {
            match timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(event)) => self.pending.push(event),
                Ok(None) | Err(_) => break,
            }
        }

        self.deadline = None;
        Some(std::mem::take(&mut self.pending))
    }

    /// Refuse new events; already queued ones stay readable
    pub fn close(&mut self) {
        self.rx.close();
    }

    /// Everything still buffered, in arrival order
    pub fn drain(&mut self) -> Vec<StationEvent> {
        let mut events = std::mem::take(&mut self.pending);
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        self.deadline = None;
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(capacity: usize) -> DispatcherConfig {
        DispatcherConfig {
            queue_capacity: capacity,
            enqueue_timeout_ms: 20,
            ..DispatcherConfig::default()
        }
    }

    fn heartbeat(id: &str) -> StationEvent {
        StationEvent::Heartbeat {
            charger_id: id.to_string(),
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn try_dispatch_reports_full_queue() {
        let (tx, _rx) = channel(&config(2), "s1");
        tx.try_dispatch(heartbeat("A")).unwrap();
        tx.try_dispatch(heartbeat("B")).unwrap();
        let err = tx.try_dispatch(heartbeat("C")).unwrap_err();
        assert!(matches!(err, PowershareError::QueueFull { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_times_out_on_full_queue() {
        let (tx, _rx) = channel(&config(1), "s1");
        tx.dispatch(heartbeat("A")).await.unwrap();
        let err = tx.dispatch(heartbeat("B")).await.unwrap_err();
        assert!(matches!(err, PowershareError::QueueFull { .. }));
    }

    #[tokio::test]
    async fn closed_queue_reports_shutdown() {
        let (tx, mut rx) = channel(&config(4), "s1");
        tx.try_dispatch(heartbeat("A")).unwrap();
        rx.close();
        assert!(matches!(
            tx.try_dispatch(heartbeat("B")),
            Err(PowershareError::Shutdown)
        ));
        assert_eq!(rx.drain().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_coalesces_into_one_batch() {
        let (tx, mut rx) = channel(&config(16), "s1");
        for id in ["A", "B", "C"] {
            tx.try_dispatch(heartbeat(id)).unwrap();
        }
        let producer = tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            producer.try_dispatch(heartbeat("D")).unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
            producer.try_dispatch(heartbeat("E")).unwrap();
        });

        let batch = rx.next_batch(Duration::from_millis(100), 64).await.unwrap();
        let ids: Vec<_> = batch.iter().filter_map(StationEvent::charger_id).collect();
        assert_eq!(ids, vec!["A", "B", "C", "D"]);

        let batch = rx.next_batch(Duration::from_millis(100), 64).await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_size_is_capped() {
        let (tx, mut rx) = channel(&config(16), "s1");
        for i in 0..5 {
            tx.try_dispatch(heartbeat(&format!("CP{i}"))).unwrap();
        }
        let batch = rx.next_batch(Duration::from_millis(100), 3).await.unwrap();
        assert_eq!(batch.len(), 3);
        let batch = rx.next_batch(Duration::from_millis(100), 3).await.unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn closed_and_empty_queue_ends_batches() {
        let (tx, mut rx) = channel(&config(4), "s1");
        drop(tx);
        assert!(rx.next_batch(Duration::ZERO, 8).await.is_none());
    }
}
