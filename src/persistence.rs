//! Persistence layer for session lifecycle records
//!
//! Lifecycle records are handed to a background writer so an allocation cycle
//! never waits on storage. The writer retries failed appends a configured
//! number of times and logs what it finally has to drop.

use crate::config::PersistenceConfig;
use crate::error::{PowershareError, Result};
use crate::logging::{StructuredLogger, get_logger};
use crate::session::LifecycleEvent;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};

/// Append-only sink for lifecycle records
#[async_trait]
pub trait LifecycleStore: Send + Sync {
    async fn append(&self, event: &LifecycleEvent) -> Result<()>;
}

/// One JSON document per line
#[derive(Debug)]
pub struct JsonLinesStore {
    path: PathBuf,
    // Serializes appends from concurrent writers
    lock: Mutex<()>,
}

impl JsonLinesStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    /// Read every record back, skipping lines that fail to parse
    pub async fn load(&self) -> Result<Vec<LifecycleEvent>> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(Vec::new());
        }
        let contents = tokio::fs::read_to_string(&self.path).await?;
        Ok(contents
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

#[async_trait]
impl LifecycleStore for JsonLinesStore {
    async fn append(&self, event: &LifecycleEvent) -> Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                PowershareError::persistence(format!("{}: {e}", parent.display()))
            })?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| PowershareError::persistence(format!("{}: {e}", self.path.display())))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| PowershareError::persistence(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| PowershareError::persistence(e.to_string()))?;
        Ok(())
    }
}

/// In-memory store for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryStore {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl LifecycleStore for MemoryStore {
    async fn append(&self, event: &LifecycleEvent) -> Result<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

/// Handle to the background lifecycle writer
#[derive(Debug, Clone)]
pub struct PersistenceHandle {
    tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl PersistenceHandle {
    /// Queue a record; never blocks
    pub fn record(&self, event: LifecycleEvent) {
        // Writer gone means the process is tearing down; nothing left to do
        let _ = self.tx.send(event);
    }
}

/// Start the writer task. The task ends once every handle is dropped and the
/// queue is empty.
pub fn spawn_writer(
    store: Arc<dyn LifecycleStore>,
    config: &PersistenceConfig,
) -> (PersistenceHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<LifecycleEvent>();
    let attempts = config.retry_attempts.max(1);
    let delay = Duration::from_millis(config.retry_delay_ms);
    let logger = get_logger("persistence");

    let task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            write_with_retry(store.as_ref(), &event, attempts, delay, &logger).await;
        }
        logger.debug("Lifecycle writer stopped");
    });
    (PersistenceHandle { tx }, task)
}

async fn write_with_retry(
    store: &dyn LifecycleStore,
    event: &LifecycleEvent,
    attempts: u32,
    delay: Duration,
    logger: &StructuredLogger,
) {
    for attempt in 1..=attempts {
        match store.append(event).await {
            Ok(()) => return,
            Err(e) if attempt < attempts => {
                logger.warn(&format!(
                    "Writing {:?} record for session {} failed (attempt {attempt}/{attempts}): {e}",
                    event.kind, event.session_id
                ));
                sleep(delay).await;
            }
            Err(e) => {
                logger.error(&format!(
                    "Dropping {:?} record for session {} after {attempts} attempts: {e}",
                    event.kind, event.session_id
                ));
            }
        }
    }
}
