//! Lifecycle of isolated exchange instances.
//!
//! An untrusted exchange runs as another copy of this server inside a
//! resource-capped container. The manager owns the port pool and the record
//! of every container it started; records are the source of truth for port
//! uniqueness.

pub mod ports;
pub mod runtime;
pub mod spec;

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    config::SandboxSettings,
    exchange::{Exchange, SandboxAttachment},
};

pub use ports::{PortAllocator, PortLease};
pub use runtime::{ContainerRuntime, ContainerState, DockerCli, StopOutcome};
pub use spec::SandboxSpec;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("no free sandbox port between {base} and {max}")]
    PortsExhausted { base: u16, max: u16 },
    #[error("sandbox failed to start: {0}")]
    StartFailed(String),
    #[error("container runtime error: {0}")]
    Runtime(String),
    #[error("no sandbox for exchange {0}")]
    NotFound(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxRecord {
    pub exchange_id: Uuid,
    pub slug: String,
    pub container_id: String,
    pub container_name: String,
    pub port: u16,
    pub created_at: DateTime<Utc>,
    pub status: SandboxStatus,
}

impl SandboxRecord {
    pub fn attachment(&self) -> SandboxAttachment {
        SandboxAttachment {
            port: self.port,
            container_id: self.container_id.clone(),
        }
    }
}

pub struct SandboxManager {
    settings: SandboxSettings,
    runtime: Arc<dyn ContainerRuntime>,
    ports: PortAllocator,
    records: Mutex<HashMap<Uuid, SandboxRecord>>,
    /// One start at a time per exchange.
    provisioning: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    api_tokens_env: String,
}

impl std::fmt::Debug for SandboxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxManager")
            .field("image", &self.settings.image)
            .field("records", &self.records.lock().len())
            .finish()
    }
}

impl SandboxManager {
    pub fn new(
        settings: SandboxSettings,
        runtime: Arc<dyn ContainerRuntime>,
        api_tokens_env: String,
    ) -> Self {
        Self {
            ports: PortAllocator::new(settings.base_port, settings.max_port),
            settings,
            runtime,
            records: Mutex::new(HashMap::new()),
            provisioning: Mutex::new(HashMap::new()),
            api_tokens_env,
        }
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    pub fn record(&self, exchange_id: Uuid) -> Option<SandboxRecord> {
        self.records.lock().get(&exchange_id).cloned()
    }

    pub fn records(&self) -> Vec<SandboxRecord> {
        let mut records: Vec<SandboxRecord> = self.records.lock().values().cloned().collect();
        records.sort_by_key(|record| record.port);
        records
    }

    fn running_ports(&self) -> BTreeSet<u16> {
        self.records
            .lock()
            .values()
            .filter(|record| record.status == SandboxStatus::Running)
            .map(|record| record.port)
            .collect()
    }

    /// Starts the exchange's container, or returns the running record when
    /// one already exists.
    pub async fn provision(&self, exchange: &Exchange) -> Result<SandboxRecord, SandboxError> {
        let lock = Arc::clone(self.provisioning.lock().entry(exchange.id).or_default());
        let result = {
            let _guard = lock.lock().await;
            self.start_unless_running(exchange).await
        };
        drop(lock);
        self.provisioning
            .lock()
            .retain(|_, lock| Arc::strong_count(lock) > 1);
        result
    }

    async fn start_unless_running(&self, exchange: &Exchange) -> Result<SandboxRecord, SandboxError> {
        if let Some(existing) = self.record(exchange.id) {
            if existing.status == SandboxStatus::Running {
                return Ok(existing);
            }
        }

        let lease = self.ports.allocate(|| self.running_ports()).await?;
        let spec = SandboxSpec::for_exchange(exchange, lease.port(), &self.settings, &self.api_tokens_env);
        tracing::info!(
            exchange = %exchange.slug,
            container = %spec.name,
            port = spec.port,
            image = %spec.image,
            "starting sandbox"
        );

        let container_id = self.runtime.run(&spec).await.inspect_err(|err| {
            tracing::warn!(exchange = %exchange.slug, error = %err, "sandbox start failed");
        })?;

        let record = SandboxRecord {
            exchange_id: exchange.id,
            slug: exchange.slug.clone(),
            container_id,
            container_name: spec.name,
            port: spec.port,
            created_at: Utc::now(),
            status: SandboxStatus::Running,
        };
        self.records.lock().insert(exchange.id, record.clone());
        drop(lease);

        Ok(record)
    }

    /// Registers a container started by a previous process so its port is
    /// reserved and the reconciler watches it.
    pub fn adopt(&self, exchange: &Exchange, attachment: &SandboxAttachment) -> SandboxRecord {
        let record = SandboxRecord {
            exchange_id: exchange.id,
            slug: exchange.slug.clone(),
            container_id: attachment.container_id.clone(),
            container_name: attachment.container_id.clone(),
            port: attachment.port,
            created_at: Utc::now(),
            status: SandboxStatus::Running,
        };
        self.records.lock().insert(exchange.id, record.clone());
        record
    }

    /// Stops and removes the exchange's container. Safe to repeat.
    pub async fn teardown(&self, exchange_id: Uuid) -> Result<StopOutcome, SandboxError> {
        let Some(record) = self.records.lock().remove(&exchange_id) else {
            return Ok(StopOutcome::AlreadyGone);
        };

        match self
            .runtime
            .stop(&record.container_name, self.settings.stop_grace)
            .await
        {
            Ok(outcome) => {
                tracing::info!(
                    exchange = %record.slug,
                    container = %record.container_name,
                    outcome = ?outcome,
                    "sandbox torn down"
                );
                Ok(outcome)
            }
            Err(err) => {
                self.records.lock().insert(exchange_id, record);
                Err(err)
            }
        }
    }

    /// Drops records whose container is no longer running, releasing their
    /// ports. Returns the dropped records.
    pub async fn reconcile(&self) -> Vec<SandboxRecord> {
        let snapshot = self.records();
        let mut dead = Vec::new();

        for record in snapshot {
            match self.runtime.inspect(&record.container_name).await {
                Ok(ContainerState::Running) => {}
                Ok(state) => {
                    if state == ContainerState::Exited {
                        if let Err(err) = self
                            .runtime
                            .stop(&record.container_name, self.settings.stop_grace)
                            .await
                        {
                            tracing::warn!(container = %record.container_name, error = %err, "failed to remove exited sandbox");
                        }
                    }
                    if let Some(mut removed) = self.records.lock().remove(&record.exchange_id) {
                        removed.status = SandboxStatus::Stopped;
                        dead.push(removed);
                    }
                }
                Err(err) => {
                    tracing::warn!(container = %record.container_name, error = %err, "sandbox inspection failed");
                }
            }
        }

        if !dead.is_empty() {
            tracing::warn!(count = dead.len(), "dead sandboxes reconciled");
        }
        dead
    }
}
