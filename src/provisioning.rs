//! Exchange activation and teardown.
//!
//! Activation validates the exchange's configuration by constructing its
//! adapter. Trusted exchanges (or every exchange when sandboxing is off) keep
//! that adapter in-process; untrusted ones get a sandbox and are served from
//! there.

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    adapters::KnowledgeAdapter,
    exchange::{Exchange, ExchangeStatus, ExchangeStore, StoreError},
    registry::{AdapterRegistry, RegistryError},
    sandbox::{SandboxError, SandboxManager, StopOutcome},
    session::SessionManager,
};

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("exchange {0} not found")]
    NotFound(Uuid),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Provisioner {
    registry: Arc<AdapterRegistry>,
    store: Arc<dyn ExchangeStore>,
    sandbox: Option<Arc<SandboxManager>>,
    adapters: RwLock<HashMap<Uuid, Arc<dyn KnowledgeAdapter>>>,
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner")
            .field("in_process", &self.adapters.read().len())
            .field("sandboxing", &self.sandbox.is_some())
            .finish()
    }
}

impl Provisioner {
    pub fn new(
        registry: Arc<AdapterRegistry>,
        store: Arc<dyn ExchangeStore>,
        sandbox: Option<Arc<SandboxManager>>,
    ) -> Self {
        Self {
            registry,
            store,
            sandbox,
            adapters: RwLock::new(HashMap::new()),
        }
    }

    pub fn sandbox(&self) -> Option<&Arc<SandboxManager>> {
        self.sandbox.as_ref()
    }

    /// The in-process adapter bound to an active exchange.
    pub fn adapter_for(&self, exchange_id: Uuid) -> Option<Arc<dyn KnowledgeAdapter>> {
        self.adapters.read().get(&exchange_id).cloned()
    }

    /// Validates, provisions and marks the exchange `active`; on any failure
    /// the exchange is marked `error` with the reason.
    pub async fn activate_exchange(&self, exchange_id: Uuid) -> Result<Exchange, ProvisionError> {
        let exchange = self
            .store
            .get(exchange_id)
            .await?
            .ok_or(ProvisionError::NotFound(exchange_id))?;

        match self.bring_up(&exchange).await {
            Ok(()) => {
                self.store
                    .set_status(exchange_id, ExchangeStatus::Active, None)
                    .await?;
                tracing::info!(
                    exchange = %exchange.slug,
                    backend = %exchange.backend,
                    sandboxed = self.is_sandboxed(&exchange),
                    "exchange activated"
                );
            }
            Err(err) => {
                tracing::warn!(exchange = %exchange.slug, error = %err, "exchange activation failed");
                self.store
                    .set_status(exchange_id, ExchangeStatus::Error, Some(err.to_string()))
                    .await?;
                return Err(err);
            }
        }

        self.store
            .get(exchange_id)
            .await?
            .ok_or(ProvisionError::NotFound(exchange_id))
    }

    fn is_sandboxed(&self, exchange: &Exchange) -> bool {
        !exchange.trusted && self.sandbox.is_some()
    }

    async fn bring_up(&self, exchange: &Exchange) -> Result<(), ProvisionError> {
        let adapter = self.registry.create(&exchange.backend, &exchange.config)?;

        let Some(sandbox) = self.sandbox.as_ref().filter(|_| !exchange.trusted) else {
            self.adapters.write().insert(exchange.id, adapter);
            return Ok(());
        };
        drop(adapter);

        if let Some(attachment) = &exchange.sandbox {
            sandbox.adopt(exchange, attachment);
            return Ok(());
        }

        let record = sandbox.provision(exchange).await?;
        if let Err(err) = self
            .store
            .attach_sandbox(exchange.id, Some(record.attachment()))
            .await
        {
            if let Err(teardown_err) = sandbox.teardown(exchange.id).await {
                tracing::warn!(exchange = %exchange.slug, error = %teardown_err, "failed to tear down orphaned sandbox");
            }
            return Err(err.into());
        }
        Ok(())
    }

    /// Activates every stored exchange. Returns how many became active.
    pub async fn activate_all(&self) -> Result<usize, ProvisionError> {
        let mut activated = 0;
        for exchange in self.store.list().await? {
            if self.activate_exchange(exchange.id).await.is_ok() {
                activated += 1;
            }
        }
        Ok(activated)
    }

    /// Closes the exchange's sessions, tears down its sandbox and removes it
    /// from the store.
    pub async fn delete_exchange(
        &self,
        exchange_id: Uuid,
        sessions: &SessionManager,
    ) -> Result<Exchange, ProvisionError> {
        self.adapters.write().remove(&exchange_id);
        let closed = sessions.close_exchange(exchange_id);

        let outcome = match &self.sandbox {
            Some(sandbox) => sandbox.teardown(exchange_id).await?,
            None => StopOutcome::AlreadyGone,
        };

        let exchange = self.store.delete(exchange_id).await.map_err(|err| match err {
            StoreError::NotFound(_) => ProvisionError::NotFound(exchange_id),
            other => other.into(),
        })?;
        tracing::info!(
            exchange = %exchange.slug,
            sessions_closed = closed,
            sandbox = ?outcome,
            "exchange deleted"
        );
        Ok(exchange)
    }

    /// One reconciliation pass: exchanges whose sandbox died are detached
    /// and marked `error`.
    pub async fn reconcile_sandboxes(&self) -> Result<usize, ProvisionError> {
        let Some(sandbox) = &self.sandbox else {
            return Ok(0);
        };

        let dead = sandbox.reconcile().await;
        for record in &dead {
            self.store.attach_sandbox(record.exchange_id, None).await?;
            self.store
                .set_status(
                    record.exchange_id,
                    ExchangeStatus::Error,
                    Some(SandboxError::NotFound(record.exchange_id).to_string()),
                )
                .await?;
        }
        Ok(dead.len())
    }
}

pub fn spawn_sandbox_reconciler(
    provisioner: Arc<Provisioner>,
    shutdown: CancellationToken,
) -> Option<JoinHandle<()>> {
    let interval = provisioner.sandbox()?.settings().reconcile_interval;

    Some(tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(err) = provisioner.reconcile_sandboxes().await {
                        tracing::warn!(error = %err, "sandbox reconciliation tick failed");
                    }
                }
            }
        }
    }))
}
