//! Exchange records and the store boundary. The relational CRUD surface for
//! exchanges lives elsewhere; this server only reads exchanges, flips their
//! status, attaches sandbox handles and appends access records.

use std::{collections::HashMap, path::Path};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeStatus {
    #[default]
    Processing,
    Active,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SandboxAttachment {
    pub port: u16,
    pub container_id: String,
}

fn empty_object() -> Value {
    json!({})
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Exchange {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub slug: String,
    #[serde(default)]
    pub name: String,
    pub backend: String,
    #[serde(default = "empty_object")]
    pub config: Value,
    #[serde(default)]
    pub status: ExchangeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Single-use credentials; each one is consumed by the session it opens.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packet_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxAttachment>,
    /// Untrusted exchanges run in a sandbox when sandboxing is enabled.
    #[serde(default)]
    pub trusted: bool,
}

impl Exchange {
    pub fn new(slug: impl Into<String>, backend: impl Into<String>, config: Value) -> Self {
        let slug = slug.into();
        Self {
            id: Uuid::new_v4(),
            name: slug.clone(),
            slug,
            backend: backend.into(),
            config,
            status: ExchangeStatus::Processing,
            error_message: None,
            packet_keys: Vec::new(),
            sandbox: None,
            trusted: false,
        }
    }

    pub fn trusted(mut self) -> Self {
        self.trusted = true;
        self
    }

    pub fn with_packet_key(mut self, key: impl Into<String>) -> Self {
        self.packet_keys.push(key.into());
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == ExchangeStatus::Active
    }
}

/// One request made through a packet-key session.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AccessRecord {
    pub exchange_id: Uuid,
    pub packet_key_hint: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("exchange '{0}' not found")]
    NotFound(String),
    #[error("exchange slug '{0}' is already taken")]
    SlugTaken(String),
    #[error("failed to read exchanges file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse exchanges file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[async_trait]
pub trait ExchangeStore: Send + Sync {
    async fn insert(&self, exchange: Exchange) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Exchange>, StoreError>;

    async fn get_by_slug(&self, slug: &str) -> Result<Option<Exchange>, StoreError>;

    async fn list(&self) -> Result<Vec<Exchange>, StoreError>;

    /// Consumes `key` and returns the exchange it belonged to.
    async fn redeem_packet_key(&self, key: &str) -> Result<Option<Exchange>, StoreError>;

    async fn set_status(
        &self,
        id: Uuid,
        status: ExchangeStatus,
        error_message: Option<String>,
    ) -> Result<(), StoreError>;

    async fn attach_sandbox(
        &self,
        id: Uuid,
        sandbox: Option<SandboxAttachment>,
    ) -> Result<(), StoreError>;

    async fn record_access(&self, record: AccessRecord) -> Result<(), StoreError>;

    async fn delete(&self, id: Uuid) -> Result<Exchange, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryExchangeStore {
    exchanges: RwLock<HashMap<Uuid, Exchange>>,
    access_log: Mutex<Vec<AccessRecord>>,
}

impl InMemoryExchangeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_exchanges(exchanges: Vec<Exchange>) -> Result<Self, StoreError> {
        let store = Self::new();
        {
            let mut map = store.exchanges.write();
            for exchange in exchanges {
                if map.values().any(|existing| existing.slug == exchange.slug) {
                    return Err(StoreError::SlugTaken(exchange.slug));
                }
                map.insert(exchange.id, exchange);
            }
        }
        Ok(store)
    }

    /// Seeds the store from a JSON array of exchanges.
    pub async fn load(path: &Path) -> Result<Self, StoreError> {
        let raw = tokio::fs::read_to_string(path).await?;
        let exchanges: Vec<Exchange> = serde_json::from_str(&raw)?;
        Self::from_exchanges(exchanges)
    }

    pub fn access_log(&self) -> Vec<AccessRecord> {
        self.access_log.lock().clone()
    }

    fn update<F>(&self, id: Uuid, apply: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Exchange),
    {
        let mut map = self.exchanges.write();
        let exchange = map
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        apply(exchange);
        Ok(())
    }
}

#[async_trait]
impl ExchangeStore for InMemoryExchangeStore {
    async fn insert(&self, exchange: Exchange) -> Result<(), StoreError> {
        let mut map = self.exchanges.write();
        if map
            .values()
            .any(|existing| existing.slug == exchange.slug && existing.id != exchange.id)
        {
            return Err(StoreError::SlugTaken(exchange.slug));
        }
        map.insert(exchange.id, exchange);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Exchange>, StoreError> {
        Ok(self.exchanges.read().get(&id).cloned())
    }

    async fn get_by_slug(&self, slug: &str) -> Result<Option<Exchange>, StoreError> {
        Ok(self
            .exchanges
            .read()
            .values()
            .find(|exchange| exchange.slug == slug)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<Exchange>, StoreError> {
        let mut exchanges: Vec<Exchange> = self.exchanges.read().values().cloned().collect();
        exchanges.sort_by(|left, right| left.slug.cmp(&right.slug));
        Ok(exchanges)
    }

    async fn redeem_packet_key(&self, key: &str) -> Result<Option<Exchange>, StoreError> {
        let mut map = self.exchanges.write();
        let Some(exchange) = map
            .values_mut()
            .find(|exchange| exchange.packet_keys.iter().any(|candidate| candidate == key))
        else {
            return Ok(None);
        };
        exchange.packet_keys.retain(|candidate| candidate != key);
        Ok(Some(exchange.clone()))
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: ExchangeStatus,
        error_message: Option<String>,
    ) -> Result<(), StoreError> {
        self.update(id, |exchange| {
            exchange.status = status;
            exchange.error_message = error_message;
        })
    }

    async fn attach_sandbox(
        &self,
        id: Uuid,
        sandbox: Option<SandboxAttachment>,
    ) -> Result<(), StoreError> {
        self.update(id, |exchange| exchange.sandbox = sandbox)
    }

    async fn record_access(&self, record: AccessRecord) -> Result<(), StoreError> {
        self.access_log.lock().push(record);
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<Exchange, StoreError> {
        self.exchanges
            .write()
            .remove(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[tokio::test]
    async fn packet_keys_are_single_use() {
        let exchange = Exchange::new("team-notes", "filesystem", json!({ "root_path": "/srv" }))
            .with_packet_key("pk_live_0123456789");
        let store = InMemoryExchangeStore::from_exchanges(vec![exchange]).expect("store");

        let redeemed = store
            .redeem_packet_key("pk_live_0123456789")
            .await
            .expect("redeem")
            .expect("first redemption");
        assert_eq!(redeemed.slug, "team-notes");
        assert!(redeemed.packet_keys.is_empty());

        assert!(store
            .redeem_packet_key("pk_live_0123456789")
            .await
            .expect("redeem")
            .is_none());
    }

    #[tokio::test]
    async fn duplicate_slugs_are_rejected() {
        let store = InMemoryExchangeStore::new();
        store
            .insert(Exchange::new("docs", "filesystem", json!({})))
            .await
            .expect("first insert");
        let error = store
            .insert(Exchange::new("docs", "github", json!({})))
            .await
            .expect_err("duplicate slug");
        assert!(matches!(error, StoreError::SlugTaken(_)));
    }

    #[tokio::test]
    async fn status_and_sandbox_updates_are_visible() {
        let exchange = Exchange::new("docs", "filesystem", json!({}));
        let id = exchange.id;
        let store = InMemoryExchangeStore::from_exchanges(vec![exchange]).expect("store");

        store
            .set_status(id, ExchangeStatus::Error, Some("boom".to_string()))
            .await
            .expect("status");
        store
            .attach_sandbox(
                id,
                Some(SandboxAttachment {
                    port: 9100,
                    container_id: "abc123".to_string(),
                }),
            )
            .await
            .expect("attach");

        let stored = store.get(id).await.expect("get").expect("exists");
        assert_eq!(stored.status, ExchangeStatus::Error);
        assert_eq!(stored.error_message.as_deref(), Some("boom"));
        assert_eq!(stored.sandbox.map(|sandbox| sandbox.port), Some(9100));

        assert!(matches!(
            store.set_status(Uuid::new_v4(), ExchangeStatus::Active, None).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn loads_exchanges_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            file,
            r#"[{{"slug":"docs","backend":"filesystem","config":{{"root_path":"/srv"}},"trusted":true}}]"#
        )
        .expect("write");

        let store = InMemoryExchangeStore::load(file.path()).await.expect("load");
        let exchange = store
            .get_by_slug("docs")
            .await
            .expect("lookup")
            .expect("seeded");
        assert!(exchange.trusted);
        assert_eq!(exchange.status, ExchangeStatus::Processing);
        assert_eq!(exchange.name, "");
    }
}
