//! Maps node addresses to reachable endpoints.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use meshgate_core::address::NodeAddress;

/// One published node record. Rewritten on every publish cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRecord {
    pub address: NodeAddress,
    /// Where the node accepts queries, e.g. `203.0.113.7:7420`.
    pub endpoint: String,
    pub valid_until: SystemTime,
}

impl PublishRecord {
    pub fn new(address: NodeAddress, endpoint: impl Into<String>, validity: Duration) -> Self {
        Self {
            address,
            endpoint: endpoint.into(),
            valid_until: SystemTime::now() + validity,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.valid_until <= SystemTime::now()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("no record for {0}")]
    NotFound(NodeAddress),

    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Directory: Send + Sync {
    async fn publish(&self, record: PublishRecord) -> Result<(), DirectoryError>;

    async fn find(&self, address: &NodeAddress) -> Result<PublishRecord, DirectoryError>;
}

// ── In-memory ─────────────────────────────────────────────────────────────────

/// Process-local directory. Expired records are dropped on lookup.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    records: Arc<DashMap<NodeAddress, PublishRecord>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record still valid.
    pub fn records(&self) -> Vec<PublishRecord> {
        self.records
            .iter()
            .filter(|e| !e.is_expired())
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn purge_expired(&self) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| !r.is_expired());
        before.saturating_sub(self.records.len())
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn publish(&self, record: PublishRecord) -> Result<(), DirectoryError> {
        tracing::debug!(address = %record.address.short(), endpoint = %record.endpoint, "record stored");
        self.records.insert(record.address, record);
        Ok(())
    }

    async fn find(&self, address: &NodeAddress) -> Result<PublishRecord, DirectoryError> {
        let record = self
            .records
            .get(address)
            .map(|r| r.value().clone())
            .ok_or(DirectoryError::NotFound(*address))?;
        if record.is_expired() {
            self.records.remove_if(address, |_, r| r.is_expired());
            return Err(DirectoryError::NotFound(*address));
        }
        Ok(record)
    }
}

// ── HTTP ──────────────────────────────────────────────────────────────────────

/// Client for a directory served over HTTP:
/// `POST {base}/records` and `GET {base}/records/{address}`.
///
/// Every request gives up after `timeout`.
pub struct HttpDirectory {
    client: reqwest::Client,
    base: String,
}

impl HttpDirectory {
    pub fn new(base: &str, timeout: Duration) -> Result<Self, DirectoryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Directory for HttpDirectory {
    async fn publish(&self, record: PublishRecord) -> Result<(), DirectoryError> {
        let url = format!("{}/records", self.base);
        let resp = self
            .client
            .post(&url)
            .json(&record)
            .send()
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(DirectoryError::Unavailable(format!(
                "{url} returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn find(&self, address: &NodeAddress) -> Result<PublishRecord, DirectoryError> {
        let url = format!("{}/records/{}", self.base, address);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(DirectoryError::NotFound(*address));
        }
        if !resp.status().is_success() {
            return Err(DirectoryError::Unavailable(format!(
                "{url} returned {}",
                resp.status()
            )));
        }
        let record: PublishRecord = resp
            .json()
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
        if record.is_expired() {
            return Err(DirectoryError::NotFound(*address));
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_directory_round_trip() {
        let dir = MemoryDirectory::new();
        let addr = NodeAddress::derive(b"node-a");
        dir.publish(PublishRecord::new(addr, "127.0.0.1:7420", Duration::from_secs(60)))
            .await
            .unwrap();
        let found = dir.find(&addr).await.unwrap();
        assert_eq!(found.endpoint, "127.0.0.1:7420");
        assert_eq!(dir.records().len(), 1);
    }

    #[tokio::test]
    async fn expired_record_is_not_found() {
        let dir = MemoryDirectory::new();
        let addr = NodeAddress::derive(b"node-b");
        let mut record = PublishRecord::new(addr, "127.0.0.1:1", Duration::ZERO);
        record.valid_until = SystemTime::now() - Duration::from_secs(1);
        dir.publish(record).await.unwrap();
        assert!(matches!(dir.find(&addr).await, Err(DirectoryError::NotFound(_))));
        assert_eq!(dir.purge_expired(), 0, "lookup already dropped it");
    }

    #[tokio::test]
    async fn republish_replaces_record() {
        let dir = MemoryDirectory::new();
        let addr = NodeAddress::derive(b"node-c");
        dir.publish(PublishRecord::new(addr, "a:1", Duration::from_secs(60)))
            .await
            .unwrap();
        dir.publish(PublishRecord::new(addr, "b:2", Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(dir.find(&addr).await.unwrap().endpoint, "b:2");
    }

    #[test]
    fn record_serializes_address_as_string() {
        let record = PublishRecord::new(NodeAddress::from_bytes([1; 32]), "x:1", Duration::from_secs(1));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["address"], record.address.to_string());
    }
}
