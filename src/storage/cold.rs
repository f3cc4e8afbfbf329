//! Cold storage tier: content-addressed archive over the IPFS HTTP API.
//!
//! One object per archived batch; the returned content hash becomes the
//! `archive_ref` annotated onto warm rows. A Keccak-256 checksum travels
//! inside each object so integrity survives independently of the transport.

use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

use crate::config::IpfsConfig;
use crate::error::CoreError;
use crate::models::Order;

pub struct ColdStore {
    api_url: String,
    client: reqwest::Client,
}

/// The archived payload: a batch of terminal orders plus its checksum.
#[derive(Debug, Serialize, Deserialize)]
pub struct ArchiveBatch {
    pub orders: Vec<Order>,
    pub checksum: String,
    pub archived_at: i64,
}

impl ArchiveBatch {
    pub fn new(orders: Vec<Order>, archived_at: i64) -> Result<Self, CoreError> {
        let body = serde_json::to_vec(&orders)
            .map_err(|e| CoreError::Fatal(format!("archive serialization: {e}")))?;
        Ok(ArchiveBatch {
            orders,
            checksum: keccak_hex(&body),
            archived_at,
        })
    }

    pub fn verify(&self) -> Result<(), CoreError> {
        let body = serde_json::to_vec(&self.orders)
            .map_err(|e| CoreError::Fatal(format!("archive serialization: {e}")))?;
        if keccak_hex(&body) != self.checksum {
            return Err(CoreError::Fatal("archive checksum mismatch".into()));
        }
        Ok(())
    }
}

pub fn keccak_hex(data: &[u8]) -> String {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[derive(Deserialize)]
struct AddResponse {
    #[serde(rename = "Hash")]
    hash: String,
}

impl ColdStore {
    pub fn new(config: &IpfsConfig) -> Self {
        ColdStore {
            api_url: config.api_url(),
            client: reqwest::Client::new(),
        }
    }

    /// Write a batch and return its content address.
    pub async fn put_batch(&self, batch: &ArchiveBatch) -> Result<String, CoreError> {
        let body = serde_json::to_vec(batch)
            .map_err(|e| CoreError::Fatal(format!("archive serialization: {e}")))?;

        let part = reqwest::multipart::Part::bytes(body).file_name("batch.json");
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(format!("{}/add", self.api_url))
            .multipart(form)
            .send()
            .await?
            .error_for_status()?;

        let added: AddResponse = response.json().await?;
        tracing::debug!(cid = %added.hash, orders = batch.orders.len(), "archived batch to cold tier");
        Ok(added.hash)
    }

    /// Read a batch back by its content address; explicit historical
    /// lookups only, never on the operational path.
    pub async fn get_batch(&self, archive_ref: &str) -> Result<ArchiveBatch, CoreError> {
        let response = self
            .client
            .post(format!("{}/cat", self.api_url))
            .query(&[("arg", archive_ref)])
            .send()
            .await?
            .error_for_status()?;

        let bytes = response.bytes().await?;
        let batch: ArchiveBatch = serde_json::from_slice(&bytes)
            .map_err(|e| CoreError::Transient(format!("corrupt archive object: {e}")))?;
        batch.verify()?;
        Ok(batch)
    }

    /// Locate one archived order inside its batch.
    pub async fn get_order(
        &self,
        archive_ref: &str,
        order_id: &uuid::Uuid,
    ) -> Result<Option<Order>, CoreError> {
        let batch = self.get_batch(archive_ref).await?;
        Ok(batch.orders.into_iter().find(|o| &o.id == order_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderType, Side};
    use crate::precision::Amount;

    #[test]
    fn checksum_is_stable_and_detects_tampering() {
        let order = Order::new("alice", "XOM/USDT", OrderType::Limit, Side::Buy, Amount::from_u64(5), 1);
        let batch = ArchiveBatch::new(vec![order], 100).unwrap();
        assert!(batch.verify().is_ok());

        let mut tampered = ArchiveBatch::new(batch.orders.clone(), 100).unwrap();
        tampered.orders[0].filled = Amount::from_u64(1);
        tampered.checksum = batch.checksum.clone();
        assert!(tampered.verify().is_err());
    }

    #[test]
    fn keccak_hex_known_vector() {
        // Keccak-256 of the empty string.
        assert_eq!(
            keccak_hex(b""),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }
}
