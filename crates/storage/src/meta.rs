//! Conversation metadata store
//!
//! Full upserts replace the document; PATCH merges the provided top-level
//! fields into the stored one and fails with NotFound when the group has no
//! metadata yet.

use crate::{ScyllaClient, StorageError};
use async_trait::async_trait;
use chatmem_core::ConversationMeta;
use chrono::Utc;
use scylla::IntoTypedRows;

/// Conversation metadata contract
#[async_trait]
pub trait ConversationMetaStore: Send + Sync {
    async fn upsert(&self, meta: &ConversationMeta) -> Result<(), StorageError>;

    /// Merge `partial` (top-level keys) into the stored metadata
    async fn patch(
        &self,
        group_id: &str,
        partial: &serde_json::Value,
    ) -> Result<ConversationMeta, StorageError>;

    async fn get(&self, group_id: &str) -> Result<Option<ConversationMeta>, StorageError>;
}

/// ScyllaDB implementation
#[derive(Clone)]
pub struct ScyllaConversationMetaStore {
    client: ScyllaClient,
}

impl ScyllaConversationMetaStore {
    pub fn new(client: ScyllaClient) -> Self {
        Self { client }
    }

    fn ks(&self) -> &str {
        self.client.keyspace()
    }
}

/// Merge top-level keys of `partial` into `base`; `group_id` is never
/// overwritten by a patch
pub fn merge_meta(
    base: &ConversationMeta,
    partial: &serde_json::Value,
) -> Result<ConversationMeta, StorageError> {
    let mut doc = serde_json::to_value(base)?;
    let (Some(doc_map), Some(patch_map)) = (doc.as_object_mut(), partial.as_object()) else {
        return Err(StorageError::Serialization(
            "conversation meta patch must be a JSON object".into(),
        ));
    };

    for (key, value) in patch_map {
        if key == "group_id" {
            continue;
        }
        doc_map.insert(key.clone(), value.clone());
    }

    serde_json::from_value(doc).map_err(|e| StorageError::Serialization(e.to_string()))
}

#[async_trait]
impl ConversationMetaStore for ScyllaConversationMetaStore {
    async fn upsert(&self, meta: &ConversationMeta) -> Result<(), StorageError> {
        let meta_json = serde_json::to_string(meta)?;
        let query = format!(
            "INSERT INTO {}.conversation_meta (group_id, meta_json, updated_at_ms) VALUES (?, ?, ?)",
            self.ks()
        );
        self.client
            .session()
            .query_unpaged(
                query,
                (&meta.group_id, &meta_json, Utc::now().timestamp_millis()),
            )
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;

        tracing::debug!(group_id = %meta.group_id, "conversation meta upserted");
        Ok(())
    }

    async fn patch(
        &self,
        group_id: &str,
        partial: &serde_json::Value,
    ) -> Result<ConversationMeta, StorageError> {
        let existing = self
            .get(group_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("conversation meta {group_id}")))?;

        let merged = merge_meta(&existing, partial)?;
        self.upsert(&merged).await?;
        Ok(merged)
    }

    async fn get(&self, group_id: &str) -> Result<Option<ConversationMeta>, StorageError> {
        let query = format!(
            "SELECT meta_json FROM {}.conversation_meta WHERE group_id = ?",
            self.ks()
        );
        let result = self
            .client
            .session()
            .query_unpaged(query, (group_id,))
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;

        if let Some(rows) = result.rows {
            if let Some(row) = rows.into_typed::<(String,)>().next() {
                let (json,) = row.map_err(|e| StorageError::Database(e.to_string()))?;
                return Ok(Some(serde_json::from_str(&json)?));
            }
        }
        Ok(None)
    }
}
