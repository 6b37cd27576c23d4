//! Memory record document store
//!
//! Records are stored twice: the full JSON document under its event id
//! (source of truth), and a slim row per owning scope in a query table that
//! serves paginated fetches ordered by timestamp.

use crate::{DeleteFilter, ScyllaClient, StorageError};
use async_trait::async_trait;
use chatmem_core::{MemoryRecord, RecordType};
use chrono::Utc;
use scylla::IntoTypedRows;

/// Sort direction for fetches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Desc,
    Asc,
}

impl SortOrder {
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("asc") {
            Self::Asc
        } else {
            Self::Desc
        }
    }
}

/// One page of fetched records
#[derive(Debug, Clone, Default)]
pub struct FetchPage {
    pub records: Vec<MemoryRecord>,
    pub total_count: usize,
    pub has_more: bool,
}

/// The owning scope a record is filed under: its user for personal records,
/// its group otherwise
pub fn owner_of(record: &MemoryRecord) -> &str {
    if record.user_id.is_empty() {
        &record.group_id
    } else {
        &record.user_id
    }
}

/// Document store contract
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert(&self, record: &MemoryRecord) -> Result<(), StorageError>;

    async fn get(&self, event_id: &str) -> Result<Option<MemoryRecord>, StorageError>;

    /// Fetch several records, preserving the id order; missing ids are
    /// silently dropped
    async fn get_many(&self, event_ids: &[String]) -> Result<Vec<MemoryRecord>, StorageError>;

    /// Returns whether the record existed
    async fn delete_by_event_id(&self, event_id: &str) -> Result<bool, StorageError>;

    async fn delete_by_filters(&self, filter: &DeleteFilter) -> Result<u64, StorageError>;

    /// Paginated fetch for one owner scope
    async fn fetch_page(
        &self,
        owner_id: &str,
        record_type: Option<RecordType>,
        limit: usize,
        offset: usize,
        sort: SortOrder,
    ) -> Result<FetchPage, StorageError>;
}

/// ScyllaDB implementation
#[derive(Clone)]
pub struct ScyllaRecordStore {
    client: ScyllaClient,
}

impl ScyllaRecordStore {
    pub fn new(client: ScyllaClient) -> Self {
        Self { client }
    }

    fn ks(&self) -> &str {
        self.client.keyspace()
    }

    /// Event ids for one owner, newest first, optionally time-bounded
    async fn owner_event_ids(
        &self,
        owner_id: &str,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        sort: SortOrder,
    ) -> Result<Vec<(String, String)>, StorageError> {
        let mut query = format!(
            "SELECT event_id, record_type FROM {}.memory_records_by_owner WHERE owner_id = ?",
            self.ks()
        );
        if start_ms.is_some() {
            query.push_str(" AND timestamp_ms >= ?");
        }
        if end_ms.is_some() {
            query.push_str(" AND timestamp_ms <= ?");
        }
        if matches!(sort, SortOrder::Asc) {
            query.push_str(" ORDER BY timestamp_ms ASC");
        }

        let result = match (start_ms, end_ms) {
            (Some(s), Some(e)) => {
                self.client
                    .session()
                    .query_unpaged(query, (owner_id, s, e))
                    .await
            }
            (Some(s), None) => {
                self.client
                    .session()
                    .query_unpaged(query, (owner_id, s))
                    .await
            }
            (None, Some(e)) => {
                self.client
                    .session()
                    .query_unpaged(query, (owner_id, e))
                    .await
            }
            (None, None) => {
                self.client
                    .session()
                    .query_unpaged(query, (owner_id,))
                    .await
            }
        }
        .map_err(|e| StorageError::Database(e.to_string()))?;

        let mut out = Vec::new();
        if let Some(rows) = result.rows {
            for row in rows.into_typed::<(String, String)>() {
                let (event_id, record_type) =
                    row.map_err(|e| StorageError::Database(e.to_string()))?;
                out.push((event_id, record_type));
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl RecordStore for ScyllaRecordStore {
    async fn insert(&self, record: &MemoryRecord) -> Result<(), StorageError> {
        let record_json = serde_json::to_string(record)?;
        let now_ms = Utc::now().timestamp_millis();

        let insert_record = format!(
            "INSERT INTO {}.memory_records \
             (event_id, user_id, group_id, record_type, timestamp_ms, record_json, created_at_ms, updated_at_ms) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            self.ks()
        );
        self.client
            .session()
            .query_unpaged(
                insert_record,
                (
                    &record.event_id,
                    &record.user_id,
                    &record.group_id,
                    record.record_type.as_str(),
                    record.timestamp.timestamp_millis(),
                    &record_json,
                    record.created_at.timestamp_millis(),
                    now_ms,
                ),
            )
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let insert_owner = format!(
            "INSERT INTO {}.memory_records_by_owner (owner_id, timestamp_ms, event_id, record_type) \
             VALUES (?, ?, ?, ?)",
            self.ks()
        );
        self.client
            .session()
            .query_unpaged(
                insert_owner,
                (
                    owner_of(record),
                    record.timestamp.timestamp_millis(),
                    &record.event_id,
                    record.record_type.as_str(),
                ),
            )
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;

        tracing::debug!(event_id = %record.event_id, owner = owner_of(record), "record inserted");
        Ok(())
    }

    async fn get(&self, event_id: &str) -> Result<Option<MemoryRecord>, StorageError> {
        let query = format!(
            "SELECT record_json FROM {}.memory_records WHERE event_id = ?",
            self.ks()
        );
        let result = self
            .client
            .session()
            .query_unpaged(query, (event_id,))
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;

        if let Some(rows) = result.rows {
            if let Some(row) = rows.into_typed::<(String,)>().next() {
                let (json,) = row.map_err(|e| StorageError::Database(e.to_string()))?;
                let record: MemoryRecord = serde_json::from_str(&json)?;
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    async fn get_many(&self, event_ids: &[String]) -> Result<Vec<MemoryRecord>, StorageError> {
        let mut records = Vec::with_capacity(event_ids.len());
        for event_id in event_ids {
            if let Some(record) = self.get(event_id).await? {
                records.push(record);
            } else {
                tracing::warn!(event_id = %event_id, "referenced record missing from document store");
            }
        }
        Ok(records)
    }

    async fn delete_by_event_id(&self, event_id: &str) -> Result<bool, StorageError> {
        // The owner-table row needs the record's scope and timestamp
        let Some(record) = self.get(event_id).await? else {
            return Ok(false);
        };

        let delete_record = format!(
            "DELETE FROM {}.memory_records WHERE event_id = ?",
            self.ks()
        );
        self.client
            .session()
            .query_unpaged(delete_record, (event_id,))
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let delete_owner = format!(
            "DELETE FROM {}.memory_records_by_owner WHERE owner_id = ? AND timestamp_ms = ? AND event_id = ?",
            self.ks()
        );
        self.client
            .session()
            .query_unpaged(
                delete_owner,
                (
                    owner_of(&record),
                    record.timestamp.timestamp_millis(),
                    event_id,
                ),
            )
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;

        tracing::debug!(event_id, "record deleted");
        Ok(true)
    }

    async fn delete_by_filters(&self, filter: &DeleteFilter) -> Result<u64, StorageError> {
        filter.validate()?;

        let mut deleted = 0u64;
        let owners: Vec<&String> = [filter.user_id.as_ref(), filter.group_id.as_ref()]
            .into_iter()
            .flatten()
            .filter(|o| !o.is_empty())
            .collect();

        for owner in owners {
            let ids = self
                .owner_event_ids(owner, filter.start_ms, filter.end_ms, SortOrder::Desc)
                .await?;
            for (event_id, _) in ids {
                if self.delete_by_event_id(&event_id).await? {
                    deleted += 1;
                }
            }
        }

        tracing::info!(deleted, "records deleted by filter");
        Ok(deleted)
    }

    async fn fetch_page(
        &self,
        owner_id: &str,
        record_type: Option<RecordType>,
        limit: usize,
        offset: usize,
        sort: SortOrder,
    ) -> Result<FetchPage, StorageError> {
        let all = self.owner_event_ids(owner_id, None, None, sort).await?;

        let matching: Vec<String> = all
            .into_iter()
            .filter(|(_, kind)| {
                record_type.map_or(true, |wanted| RecordType::parse(kind) == wanted)
            })
            .map(|(id, _)| id)
            .collect();

        let total_count = matching.len();
        let page_ids: Vec<String> = matching.into_iter().skip(offset).take(limit).collect();
        let records = self.get_many(&page_ids).await?;

        Ok(FetchPage {
            has_more: offset + records.len() < total_count,
            total_count,
            records,
        })
    }
}
