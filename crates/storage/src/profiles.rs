//! Version-tagged group/user profile store
//!
//! Each upsert writes a new version row and re-normalizes `is_latest`
//! across the pair's versions: exactly one row stays latest, the one with
//! the lexicographically greatest version. Concurrent upserts for one pair
//! are already serialized by the pipeline's per-group lock; this store
//! assumes a single writer per `(user_id, group_id)`.

use crate::{ScyllaClient, StorageError};
use async_trait::async_trait;
use chatmem_core::GroupProfile;
use chrono::{TimeZone, Utc};
use scylla::IntoTypedRows;

/// Closed version interval `[start, end]`; either bound may be open
pub type VersionRange = (Option<String>, Option<String>);

/// Whether `version` falls within the closed range
pub fn version_in_range(version: &str, range: &VersionRange) -> bool {
    if let Some(start) = &range.0 {
        if version < start.as_str() {
            return false;
        }
    }
    if let Some(end) = &range.1 {
        if version > end.as_str() {
            return false;
        }
    }
    true
}

/// The version that must carry `is_latest` after normalization
pub fn latest_version<'a>(versions: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
    versions.into_iter().max()
}

/// Profile store contract
#[async_trait]
pub trait GroupProfileStore: Send + Sync {
    /// Insert a version and re-normalize `is_latest` for the pair
    async fn upsert_version(&self, profile: &GroupProfile) -> Result<(), StorageError>;

    async fn get_latest(
        &self,
        user_id: &str,
        group_id: &str,
    ) -> Result<Option<GroupProfile>, StorageError>;

    /// All versions of a pair, newest version first, optionally bounded
    async fn list_versions(
        &self,
        user_id: &str,
        group_id: &str,
        range: Option<VersionRange>,
    ) -> Result<Vec<GroupProfile>, StorageError>;
}

/// ScyllaDB implementation
#[derive(Clone)]
pub struct ScyllaGroupProfileStore {
    client: ScyllaClient,
}

impl ScyllaGroupProfileStore {
    pub fn new(client: ScyllaClient) -> Self {
        Self { client }
    }

    fn ks(&self) -> &str {
        self.client.keyspace()
    }

    async fn load_all(
        &self,
        user_id: &str,
        group_id: &str,
    ) -> Result<Vec<GroupProfile>, StorageError> {
        let query = format!(
            "SELECT version, is_latest, payload_json, created_at_ms, updated_at_ms \
             FROM {}.group_user_profiles WHERE user_id = ? AND group_id = ?",
            self.ks()
        );
        let result = self
            .client
            .session()
            .query_unpaged(query, (user_id, group_id))
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let mut profiles = Vec::new();
        if let Some(rows) = result.rows {
            for row in rows.into_typed::<(String, bool, String, i64, i64)>() {
                let (version, is_latest, payload_json, created_ms, updated_ms) =
                    row.map_err(|e| StorageError::Database(e.to_string()))?;
                profiles.push(GroupProfile {
                    user_id: user_id.to_string(),
                    group_id: group_id.to_string(),
                    version,
                    is_latest,
                    payload: serde_json::from_str(&payload_json)?,
                    created_at: Utc
                        .timestamp_millis_opt(created_ms)
                        .single()
                        .unwrap_or_else(Utc::now),
                    updated_at: Utc
                        .timestamp_millis_opt(updated_ms)
                        .single()
                        .unwrap_or_else(Utc::now),
                });
            }
        }
        Ok(profiles)
    }

    async fn set_latest_flag(
        &self,
        user_id: &str,
        group_id: &str,
        version: &str,
        is_latest: bool,
    ) -> Result<(), StorageError> {
        let query = format!(
            "UPDATE {}.group_user_profiles SET is_latest = ?, updated_at_ms = ? \
             WHERE user_id = ? AND group_id = ? AND version = ?",
            self.ks()
        );
        self.client
            .session()
            .query_unpaged(
                query,
                (
                    is_latest,
                    Utc::now().timestamp_millis(),
                    user_id,
                    group_id,
                    version,
                ),
            )
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl GroupProfileStore for ScyllaGroupProfileStore {
    async fn upsert_version(&self, profile: &GroupProfile) -> Result<(), StorageError> {
        let payload_json = serde_json::to_string(&profile.payload)?;
        let now_ms = Utc::now().timestamp_millis();

        let insert = format!(
            "INSERT INTO {}.group_user_profiles \
             (user_id, group_id, version, is_latest, payload_json, created_at_ms, updated_at_ms) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            self.ks()
        );
        self.client
            .session()
            .query_unpaged(
                insert,
                (
                    &profile.user_id,
                    &profile.group_id,
                    &profile.version,
                    false,
                    &payload_json,
                    profile.created_at.timestamp_millis(),
                    now_ms,
                ),
            )
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;

        // Re-normalize: the lexicographically greatest version wins
        let all = self.load_all(&profile.user_id, &profile.group_id).await?;
        let winner = latest_version(all.iter().map(|p| p.version.as_str()))
            .map(str::to_string)
            .unwrap_or_else(|| profile.version.clone());

        for existing in &all {
            let should_be_latest = existing.version == winner;
            if existing.is_latest != should_be_latest {
                self.set_latest_flag(
                    &profile.user_id,
                    &profile.group_id,
                    &existing.version,
                    should_be_latest,
                )
                .await?;
            }
        }
        // The freshly inserted row is in `all` (query after insert), so the
        // loop above covers it too.

        tracing::debug!(
            user_id = %profile.user_id,
            group_id = %profile.group_id,
            version = %profile.version,
            latest = %winner,
            "profile version upserted"
        );
        Ok(())
    }

    async fn get_latest(
        &self,
        user_id: &str,
        group_id: &str,
    ) -> Result<Option<GroupProfile>, StorageError> {
        let all = self.load_all(user_id, group_id).await?;
        Ok(all.into_iter().find(|p| p.is_latest))
    }

    async fn list_versions(
        &self,
        user_id: &str,
        group_id: &str,
        range: Option<VersionRange>,
    ) -> Result<Vec<GroupProfile>, StorageError> {
        let mut all = self.load_all(user_id, group_id).await?;
        if let Some(range) = range {
            all.retain(|p| version_in_range(&p.version, &range));
        }
        all.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(all)
    }
}
