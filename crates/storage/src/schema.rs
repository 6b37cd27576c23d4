//! ScyllaDB schema creation

use crate::StorageError;
use scylla::Session;

/// Create the keyspace if it doesn't exist
pub async fn create_keyspace(
    session: &Session,
    keyspace: &str,
    replication_factor: u8,
) -> Result<(), StorageError> {
    let query = format!(
        "CREATE KEYSPACE IF NOT EXISTS {} WITH replication = {{'class': 'SimpleStrategy', 'replication_factor': {}}}",
        keyspace, replication_factor
    );

    session
        .query_unpaged(query, &[])
        .await
        .map_err(|e| StorageError::Schema(format!("failed to create keyspace: {e}")))?;

    Ok(())
}

/// Create all required tables
pub async fn create_tables(session: &Session, keyspace: &str) -> Result<(), StorageError> {
    // Source-of-truth records, keyed by event id. The full record is one
    // JSON document; the extra columns exist for direct lookups and the
    // compensating-delete path.
    let records_table = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {}.memory_records (
            event_id TEXT,
            user_id TEXT,
            group_id TEXT,
            record_type TEXT,
            timestamp_ms BIGINT,
            record_json TEXT,
            created_at_ms BIGINT,
            updated_at_ms BIGINT,
            PRIMARY KEY (event_id)
        )
    "#,
        keyspace
    );

    session
        .query_unpaged(records_table, &[])
        .await
        .map_err(|e| StorageError::Schema(format!("failed to create memory_records: {e}")))?;

    // Query table for paginated fetches, partitioned by the owning scope
    // (user_id for personal records, group_id for group records).
    let records_by_owner = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {}.memory_records_by_owner (
            owner_id TEXT,
            timestamp_ms BIGINT,
            event_id TEXT,
            record_type TEXT,
            PRIMARY KEY ((owner_id), timestamp_ms, event_id)
        ) WITH CLUSTERING ORDER BY (timestamp_ms DESC, event_id ASC)
    "#,
        keyspace
    );

    session
        .query_unpaged(records_by_owner, &[])
        .await
        .map_err(|e| {
            StorageError::Schema(format!("failed to create memory_records_by_owner: {e}"))
        })?;

    // Version-tagged profile aggregates; clustering DESC puts the greatest
    // version first, which is also the is_latest row after normalization.
    let profiles_table = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {}.group_user_profiles (
            user_id TEXT,
            group_id TEXT,
            version TEXT,
            is_latest BOOLEAN,
            payload_json TEXT,
            created_at_ms BIGINT,
            updated_at_ms BIGINT,
            PRIMARY KEY ((user_id, group_id), version)
        ) WITH CLUSTERING ORDER BY (version DESC)
    "#,
        keyspace
    );

    session
        .query_unpaged(profiles_table, &[])
        .await
        .map_err(|e| StorageError::Schema(format!("failed to create group_user_profiles: {e}")))?;

    // Group conversation metadata, upserted by the chat system
    let meta_table = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {}.conversation_meta (
            group_id TEXT,
            meta_json TEXT,
            updated_at_ms BIGINT,
            PRIMARY KEY (group_id)
        )
    "#,
        keyspace
    );

    session
        .query_unpaged(meta_table, &[])
        .await
        .map_err(|e| StorageError::Schema(format!("failed to create conversation_meta: {e}")))?;

    Ok(())
}
