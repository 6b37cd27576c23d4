//! ScyllaDB client and connection management

use crate::schema;
use crate::StorageError;
use chatmem_config::StorageConfig;
use scylla::{Session, SessionBuilder};
use std::sync::Arc;

/// ScyllaDB client wrapper shared by every store
#[derive(Clone)]
pub struct ScyllaClient {
    session: Arc<Session>,
    config: StorageConfig,
}

impl ScyllaClient {
    /// Connect to the cluster
    pub async fn connect(config: StorageConfig) -> Result<Self, StorageError> {
        tracing::info!(hosts = ?config.scylla_hosts, keyspace = %config.keyspace, "connecting to ScyllaDB");

        let session = SessionBuilder::new()
            .known_nodes(&config.scylla_hosts)
            .build()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        Ok(Self {
            session: Arc::new(session),
            config,
        })
    }

    /// Create the keyspace and tables if absent
    pub async fn ensure_schema(&self) -> Result<(), StorageError> {
        schema::create_keyspace(
            &self.session,
            &self.config.keyspace,
            self.config.replication_factor,
        )
        .await?;
        schema::create_tables(&self.session, &self.config.keyspace).await?;
        tracing::info!(keyspace = %self.config.keyspace, "schema ensured");
        Ok(())
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn keyspace(&self) -> &str {
        &self.config.keyspace
    }
}
