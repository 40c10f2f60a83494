// =============================================================================
// Matrixon Sliding Sync Proxy - Postgresql Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Durable engine backed by PostgreSQL. Every tree is a `matrixon_<name>`
//   table of (key BYTEA, value BYTEA); batches are written in one transaction
//   so a commit is either fully visible or not at all.
//
// =============================================================================

use std::{
    collections::HashSet,
    sync::{Arc, RwLock},
    time::Instant,
};

use async_trait::async_trait;
use deadpool_postgres::{
    tokio_postgres::{self, types::ToSql, NoTls},
    Manager, ManagerConfig, Pool, RecyclingMethod,
};
use tracing::{debug, info};

use super::{next_counter, prefix_upper_bound, KeyValueDatabaseEngine, KvTree};
use crate::{Error, Result};

/// Rows per multi-value INSERT
const BATCH_CHUNK: usize = 1000;

const POOL_SIZE: usize = 16;

pub struct Engine {
    pool: Pool,
    table_schemas: RwLock<HashSet<String>>,
}

impl Engine {
    /// Connect to `database_url` and verify the connection
    pub async fn open(database_url: &str) -> Result<Arc<Self>> {
        let start_time = Instant::now();
        info!("📊 Initializing PostgreSQL connection pool");

        let pg_config: tokio_postgres::Config = database_url
            .parse()
            .map_err(|e| Error::bad_config(format!("Invalid database_url: {e}")))?;

        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );

        let pool = Pool::builder(manager)
            .max_size(POOL_SIZE)
            .build()
            .map_err(|e| Error::bad_config(format!("Failed to create PostgreSQL pool: {e}")))?;

        let client = pool.get().await.map_err(pool_error)?;
        client.execute("SELECT 1", &[]).await.map_err(pg_error)?;

        info!(
            "✅ PostgreSQL connection pool initialized in {:?}",
            start_time.elapsed()
        );

        Ok(Arc::new(Self {
            pool,
            table_schemas: RwLock::new(HashSet::new()),
        }))
    }

    fn schema_known(&self, table_name: &str) -> Result<bool> {
        Ok(self
            .table_schemas
            .read()
            .map_err(|_| Error::bad_database("Schema cache lock poisoned."))?
            .contains(table_name))
    }
}

#[async_trait]
impl KeyValueDatabaseEngine for Arc<Engine> {
    async fn open_tree(&self, name: &'static str) -> Result<Arc<dyn KvTree>> {
        let table_name = format!("matrixon_{}", name.replace('-', "_"));

        if !self.schema_known(&table_name)? {
            let client = self.pool.get().await.map_err(pool_error)?;
            client
                .batch_execute(&format!(
                    "CREATE TABLE IF NOT EXISTS {table_name} (
                        key BYTEA PRIMARY KEY,
                        value BYTEA NOT NULL
                    );"
                ))
                .await
                .map_err(pg_error)?;

            info!("📊 Created table: {}", table_name);
            self.table_schemas
                .write()
                .map_err(|_| Error::bad_database("Schema cache lock poisoned."))?
                .insert(table_name.clone());
        }

        Ok(Arc::new(PostgreSQLTable {
            engine: Arc::clone(self),
            table_name,
        }))
    }

    async fn flush(&self) -> Result<()> {
        // Every statement is committed when it returns
        Ok(())
    }

    fn describe(&self) -> String {
        "postgresql".to_owned()
    }
}

pub struct PostgreSQLTable {
    engine: Arc<Engine>,
    table_name: String,
}

impl PostgreSQLTable {
    async fn process_batch(
        &self,
        transaction: &tokio_postgres::Transaction<'_>,
        batch_data: &[(Vec<u8>, Vec<u8>)],
    ) -> Result<()> {
        if batch_data.is_empty() {
            return Ok(());
        }

        let mut query = format!("INSERT INTO {} (key, value) VALUES ", self.table_name);
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(batch_data.len() * 2);

        for (i, (key, value)) in batch_data.iter().enumerate() {
            if i > 0 {
                query.push_str(", ");
            }
            query.push_str(&format!("(${}, ${})", 2 * i + 1, 2 * i + 2));
            params.push(key);
            params.push(value);
        }

        query.push_str(" ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value");

        transaction
            .execute(query.as_str(), &params)
            .await
            .map_err(pg_error)?;

        Ok(())
    }
}

#[async_trait]
impl KvTree for PostgreSQLTable {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let start_time = Instant::now();
        let client = self.engine.pool.get().await.map_err(pool_error)?;

        let row = client
            .query_opt(
                format!("SELECT value FROM {} WHERE key = $1", self.table_name).as_str(),
                &[&key],
            )
            .await
            .map_err(pg_error)?;

        debug!(
            "📖 GET on table {} took {:?}",
            self.table_name,
            start_time.elapsed()
        );

        Ok(row.map(|row| row.get::<_, Vec<u8>>(0)))
    }

    async fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let client = self.engine.pool.get().await.map_err(pool_error)?;

        client
            .execute(
                format!(
                    "INSERT INTO {} (key, value) VALUES ($1, $2) ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
                    self.table_name
                )
                .as_str(),
                &[&key, &value],
            )
            .await
            .map_err(pg_error)?;

        Ok(())
    }

    async fn insert_batch(&self, batch: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        let start_time = Instant::now();
        let mut client = self.engine.pool.get().await.map_err(pool_error)?;
        let transaction = client.transaction().await.map_err(pg_error)?;

        for chunk in batch.chunks(BATCH_CHUNK) {
            self.process_batch(&transaction, chunk).await?;
        }

        transaction.commit().await.map_err(pg_error)?;

        debug!(
            "📝 Batch of {} rows on table {} took {:?}",
            batch.len(),
            self.table_name,
            start_time.elapsed()
        );

        Ok(())
    }

    async fn remove(&self, key: &[u8]) -> Result<()> {
        let client = self.engine.pool.get().await.map_err(pool_error)?;

        client
            .execute(
                format!("DELETE FROM {} WHERE key = $1", self.table_name).as_str(),
                &[&key],
            )
            .await
            .map_err(pg_error)?;

        Ok(())
    }

    async fn scan_prefix(&self, prefix: Vec<u8>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let client = self.engine.pool.get().await.map_err(pool_error)?;

        let rows = match prefix_upper_bound(&prefix) {
            Some(upper) => {
                client
                    .query(
                        format!(
                            "SELECT key, value FROM {} WHERE key >= $1 AND key < $2 ORDER BY key",
                            self.table_name
                        )
                        .as_str(),
                        &[&prefix, &upper],
                    )
                    .await
            }
            None => {
                client
                    .query(
                        format!(
                            "SELECT key, value FROM {} WHERE key >= $1 ORDER BY key",
                            self.table_name
                        )
                        .as_str(),
                        &[&prefix],
                    )
                    .await
            }
        }
        .map_err(pg_error)?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get::<_, Vec<u8>>(0), row.get::<_, Vec<u8>>(1)))
            .collect())
    }

    async fn increment(&self, key: &[u8]) -> Result<Vec<u8>> {
        let mut client = self.engine.pool.get().await.map_err(pool_error)?;
        let transaction = client.transaction().await.map_err(pg_error)?;

        let old = transaction
            .query_opt(
                format!("SELECT value FROM {} WHERE key = $1 FOR UPDATE", self.table_name)
                    .as_str(),
                &[&key],
            )
            .await
            .map_err(pg_error)?
            .map(|row| row.get::<_, Vec<u8>>(0));

        let new = next_counter(old.as_deref())?;
        self.process_batch(&transaction, &[(key.to_vec(), new.clone())])
            .await?;
        transaction.commit().await.map_err(pg_error)?;

        Ok(new)
    }
}

fn pool_error(e: deadpool_postgres::PoolError) -> Error {
    Error::bad_database(format!("PostgreSQL pool: {e}"))
}

fn pg_error(e: tokio_postgres::Error) -> Error {
    Error::bad_database(format!("PostgreSQL: {e}"))
}
