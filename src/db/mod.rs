//! Durable Store access (spec.md §2/§3).
//!
//! `DatabaseManager` owns a single connection pool and exposes `withTx`/
//! `withConn`-style helpers (spec.md §9): every query goes through the pool
//! or an explicit transaction borrowed from it, there is no other path to a
//! connection, and release is guaranteed by Rust's scope-exit drop of the
//! `PoolConnection`/`Transaction` guard — no manual try/finally required.

pub mod models;

use anyhow::{anyhow, Result};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::info;

#[derive(Clone)]
pub struct DatabaseManager {
    pool: PgPool,
}

impl DatabaseManager {
    pub async fn new(database_url: &str) -> Result<Self> {
        info!("connecting to durable store");
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| anyhow!("failed to connect to database: {e}"))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| anyhow!("failed to run migrations: {e}"))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'_, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| anyhow!("failed to start transaction: {e}"))
    }
}
