//! Thread-scoped context persistence with TTL
//!
//! Two backends: an in-process TTL cache and Postgres. Both treat an entry
//! older than the TTL as absent and remove it as part of the same read.

use crate::error::{OrchestrationError, Result};
use crate::models::ContextMap;
use crate::session::cache::TtlCache;
use crate::session::clock::{to_chrono, Clock};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, thread_id: &str) -> Result<Option<ContextMap>>;

    async fn set(&self, thread_id: &str, context: &ContextMap) -> Result<()>;
}

pub struct InMemorySessionStore {
    cache: Arc<TtlCache<String, ContextMap>>,
}

impl InMemorySessionStore {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache: Arc::new(TtlCache::new("session", ttl, clock)),
        }
    }

    /// Underlying cache, for attaching a sweeper
    pub fn cache(&self) -> Arc<TtlCache<String, ContextMap>> {
        self.cache.clone()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, thread_id: &str) -> Result<Option<ContextMap>> {
        Ok(self.cache.get(&thread_id.to_string()).await)
    }

    async fn set(&self, thread_id: &str, context: &ContextMap) -> Result<()> {
        self.cache.insert(thread_id.to_string(), context.clone()).await;
        Ok(())
    }
}

pub struct PgSessionStore {
    pool: PgPool,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
    schema_ready: OnceCell<()>,
}

impl PgSessionStore {
    /// Lazily connecting pool; nothing touches the database until first use
    pub fn connect_lazy(database_url: &str, ttl: Duration, clock: Arc<dyn Clock>) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)?;

        info!("Session store backend: postgres");

        Ok(Self {
            pool,
            ttl: to_chrono(ttl),
            clock,
            schema_ready: OnceCell::new(),
        })
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS thread_contexts (
                      thread_id TEXT PRIMARY KEY,
                      context TEXT NOT NULL,
                      updated_at TIMESTAMPTZ NOT NULL
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                OrchestrationError::DatabaseError(format!(
                    "Failed to initialize session schema: {}",
                    e
                ))
            })?;

        Ok(())
    }

    /// Delete every expired row, returning how many were removed
    pub async fn sweep_expired(&self) -> Result<u64> {
        self.ensure_schema().await?;
        let cutoff = self.clock.now() - self.ttl;

        let result = sqlx::query("DELETE FROM thread_contexts WHERE updated_at <= $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn get(&self, thread_id: &str) -> Result<Option<ContextMap>> {
        self.ensure_schema().await?;
        let cutoff = self.clock.now() - self.ttl;

        let mut tx = self.pool.begin().await?;

        let evicted = sqlx::query(
            "DELETE FROM thread_contexts WHERE thread_id = $1 AND updated_at <= $2",
        )
        .bind(thread_id)
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if evicted > 0 {
            debug!(thread_id, "Evicted expired session context on read");
        }

        let row = sqlx::query("SELECT context FROM thread_contexts WHERE thread_id = $1")
            .bind(thread_id)
            .fetch_optional(&mut *tx)
            .await?;

        tx.commit().await?;

        match row {
            Some(row) => {
                let raw: String = row.try_get("context")?;
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, thread_id: &str, context: &ContextMap) -> Result<()> {
        self.ensure_schema().await?;
        let raw = serde_json::to_string(context)?;

        sqlx::query(
            r#"
            INSERT INTO thread_contexts (thread_id, context, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (thread_id)
            DO UPDATE SET context = EXCLUDED.context, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(thread_id)
        .bind(raw)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
