//! Marker backends
//!
//! A marker is a keyed, expiring, owned flag. The PostgreSQL backend makes
//! markers visible to every scheduler process sharing the database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::repository::StoreError;

#[async_trait]
pub trait MarkerStore: Send + Sync {
    /// Sets the marker unless a live one exists. Returns whether it was set.
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Removes the marker if `owner` still holds it
    async fn release(&self, key: &str, owner: &str) -> Result<(), StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Removes the marker regardless of owner. Returns whether one was set.
    async fn clear(&self, key: &str) -> Result<bool, StoreError>;
}

fn expiry(ttl: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(60))
}

pub struct PgMarkerStore {
    pool: PgPool,
}

impl PgMarkerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MarkerStore for PgMarkerStore {
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        sqlx::query("DELETE FROM markers WHERE key = $1 AND expires_at < $2")
            .bind(key)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        let result = sqlx::query(
            r#"
            INSERT INTO markers (key, owner, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(owner)
        .bind(expiry(ttl))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM markers WHERE key = $1 AND owner = $2")
            .bind(key)
            .bind(owner)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let found = sqlx::query_scalar::<_, String>(
            "SELECT key FROM markers WHERE key = $1 AND expires_at >= $2",
        )
        .bind(key)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        Ok(found.is_some())
    }

    async fn clear(&self, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM markers WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// Markers local to one process
#[derive(Default)]
pub struct MemoryMarkerStore {
    /// key -> (owner, expires_at)
    markers: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
}

impl MemoryMarkerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MarkerStore for MemoryMarkerStore {
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut markers = self.markers.lock().await;
        let now = Utc::now();

        if let Some((_, expires_at)) = markers.get(key) {
            if *expires_at >= now {
                return Ok(false);
            }
        }

        markers.insert(key.to_string(), (owner.to_string(), expiry(ttl)));
        Ok(true)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<(), StoreError> {
        let mut markers = self.markers.lock().await;
        if markers.get(key).is_some_and(|(holder, _)| holder == owner) {
            markers.remove(key);
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let markers = self.markers.lock().await;
        Ok(markers
            .get(key)
            .is_some_and(|(_, expires_at)| *expires_at >= Utc::now()))
    }

    async fn clear(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.markers.lock().await.remove(key).is_some())
    }
}
