//! Concurrency Guards
//!
//! Two keyed markers shared by every scheduler process:
//!
//! - completing: `"<pipeline_instance_id>__<action_id>"`, held while a
//!   completion callback is applied so racing callbacks for the same action
//!   back off instead of double-applying the cascade
//! - calculating: one per pipeline-instance, held for the duration of a
//!   cascade so liveness reclaims and resets wait for it to finish
//!
//! Contention is resolved with bounded, jittered retries. When the bound is
//! exhausted the caller proceeds without the marker.

pub mod marker;

pub use marker::{MarkerStore, MemoryMarkerStore, PgMarkerStore};

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

use crate::repository::StoreError;

#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Expiry of a marker whose holder crashed
    pub ttl: Duration,
    pub completing_retries: u32,
    pub calculation_retries: u32,
    pub min_backoff: Duration,
    pub max_jitter: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            completing_retries: 10,
            calculation_retries: 20,
            min_backoff: Duration::from_millis(50),
            max_jitter: Duration::from_millis(250),
        }
    }
}

/// A marker held (or not) by this process
#[derive(Debug)]
#[must_use]
pub struct Lease {
    key: String,
    owned: bool,
}

impl Lease {
    pub fn is_owned(&self) -> bool {
        self.owned
    }
}

pub struct Guards {
    markers: Arc<dyn MarkerStore>,
    /// Identifies this process as a marker holder
    owner: String,
    config: GuardConfig,
}

impl Guards {
    pub fn new(markers: Arc<dyn MarkerStore>, config: GuardConfig) -> Self {
        Self {
            markers,
            owner: uuid::Uuid::new_v4().to_string(),
            config,
        }
    }

    pub fn completing_key(pipeline_instance_id: i64, action_id: i64) -> String {
        format!("{}__{}", pipeline_instance_id, action_id)
    }

    pub fn calculating_key(pipeline_instance_id: i64) -> String {
        format!("calculating__{}", pipeline_instance_id)
    }

    async fn backoff(&self) {
        let jitter_ms = self.config.max_jitter.as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        tokio::time::sleep(self.config.min_backoff + Duration::from_millis(jitter)).await;
    }

    async fn acquire(&self, key: String, retries: u32) -> Result<Lease, StoreError> {
        for attempt in 0..=retries {
            if self
                .markers
                .try_acquire(&key, &self.owner, self.config.ttl)
                .await?
            {
                return Ok(Lease { key, owned: true });
            }

            tracing::debug!("Marker {} is held elsewhere (attempt {})", key, attempt + 1);
            if attempt < retries {
                self.backoff().await;
            }
        }

        tracing::warn!(
            "Marker {} still held after {} retries, proceeding without it",
            key,
            retries
        );
        Ok(Lease { key, owned: false })
    }

    /// Takes the completing marker for one action of one pipeline-instance
    pub async fn acquire_completing(
        &self,
        pipeline_instance_id: i64,
        action_id: i64,
    ) -> Result<Lease, StoreError> {
        self.acquire(
            Self::completing_key(pipeline_instance_id, action_id),
            self.config.completing_retries,
        )
        .await
    }

    /// Takes the calculating marker of a pipeline-instance for a cascade
    pub async fn begin_calculation(&self, pipeline_instance_id: i64) -> Result<Lease, StoreError> {
        self.acquire(
            Self::calculating_key(pipeline_instance_id),
            self.config.calculation_retries,
        )
        .await
    }

    /// Waits for a running cascade on the pipeline-instance to finish.
    /// Returns false if it was still running when the retries ran out.
    pub async fn wait_for_calculation(&self, pipeline_instance_id: i64) -> Result<bool, StoreError> {
        let key = Self::calculating_key(pipeline_instance_id);

        for attempt in 0..=self.config.calculation_retries {
            if !self.markers.exists(&key).await? {
                return Ok(true);
            }
            if attempt < self.config.calculation_retries {
                self.backoff().await;
            }
        }

        Ok(false)
    }

    pub async fn release(&self, lease: Lease) -> Result<(), StoreError> {
        if lease.owned {
            self.markers.release(&lease.key, &self.owner).await?;
        }
        Ok(())
    }

    pub async fn is_completing(
        &self,
        pipeline_instance_id: i64,
        action_id: i64,
    ) -> Result<bool, StoreError> {
        self.markers
            .exists(&Self::completing_key(pipeline_instance_id, action_id))
            .await
    }

    /// Operator escape hatch for a marker left behind by a crashed process
    pub async fn clear_completing(
        &self,
        pipeline_instance_id: i64,
        action_id: i64,
    ) -> Result<bool, StoreError> {
        self.markers
            .clear(&Self::completing_key(pipeline_instance_id, action_id))
            .await
    }

    pub async fn is_calculating(&self, pipeline_instance_id: i64) -> Result<bool, StoreError> {
        self.markers
            .exists(&Self::calculating_key(pipeline_instance_id))
            .await
    }
}

#[cfg(test)]
pub(crate) fn fast_config() -> GuardConfig {
    GuardConfig {
        ttl: Duration::from_secs(60),
        completing_retries: 2,
        calculation_retries: 2,
        min_backoff: Duration::from_millis(1),
        max_jitter: Duration::from_millis(2),
    }
}
