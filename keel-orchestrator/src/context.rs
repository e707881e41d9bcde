//! Scheduler context
//!
//! Everything the dispatch loop, the services and the HTTP handlers share:
//! the store, the concurrency guards, the status catalog and the ordered
//! handler registry. Built once at startup and passed around explicitly.

use keel_core::domain::status::StatusCatalog;
use std::sync::Arc;

use crate::config::Config;
use crate::guard::Guards;
use crate::handler::HandlerRegistry;
use crate::repository::{Store, StoreError};

pub struct SchedulerContext {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub guards: Guards,
    pub catalog: StatusCatalog,
    pub handlers: HandlerRegistry,
}

impl SchedulerContext {
    /// Builds the context, loading operator-defined statuses from the store
    pub async fn new(
        config: Config,
        store: Arc<dyn Store>,
        guards: Guards,
        handlers: HandlerRegistry,
    ) -> Result<Self, StoreError> {
        let statuses = store.list_statuses().await?;
        tracing::info!("Loaded {} custom status(es)", statuses.len());

        Ok(Self {
            config,
            store,
            guards,
            catalog: StatusCatalog::with_statuses(statuses),
            handlers,
        })
    }
}
