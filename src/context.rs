use crate::amex::AmexClient;
use crate::config::Config;
use crate::db::{self, Pool};
use crate::dispatch::Dispatcher;
use crate::processor::ItemProcessor;
use crate::queue::SqliteTaskQueue;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Process-wide collaborators, built once from configuration and passed
/// explicitly to whatever needs them.
#[derive(Clone)]
pub struct AppContext {
    pub config: Config,
    pub store: Pool,
    pub queue: Arc<SqliteTaskQueue>,
    pub registry: Arc<AmexClient>,
}

impl AppContext {
    pub async fn from_config(config: Config) -> Result<Self> {
        config.ensure_dirs()?;
        let busy_timeout = Duration::from_secs(config.store.busy_timeout_secs);

        let store = db::init_pool(&config.store_url(), busy_timeout).await?;
        db::run_migrations(&store)
            .await
            .context("failed to migrate the batch store")?;

        let queue = SqliteTaskQueue::connect(&config.queue_url(), busy_timeout, config.queue.name.clone())
            .await
            .context("failed to open the work queue")?;

        let registry = AmexClient::new(&config.amex.api_host, config.amex.credentials.provider())?
            .require_client_cert(config.amex.require_client_cert);

        info!(queue = %config.queue.name, api_host = %config.amex.api_host, "context ready");
        Ok(Self {
            config,
            store,
            queue: Arc::new(queue),
            registry: Arc::new(registry),
        })
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            self.store.clone(),
            self.queue.clone(),
            self.config.queue.retry_policy(),
        )
    }

    pub fn processor(&self) -> ItemProcessor {
        ItemProcessor::new(self.store.clone(), self.registry.clone()).with_claim_hold(self.lease())
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.config.queue.lease_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.app.poll_interval_ms)
    }
}
