use std::sync::Arc;

use db::SqliteEventStore;
use events::EventBroker;
use orchestrator::{register_builtin, AgentRegistry, Coordinator, RemoteAgent};

use crate::config::ProtocolConfig;
use crate::error::{AppError, StartupError};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<AgentRegistry>,
}

impl AppState {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self { registry }
    }

    /// Build the broker, store and agent registry described by `config`.
    pub async fn from_config(config: &ProtocolConfig) -> Result<Self, StartupError> {
        let mut broker = EventBroker::new().with_retention(config.retention());
        if let Some(url) = &config.storage.database_url {
            let pool = db::connect(url).await?;
            broker = broker.with_store(Arc::new(SqliteEventStore::new(pool)));
            tracing::info!("Event store: {}", url);
        }

        let registry = Arc::new(AgentRegistry::new(broker, config.run_settings()));
        if config.agents.builtin {
            register_builtin(&registry)?;
        }

        for remote in &config.agents.remote {
            let agent = RemoteAgent::connect(remote.name.clone(), &remote.url).await?;
            registry.register(Arc::new(agent))?;
        }

        registry.start_janitor(config.janitor_interval());
        tracing::info!("Serving agents: {}", registry.names().join(", "));

        Ok(Self::new(registry))
    }

    pub fn agent(&self, name: &str) -> Result<Arc<Coordinator>, AppError> {
        Ok(self.registry.get(name)?)
    }
}
