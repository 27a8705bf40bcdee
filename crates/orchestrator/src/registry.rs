use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use events::EventBroker;
use protocol_core::{AgentEntry, ProtocolError, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapter::AgentAdapter;
use crate::coordinator::{Coordinator, RunSettings};

/// All agents served by one process, keyed by name.
///
/// Every coordinator shares the registry's [`EventBroker`], so one janitor
/// and one store cover every run.
pub struct AgentRegistry {
    agents: RwLock<BTreeMap<String, Arc<Coordinator>>>,
    broker: EventBroker,
    settings: RunSettings,
    janitor: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl AgentRegistry {
    /// Empty registry whose agents share `broker` and `settings`.
    pub fn new(broker: EventBroker, settings: RunSettings) -> Self {
        Self {
            agents: RwLock::new(BTreeMap::new()),
            broker,
            settings,
            janitor: Mutex::new(None),
        }
    }

    /// Broker shared by every registered agent.
    pub fn broker(&self) -> &EventBroker {
        &self.broker
    }

    /// Run settings applied to every registered agent.
    pub fn settings(&self) -> RunSettings {
        self.settings
    }

    /// Register an adapter under the name from its descriptor.
    pub fn register(&self, adapter: Arc<dyn AgentAdapter>) -> Result<Arc<Coordinator>> {
        let coordinator = Coordinator::new(adapter, self.broker.clone()).with_settings(self.settings);
        let name = coordinator.name().to_string();
        validate_name(&name)?;

        let mut agents = self.agents.write().unwrap_or_else(|p| p.into_inner());
        if agents.contains_key(&name) {
            return Err(ProtocolError::validation(format!(
                "Agent '{}' is already registered",
                name
            )));
        }

        let coordinator = Arc::new(coordinator);
        agents.insert(name.clone(), Arc::clone(&coordinator));
        info!(agent = %name, "Agent registered");
        Ok(coordinator)
    }

    /// Coordinator of the agent called `name`.
    pub fn get(&self, name: &str) -> Result<Arc<Coordinator>> {
        self.agents
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| ProtocolError::UnknownAgent(name.to_string()))
    }

    /// Registered agent names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.agents
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Index of served agents, sorted by name.
    pub fn entries(&self) -> Vec<AgentEntry> {
        self.names().into_iter().map(AgentEntry::for_agent).collect()
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.agents.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// True when no agent is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start evicting expired logs. No-op when logs are kept forever or a
    /// janitor is already running.
    pub fn start_janitor(&self, interval: Duration) {
        if self.broker.retention().evict_after.is_none() {
            return;
        }

        let mut janitor = self.janitor.lock().unwrap_or_else(|p| p.into_inner());
        if janitor.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let handle = self.broker.spawn_janitor(interval, token.clone());
        *janitor = Some((token, handle));
    }

    /// Whether the eviction janitor is running.
    pub fn janitor_running(&self) -> bool {
        self.janitor
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    /// Stop the janitor and cancel every live run.
    pub async fn shutdown(&self) {
        let janitor = self
            .janitor
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some((token, handle)) = janitor {
            token.cancel();
            if let Err(e) = handle.await {
                warn!("Janitor task ended abnormally: {}", e);
            }
        }

        let coordinators: Vec<Arc<Coordinator>> = self
            .agents
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        for coordinator in coordinators {
            coordinator.shutdown().await;
        }
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ProtocolError::validation(format!(
            "Invalid agent name '{}': use letters, digits, '-' or '_'",
            name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AgentContext, AgentStep, AgentStream};
    use events::RetentionPolicy;
    use futures::StreamExt;
    use protocol_core::AgentDescriptor;

    struct Named(&'static str);

    impl AgentAdapter for Named {
        fn describe(&self) -> AgentDescriptor {
            AgentDescriptor::new(self.0, "test")
        }

        fn start(&self, _ctx: AgentContext) -> AgentStream {
            futures::stream::iter(vec![AgentStep::success()]).boxed()
        }
    }

    fn registry() -> AgentRegistry {
        AgentRegistry::new(EventBroker::new(), RunSettings::default())
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = registry();
        registry.register(Arc::new(Named("zeta"))).unwrap();
        registry.register(Arc::new(Named("alpha"))).unwrap();

        assert_eq!(registry.get("zeta").unwrap().name(), "zeta");
        assert!(matches!(
            registry.get("missing"),
            Err(ProtocolError::UnknownAgent(name)) if name == "missing"
        ));

        let entries = registry.entries();
        assert_eq!(entries[0], AgentEntry::for_agent("alpha"));
        assert_eq!(entries[1].path, "/zeta");
    }

    #[test]
    fn test_duplicate_and_invalid_names_rejected() {
        let registry = registry();
        registry.register(Arc::new(Named("echo"))).unwrap();

        assert!(registry.register(Arc::new(Named("echo"))).is_err());
        assert!(registry.register(Arc::new(Named("has space"))).is_err());
        assert!(registry.register(Arc::new(Named(""))).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_janitor_only_runs_with_retention() {
        let keep = registry();
        keep.start_janitor(Duration::from_millis(10));
        assert!(!keep.janitor_running());

        let evicting = AgentRegistry::new(
            EventBroker::new().with_retention(RetentionPolicy::evict_after(Duration::from_secs(60))),
            RunSettings::default(),
        );
        evicting.start_janitor(Duration::from_millis(10));
        assert!(evicting.janitor_running());

        evicting.shutdown().await;
        assert!(!evicting.janitor_running());
    }
}
