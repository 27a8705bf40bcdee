//! Built-in agents.

mod delegate;
mod echo;
mod remote;

use std::sync::Arc;

use protocol_core::Result;

pub use delegate::DelegateAgent;
pub use echo::EchoAgent;
pub use remote::RemoteAgent;

use crate::registry::AgentRegistry;

/// Register `echo` and a `delegate` agent that forwards to it.
pub fn register_builtin(registry: &AgentRegistry) -> Result<()> {
    let echo = registry.register(Arc::new(EchoAgent::new()))?;
    registry.register(Arc::new(DelegateAgent::new("delegate", echo)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::RunSettings;
    use events::EventBroker;

    #[test]
    fn test_builtin_agents_registered() {
        let registry = AgentRegistry::new(EventBroker::new(), RunSettings::default());
        register_builtin(&registry).unwrap();

        assert_eq!(registry.names(), vec!["delegate", "echo"]);
        assert!(register_builtin(&registry).is_err());
    }
}
