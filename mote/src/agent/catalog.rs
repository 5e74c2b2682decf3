//! The live agent catalog.
//!
//! Agents are hot-mutable: a management surface may add or remove entries
//! while sessions run. Readers therefore take snapshots per call and never
//! cache entries across transitions. The catalog is cheap to clone; all
//! clones share the same underlying map.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::config::AgentConfig;

/// Injected catalog lookup: `name -> Option<AgentConfig>` snapshot.
pub type AgentLookup = Arc<dyn Fn(&str) -> Option<AgentConfig> + Send + Sync>;

/// A guarded, hot-mutable registry of agent definitions.
#[derive(Debug, Clone, Default)]
pub struct AgentCatalog {
    agents: Arc<RwLock<HashMap<String, AgentConfig>>>,
}

impl AgentCatalog {
    /// Create an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an agent definition.
    pub fn insert(&self, config: AgentConfig) {
        let mut agents = self.agents.write().expect("catalog lock poisoned");
        agents.insert(config.name.clone(), config);
    }

    /// Remove an agent by name, returning the removed definition.
    pub fn remove(&self, name: &str) -> Option<AgentConfig> {
        let mut agents = self.agents.write().expect("catalog lock poisoned");
        agents.remove(name)
    }

    /// Snapshot an agent definition by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<AgentConfig> {
        let agents = self.agents.read().expect("catalog lock poisoned");
        agents.get(name).cloned()
    }

    /// Whether an agent with the given name exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        let agents = self.agents.read().expect("catalog lock poisoned");
        agents.contains_key(name)
    }

    /// Names of all registered agents, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let agents = self.agents.read().expect("catalog lock poisoned");
        let mut names: Vec<String> = agents.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered agents.
    #[must_use]
    pub fn len(&self) -> usize {
        let agents = self.agents.read().expect("catalog lock poisoned");
        agents.len()
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build an injectable lookup closure over this catalog.
    ///
    /// Each call re-reads the catalog, so live edits are visible at the
    /// next transition.
    #[must_use]
    pub fn lookup_fn(&self) -> AgentLookup {
        let catalog = self.clone();
        Arc::new(move |name| catalog.get(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_sees_live_edits() {
        let catalog = AgentCatalog::new();
        let lookup = catalog.lookup_fn();

        assert!(lookup("worker").is_none());
        catalog.insert(AgentConfig::new("worker"));
        assert!(lookup("worker").is_some());
        catalog.remove("worker");
        assert!(lookup("worker").is_none());
    }

    #[test]
    fn clones_share_the_same_map() {
        let catalog = AgentCatalog::new();
        let view = catalog.clone();
        catalog.insert(AgentConfig::new("alpha"));
        assert!(view.contains("alpha"));
    }

    #[test]
    fn names_are_sorted() {
        let catalog = AgentCatalog::new();
        catalog.insert(AgentConfig::new("zeta"));
        catalog.insert(AgentConfig::new("alpha"));
        assert_eq!(catalog.names(), vec!["alpha", "zeta"]);
    }
}
