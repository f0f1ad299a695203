//! Content restriction policy.
//!
//! A pure predicate deciding which block states may be replicated into
//! the target region. The engine consults it during scanning (simple
//! candidates) and again at complex-candidate placement; it never
//! decides anything else.

use ahash::AHashSet;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::world::BlockState;

/// Set of banned block identifiers, built from config.
#[derive(Debug, Clone, Default)]
pub struct ContentPolicy {
    banned: AHashSet<String>,
}

impl ContentPolicy {
    /// Builds a policy from the configured banned-block list.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        let mut policy = Self::default();
        policy.reload(config);
        policy
    }

    /// Rebuilds the banned set from config (used on config reload).
    pub fn reload(&mut self, config: &EngineConfig) {
        self.banned.clear();
        for id in &config.banned_blocks {
            let id = id.trim();
            if id.is_empty() {
                warn!("Ignoring empty banned-block entry");
                continue;
            }
            self.banned.insert(id.to_string());
        }
        debug!("Content policy initialized with {} entries", self.banned.len());
    }

    /// Checks whether a block state may not be replicated.
    #[must_use]
    pub fn is_banned(&self, state: &BlockState) -> bool {
        self.banned.contains(state.id())
    }

    /// Number of banned identifiers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.banned.len()
    }

    /// Whether the policy bans nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.banned.is_empty()
    }
}

impl FromIterator<String> for ContentPolicy {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self {
            banned: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_bans_configured_blocks() {
        let policy = ContentPolicy::from_config(&EngineConfig::default());
        assert!(policy.is_banned(&BlockState::new("ender_chest")));
        assert!(!policy.is_banned(&BlockState::new("stone")));
    }

    #[test]
    fn test_empty_entries_skipped() {
        let config = EngineConfig {
            banned_blocks: vec![String::new(), "  ".to_string(), "tnt".to_string()],
            ..Default::default()
        };
        let policy = ContentPolicy::from_config(&config);
        assert_eq!(policy.len(), 1);
        assert!(policy.is_banned(&BlockState::new("tnt")));
    }

    #[test]
    fn test_reload_replaces_set() {
        let mut policy = ContentPolicy::from_config(&EngineConfig::default());
        let config = EngineConfig {
            banned_blocks: vec!["barrier".to_string()],
            ..Default::default()
        };
        policy.reload(&config);
        assert!(!policy.is_banned(&BlockState::new("ender_chest")));
        assert!(policy.is_banned(&BlockState::new("barrier")));
    }
}
