//! Feature flag lookups consulted by the client.

use crate::config::Config;
use crate::context::FeatureFlagActors;
use std::collections::{BTreeMap, HashMap};

/// Gates the circuit breaker. When disabled every call bypasses it.
pub const CIRCUIT_BREAKER_FLAG: &str = "circuit_breaker_gitaly_client";

/// Flags with this prefix are evaluated client side and forwarded to the server.
pub const SERVER_FLAG_PREFIX: &str = "gitaly_";

pub trait FeatureFlags: Send + Sync {
    fn is_enabled(&self, flag: &str, actors: &FeatureFlagActors) -> bool;

    /// Names of the flags forwarded to the server.
    fn server_flags(&self) -> Vec<String>;
}

/// Flag values from configuration, with optional per-actor overrides.
#[derive(Clone, Debug, Default)]
pub struct StaticFeatureFlags {
    flags: HashMap<String, bool>,
    actor_overrides: HashMap<(String, String), bool>,
}

impl StaticFeatureFlags {
    pub fn from_config(config: &Config) -> Self {
        let mut flags = config.feature_flags.clone();
        flags.insert(
            CIRCUIT_BREAKER_FLAG.to_string(),
            config.circuit_breaker.enabled,
        );

        StaticFeatureFlags {
            flags,
            actor_overrides: HashMap::new(),
        }
    }

    pub fn with_flag(mut self, flag: impl Into<String>, enabled: bool) -> Self {
        self.flags.insert(flag.into(), enabled);
        self
    }

    /// Overrides `flag` whenever any of the current actors equals `actor`.
    pub fn with_actor_override(
        mut self,
        flag: impl Into<String>,
        actor: impl Into<String>,
        enabled: bool,
    ) -> Self {
        self.actor_overrides
            .insert((flag.into(), actor.into()), enabled);
        self
    }
}

impl FeatureFlags for StaticFeatureFlags {
    fn is_enabled(&self, flag: &str, actors: &FeatureFlagActors) -> bool {
        let candidates = [&actors.repository, &actors.user, &actors.project, &actors.group];

        candidates
            .into_iter()
            .flatten()
            .find_map(|actor| {
                self.actor_overrides
                    .get(&(flag.to_string(), actor.clone()))
                    .copied()
            })
            .or_else(|| self.flags.get(flag).copied())
            .unwrap_or(false)
    }

    fn server_flags(&self) -> Vec<String> {
        let mut flags: Vec<String> = self
            .flags
            .keys()
            .chain(self.actor_overrides.keys().map(|(flag, _)| flag))
            .filter(|flag| flag.starts_with(SERVER_FLAG_PREFIX))
            .cloned()
            .collect();
        flags.sort();
        flags.dedup();
        flags
    }
}

/// Header name for a server flag: `gitaly_mep_mep` becomes `gitaly-feature-mep-mep`.
pub fn feature_header(flag: &str) -> String {
    let name = flag.strip_prefix(SERVER_FLAG_PREFIX).unwrap_or(flag);
    format!("gitaly-feature-{}", name.replace('_', "-"))
}

/// Evaluates every server flag for `actors`.
pub fn server_feature_headers(
    flags: &dyn FeatureFlags,
    actors: &FeatureFlagActors,
) -> BTreeMap<String, String> {
    flags
        .server_flags()
        .into_iter()
        .map(|flag| {
            let enabled = flags.is_enabled(&flag, actors);
            (feature_header(&flag), enabled.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::test_config;

    #[test]
    fn test_from_config() {
        let mut config = test_config();
        config.circuit_breaker.enabled = false;
        config.feature_flags.insert("gitaly_mep_mep".into(), true);

        let flags = StaticFeatureFlags::from_config(&config);
        let actors = FeatureFlagActors::default();

        assert!(!flags.is_enabled(CIRCUIT_BREAKER_FLAG, &actors));
        assert!(flags.is_enabled("gitaly_mep_mep", &actors));
        assert!(!flags.is_enabled("unknown", &actors));
        assert_eq!(flags.server_flags(), vec!["gitaly_mep_mep".to_string()]);
    }

    #[test]
    fn test_actor_overrides() {
        let flags = StaticFeatureFlags::default()
            .with_flag("gitaly_find_tag", false)
            .with_actor_override("gitaly_find_tag", "project-1", true);

        let actors = FeatureFlagActors {
            project: Some("project-1".into()),
            ..FeatureFlagActors::default()
        };

        assert!(flags.is_enabled("gitaly_find_tag", &actors));
        assert!(!flags.is_enabled("gitaly_find_tag", &FeatureFlagActors::default()));
    }

    #[test]
    fn test_server_feature_headers() {
        let flags = StaticFeatureFlags::default()
            .with_flag("gitaly_mep_mep", true)
            .with_flag("gitaly_other_flag", false)
            .with_flag("ui_only", true);

        let headers = server_feature_headers(&flags, &FeatureFlagActors::default());

        assert_eq!(
            headers,
            BTreeMap::from([
                ("gitaly-feature-mep-mep".to_string(), "true".to_string()),
                ("gitaly-feature-other-flag".to_string(), "false".to_string()),
            ])
        );
    }
}
