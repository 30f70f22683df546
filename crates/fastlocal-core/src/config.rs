//! Runtime configuration.
//!
//! Configuration is process-immutable. It is read from the environment on
//! first use and cached thereafter, unless a program installs one explicitly
//! with [`install`] before touching any variable:
//! - `FASTLOCAL_SENTINEL_POLICY`: `strict` (default) rejects attempts to store
//!   the unset sentinel with [`LocalError::MisuseOfSentinel`]; `lenient`
//!   silently turns them into a removal.
//! - `FASTLOCAL_DEATH_WATCH`: `on` registers every thread that starts using
//!   variables with the thread death watcher so its bookkeeping is dropped
//!   when it exits. Default `off`.
//!
//! [`LocalError::MisuseOfSentinel`]: crate::LocalError::MisuseOfSentinel

use std::sync::OnceLock;

use serde::Serialize;

/// Environment variable selecting the [`SentinelPolicy`].
pub const SENTINEL_POLICY_ENV: &str = "FASTLOCAL_SENTINEL_POLICY";

/// Environment variable enabling the thread death watcher integration.
pub const DEATH_WATCH_ENV: &str = "FASTLOCAL_DEATH_WATCH";

/// What to do when the unset sentinel is stored as if it were a value.
///
/// The sentinel is a reserved value, not part of any variable's value domain.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SentinelPolicy {
    /// Fail with `MisuseOfSentinel`.
    #[default]
    Strict,
    /// Treat the store as a removal.
    Lenient,
}

impl SentinelPolicy {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" | "reject" | "error" => Self::Strict,
            "lenient" | "remove" | "redirect" => Self::Lenient,
            _ => Self::Strict,
        }
    }

    /// Returns true if storing the sentinel is an error.
    #[must_use]
    pub const fn rejects_sentinel(self) -> bool {
        matches!(self, Self::Strict)
    }
}

/// Snapshot of all runtime knobs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RuntimeConfig {
    pub sentinel_policy: SentinelPolicy,
    pub death_watch: bool,
}

impl RuntimeConfig {
    /// Build a config from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            sentinel_policy: lookup(SENTINEL_POLICY_ENV)
                .map(|v| SentinelPolicy::from_str_loose(&v))
                .unwrap_or_default(),
            death_watch: lookup(DEATH_WATCH_ENV).is_some_and(|v| parse_switch(&v)),
        }
    }

    /// Build a config from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

fn parse_switch(s: &str) -> bool {
    matches!(
        s.trim().to_ascii_lowercase().as_str(),
        "on" | "1" | "true" | "yes" | "enabled"
    )
}

static GLOBAL_CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

/// Get the process configuration (reads env vars on first call, caches thereafter).
#[must_use]
pub fn runtime_config() -> &'static RuntimeConfig {
    GLOBAL_CONFIG.get_or_init(RuntimeConfig::from_env)
}

/// Install `config` as the process configuration.
///
/// Fails, handing the config back, if the configuration was already read or
/// installed.
pub fn install(config: RuntimeConfig) -> Result<(), RuntimeConfig> {
    GLOBAL_CONFIG.set(config)
}

/// Shorthand for the configured sentinel policy.
#[must_use]
pub fn sentinel_policy() -> SentinelPolicy {
    runtime_config().sentinel_policy
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn parse_sentinel_policies() {
        assert_eq!(SentinelPolicy::from_str_loose("strict"), SentinelPolicy::Strict);
        assert_eq!(SentinelPolicy::from_str_loose("STRICT"), SentinelPolicy::Strict);
        assert_eq!(SentinelPolicy::from_str_loose("reject"), SentinelPolicy::Strict);
        assert_eq!(SentinelPolicy::from_str_loose("lenient"), SentinelPolicy::Lenient);
        assert_eq!(SentinelPolicy::from_str_loose(" Remove "), SentinelPolicy::Lenient);
        assert_eq!(SentinelPolicy::from_str_loose("bogus"), SentinelPolicy::Strict);
    }

    #[test]
    fn default_is_strict_without_death_watch() {
        let config = RuntimeConfig::from_lookup(|_| None);
        assert_eq!(config.sentinel_policy, SentinelPolicy::Strict);
        assert!(!config.death_watch);
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn lookup_drives_both_knobs() {
        let config = RuntimeConfig::from_lookup(lookup_from(&[
            (SENTINEL_POLICY_ENV, "lenient"),
            (DEATH_WATCH_ENV, "On"),
        ]));
        assert_eq!(config.sentinel_policy, SentinelPolicy::Lenient);
        assert!(config.death_watch);

        let config = RuntimeConfig::from_lookup(lookup_from(&[(DEATH_WATCH_ENV, "off")]));
        assert!(!config.death_watch);
    }

    #[test]
    fn only_strict_rejects() {
        assert!(SentinelPolicy::Strict.rejects_sentinel());
        assert!(!SentinelPolicy::Lenient.rejects_sentinel());
    }
}
