use std::time::Duration;

use crate::config::Settings;
use crate::error::RelayError;
use crate::runtime::memory::EnvironmentOptions;
use crate::runtime::policy::FetchPolicy;

use super::suspense::DEFAULT_TEMPORARY_RETAIN;

/// The slice of [`Settings`] the resource layer reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceConfig {
    pub query_capacity: usize,
    pub fragment_capacity: usize,
    pub temporary_retain: Duration,
    pub default_fetch_policy: FetchPolicy,
    pub default_live_fetch_policy: FetchPolicy,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            query_capacity: 1000,
            fragment_capacity: 1_000_000,
            temporary_retain: DEFAULT_TEMPORARY_RETAIN,
            default_fetch_policy: FetchPolicy::StoreOrNetwork,
            default_live_fetch_policy: FetchPolicy::StoreAndNetwork,
        }
    }
}

impl ResourceConfig {
    /// Rejects capacities the LRU caches cannot be built with.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.query_capacity == 0 {
            return Err(RelayError::configuration(
                "cache.query_capacity",
                "must be greater than zero",
            ));
        }
        if self.fragment_capacity == 0 {
            return Err(RelayError::configuration(
                "cache.fragment_capacity",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl From<&Settings> for ResourceConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            query_capacity: settings.cache.query_capacity,
            fragment_capacity: settings.cache.fragment_capacity,
            temporary_retain: settings.retention.temporary_retain,
            default_fetch_policy: settings.policy.default_fetch_policy,
            default_live_fetch_policy: settings.policy.default_live_fetch_policy,
        }
    }
}

impl From<&Settings> for EnvironmentOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            render_policy: settings.policy.default_render_policy,
            ..Self::default()
        }
    }
}
