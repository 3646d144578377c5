use std::sync::Arc;

use crate::config::Settings;
use crate::error::RelayError;
use crate::runtime::environment::Environment;

use super::config::ResourceConfig;
use super::fragment::FragmentResource;
use super::query::QueryResource;
use super::query_cache::QueryReferenceCache;

/// Environment-scoped handle threading the resource caches to every
/// primitive. Construct once per environment and clone freely.
#[derive(Clone)]
pub struct RelayContext {
    env: Arc<dyn Environment>,
    config: ResourceConfig,
    queries: Arc<QueryResource>,
    fragments: Arc<FragmentResource>,
    query_references: Arc<QueryReferenceCache>,
}

impl RelayContext {
    pub fn new(env: Arc<dyn Environment>, config: ResourceConfig) -> Result<Self, RelayError> {
        config.validate()?;
        let queries = Arc::new(QueryResource::new(env.clone(), config)?);
        let fragments = Arc::new(FragmentResource::new(env.clone(), queries.clone(), &config)?);
        Ok(Self {
            env,
            config,
            queries,
            fragments,
            query_references: Arc::new(QueryReferenceCache::new()),
        })
    }

    pub fn from_settings(env: Arc<dyn Environment>, settings: &Settings) -> Result<Self, RelayError> {
        Self::new(env, ResourceConfig::from(settings))
    }

    pub fn environment(&self) -> &Arc<dyn Environment> {
        &self.env
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    pub fn query_resource(&self) -> &Arc<QueryResource> {
        &self.queries
    }

    pub fn fragment_resource(&self) -> &Arc<FragmentResource> {
        &self.fragments
    }

    pub fn query_references(&self) -> &Arc<QueryReferenceCache> {
        &self.query_references
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::memory::{EnvironmentOptions, MemoryEnvironment, ScriptedNetwork};

    #[test]
    fn zero_capacity_is_a_construction_error() {
        let env = MemoryEnvironment::new(
            Arc::new(ScriptedNetwork::new()),
            EnvironmentOptions::default(),
        );
        let config = ResourceConfig {
            query_capacity: 0,
            ..ResourceConfig::default()
        };

        assert!(matches!(
            RelayContext::new(env, config),
            Err(RelayError::Configuration {
                key: "cache.query_capacity",
                ..
            })
        ));
    }
}
