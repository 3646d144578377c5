//! Coarse dedup above [`super::QueryResource`]: independent computations
//! issuing the same operation under the same policy share one fetch and one
//! store retain.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;
use uuid::Uuid;

use crate::cache::lock::mutex_lock;
use crate::runtime::descriptor::OperationDescriptor;
use crate::runtime::disposable::Disposable;
use crate::runtime::environment::Environment;
use crate::runtime::observable::{Observable, Observer, ReplaySubject, Subscription};
use crate::runtime::policy::FetchPolicy;
use crate::runtime::snapshot::{AvailabilityStatus, GraphQlResponse};

const SOURCE: &str = "resource::query_cache";

type Entries = Mutex<HashMap<String, Arc<QueryReference>>>;

#[derive(Default)]
struct ReferenceState {
    retain_count: usize,
    retention: Option<Disposable>,
    network: Option<Subscription>,
}

/// A started fetch shared by every caller resolving the same cache key.
pub struct QueryReference {
    id: Uuid,
    cache_key: String,
    operation: OperationDescriptor,
    source: ReplaySubject<GraphQlResponse>,
    state: Mutex<ReferenceState>,
    entries: Weak<Entries>,
}

impl QueryReference {
    pub fn operation(&self) -> &OperationDescriptor {
        &self.operation
    }

    /// Replays every payload received so far, then follows the live request.
    pub fn source(&self) -> Observable<GraphQlResponse> {
        self.source.observable()
    }

    pub fn retain_count(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "retain_count").retain_count
    }

    /// The first retain holds the operation in the store; the last release
    /// frees it, cancels live requests and forgets the cache entry.
    pub fn retain(self: &Arc<Self>, env: &dyn Environment) -> Disposable {
        let first = {
            let mut state = mutex_lock(&self.state, SOURCE, "retain");
            state.retain_count += 1;
            state.retain_count == 1
        };
        if first {
            let retention = env.retain(&self.operation);
            mutex_lock(&self.state, SOURCE, "retain").retention = Some(retention);
        }

        let this = Arc::downgrade(self);
        Disposable::new(move || {
            if let Some(this) = this.upgrade() {
                this.release();
            }
        })
    }

    fn release(&self) {
        let (retention, network) = {
            let mut state = mutex_lock(&self.state, SOURCE, "release");
            if state.retain_count == 0 {
                return;
            }
            state.retain_count -= 1;
            if state.retain_count > 0 {
                return;
            }
            let network = if self.operation.is_live() {
                state.network.take()
            } else {
                None
            };
            (state.retention.take(), network)
        };
        if let Some(mut retention) = retention {
            retention.dispose();
        }
        if let Some(network) = network {
            network.unsubscribe();
        }
        if let Some(entries) = self.entries.upgrade() {
            let mut entries = mutex_lock(&entries, SOURCE, "release");
            if entries.get(&self.cache_key).is_some_and(|entry| entry.id == self.id) {
                entries.remove(&self.cache_key);
            }
        }
        debug!(
            target_module = SOURCE,
            cache_key = %self.cache_key,
            "Released query reference"
        );
    }
}

/// Per-environment map from `{policy}-{request}[-{fetch_key}]` to the shared
/// fetch. Reads the store already satisfies are not recorded, so they are
/// re-checked against the store on every resolve.
#[derive(Default)]
pub struct QueryReferenceCache {
    entries: Arc<Entries>,
}

impl QueryReferenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache_key(
        fetch_policy: FetchPolicy,
        operation: &OperationDescriptor,
        fetch_key: Option<&str>,
    ) -> String {
        let key = format!("{fetch_policy}-{}", operation.request.identifier);
        match fetch_key {
            Some(fetch_key) => format!("{key}-{fetch_key}"),
            None => key,
        }
    }

    /// Returns the shared reference for the key, starting the fetch on first
    /// use. `None` means nothing needs fetching under this policy.
    pub fn resolve(
        &self,
        env: &dyn Environment,
        operation: &OperationDescriptor,
        fetch_policy: FetchPolicy,
        fetch_key: Option<&str>,
    ) -> Option<Arc<QueryReference>> {
        let cache_key = Self::cache_key(fetch_policy, operation, fetch_key);
        if let Some(existing) = mutex_lock(&self.entries, SOURCE, "resolve").get(&cache_key) {
            return Some(existing.clone());
        }

        let should_fetch = match fetch_policy {
            FetchPolicy::StoreOnly => false,
            FetchPolicy::StoreOrNetwork => {
                env.check(operation).status != AvailabilityStatus::Available
            }
            FetchPolicy::StoreAndNetwork | FetchPolicy::NetworkOnly => true,
        };
        if !should_fetch {
            return None;
        }

        debug!(
            target_module = SOURCE,
            cache_key = %cache_key,
            "Starting shared query fetch"
        );
        let reference = Arc::new(QueryReference {
            id: Uuid::new_v4(),
            cache_key: cache_key.clone(),
            operation: operation.clone(),
            source: ReplaySubject::new(),
            state: Mutex::new(ReferenceState::default()),
            entries: Arc::downgrade(&self.entries),
        });
        mutex_lock(&self.entries, SOURCE, "resolve").insert(cache_key, reference.clone());

        let next = reference.source.clone();
        let error = reference.source.clone();
        let complete = reference.source.clone();
        let network = env.fetch_query(operation).subscribe(
            Observer::new()
                .on_next(move |response| next.next(response))
                .on_error(move |err| error.error(err))
                .on_complete(move || complete.complete()),
        );
        if !network.is_closed() {
            mutex_lock(&reference.state, SOURCE, "resolve").network = Some(network);
        }
        Some(reference)
    }

    pub fn contains(&self, cache_key: &str) -> bool {
        mutex_lock(&self.entries, SOURCE, "contains").contains_key(cache_key)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::runtime::descriptor::{ConcreteRequest, Field, Variables};
    use crate::runtime::memory::{EnvironmentOptions, MemoryEnvironment, ScriptedNetwork};

    fn setup(live: bool) -> (Arc<MemoryEnvironment>, ScriptedNetwork, OperationDescriptor) {
        let network = ScriptedNetwork::new();
        let env = MemoryEnvironment::new(Arc::new(network.clone()), EnvironmentOptions::default());
        let mut request = ConcreteRequest::query("ViewerQuery", vec![Field::scalar("viewer").into()]);
        if live {
            request = request.live();
        }
        let operation = OperationDescriptor::new(&Arc::new(request), Variables::new());
        (env, network, operation)
    }

    #[test]
    fn same_key_shares_one_fetch() {
        let (env, network, operation) = setup(false);
        let cache = QueryReferenceCache::new();

        let first = cache
            .resolve(env.as_ref(), &operation, FetchPolicy::StoreAndNetwork, None)
            .expect("fetching");
        let second = cache
            .resolve(env.as_ref(), &operation, FetchPolicy::StoreAndNetwork, None)
            .expect("fetching");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(network.request_count(), 1);
    }

    #[test]
    fn satisfied_store_records_no_reference() {
        let (env, network, operation) = setup(false);
        env.commit_payload(&operation, json!({"viewer": "me"}));
        let cache = QueryReferenceCache::new();

        let resolved = cache.resolve(env.as_ref(), &operation, FetchPolicy::StoreOrNetwork, None);

        assert!(resolved.is_none());
        let key = QueryReferenceCache::cache_key(FetchPolicy::StoreOrNetwork, &operation, None);
        assert!(!cache.contains(&key));
        assert_eq!(network.request_count(), 0);
    }

    #[test]
    fn stale_store_fetches_after_an_earlier_satisfied_read() {
        let (env, network, operation) = setup(false);
        env.commit_payload(&operation, json!({"viewer": "me"}));
        let cache = QueryReferenceCache::new();
        assert!(
            cache
                .resolve(env.as_ref(), &operation, FetchPolicy::StoreOrNetwork, None)
                .is_none()
        );

        env.invalidate(&operation);
        let resolved = cache.resolve(env.as_ref(), &operation, FetchPolicy::StoreOrNetwork, None);

        assert!(resolved.is_some());
        assert_eq!(network.request_count(), 1);
    }

    #[test]
    fn last_release_forgets_and_cancels_live_queries() {
        let (env, network, operation) = setup(true);
        let cache = QueryReferenceCache::new();
        let reference = cache
            .resolve(env.as_ref(), &operation, FetchPolicy::NetworkOnly, Some("1"))
            .expect("fetching");

        let mut a = reference.retain(env.as_ref());
        let mut b = reference.retain(env.as_ref());
        assert_eq!(env.retain_count(&operation), 1);

        a.dispose();
        assert!(network.cancelled().is_empty());
        b.dispose();

        assert_eq!(env.retain_count(&operation), 0);
        assert_eq!(network.cancelled(), vec!["ViewerQuery".to_string()]);
        let key = QueryReferenceCache::cache_key(FetchPolicy::NetworkOnly, &operation, Some("1"));
        assert!(!cache.contains(&key));
    }
}
