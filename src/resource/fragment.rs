//! Fragment reads with suspense, store subscriptions and missed-update
//! catch-up, cached per fragment identifier.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use metrics::counter;
use serde_json::Value;
use tracing::{debug, error};

use crate::cache::LruCache;
use crate::cache::lock::mutex_lock;
use crate::error::RelayError;
use crate::runtime::data::{Data, recycle_nodes_into};
use crate::runtime::descriptor::{
    FragmentKey, OperationDescriptor, ReaderFragment, RequestDescriptor, Selector,
    fragment_identifier, get_selector, variables_from_fragment,
};
use crate::runtime::disposable::Disposable;
use crate::runtime::environment::Environment;
use crate::runtime::pending::{Pending, Resolution};
use crate::runtime::policy::Epoch;
use crate::runtime::snapshot::{MissingClientEdge, MissingLiveResolverField, Snapshot};

use super::client_edge::ClientEdgeQueryResults;
use super::config::ResourceConfig;
use super::query::{PrepareOptions, QueryResource, QueryResult};

const SOURCE: &str = "resource::fragment";

const METRIC_FRAGMENT_HIT: &str = "relay_fragment_resource_hit_total";
const METRIC_FRAGMENT_MISS: &str = "relay_fragment_resource_miss_total";
const METRIC_FRAGMENT_EVICT: &str = "relay_fragment_resource_evict_total";

/// One snapshot per selector: plural fragments read one per key element.
#[derive(Debug, Clone)]
pub enum FragmentSnapshot {
    Single(Snapshot),
    Plural(Vec<Snapshot>),
}

impl FragmentSnapshot {
    pub fn snapshots(&self) -> &[Snapshot] {
        match self {
            FragmentSnapshot::Single(snapshot) => std::slice::from_ref(snapshot),
            FragmentSnapshot::Plural(snapshots) => snapshots,
        }
    }

    pub fn is_missing_data(&self) -> bool {
        self.snapshots().iter().any(|snapshot| snapshot.is_missing_data)
    }

    fn data(&self) -> Data {
        match self {
            FragmentSnapshot::Single(snapshot) => snapshot.data.clone(),
            FragmentSnapshot::Plural(snapshots) => {
                Data::list(snapshots.iter().map(|snapshot| snapshot.data.clone()))
            }
        }
    }

    fn missing_client_edges(&self) -> Vec<&MissingClientEdge> {
        self.snapshots()
            .iter()
            .flat_map(|snapshot| snapshot.missing_client_edges.iter())
            .collect()
    }

    fn missing_live_resolver_fields(&self) -> Vec<&MissingLiveResolverField> {
        self.snapshots()
            .iter()
            .flat_map(|snapshot| snapshot.missing_live_resolver_fields.iter())
            .collect()
    }

    /// Same snapshots with every unchanged subtree taken from `previous`.
    fn recycled_from(self, previous: &FragmentSnapshot) -> Self {
        match (previous, self) {
            (FragmentSnapshot::Single(prev), FragmentSnapshot::Single(next)) => {
                FragmentSnapshot::Single(recycle_snapshot(prev, next))
            }
            (FragmentSnapshot::Plural(prev), FragmentSnapshot::Plural(next))
                if prev.len() == next.len() =>
            {
                FragmentSnapshot::Plural(
                    prev.iter()
                        .zip(next)
                        .map(|(prev, next)| recycle_snapshot(prev, next))
                        .collect(),
                )
            }
            (_, next) => next,
        }
    }
}

fn recycle_snapshot(prev: &Snapshot, next: Snapshot) -> Snapshot {
    let data = recycle_nodes_into(&prev.data, next.data.clone());
    Snapshot { data, ..next }
}

#[derive(Debug, Clone)]
pub struct FragmentResult {
    pub cache_key: String,
    pub data: Data,
    pub is_missing_data: bool,
    pub snapshot: Option<FragmentSnapshot>,
    pub store_epoch: Epoch,
}

impl FragmentResult {
    fn new(cache_key: &str, snapshot: FragmentSnapshot, store_epoch: Epoch) -> Self {
        Self {
            cache_key: cache_key.to_string(),
            data: snapshot.data(),
            is_missing_data: snapshot.is_missing_data(),
            snapshot: Some(snapshot),
            store_epoch,
        }
    }
}

/// Outcome of [`FragmentResource::check_missed_updates`].
#[derive(Debug, Clone)]
pub struct MissedUpdates {
    pub did_miss_updates: bool,
    /// The result re-derived at the current epoch; `None` for snapshot-less
    /// results.
    pub result: Option<FragmentResult>,
}

#[derive(Debug, Clone)]
enum CachedFragment {
    Pending {
        token: u64,
        promise: Pending,
        pending_operations: Vec<Arc<RequestDescriptor>>,
    },
    Done(FragmentResult),
}

type FragmentCache = Arc<Mutex<LruCache<CachedFragment>>>;

pub struct FragmentResource {
    env: Arc<dyn Environment>,
    cache: FragmentCache,
    query_resource: Arc<QueryResource>,
    client_edges: ClientEdgeQueryResults,
    next_token: AtomicU64,
}

impl FragmentResource {
    pub fn new(
        env: Arc<dyn Environment>,
        query_resource: Arc<QueryResource>,
        config: &ResourceConfig,
    ) -> Result<Self, RelayError> {
        Ok(Self {
            env,
            cache: Arc::new(Mutex::new(LruCache::new(config.fragment_capacity)?)),
            query_resource,
            client_edges: ClientEdgeQueryResults::new(config.temporary_retain),
            next_token: AtomicU64::new(0),
        })
    }

    pub fn read(
        &self,
        fragment: &Arc<ReaderFragment>,
        key: Option<&FragmentKey>,
        requestor: &str,
    ) -> Result<Resolution<FragmentResult>, RelayError> {
        let identifier = fragment_identifier(fragment, key);
        self.read_with_identifier(fragment, key, &identifier, requestor)
    }

    /// Reads `fragment` through `key`, returning a pending marker while an
    /// owning request, client edge query or live resolver is outstanding.
    pub fn read_with_identifier(
        &self,
        fragment: &Arc<ReaderFragment>,
        key: Option<&FragmentKey>,
        identifier: &str,
        requestor: &str,
    ) -> Result<Resolution<FragmentResult>, RelayError> {
        let Some(key) = key else {
            return Ok(Resolution::Ready(FragmentResult {
                cache_key: identifier.to_string(),
                data: Data::Null,
                is_missing_data: false,
                snapshot: None,
                store_epoch: 0,
            }));
        };

        let store_epoch = self.env.store_epoch();

        if fragment.metadata.plural {
            if let FragmentKey::Single(_) = key {
                return Err(RelayError::invariant(format!(
                    "expected fragment pointer for fragment `{}` read by `{requestor}` to be a list",
                    fragment.name
                )));
            }
            if key.is_empty() {
                return Ok(Resolution::Ready(FragmentResult {
                    cache_key: identifier.to_string(),
                    data: Data::list(Vec::new()),
                    is_missing_data: false,
                    snapshot: Some(FragmentSnapshot::Plural(Vec::new())),
                    store_epoch,
                }));
            }
        }

        let cached = mutex_lock(&self.cache, SOURCE, "read").get(identifier).cloned();
        let mut previous = None;
        match cached {
            Some(CachedFragment::Pending { promise, .. }) if !promise.is_settled() => {
                counter!(METRIC_FRAGMENT_HIT).increment(1);
                return Ok(Resolution::Pending(promise));
            }
            Some(CachedFragment::Pending { token, .. }) => {
                remove_pending(&self.cache, identifier, token);
            }
            Some(CachedFragment::Done(result)) => {
                let live_pending = result
                    .snapshot
                    .as_ref()
                    .is_some_and(|snapshot| !snapshot.missing_live_resolver_fields().is_empty());
                if !live_pending && result.store_epoch == store_epoch {
                    counter!(METRIC_FRAGMENT_HIT).increment(1);
                    if let Some(snapshot) = &result.snapshot {
                        self.surface_snapshot_errors(fragment, snapshot)?;
                    }
                    return Ok(Resolution::Ready(result));
                }
                previous = Some(result);
            }
            None => {}
        }

        let selector = get_selector(fragment, key)?.ok_or_else(|| {
            RelayError::invariant(format!(
                "expected to receive an object where `...{}` was spread, but the fragment \
                 reference was not found; spread `{}` in the parent of `{requestor}` or pass \
                 no key when the parent fetches it conditionally",
                fragment.name, fragment.name
            ))
        })?;

        counter!(METRIC_FRAGMENT_MISS).increment(1);
        let mut snapshot = match &selector {
            Selector::Single(selector) => FragmentSnapshot::Single(self.env.lookup(selector)),
            Selector::Plural(selectors) => FragmentSnapshot::Plural(
                selectors
                    .iter()
                    .map(|selector| self.env.lookup(selector))
                    .collect(),
            ),
        };
        if let Some(previous) = previous.as_ref().and_then(|result| result.snapshot.as_ref()) {
            snapshot = snapshot.recycled_from(previous);
        }
        let mut result = FragmentResult::new(identifier, snapshot, store_epoch);
        if let Some(previous) = &previous {
            result.data = recycle_nodes_into(&previous.data, result.data);
        }
        let Some(snapshot) = result.snapshot.clone() else {
            return Ok(Resolution::Ready(result));
        };

        if !result.is_missing_data {
            cache_set(&self.cache, identifier, CachedFragment::Done(result.clone()));
            self.surface_snapshot_errors(fragment, &snapshot)?;
            return Ok(Resolution::Ready(result));
        }

        let mut client_edge_requests = Vec::new();
        if fragment.has_client_edges {
            let edges = snapshot.missing_client_edges();
            if !edges.is_empty() {
                let mut query_results = Vec::new();
                for edge in edges {
                    let (request, query) = self.perform_client_edge_query(fragment, key, edge)?;
                    match query {
                        Resolution::Pending(pending) => return Ok(Resolution::Pending(pending)),
                        Resolution::Ready(query_result) => query_results.push(query_result),
                    }
                    client_edge_requests.push(request);
                }
                self.client_edges
                    .record_query_results(self.env.as_ref(), identifier, query_results);
            }
        }
        let client_edge_promises: Vec<Pending> = client_edge_requests
            .iter()
            .filter_map(|request| self.env.promise_for_active_request(request))
            .collect();

        let parent_promise = selector.owner().and_then(|owner| {
            self.save_promise_for_request_in_flight(identifier, fragment, owner)
        });

        let live_promises: Vec<Pending> = snapshot
            .missing_live_resolver_fields()
            .iter()
            .filter_map(|field| self.env.live_resolver_promise(&field.live_state_id))
            .collect();

        if !client_edge_promises.is_empty() || !live_promises.is_empty() {
            let promises = client_edge_promises
                .into_iter()
                .chain(live_promises)
                .chain(parent_promise);
            return Ok(Resolution::Pending(Pending::all(promises)));
        }
        if let Some(parent_promise) = parent_promise {
            return Ok(Resolution::Pending(parent_promise));
        }

        self.surface_snapshot_errors(fragment, &snapshot)?;
        Ok(Resolution::Ready(result))
    }

    /// Attaches one store subscription per underlying snapshot. `callback`
    /// runs synchronously after the cached result has been rewritten.
    pub fn subscribe(
        &self,
        result: &FragmentResult,
        callback: Arc<dyn Fn() + Send + Sync>,
    ) -> Disposable {
        if result.snapshot.is_none() {
            return Disposable::noop();
        }

        let missed = self.check_missed_updates(result);
        if missed.did_miss_updates {
            callback();
        }
        let Some(current) = missed.result.and_then(|result| result.snapshot) else {
            return Disposable::noop();
        };

        let cache_key = result.cache_key.clone();
        let mut disposables = Vec::new();
        match current {
            FragmentSnapshot::Single(snapshot) => {
                let env = Arc::downgrade(&self.env);
                let cache = Arc::downgrade(&self.cache);
                let key = cache_key.clone();
                let callback = callback.clone();
                disposables.push(self.env.subscribe(
                    &snapshot,
                    Arc::new(move |latest: &Snapshot| {
                        if let (Some(env), Some(cache)) = (env.upgrade(), cache.upgrade()) {
                            let result = FragmentResult::new(
                                &key,
                                FragmentSnapshot::Single(latest.clone()),
                                env.store_epoch(),
                            );
                            cache_set(&cache, &key, CachedFragment::Done(result));
                        }
                        callback();
                    }),
                ));
            }
            FragmentSnapshot::Plural(snapshots) => {
                let base = Arc::new(snapshots.clone());
                for (index, snapshot) in snapshots.iter().enumerate() {
                    let env = Arc::downgrade(&self.env);
                    let cache = Arc::downgrade(&self.cache);
                    let key = cache_key.clone();
                    let base = base.clone();
                    let callback = callback.clone();
                    disposables.push(self.env.subscribe(
                        snapshot,
                        Arc::new(move |latest: &Snapshot| {
                            if let (Some(env), Some(cache)) = (env.upgrade(), cache.upgrade()) {
                                update_plural_snapshot(
                                    &cache,
                                    &key,
                                    &base,
                                    latest,
                                    index,
                                    env.store_epoch(),
                                );
                            }
                            callback();
                        }),
                    ));
                }
            }
        }

        if let Some(query_results) = self.client_edges.get(&cache_key) {
            for query_result in &query_results {
                disposables.push(self.query_resource.retain(query_result));
            }
            if let Some(retained) = self.client_edges.permanent_retain(self.env.as_ref(), &cache_key)
            {
                disposables.push(retained);
            }
        }

        let cache = Arc::downgrade(&self.cache);
        Disposable::new(move || {
            for mut disposable in disposables {
                disposable.dispose();
            }
            if let Some(cache) = cache.upgrade() {
                mutex_lock(&cache, SOURCE, "unsubscribe").delete(&cache_key);
            }
        })
    }

    /// Re-derives `result` if the store was written since it was read. The
    /// cache is only rewritten when the data actually changed.
    pub fn check_missed_updates(&self, result: &FragmentResult) -> MissedUpdates {
        let Some(rendered) = &result.snapshot else {
            return MissedUpdates {
                did_miss_updates: false,
                result: None,
            };
        };

        let store_epoch = self.env.store_epoch();
        if result.store_epoch == store_epoch {
            return MissedUpdates {
                did_miss_updates: false,
                result: Some(result.clone()),
            };
        }

        let mut did_miss_updates = false;
        let mut rederive = |snapshot: &Snapshot| {
            let current = self.env.lookup(&snapshot.selector);
            let updated = recycle_snapshot(snapshot, current);
            if !updated.data.same_node(&snapshot.data) {
                did_miss_updates = true;
            }
            updated
        };
        let current = match rendered {
            FragmentSnapshot::Single(snapshot) => FragmentSnapshot::Single(rederive(snapshot)),
            FragmentSnapshot::Plural(snapshots) => {
                FragmentSnapshot::Plural(snapshots.iter().map(&mut rederive).collect())
            }
        };

        let mut updated = FragmentResult::new(&result.cache_key, current, store_epoch);
        updated.data = recycle_nodes_into(&result.data, updated.data);
        if did_miss_updates {
            debug!(
                target_module = SOURCE,
                fragment = %result.cache_key,
                from_epoch = result.store_epoch,
                to_epoch = store_epoch,
                "Fragment missed store updates"
            );
            cache_set(&self.cache, &result.cache_key, CachedFragment::Done(updated.clone()));
        }
        MissedUpdates {
            did_miss_updates,
            result: Some(updated),
        }
    }

    /// Operations currently pending for the cached read at `identifier`.
    pub fn pending_operations(&self, identifier: &str) -> Vec<Arc<RequestDescriptor>> {
        match mutex_lock(&self.cache, SOURCE, "pending_operations").peek(identifier) {
            Some(CachedFragment::Pending {
                pending_operations, ..
            }) => pending_operations.clone(),
            _ => Vec::new(),
        }
    }

    pub fn has_cached(&self, identifier: &str) -> bool {
        mutex_lock(&self.cache, SOURCE, "has_cached").has(identifier)
    }

    fn surface_snapshot_errors(
        &self,
        fragment: &ReaderFragment,
        snapshot: &FragmentSnapshot,
    ) -> Result<(), RelayError> {
        snapshot.snapshots().iter().try_for_each(|snapshot| {
            self.env
                .handle_potential_snapshot_errors(snapshot, fragment.metadata.throw_on_field_error)
        })
    }

    fn perform_client_edge_query(
        &self,
        fragment: &ReaderFragment,
        key: &FragmentKey,
        edge: &MissingClientEdge,
    ) -> Result<(Arc<RequestDescriptor>, Resolution<QueryResult>), RelayError> {
        let mut variables = variables_from_fragment(fragment, key);
        variables.insert(
            "id".to_string(),
            Value::String(edge.destination_id.clone()),
        );
        let operation = OperationDescriptor::new(&edge.request, variables);
        debug!(
            target_module = SOURCE,
            fragment = %fragment.name,
            destination = %edge.destination_id,
            "Fetching client edge destination"
        );
        let fetch = self.env.fetch_query(&operation);
        let query = self
            .query_resource
            .prepare(&operation, fetch, PrepareOptions::default())?;
        Ok((operation.request.clone(), query))
    }

    /// Caches a pending marker that clears itself once the owning request
    /// settles, so the next read re-derives from the store.
    fn save_promise_for_request_in_flight(
        &self,
        identifier: &str,
        fragment: &ReaderFragment,
        owner: &RequestDescriptor,
    ) -> Option<Pending> {
        let pending = self.env.pending_operations_for_fragment(fragment, owner)?;
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let cache = Arc::downgrade(&self.cache);
        let key = identifier.to_string();
        let promise = pending.pending.then(move || {
            if let Some(cache) = cache.upgrade() {
                remove_pending(&cache, &key, token);
            }
        });
        cache_set(
            &self.cache,
            identifier,
            CachedFragment::Pending {
                token,
                promise: promise.clone(),
                pending_operations: pending.operations,
            },
        );
        Some(promise)
    }
}

fn cache_set(cache: &Mutex<LruCache<CachedFragment>>, key: &str, value: CachedFragment) {
    let evicted = mutex_lock(cache, SOURCE, "cache_set").set(key.to_string(), value);
    if let Some((evicted, _)) = evicted {
        counter!(METRIC_FRAGMENT_EVICT).increment(1);
        debug!(target_module = SOURCE, fragment = %evicted, "Evicted fragment result");
    }
}

/// Drops the pending entry at `key` unless it has been replaced since.
fn remove_pending(cache: &Mutex<LruCache<CachedFragment>>, key: &str, token: u64) {
    let mut guard = mutex_lock(cache, SOURCE, "remove_pending");
    if matches!(
        guard.peek(key),
        Some(CachedFragment::Pending { token: current, .. }) if *current == token
    ) {
        guard.delete(key);
    }
}

fn update_plural_snapshot(
    cache: &Mutex<LruCache<CachedFragment>>,
    key: &str,
    base: &[Snapshot],
    latest: &Snapshot,
    index: usize,
    store_epoch: Epoch,
) {
    let current = mutex_lock(cache, SOURCE, "update_plural").peek(key).cloned();
    let mut next = match current {
        Some(CachedFragment::Done(FragmentResult {
            snapshot: Some(FragmentSnapshot::Plural(snapshots)),
            ..
        })) => snapshots,
        None
        | Some(CachedFragment::Done(FragmentResult {
            snapshot: None, ..
        })) => base.to_vec(),
        Some(_) => {
            error!(
                target_module = SOURCE,
                fragment = %latest.selector.node.name,
                "Expected cached data for a plural fragment when receiving a subscription"
            );
            return;
        }
    };
    if index >= next.len() {
        error!(
            target_module = SOURCE,
            fragment = %latest.selector.node.name,
            index,
            "Plural fragment subscription index out of range"
        );
        return;
    }
    next[index] = latest.clone();
    cache_set(
        cache,
        key,
        CachedFragment::Done(FragmentResult::new(
            key,
            FragmentSnapshot::Plural(next),
            store_epoch,
        )),
    );
}
