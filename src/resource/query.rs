//! Per-operation result cache: decides fetch vs. cache hit per fetch policy,
//! starts (or joins) the network request, and ties each entry's lifetime to
//! its [`SuspenseResource`].

use std::sync::{Arc, Mutex, Weak};

use metrics::counter;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::LruCache;
use crate::cache::lock::mutex_lock;
use crate::error::RelayError;
use crate::runtime::descriptor::{FragmentRef, OperationDescriptor, ReaderFragment};
use crate::runtime::disposable::Disposable;
use crate::runtime::environment::Environment;
use crate::runtime::observable::{Observable, Observer, Subscription};
use crate::runtime::pending::{Pending, Resolution, Resolver};
use crate::runtime::policy::{FetchPolicy, RenderPolicy};
use crate::runtime::snapshot::{
    AvailabilityStatus, GraphQlResponse, OperationAvailability, Snapshot,
};

use super::config::ResourceConfig;
use super::suspense::SuspenseResource;

const SOURCE: &str = "resource::query";

const METRIC_QUERY_HIT: &str = "relay_query_resource_hit_total";
const METRIC_QUERY_MISS: &str = "relay_query_resource_miss_total";
const METRIC_QUERY_EVICT: &str = "relay_query_resource_evict_total";

/// A renderable operation: the root fragment plus a reference pointing at it.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub cache_identifier: String,
    pub fragment_node: Arc<ReaderFragment>,
    pub fragment_ref: Arc<FragmentRef>,
    pub operation: OperationDescriptor,
}

impl QueryResult {
    fn new(operation: &OperationDescriptor, cache_identifier: &str) -> Self {
        Self {
            cache_identifier: cache_identifier.to_string(),
            fragment_node: operation.request.node.fragment.clone(),
            fragment_ref: operation.root_ref(),
            operation: operation.clone(),
        }
    }
}

#[derive(Debug, Clone)]
enum QueryValue {
    Result(QueryResult),
    Pending(Pending),
    Error(RelayError),
}

struct EntryState {
    value: QueryValue,
    processed_payloads: usize,
    network: Option<Subscription>,
}

struct QueryCacheEntry {
    id: Uuid,
    is_live: bool,
    /// Store availability when the entry was created.
    availability: OperationAvailability,
    state: Mutex<EntryState>,
    retention: SuspenseResource,
}

impl QueryCacheEntry {
    fn value(&self) -> QueryValue {
        mutex_lock(&self.state, SOURCE, "entry_value").value.clone()
    }

    fn set_value(&self, value: QueryValue) {
        mutex_lock(&self.state, SOURCE, "entry_set_value").value = value;
    }

    /// Live queries cancel the subscription being replaced.
    fn set_network(&self, subscription: Option<Subscription>) {
        let previous = std::mem::replace(
            &mut mutex_lock(&self.state, SOURCE, "entry_set_network").network,
            subscription,
        );
        if self.is_live
            && let Some(previous) = previous
        {
            previous.unsubscribe();
        }
    }

    fn take_network(&self) -> Option<Subscription> {
        mutex_lock(&self.state, SOURCE, "entry_take_network").network.take()
    }
}

type QueryCache = Arc<Mutex<LruCache<Arc<QueryCacheEntry>>>>;

/// Knobs for [`QueryResource::prepare`]; `None` policies fall back to the
/// configured defaults.
#[derive(Default)]
pub struct PrepareOptions {
    pub fetch_policy: Option<FetchPolicy>,
    pub render_policy: Option<RenderPolicy>,
    pub observer: Option<Observer<Snapshot>>,
    pub cache_breaker: Option<String>,
}

/// Cache identifier for an operation under the given policies:
/// `{fetch}-{render}-{request}` plus `-{breaker}` when one is given.
pub fn query_cache_identifier(
    env: &dyn Environment,
    config: &ResourceConfig,
    operation: &OperationDescriptor,
    fetch_policy: Option<FetchPolicy>,
    render_policy: Option<RenderPolicy>,
    cache_breaker: Option<&str>,
) -> String {
    let fetch_policy = fetch_policy.unwrap_or_else(|| default_fetch_policy(config, operation));
    let render_policy = render_policy.unwrap_or_else(|| env.default_render_policy());
    let identifier = format!(
        "{fetch_policy}-{render_policy}-{}",
        operation.request.identifier
    );
    match cache_breaker {
        Some(breaker) => format!("{identifier}-{breaker}"),
        None => identifier,
    }
}

fn default_fetch_policy(config: &ResourceConfig, operation: &OperationDescriptor) -> FetchPolicy {
    if operation.request.node.live {
        config.default_live_fetch_policy
    } else {
        config.default_fetch_policy
    }
}

pub struct QueryResource {
    env: Arc<dyn Environment>,
    cache: QueryCache,
    config: ResourceConfig,
}

impl QueryResource {
    pub fn new(env: Arc<dyn Environment>, config: ResourceConfig) -> Result<Self, RelayError> {
        Ok(Self {
            env,
            cache: Arc::new(Mutex::new(LruCache::new(config.query_capacity)?)),
            config,
        })
    }

    pub fn prepare(
        &self,
        operation: &OperationDescriptor,
        fetch_observable: Observable<GraphQlResponse>,
        options: PrepareOptions,
    ) -> Result<Resolution<QueryResult>, RelayError> {
        let cache_identifier = query_cache_identifier(
            self.env.as_ref(),
            &self.config,
            operation,
            options.fetch_policy,
            options.render_policy,
            options.cache_breaker.as_deref(),
        );
        self.prepare_with_identifier(
            &cache_identifier,
            operation,
            fetch_observable,
            options.fetch_policy,
            options.render_policy,
            options.observer,
        )
    }

    /// Returns the cached result, a pending marker to await, or the error the
    /// initial payload failed with. Always takes a temporary retain.
    pub fn prepare_with_identifier(
        &self,
        cache_identifier: &str,
        operation: &OperationDescriptor,
        fetch_observable: Observable<GraphQlResponse>,
        fetch_policy: Option<FetchPolicy>,
        render_policy: Option<RenderPolicy>,
        observer: Option<Observer<Snapshot>>,
    ) -> Result<Resolution<QueryResult>, RelayError> {
        let fetch_policy =
            fetch_policy.unwrap_or_else(|| default_fetch_policy(&self.config, operation));
        let render_policy = render_policy.unwrap_or_else(|| self.env.default_render_policy());

        let cached = mutex_lock(&self.cache, SOURCE, "prepare").get(cache_identifier).cloned();
        let temporary: Arc<Mutex<Option<Disposable>>> = Arc::new(Mutex::new(None));
        let entry = match cached {
            Some(entry) => {
                counter!(METRIC_QUERY_HIT).increment(1);
                entry
            }
            None => {
                counter!(METRIC_QUERY_MISS).increment(1);
                let user = observer.unwrap_or_default();
                let slot = temporary.clone();
                let wrapped = user.clone().on_unsubscribe(move |subscription| {
                    let disposable = mutex_lock(&slot, SOURCE, "observer_unsubscribe").take();
                    if let Some(mut disposable) = disposable {
                        disposable.dispose();
                    }
                    user.emit_unsubscribe(subscription);
                });
                self.fetch_and_save(
                    cache_identifier,
                    operation,
                    fetch_observable,
                    fetch_policy,
                    render_policy,
                    wrapped,
                )?
            }
        };

        let disposable = entry.retention.temporary_retain(self.env.as_ref());
        *mutex_lock(&temporary, SOURCE, "prepare_temporary") = Some(disposable);

        match entry.value() {
            QueryValue::Result(result) => Ok(Resolution::Ready(result)),
            QueryValue::Pending(pending) => Ok(Resolution::Pending(pending)),
            QueryValue::Error(error) => Err(error),
        }
    }

    /// Permanently retains the entry behind `result`, recreating it if it was
    /// released in the meantime.
    pub fn retain(&self, result: &QueryResult) -> Disposable {
        let entry = get_or_create_entry(
            &self.cache,
            &self.config,
            &result.cache_identifier,
            &result.operation,
            QueryValue::Result(result.clone()),
            None,
            || self.env.check(&result.operation),
        );
        entry.retention.permanent_retain(self.env.as_ref())
    }

    pub fn release_temporary_retain(&self, result: &QueryResult) {
        let entry = mutex_lock(&self.cache, SOURCE, "release_temporary_retain")
            .peek(&result.cache_identifier)
            .cloned();
        if let Some(entry) = entry {
            entry.retention.release_temporary_retain();
        }
    }

    pub fn has_entry(&self, cache_identifier: &str) -> bool {
        mutex_lock(&self.cache, SOURCE, "has_entry").has(cache_identifier)
    }

    pub fn retain_count(&self, cache_identifier: &str) -> Option<usize> {
        mutex_lock(&self.cache, SOURCE, "retain_count")
            .peek(cache_identifier)
            .map(|entry| entry.retention.retain_count())
    }

    /// What the store held for the operation when the entry was created.
    pub fn availability(&self, cache_identifier: &str) -> Option<OperationAvailability> {
        mutex_lock(&self.cache, SOURCE, "availability")
            .peek(cache_identifier)
            .map(|entry| entry.availability)
    }

    pub fn query_cache_identifier(
        &self,
        operation: &OperationDescriptor,
        fetch_policy: Option<FetchPolicy>,
        render_policy: Option<RenderPolicy>,
        cache_breaker: Option<&str>,
    ) -> String {
        query_cache_identifier(
            self.env.as_ref(),
            &self.config,
            operation,
            fetch_policy,
            render_policy,
            cache_breaker,
        )
    }

    fn fetch_and_save(
        &self,
        cache_identifier: &str,
        operation: &OperationDescriptor,
        fetch_observable: Observable<GraphQlResponse>,
        fetch_policy: FetchPolicy,
        render_policy: RenderPolicy,
        observer: Observer<Snapshot>,
    ) -> Result<Arc<QueryCacheEntry>, RelayError> {
        let availability = self.env.check(operation);
        let has_full_query = availability.status == AvailabilityStatus::Available;
        let can_partial_render = has_full_query
            || (render_policy == RenderPolicy::Partial
                && availability.status != AvailabilityStatus::Stale);

        let (should_fetch, should_allow_render) = match fetch_policy {
            FetchPolicy::StoreOnly => (false, true),
            FetchPolicy::StoreOrNetwork => (!has_full_query, can_partial_render),
            FetchPolicy::StoreAndNetwork => (true, can_partial_render),
            FetchPolicy::NetworkOnly => (true, false),
        };
        debug!(
            target_module = SOURCE,
            operation = %operation.name(),
            %fetch_policy,
            %render_policy,
            should_fetch,
            should_allow_render,
            "Preparing query"
        );

        if should_allow_render {
            let entry = create_entry(
                &self.cache,
                &self.config,
                cache_identifier,
                operation,
                QueryValue::Result(QueryResult::new(operation, cache_identifier)),
                None,
                availability,
            );
            cache_set(&self.cache, cache_identifier, entry);
        }

        if should_fetch {
            self.start_fetch(
                cache_identifier,
                operation,
                availability,
                fetch_observable,
                observer,
            );
        } else {
            observer.emit_complete();
        }

        mutex_lock(&self.cache, SOURCE, "fetch_and_save")
            .peek(cache_identifier)
            .cloned()
            .ok_or_else(|| {
                RelayError::invariant(format!(
                    "expected a cached result after preparing query `{}`",
                    operation.name()
                ))
            })
    }

    fn start_fetch(
        &self,
        cache_identifier: &str,
        operation: &OperationDescriptor,
        availability: OperationAvailability,
        fetch_observable: Observable<GraphQlResponse>,
        observer: Observer<Snapshot>,
    ) {
        let (promise, resolver) = Pending::channel();
        let resolver: Arc<Mutex<Option<Resolver>>> = Arc::new(Mutex::new(Some(resolver)));
        let network: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let query_result = QueryResult::new(operation, cache_identifier);
        let settle = {
            let resolver = resolver.clone();
            move || {
                let resolver = mutex_lock(&resolver, SOURCE, "resolve_network").take();
                if let Some(resolver) = resolver {
                    resolver.resolve();
                }
            }
        };

        let context = FetchContext {
            cache: Arc::downgrade(&self.cache),
            config: self.config,
            env: Arc::downgrade(&self.env),
            cache_identifier: cache_identifier.to_string(),
            operation: operation.clone(),
            query_result,
            availability,
            network: network.clone(),
        };

        let start = {
            let context = context.clone();
            let observer = observer.clone();
            move |subscription: &Subscription| {
                *mutex_lock(&context.network, SOURCE, "fetch_start") = Some(subscription.clone());
                if let Some(entry) = context.peek_entry() {
                    entry.set_network(Some(subscription.clone()));
                }
                // Only live queries may cancel their request.
                if context.operation.is_live() {
                    observer.emit_start(subscription);
                } else {
                    observer.emit_start(&subscription.detached());
                }
            }
        };
        let next = {
            let context = context.clone();
            let observer = observer.clone();
            let settle = settle.clone();
            move |_response: GraphQlResponse| {
                if let Some(entry) = context.entry() {
                    mutex_lock(&entry.state, SOURCE, "fetch_next").processed_payloads += 1;
                    entry.set_value(QueryValue::Result(context.query_result.clone()));
                }
                settle();
                if let Some(env) = context.env.upgrade() {
                    observer.emit_next(env.lookup(&context.operation.fragment));
                }
            }
        };
        let error = {
            let context = context.clone();
            let observer = observer.clone();
            let settle = settle.clone();
            move |error: RelayError| {
                if let Some(entry) = context.entry() {
                    let first_payload =
                        mutex_lock(&entry.state, SOURCE, "fetch_error").processed_payloads == 0;
                    if first_payload {
                        entry.set_value(QueryValue::Error(error.clone()));
                    } else {
                        warn!(
                            target_module = SOURCE,
                            operation = %context.operation.fragment.node.name,
                            error = %error,
                            "Incremental payload returned an error"
                        );
                    }
                    settle();
                    *mutex_lock(&context.network, SOURCE, "fetch_error") = None;
                    entry.set_network(None);
                } else {
                    settle();
                }
                observer.emit_error(error);
            }
        };
        let complete = {
            let context = context.clone();
            let observer = observer.clone();
            move || {
                settle();
                *mutex_lock(&context.network, SOURCE, "fetch_complete") = None;
                if let Some(entry) = context.peek_entry() {
                    entry.set_network(None);
                }
                observer.emit_complete();
            }
        };

        fetch_observable.subscribe(
            Observer::new()
                .on_start(start)
                .on_next(next)
                .on_error(error)
                .on_complete(complete)
                .on_unsubscribe(move |subscription| observer.emit_unsubscribe(subscription)),
        );

        let exists = mutex_lock(&self.cache, SOURCE, "start_fetch").has(cache_identifier);
        if !exists {
            let subscription = mutex_lock(&network, SOURCE, "start_fetch").clone();
            let entry = create_entry(
                &self.cache,
                &self.config,
                cache_identifier,
                operation,
                QueryValue::Pending(promise),
                subscription,
                availability,
            );
            cache_set(&self.cache, cache_identifier, entry);
        }
    }
}

/// What the network observer closures need to reach the cache.
#[derive(Clone)]
struct FetchContext {
    cache: Weak<Mutex<LruCache<Arc<QueryCacheEntry>>>>,
    config: ResourceConfig,
    env: Weak<dyn Environment>,
    cache_identifier: String,
    operation: OperationDescriptor,
    query_result: QueryResult,
    availability: OperationAvailability,
    network: Arc<Mutex<Option<Subscription>>>,
}

impl FetchContext {
    fn peek_entry(&self) -> Option<Arc<QueryCacheEntry>> {
        let cache = self.cache.upgrade()?;
        let entry = mutex_lock(&cache, SOURCE, "peek_entry")
            .get(&self.cache_identifier)
            .cloned();
        entry
    }

    fn entry(&self) -> Option<Arc<QueryCacheEntry>> {
        let cache = self.cache.upgrade()?;
        let network = mutex_lock(&self.network, SOURCE, "entry_network").clone();
        Some(get_or_create_entry(
            &cache,
            &self.config,
            &self.cache_identifier,
            &self.operation,
            QueryValue::Result(self.query_result.clone()),
            network,
            || self.availability,
        ))
    }
}

fn get_or_create_entry(
    cache: &QueryCache,
    config: &ResourceConfig,
    cache_identifier: &str,
    operation: &OperationDescriptor,
    value: QueryValue,
    network: Option<Subscription>,
    availability: impl FnOnce() -> OperationAvailability,
) -> Arc<QueryCacheEntry> {
    let existing = mutex_lock(cache, SOURCE, "get_or_create").get(cache_identifier).cloned();
    if let Some(entry) = existing {
        return entry;
    }
    let entry = create_entry(
        cache,
        config,
        cache_identifier,
        operation,
        value,
        network,
        availability(),
    );
    cache_set(cache, cache_identifier, entry.clone());
    entry
}

fn cache_set(cache: &QueryCache, cache_identifier: &str, entry: Arc<QueryCacheEntry>) {
    let evicted = mutex_lock(cache, SOURCE, "cache_set").set(cache_identifier.to_string(), entry);
    if let Some((key, _)) = evicted {
        counter!(METRIC_QUERY_EVICT).increment(1);
        debug!(
            target_module = SOURCE,
            cache_identifier = %key,
            "Evicted query entry without releasing its retention"
        );
    }
}

fn create_entry(
    cache: &QueryCache,
    config: &ResourceConfig,
    cache_identifier: &str,
    operation: &OperationDescriptor,
    value: QueryValue,
    network: Option<Subscription>,
    availability: OperationAvailability,
) -> Arc<QueryCacheEntry> {
    let cache = Arc::downgrade(cache);
    let cache_identifier = cache_identifier.to_string();
    let operation = operation.clone();
    let temporary_retain = config.temporary_retain;
    Arc::new_cyclic(|this: &Weak<QueryCacheEntry>| {
        let this = this.clone();
        let is_live = operation.is_live();
        let retain_operation = operation.clone();
        let retention = SuspenseResource::new(
            move |env: &dyn Environment| {
                let mut retention = env.retain(&retain_operation);
                let this = this.clone();
                let cache = cache.clone();
                let cache_identifier = cache_identifier.clone();
                Disposable::new(move || {
                    let entry = this.upgrade();
                    if let Some(entry) = &entry
                        && entry.is_live
                        && let Some(network) = entry.take_network()
                    {
                        network.unsubscribe();
                    }
                    retention.dispose();
                    if let (Some(entry), Some(cache)) = (entry, cache.upgrade()) {
                        clear_entry(&cache, &cache_identifier, entry.id);
                    }
                })
            },
            temporary_retain,
        );
        QueryCacheEntry {
            id: Uuid::new_v4(),
            is_live,
            availability,
            state: Mutex::new(EntryState {
                value,
                processed_payloads: 0,
                network,
            }),
            retention,
        }
    })
}

/// Removes the entry unless it has already been replaced under the same key.
fn clear_entry(cache: &Mutex<LruCache<Arc<QueryCacheEntry>>>, cache_identifier: &str, id: Uuid) {
    let mut guard = mutex_lock(cache, SOURCE, "clear_entry");
    if guard.peek(cache_identifier).is_some_and(|entry| entry.id == id) {
        guard.delete(cache_identifier);
        debug!(
            target_module = SOURCE,
            cache_identifier = %cache_identifier,
            "Released query entry"
        );
    }
}
