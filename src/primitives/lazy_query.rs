//! Render-as-you-fetch reads that start their own request.
//!
//! Fetches go through the context's [`QueryReferenceCache`], so several lazy
//! queries for the same operation, policy and fetch key share one request.
//! Data is read straight from the store and kept live with a store
//! subscription that is re-established after every payload.
//!
//! [`QueryReferenceCache`]: crate::resource::QueryReferenceCache

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::cache::lock::mutex_lock;
use crate::error::RelayError;
use crate::runtime::data::Data;
use crate::runtime::descriptor::{CacheConfig, ConcreteRequest, OperationDescriptor, Variables};
use crate::runtime::disposable::Disposable;
use crate::runtime::observable::Observer;
use crate::runtime::pending::{Pending, Resolver};
use crate::runtime::policy::FetchPolicy;

use super::memo::create_memo_operation_descriptor;
use super::reactive::{DataState, Owner, Signal};

const SOURCE: &str = "primitives::lazy_query";

#[derive(Debug, Clone, Default)]
pub struct LazyLoadQueryOptions {
    pub fetch_policy: Option<FetchPolicy>,
    pub fetch_key: Option<String>,
}

struct LazyInner {
    owner: Owner,
    fetch_policy: FetchPolicy,
    fetch_key: Option<String>,
    state: Signal<DataState<Data>>,
    in_flight: Signal<bool>,
    generation: AtomicU64,
    held: Mutex<Vec<Disposable>>,
    store_subscription: Mutex<Option<Disposable>>,
    first_payload: Mutex<Option<Pending>>,
}

/// Handle to a running lazy query.
#[derive(Clone)]
pub struct LazyQuery {
    inner: Arc<LazyInner>,
    operation: Signal<OperationDescriptor>,
}

/// Starts `request` with the current `variables` and restarts it whenever
/// they change by value. Everything is released with the owner's scope.
pub fn create_lazy_load_query(
    owner: &Owner,
    request: Arc<ConcreteRequest>,
    variables: &Signal<Variables>,
    options: LazyLoadQueryOptions,
) -> LazyQuery {
    let config = owner.context().config();
    let fetch_policy = options.fetch_policy.unwrap_or(if request.live {
        config.default_live_fetch_policy
    } else {
        config.default_fetch_policy
    });
    let (operation, memo_subscription) =
        create_memo_operation_descriptor(request, variables, CacheConfig::default());
    owner.scope().own(memo_subscription);

    let inner = Arc::new(LazyInner {
        owner: owner.clone(),
        fetch_policy,
        fetch_key: options.fetch_key,
        state: Signal::new(DataState::pending()),
        in_flight: Signal::new(false),
        generation: AtomicU64::new(0),
        held: Mutex::new(Vec::new()),
        store_subscription: Mutex::new(None),
        first_payload: Mutex::new(None),
    });

    let weak = Arc::downgrade(&inner);
    owner.scope().own(operation.subscribe(move |next| {
        if let Some(inner) = weak.upgrade() {
            LazyInner::run(&inner, next.clone());
        }
    }));
    let weak = Arc::downgrade(&inner);
    owner.scope().on_cleanup(move || {
        if let Some(inner) = weak.upgrade() {
            inner.generation.fetch_add(1, Ordering::SeqCst);
            inner.teardown();
        }
    });

    LazyInner::run(&inner, operation.get());
    LazyQuery { inner, operation }
}

impl LazyQuery {
    pub fn state(&self) -> DataState<Data> {
        self.inner.state.get()
    }

    pub fn signal(&self) -> &Signal<DataState<Data>> {
        &self.inner.state
    }

    pub fn in_flight(&self) -> bool {
        self.inner.in_flight.get()
    }

    pub fn operation(&self) -> OperationDescriptor {
        self.operation.get()
    }

    /// Waits for the first payload of the current request, then returns the
    /// data or the request's error.
    pub async fn ready(&self) -> Result<Option<Data>, RelayError> {
        let waiting = mutex_lock(&self.inner.first_payload, SOURCE, "ready").clone();
        if let Some(waiting) = waiting {
            waiting.await;
        }
        self.inner.state.get().read()
    }
}

fn settle(resolver: &Mutex<Option<Resolver>>) {
    let resolver = mutex_lock(resolver, SOURCE, "settle").take();
    if let Some(resolver) = resolver {
        resolver.resolve();
    }
}

impl LazyInner {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn run(this: &Arc<Self>, operation: OperationDescriptor) {
        let generation = this.generation.fetch_add(1, Ordering::SeqCst) + 1;
        this.teardown();

        let context = this.owner.context();
        let env = context.environment().clone();
        let mut held = vec![env.retain(&operation)];
        let reference = context.query_references().resolve(
            env.as_ref(),
            &operation,
            this.fetch_policy,
            this.fetch_key.as_deref(),
        );

        let Some(reference) = reference else {
            debug!(
                target_module = SOURCE,
                operation = %operation.name(),
                "Store satisfies lazy query; not fetching"
            );
            *mutex_lock(&this.held, SOURCE, "run") = held;
            Self::publish(this, generation, &operation);
            return;
        };

        held.push(reference.retain(env.as_ref()));
        let (pending, resolver) = Pending::channel();
        let resolver = Arc::new(Mutex::new(Some(resolver)));
        *mutex_lock(&this.first_payload, SOURCE, "run") = Some(pending.clone());
        this.owner.boundary().register(pending);
        this.in_flight.set_if_changed(true);
        this.state.update(|state| {
            state.pending = true;
            state.error = None;
        });

        let next = (Arc::downgrade(this), operation.clone(), resolver.clone());
        let error = (Arc::downgrade(this), resolver.clone());
        let complete = (Arc::downgrade(this), operation.clone(), resolver);
        let subscription = reference.source().subscribe(
            Observer::new()
                .on_next(move |_| {
                    if let Some(inner) = next.0.upgrade() {
                        Self::publish(&inner, generation, &next.1);
                    }
                    settle(&next.2);
                })
                .on_error(move |err: RelayError| {
                    if let Some(inner) = error.0.upgrade()
                        && inner.is_current(generation)
                    {
                        inner.in_flight.set_if_changed(false);
                        inner.state.set(DataState::failed(err));
                    }
                    settle(&error.1);
                })
                .on_complete(move || {
                    if let Some(inner) = complete.0.upgrade()
                        && inner.is_current(generation)
                    {
                        inner.in_flight.set_if_changed(false);
                        Self::publish(&inner, generation, &complete.1);
                    }
                    settle(&complete.2);
                }),
        );
        held.push(Disposable::new(move || subscription.unsubscribe()));

        if this.is_current(generation) {
            *mutex_lock(&this.held, SOURCE, "run") = held;
        } else {
            Disposable::all(held).dispose();
        }
    }

    /// Reads the operation root and re-subscribes to what it touched.
    fn publish(this: &Arc<Self>, generation: u64, operation: &OperationDescriptor) {
        if !this.is_current(generation) {
            return;
        }
        let env = this.owner.context().environment().clone();
        let snapshot = env.lookup(&operation.fragment);
        this.state
            .set_if_changed(DataState::ready(snapshot.data.clone()));

        let weak = Arc::downgrade(this);
        let subscription = env.subscribe(
            &snapshot,
            Arc::new(move |snapshot| {
                if let Some(inner) = weak.upgrade()
                    && inner.is_current(generation)
                {
                    inner
                        .state
                        .set_if_changed(DataState::ready(snapshot.data.clone()));
                }
            }),
        );
        let previous = mutex_lock(&this.store_subscription, SOURCE, "publish").replace(subscription);
        if let Some(mut previous) = previous {
            previous.dispose();
        }
    }

    fn teardown(&self) {
        let held = std::mem::take(&mut *mutex_lock(&self.held, SOURCE, "teardown"));
        let subscription = mutex_lock(&self.store_subscription, SOURCE, "teardown").take();
        if let Some(mut subscription) = subscription {
            subscription.dispose();
        }
        Disposable::all(held).dispose();
        self.in_flight.set_if_changed(false);
    }
}
