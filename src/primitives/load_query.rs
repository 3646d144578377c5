//! Imperative query preloading outside of any render.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::cache::lock::mutex_lock;
use crate::error::RelayError;
use crate::runtime::descriptor::{CacheConfig, ConcreteRequest, OperationDescriptor, Variables};
use crate::runtime::disposable::Disposable;
use crate::runtime::environment::Environment;
use crate::runtime::observable::{Observable, Observer, ReplaySubject, Subscription};
use crate::runtime::policy::FetchPolicy;
use crate::runtime::snapshot::{AvailabilityStatus, GraphQlResponse};

const SOURCE: &str = "primitives::load_query";

static NEXT_FETCH_KEY: AtomicU64 = AtomicU64::new(100_001);

fn next_fetch_key() -> u64 {
    NEXT_FETCH_KEY.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoadQueryOptions {
    /// Defaults to store-or-network.
    pub fetch_policy: Option<FetchPolicy>,
}

#[derive(Default)]
struct PreloadedState {
    retention: Option<Disposable>,
    network: Option<Subscription>,
    disposed: bool,
    released: bool,
    cancelled: bool,
    network_error: Option<RelayError>,
}

/// A query whose fetch was started ahead of rendering.
#[derive(Clone)]
pub struct PreloadedQuery {
    environment: Arc<dyn Environment>,
    operation: OperationDescriptor,
    fetch_key: u64,
    fetch_policy: FetchPolicy,
    source: Option<Observable<GraphQlResponse>>,
    state: Arc<Mutex<PreloadedState>>,
}

/// Retains the operation and, unless the policy and store say otherwise,
/// starts fetching it. Every call gets a fresh fetch key.
pub fn load_query(
    environment: &Arc<dyn Environment>,
    request: &Arc<ConcreteRequest>,
    variables: Variables,
    options: LoadQueryOptions,
) -> PreloadedQuery {
    let fetch_policy = options.fetch_policy.unwrap_or(FetchPolicy::StoreOrNetwork);
    let fetch_key = next_fetch_key();
    let operation = OperationDescriptor::with_cache_config(
        request,
        variables,
        CacheConfig { force: true },
    );
    let state = Arc::new(Mutex::new(PreloadedState {
        retention: Some(environment.retain(&operation)),
        ..PreloadedState::default()
    }));

    let should_fetch = match fetch_policy {
        FetchPolicy::StoreOnly => false,
        FetchPolicy::StoreOrNetwork => {
            environment.check(&operation).status != AvailabilityStatus::Available
        }
        FetchPolicy::StoreAndNetwork | FetchPolicy::NetworkOnly => true,
    };
    debug!(
        target_module = SOURCE,
        operation = %operation.name(),
        fetch_key,
        %fetch_policy,
        should_fetch,
        "Loading query"
    );

    let source = should_fetch.then(|| {
        let subject = ReplaySubject::new();
        let next = subject.clone();
        let error = subject.clone();
        let complete = subject.clone();
        let failed = state.clone();
        let network = environment.fetch_query(&operation).subscribe(
            Observer::new()
                .on_next(move |response| next.next(response))
                .on_error(move |err: RelayError| {
                    mutex_lock(&failed, SOURCE, "network_error").network_error = Some(err.clone());
                    error.error(err);
                })
                .on_complete(move || complete.complete()),
        );
        if !network.is_closed() {
            mutex_lock(&state, SOURCE, "load_query").network = Some(network);
        }
        subject.observable()
    });

    PreloadedQuery {
        environment: environment.clone(),
        operation,
        fetch_key,
        fetch_policy,
        source,
        state,
    }
}

impl PreloadedQuery {
    pub fn environment(&self) -> &Arc<dyn Environment> {
        &self.environment
    }

    pub fn operation(&self) -> &OperationDescriptor {
        &self.operation
    }

    pub fn name(&self) -> &str {
        self.operation.name()
    }

    pub fn variables(&self) -> &Variables {
        &self.operation.request.variables
    }

    pub fn fetch_key(&self) -> u64 {
        self.fetch_key
    }

    pub fn fetch_policy(&self) -> FetchPolicy {
        self.fetch_policy
    }

    /// Replays the preloaded payloads; `None` when nothing was fetched.
    pub fn source(&self) -> Option<Observable<GraphQlResponse>> {
        self.source.clone()
    }

    pub fn network_error(&self) -> Option<RelayError> {
        mutex_lock(&self.state, SOURCE, "network_error").network_error.clone()
    }

    /// True once disposed or released.
    pub fn is_disposed(&self) -> bool {
        let state = mutex_lock(&self.state, SOURCE, "is_disposed");
        state.disposed || state.released
    }

    /// Drops the store retain, leaving any request running.
    pub fn release_query(&self) {
        let retention = {
            let mut state = mutex_lock(&self.state, SOURCE, "release_query");
            if state.released {
                return;
            }
            state.released = true;
            state.retention.take()
        };
        if let Some(mut retention) = retention {
            retention.dispose();
        }
    }

    pub fn cancel_network_request(&self) {
        let network = {
            let mut state = mutex_lock(&self.state, SOURCE, "cancel_network_request");
            state.cancelled = true;
            state.network.take()
        };
        if let Some(network) = network {
            network.unsubscribe();
        }
    }

    /// True once the request was cancelled, directly or through `dispose`.
    pub fn was_cancelled(&self) -> bool {
        mutex_lock(&self.state, SOURCE, "was_cancelled").cancelled
    }

    /// Releases the query and cancels its request.
    pub fn dispose(&self) {
        if std::mem::replace(&mut mutex_lock(&self.state, SOURCE, "dispose").disposed, true) {
            return;
        }
        self.release_query();
        self.cancel_network_request();
    }
}
