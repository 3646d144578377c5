//! Whole-operation reads over the query resource.
//!
//! A [`QueryNode`] prepares the operation (deduplicating on its cache
//! identifier), permanently retains the result once one exists and renders
//! the root fragment through a [`FragmentNode`].

use std::sync::{Arc, Mutex};

use crate::cache::lock::mutex_lock;
use crate::error::RelayError;
use crate::resource::query::QueryResult;
use crate::runtime::data::Data;
use crate::runtime::descriptor::{FragmentKey, OperationDescriptor};
use crate::runtime::disposable::Disposable;
use crate::runtime::observable::{Observable, Observer};
use crate::runtime::pending::{Resolution, resolve};
use crate::runtime::policy::{FetchPolicy, RenderPolicy};
use crate::runtime::snapshot::{GraphQlResponse, Snapshot};

use super::fetch_tracker::FetchTracker;
use super::fragment::FragmentNode;
use super::reactive::{DataState, Owner, Signal};

const SOURCE: &str = "primitives::query";

#[derive(Debug, Clone, Default)]
pub struct QueryNodeOptions {
    pub fetch_policy: Option<FetchPolicy>,
    pub render_policy: Option<RenderPolicy>,
    /// Cache breaker: a new key forces a new cache entry.
    pub fetch_key: Option<String>,
}

#[derive(Default)]
struct NodeSlot {
    result: Option<QueryResult>,
    retention: Option<Disposable>,
    fragment: Option<FragmentNode>,
    disposed: bool,
}

struct QueryNodeInner {
    owner: Owner,
    operation: OperationDescriptor,
    cache_identifier: String,
    fetch_observable: Observable<GraphQlResponse>,
    options: QueryNodeOptions,
    tracker: FetchTracker,
    state: Signal<DataState<Data>>,
    slot: Mutex<NodeSlot>,
}

#[derive(Clone)]
pub struct QueryNode {
    inner: Arc<QueryNodeInner>,
}

/// Builds the node; nothing is fetched until the first read.
pub fn create_query_node(
    owner: &Owner,
    operation: OperationDescriptor,
    fetch_observable: Observable<GraphQlResponse>,
    options: QueryNodeOptions,
) -> QueryNode {
    let cache_identifier = owner.context().query_resource().query_cache_identifier(
        &operation,
        options.fetch_policy,
        options.render_policy,
        options.fetch_key.as_deref(),
    );
    let node = QueryNode {
        inner: Arc::new(QueryNodeInner {
            owner: owner.clone(),
            operation,
            cache_identifier,
            fetch_observable,
            options,
            tracker: FetchTracker::new(),
            state: Signal::new(DataState::pending()),
            slot: Mutex::new(NodeSlot::default()),
        }),
    };
    let weak = Arc::downgrade(&node.inner);
    owner.scope().on_cleanup(move || {
        if let Some(inner) = weak.upgrade() {
            inner.dispose();
        }
    });
    node
}

impl QueryNode {
    pub fn operation(&self) -> &OperationDescriptor {
        &self.inner.operation
    }

    pub fn cache_identifier(&self) -> &str {
        &self.inner.cache_identifier
    }

    /// One read attempt of the root fragment.
    pub fn read(&self) -> Result<Resolution<Data>, RelayError> {
        let inner = &self.inner;
        if mutex_lock(&inner.slot, SOURCE, "read").disposed {
            return Err(RelayError::invariant(format!(
                "query `{}` was read after its node was disposed",
                inner.operation.name()
            )));
        }

        let prepared = inner.owner.context().query_resource().prepare_with_identifier(
            &inner.cache_identifier,
            &inner.operation,
            inner.fetch_observable.clone(),
            inner.options.fetch_policy,
            inner.options.render_policy,
            Some(inner.tracking_observer()),
        );
        let result = match prepared {
            Ok(Resolution::Ready(result)) => result,
            Ok(Resolution::Pending(pending)) => {
                inner.state.update(|state| state.pending = true);
                return Ok(Resolution::Pending(pending));
            }
            Err(error) => {
                inner.state.set(DataState::failed(error.clone()));
                return Err(error);
            }
        };

        let fragment = self.fragment_for(result);
        fragment.read()
    }

    pub async fn resolve(&self) -> Result<Data, RelayError> {
        resolve(|| self.read()).await
    }

    pub fn state(&self) -> DataState<Data> {
        self.inner.state.get()
    }

    pub fn signal(&self) -> &Signal<DataState<Data>> {
        &self.inner.state
    }

    pub fn is_fetching(&self) -> bool {
        self.inner.tracker.is_fetching()
    }

    pub fn dispose(&self) {
        self.inner.dispose();
    }

    /// Retains `result` on first sight and returns the root fragment node.
    fn fragment_for(&self, result: QueryResult) -> FragmentNode {
        let inner = &self.inner;
        let mut slot = mutex_lock(&inner.slot, SOURCE, "fragment_for");
        if slot.result.as_ref() != Some(&result) {
            if let Some(mut previous) = slot.retention.take() {
                previous.dispose();
            }
            if let Some(previous) = slot.fragment.take() {
                previous.dispose();
            }
            slot.retention = Some(inner.owner.context().query_resource().retain(&result));
            slot.result = Some(result.clone());
        }
        if let Some(fragment) = &slot.fragment {
            return fragment.clone();
        }
        let fragment = FragmentNode::new(
            &inner.owner,
            result.fragment_node.clone(),
            Some(FragmentKey::Single(result.fragment_ref.clone())),
            inner.state.clone(),
        );
        slot.fragment = Some(fragment.clone());
        fragment
    }
}

impl QueryNodeInner {
    fn tracking_observer(&self) -> Observer<Snapshot> {
        let start = self.tracker.clone();
        let complete = self.tracker.clone();
        let error = self.tracker.clone();
        let unsubscribe = self.tracker.clone();
        Observer::new()
            .on_start(move |subscription| start.start_fetch(subscription.clone()))
            .on_complete(move || complete.complete_fetch())
            .on_error(move |_| error.complete_fetch())
            .on_unsubscribe(move |_| unsubscribe.complete_fetch())
    }

    fn dispose(&self) {
        let (retention, fragment) = {
            let mut slot = mutex_lock(&self.slot, SOURCE, "dispose");
            slot.disposed = true;
            (slot.retention.take(), slot.fragment.take())
        };
        if let Some(fragment) = fragment {
            fragment.dispose();
        }
        if let Some(mut retention) = retention {
            retention.dispose();
        }
    }
}
