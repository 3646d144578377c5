use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use metrics::counter;
use serde_json::Value;
use tracing::debug;

use crate::cache::lock::mutex_lock;
use crate::error::RelayError;
use crate::runtime::descriptor::{
    DataId, OperationDescriptor, ReaderFragment, RequestDescriptor, SingularSelector,
};
use crate::runtime::disposable::Disposable;
use crate::runtime::environment::{Environment, PendingOperations, SnapshotCallback};
use crate::runtime::observable::{Observable, Observer, ReplaySubject, Sink, Subscription};
use crate::runtime::pending::{Pending, Resolver};
use crate::runtime::policy::{Epoch, RenderPolicy};
use crate::runtime::snapshot::{GraphQlResponse, OperationAvailability, Snapshot};

use super::network::Network;
use super::store::{Notifications, RecordStore};

const SOURCE: &str = "runtime::memory::environment";

const METRIC_NETWORK_REQUEST: &str = "relay_network_request_total";

#[derive(Debug, Clone, Copy)]
pub struct EnvironmentOptions {
    pub is_server: bool,
    pub render_policy: RenderPolicy,
}

impl Default for EnvironmentOptions {
    fn default() -> Self {
        Self {
            is_server: false,
            render_policy: RenderPolicy::Partial,
        }
    }
}

/// A request shared by every `fetch_query` subscriber with the same
/// identifier.
struct InFlight {
    generation: u64,
    request: Arc<RequestDescriptor>,
    subject: ReplaySubject<GraphQlResponse>,
    subscribers: usize,
    waiters: Vec<Resolver>,
    network: Option<Subscription>,
}

#[derive(Default)]
struct InFlightRegistry {
    requests: HashMap<String, InFlight>,
    next_generation: u64,
}

/// Reference [`Environment`]: a normalized record store plus a pluggable
/// network, with `fetch_query` dedup keyed by request identifier.
pub struct MemoryEnvironment {
    this: Weak<MemoryEnvironment>,
    store: Mutex<RecordStore>,
    network: Arc<dyn Network>,
    in_flight: Mutex<InFlightRegistry>,
    options: EnvironmentOptions,
}

fn notify(notifications: Notifications) {
    for (callback, snapshot) in notifications {
        callback(&snapshot);
    }
}

impl MemoryEnvironment {
    pub fn new(network: Arc<dyn Network>, options: EnvironmentOptions) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            store: Mutex::new(RecordStore::default()),
            network,
            in_flight: Mutex::new(InFlightRegistry::default()),
            options,
        })
    }

    /// Writes a response payload for `operation` as if it came from the
    /// network, notifying affected subscribers before returning.
    pub fn commit_payload(&self, operation: &OperationDescriptor, data: Value) {
        let Value::Object(data) = data else {
            return;
        };
        let notifications =
            mutex_lock(&self.store, SOURCE, "commit_payload").commit_payload(operation, &data, &[]);
        notify(notifications);
    }

    /// Local update of one scalar field on a record.
    pub fn commit_update(&self, id: &str, field: &str, value: Value) {
        let notifications = mutex_lock(&self.store, SOURCE, "commit_update").set_value(id, field, value);
        notify(notifications);
    }

    pub fn set_field_error(&self, id: &str, field: &str, message: &str) {
        let notifications =
            mutex_lock(&self.store, SOURCE, "set_field_error").set_field_error(id, field, message);
        notify(notifications);
    }

    pub fn delete_record(&self, id: &str) {
        let notifications = mutex_lock(&self.store, SOURCE, "delete_record").delete_record(id);
        notify(notifications);
    }

    pub fn has_record(&self, id: &DataId) -> bool {
        mutex_lock(&self.store, SOURCE, "has_record").has_record(id)
    }

    /// Marks the operation's data stale so `check` reports it until refetched.
    pub fn invalidate(&self, operation: &OperationDescriptor) {
        mutex_lock(&self.store, SOURCE, "invalidate").invalidate(operation);
    }

    pub fn invalidate_store(&self) {
        mutex_lock(&self.store, SOURCE, "invalidate_store").invalidate_store();
    }

    /// Writes live resolver state and settles readers waiting for it.
    pub fn set_live_value(&self, live_state_id: &str, value: Value) {
        let (notifications, waiters) =
            mutex_lock(&self.store, SOURCE, "set_live_value").set_live_value(live_state_id, value);
        for waiter in waiters {
            waiter.resolve();
        }
        notify(notifications);
    }

    pub fn retain_count(&self, operation: &OperationDescriptor) -> usize {
        mutex_lock(&self.store, SOURCE, "retain_count").retain_count(&operation.request.identifier)
    }

    pub fn subscription_count(&self) -> usize {
        mutex_lock(&self.store, SOURCE, "subscription_count").subscription_count()
    }

    pub fn in_flight_count(&self) -> usize {
        mutex_lock(&self.in_flight, SOURCE, "in_flight_count").requests.len()
    }

    fn commit_response(&self, operation: &OperationDescriptor, response: &GraphQlResponse) {
        let Some(Value::Object(data)) = &response.data else {
            return;
        };
        let notifications = mutex_lock(&self.store, SOURCE, "commit_response").commit_payload(
            operation,
            data,
            &response.errors,
        );
        notify(notifications);
    }

    /// Joins the in-flight request for `identifier`, creating it when
    /// `operation` is given. Returns the shared stream, its generation and
    /// whether the caller must start the network request.
    fn join(
        &self,
        identifier: &str,
        operation: Option<&OperationDescriptor>,
    ) -> Option<(Observable<GraphQlResponse>, u64, bool)> {
        let mut registry = mutex_lock(&self.in_flight, SOURCE, "join");
        if let Some(entry) = registry.requests.get_mut(identifier) {
            entry.subscribers += 1;
            return Some((entry.subject.observable(), entry.generation, false));
        }
        let operation = operation?;
        registry.next_generation += 1;
        let generation = registry.next_generation;
        let subject = ReplaySubject::new();
        let observable = subject.observable();
        registry.requests.insert(
            identifier.to_string(),
            InFlight {
                generation,
                request: operation.request.clone(),
                subject,
                subscribers: 1,
                waiters: Vec::new(),
                network: None,
            },
        );
        Some((observable, generation, true))
    }

    fn start(&self, operation: &OperationDescriptor, generation: u64) {
        let identifier = operation.request.identifier.clone();
        let Some(subject) = self.subject(&identifier, generation) else {
            return;
        };

        let next_this = self.this.clone();
        let next_identifier = identifier.clone();
        let next_subject = subject.clone();
        let error_this = self.this.clone();
        let error_identifier = identifier.clone();
        let error_subject = subject.clone();
        let complete_this = self.this.clone();
        let complete_identifier = identifier.clone();
        let network = self.execute(operation).subscribe(
            Observer::new()
                .on_next(move |response: GraphQlResponse| {
                    next_subject.next(response);
                    if let Some(env) = next_this.upgrade() {
                        env.wake(&next_identifier, generation);
                    }
                })
                .on_error(move |error| {
                    if let Some(env) = error_this.upgrade() {
                        env.settle(&error_identifier, generation);
                    }
                    error_subject.error(error);
                })
                .on_complete(move || {
                    if let Some(env) = complete_this.upgrade() {
                        env.settle(&complete_identifier, generation);
                    }
                    subject.complete();
                }),
        );

        let mut registry = mutex_lock(&self.in_flight, SOURCE, "start");
        match registry.requests.get_mut(&identifier) {
            Some(entry) if entry.generation == generation => entry.network = Some(network),
            // Settled synchronously.
            _ => {}
        }
    }

    fn subject(&self, identifier: &str, generation: u64) -> Option<ReplaySubject<GraphQlResponse>> {
        mutex_lock(&self.in_flight, SOURCE, "subject")
            .requests
            .get(identifier)
            .filter(|entry| entry.generation == generation)
            .map(|entry| entry.subject.clone())
    }

    fn wake(&self, identifier: &str, generation: u64) {
        let waiters = {
            let mut registry = mutex_lock(&self.in_flight, SOURCE, "wake");
            match registry.requests.get_mut(identifier) {
                Some(entry) if entry.generation == generation => std::mem::take(&mut entry.waiters),
                _ => Vec::new(),
            }
        };
        for waiter in waiters {
            waiter.resolve();
        }
    }

    fn settle(&self, identifier: &str, generation: u64) {
        let entry = {
            let mut registry = mutex_lock(&self.in_flight, SOURCE, "settle");
            match registry.requests.get(identifier) {
                Some(entry) if entry.generation == generation => registry.requests.remove(identifier),
                _ => None,
            }
        };
        if let Some(entry) = entry {
            for waiter in entry.waiters {
                waiter.resolve();
            }
        }
    }

    fn leave(&self, identifier: &str, generation: u64) {
        let entry = {
            let mut registry = mutex_lock(&self.in_flight, SOURCE, "leave");
            let Some(entry) = registry.requests.get_mut(identifier) else {
                return;
            };
            if entry.generation != generation {
                return;
            }
            entry.subscribers = entry.subscribers.saturating_sub(1);
            if entry.subscribers > 0 {
                return;
            }
            registry.requests.remove(identifier)
        };
        if let Some(entry) = entry {
            debug!(
                target_module = SOURCE,
                request = %identifier,
                "Cancelling request with no remaining subscribers"
            );
            if let Some(network) = entry.network {
                network.unsubscribe();
            }
            for waiter in entry.waiters {
                waiter.resolve();
            }
        }
    }

    fn shared(
        &self,
        identifier: String,
        operation: Option<OperationDescriptor>,
    ) -> Observable<GraphQlResponse> {
        let this = self.this.clone();
        Observable::create(move |sink: Sink<GraphQlResponse>| {
            let Some(env) = this.upgrade() else {
                sink.complete();
                return Disposable::noop();
            };
            let Some((observable, generation, started)) = env.join(&identifier, operation.as_ref())
            else {
                sink.complete();
                return Disposable::noop();
            };
            let inner = observable.subscribe(Observer::forward(sink));
            if started && let Some(operation) = &operation {
                env.start(operation, generation);
            }
            let this = this.clone();
            let identifier = identifier.clone();
            Disposable::new(move || {
                inner.unsubscribe();
                if let Some(env) = this.upgrade() {
                    env.leave(&identifier, generation);
                }
            })
        })
    }

    fn waiter_for(&self, identifier: &str) -> Option<(Pending, Arc<RequestDescriptor>)> {
        let mut registry = mutex_lock(&self.in_flight, SOURCE, "waiter_for");
        let entry = registry.requests.get_mut(identifier)?;
        let (pending, resolver) = Pending::channel();
        entry.waiters.push(resolver);
        Some((pending, entry.request.clone()))
    }
}

impl Environment for MemoryEnvironment {
    fn lookup(&self, selector: &SingularSelector) -> Snapshot {
        mutex_lock(&self.store, SOURCE, "lookup").lookup(selector)
    }

    fn subscribe(&self, snapshot: &Snapshot, callback: SnapshotCallback) -> Disposable {
        let id = mutex_lock(&self.store, SOURCE, "subscribe").subscribe(snapshot, callback);
        let this = self.this.clone();
        Disposable::new(move || {
            if let Some(env) = this.upgrade() {
                mutex_lock(&env.store, SOURCE, "unsubscribe").unsubscribe(id);
            }
        })
    }

    fn retain(&self, operation: &OperationDescriptor) -> Disposable {
        let identifier = operation.request.identifier.clone();
        mutex_lock(&self.store, SOURCE, "retain").retain(&identifier);
        let this = self.this.clone();
        Disposable::new(move || {
            if let Some(env) = this.upgrade() {
                mutex_lock(&env.store, SOURCE, "release").release(&identifier);
            }
        })
    }

    fn check(&self, operation: &OperationDescriptor) -> OperationAvailability {
        mutex_lock(&self.store, SOURCE, "check").check(operation)
    }

    fn execute(&self, operation: &OperationDescriptor) -> Observable<GraphQlResponse> {
        let this = self.this.clone();
        let operation = operation.clone();
        Observable::create(move |sink: Sink<GraphQlResponse>| {
            let Some(env) = this.upgrade() else {
                sink.complete();
                return Disposable::noop();
            };
            counter!(METRIC_NETWORK_REQUEST).increment(1);
            debug!(
                target_module = SOURCE,
                operation = %operation.name(),
                request = %operation.request.identifier,
                "Executing request"
            );

            let next_sink = sink.clone();
            let error_sink = sink.clone();
            let next_this = this.clone();
            let next_operation = operation.clone();
            let subscription = env.network.execute(&operation.request).subscribe(
                Observer::new()
                    .on_next(move |response: GraphQlResponse| {
                        if response.data.is_none()
                            && let Some(error) = response.errors.first()
                        {
                            next_sink.error(RelayError::network(
                                next_operation.name(),
                                error.message.clone(),
                            ));
                            return;
                        }
                        if let Some(env) = next_this.upgrade() {
                            env.commit_response(&next_operation, &response);
                        }
                        next_sink.next(response);
                    })
                    .on_error(move |error| error_sink.error(error))
                    .on_complete(move || sink.complete()),
            );
            Disposable::new(move || subscription.unsubscribe())
        })
    }

    fn fetch_query(&self, operation: &OperationDescriptor) -> Observable<GraphQlResponse> {
        self.shared(operation.request.identifier.clone(), Some(operation.clone()))
    }

    fn store_epoch(&self) -> Epoch {
        mutex_lock(&self.store, SOURCE, "store_epoch").epoch()
    }

    fn is_server(&self) -> bool {
        self.options.is_server
    }

    fn default_render_policy(&self) -> RenderPolicy {
        self.options.render_policy
    }

    fn pending_operations_for_fragment(
        &self,
        _fragment: &ReaderFragment,
        owner: &RequestDescriptor,
    ) -> Option<PendingOperations> {
        let (pending, request) = self.waiter_for(&owner.identifier)?;
        Some(PendingOperations {
            pending,
            operations: vec![request],
        })
    }

    fn promise_for_active_request(&self, request: &RequestDescriptor) -> Option<Pending> {
        self.waiter_for(&request.identifier).map(|(pending, _)| pending)
    }

    fn observable_for_active_request(
        &self,
        request: &RequestDescriptor,
    ) -> Option<Observable<GraphQlResponse>> {
        mutex_lock(&self.in_flight, SOURCE, "observable_for_active_request")
            .requests
            .contains_key(&request.identifier)
            .then(|| self.shared(request.identifier.clone(), None))
    }

    fn is_request_active(&self, request: &RequestDescriptor) -> bool {
        mutex_lock(&self.in_flight, SOURCE, "is_request_active")
            .requests
            .contains_key(&request.identifier)
    }

    fn live_resolver_promise(&self, live_state_id: &str) -> Option<Pending> {
        let mut store = mutex_lock(&self.store, SOURCE, "live_resolver_promise");
        if store.has_live_value(live_state_id) {
            return None;
        }
        let (pending, resolver) = Pending::channel();
        store.add_live_waiter(live_state_id, resolver);
        Some(pending)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::runtime::data::Data;
    use crate::runtime::descriptor::{ConcreteRequest, Field, Variables};
    use crate::runtime::memory::ScriptedNetwork;

    fn setup() -> (Arc<MemoryEnvironment>, ScriptedNetwork, OperationDescriptor) {
        let network = ScriptedNetwork::new();
        let env = MemoryEnvironment::new(Arc::new(network.clone()), EnvironmentOptions::default());
        let request = Arc::new(ConcreteRequest::query(
            "ViewerQuery",
            vec![Field::linked("viewer", vec![Field::scalar("name").into()]).into()],
        ));
        (env, network, OperationDescriptor::new(&request, Variables::new()))
    }

    #[test]
    fn fetch_query_dedupes_concurrent_subscribers() {
        let (env, network, operation) = setup();
        let received = Arc::new(AtomicUsize::new(0));

        let first_count = received.clone();
        let first = env.fetch_query(&operation).subscribe(Observer::new().on_next(
            move |_: GraphQlResponse| {
                first_count.fetch_add(1, Ordering::SeqCst);
            },
        ));
        let second_count = received.clone();
        env.fetch_query(&operation).subscribe(Observer::new().on_next(
            move |_: GraphQlResponse| {
                second_count.fetch_add(1, Ordering::SeqCst);
            },
        ));

        assert_eq!(network.request_count(), 1);
        assert!(env.is_request_active(&operation.request));

        network.respond("ViewerQuery", json!({"viewer": {"name": "Ada"}}));

        assert_eq!(received.load(Ordering::SeqCst), 2);
        assert!(!env.is_request_active(&operation.request));
        assert!(first.is_closed());
        let snapshot = env.lookup(&operation.fragment);
        assert_eq!(
            snapshot.data.get_path(&["viewer", "name"]).and_then(Data::as_str),
            Some("Ada")
        );
    }

    #[test]
    fn last_subscriber_leaving_cancels_the_request() {
        let (env, network, operation) = setup();
        let first = env.fetch_query(&operation).subscribe(Observer::new());
        let second = env.fetch_query(&operation).subscribe(Observer::new());

        first.unsubscribe();
        assert!(network.cancelled().is_empty());

        second.unsubscribe();
        assert_eq!(network.cancelled(), vec!["ViewerQuery".to_string()]);
        assert_eq!(env.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn active_request_promise_settles_on_first_payload() {
        let (env, network, operation) = setup();
        let _subscription = env.fetch_query(&operation).subscribe(Observer::new());
        let pending = env
            .promise_for_active_request(&operation.request)
            .expect("request is active");
        assert!(!pending.is_settled());

        network.push(
            "ViewerQuery",
            GraphQlResponse::incremental(json!({"viewer": {"name": "Ada"}})),
        );

        pending.await;
        assert!(env.is_request_active(&operation.request));
    }

    #[test]
    fn error_only_response_fails_the_stream() {
        let (env, network, operation) = setup();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        env.execute(&operation)
            .subscribe(Observer::new().on_error(move |error| sink.lock().unwrap().push(error)));

        network.push(
            "ViewerQuery",
            GraphQlResponse {
                data: None,
                errors: vec![crate::runtime::snapshot::GraphQlError {
                    message: "boom".into(),
                    path: Vec::new(),
                }],
                has_next: false,
            },
        );

        assert_eq!(
            *errors.lock().unwrap(),
            vec![RelayError::network("ViewerQuery", "boom")]
        );
    }
}
