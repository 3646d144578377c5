use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::cache::lock::mutex_lock;
use crate::error::RelayError;
use crate::runtime::data::Data;
use crate::runtime::descriptor::{ConcreteRequest, OperationDescriptor, Variables};
use crate::runtime::disposable::Disposable;
use crate::runtime::observable::Observer;

use super::reactive::{Owner, Signal};

const SOURCE: &str = "primitives::mutation";

pub type CompletedCallback = Box<dyn FnOnce(Data) + Send>;
pub type ErrorCallback = Box<dyn FnOnce(RelayError) + Send>;

#[derive(Default)]
pub struct MutationConfig {
    pub variables: Variables,
    /// Receives the mutation's response as read back from the store.
    pub on_completed: Option<CompletedCallback>,
    pub on_error: Option<ErrorCallback>,
    pub on_unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

struct Callbacks {
    on_completed: Option<CompletedCallback>,
    on_error: Option<ErrorCallback>,
    on_unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

/// Commits one mutation document, tracking every commit still in flight.
#[derive(Clone)]
pub struct Mutation {
    owner: Owner,
    request: Arc<ConcreteRequest>,
    next_id: Arc<AtomicU64>,
    in_flight: Arc<Mutex<HashSet<u64>>>,
    is_in_flight: Signal<bool>,
}

pub fn create_mutation(owner: &Owner, request: Arc<ConcreteRequest>) -> Mutation {
    Mutation {
        owner: owner.clone(),
        request,
        next_id: Arc::new(AtomicU64::new(0)),
        in_flight: Arc::new(Mutex::new(HashSet::new())),
        is_in_flight: Signal::new(false),
    }
}

impl Mutation {
    /// Sends the mutation. Disposing the handle cancels the request.
    pub fn commit(&self, config: MutationConfig) -> Disposable {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let operation = OperationDescriptor::new(&self.request, config.variables);
        let env = self.owner.context().environment().clone();
        debug!(
            target_module = SOURCE,
            operation = %operation.name(),
            "Committing mutation"
        );

        mutex_lock(&self.in_flight, SOURCE, "commit").insert(id);
        self.is_in_flight.set_if_changed(true);

        let callbacks = Arc::new(Mutex::new(Callbacks {
            on_completed: config.on_completed,
            on_error: config.on_error,
            on_unsubscribe: config.on_unsubscribe,
        }));

        let done = (self.clone(), callbacks.clone(), env.clone(), operation.clone());
        let failed = (self.clone(), callbacks.clone());
        let cancelled = (self.clone(), callbacks);
        let subscription = env.execute(&operation).subscribe(
            Observer::new()
                .on_complete(move || {
                    let (mutation, callbacks, env, operation) = &done;
                    mutation.settle(id);
                    let callback = mutex_lock(callbacks, SOURCE, "on_complete").on_completed.take();
                    if let Some(callback) = callback {
                        callback(env.lookup(&operation.fragment).data);
                    }
                })
                .on_error(move |err| {
                    let (mutation, callbacks) = &failed;
                    mutation.settle(id);
                    let callback = mutex_lock(callbacks, SOURCE, "on_error").on_error.take();
                    if let Some(callback) = callback {
                        callback(err);
                    }
                })
                .on_unsubscribe(move |_| {
                    let (mutation, callbacks) = &cancelled;
                    mutation.settle(id);
                    let callback = mutex_lock(callbacks, SOURCE, "on_unsubscribe")
                        .on_unsubscribe
                        .take();
                    if let Some(callback) = callback {
                        callback();
                    }
                }),
        );
        Disposable::new(move || subscription.unsubscribe())
    }

    pub fn is_in_flight(&self) -> bool {
        self.is_in_flight.get()
    }

    pub fn in_flight_signal(&self) -> &Signal<bool> {
        &self.is_in_flight
    }

    fn settle(&self, id: u64) {
        let remaining = {
            let mut in_flight = mutex_lock(&self.in_flight, SOURCE, "settle");
            in_flight.remove(&id);
            in_flight.len()
        };
        self.is_in_flight.set_if_changed(remaining > 0);
    }
}
