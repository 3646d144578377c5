use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::cache::lock::mutex_lock;
use crate::error::RelayError;
use crate::runtime::descriptor::RequestDescriptor;
use crate::runtime::disposable::Disposable;
use crate::runtime::observable::{Observable, Sink};
use crate::runtime::snapshot::GraphQlResponse;

const SOURCE: &str = "runtime::memory::network";

/// Transport used by [`super::MemoryEnvironment::execute`].
pub trait Network: Send + Sync {
    fn execute(&self, request: &RequestDescriptor) -> Observable<GraphQlResponse>;
}

#[derive(Default)]
struct ScriptedState {
    requests: Vec<Arc<RequestDescriptor>>,
    sinks: HashMap<String, Vec<(u64, Sink<GraphQlResponse>)>>,
    next_id: u64,
    cancelled: Vec<String>,
}

/// Network whose responses are pushed by hand, keyed by operation name.
///
/// Every `execute` is recorded; open requests stay pending until the test
/// responds, fails or completes them.
#[derive(Clone, Default)]
pub struct ScriptedNetwork {
    state: Arc<Mutex<ScriptedState>>,
}

impl ScriptedNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_count(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "request_count").requests.len()
    }

    pub fn requests(&self) -> Vec<Arc<RequestDescriptor>> {
        mutex_lock(&self.state, SOURCE, "requests").requests.clone()
    }

    pub fn last_request(&self) -> Option<Arc<RequestDescriptor>> {
        mutex_lock(&self.state, SOURCE, "last_request")
            .requests
            .last()
            .cloned()
    }

    /// Operation names whose requests were cancelled by their subscriber.
    pub fn cancelled(&self) -> Vec<String> {
        mutex_lock(&self.state, SOURCE, "cancelled").cancelled.clone()
    }

    pub fn is_pending(&self, name: &str) -> bool {
        mutex_lock(&self.state, SOURCE, "is_pending")
            .sinks
            .get(name)
            .is_some_and(|sinks| !sinks.is_empty())
    }

    /// Delivers `data` as the single payload and completes.
    pub fn respond(&self, name: &str, data: Value) {
        self.push(name, GraphQlResponse::data(data));
        self.complete(name);
    }

    pub fn push(&self, name: &str, response: GraphQlResponse) {
        for sink in self.sinks(name, false) {
            sink.next(response.clone());
        }
    }

    pub fn fail(&self, name: &str, message: &str) {
        for sink in self.sinks(name, true) {
            sink.error(RelayError::network(name, message));
        }
    }

    pub fn complete(&self, name: &str) {
        for sink in self.sinks(name, true) {
            sink.complete();
        }
    }

    fn sinks(&self, name: &str, take: bool) -> Vec<Sink<GraphQlResponse>> {
        let mut state = mutex_lock(&self.state, SOURCE, "sinks");
        let sinks = if take {
            state.sinks.remove(name).unwrap_or_default()
        } else {
            state.sinks.get(name).cloned().unwrap_or_default()
        };
        sinks.into_iter().map(|(_, sink)| sink).collect()
    }
}

impl Network for ScriptedNetwork {
    fn execute(&self, request: &RequestDescriptor) -> Observable<GraphQlResponse> {
        let state = self.state.clone();
        let request = Arc::new(request.clone());
        Observable::create(move |sink| {
            let name = request.node.name.clone();
            let id = {
                let mut guard = mutex_lock(&state, SOURCE, "execute");
                guard.requests.push(request.clone());
                guard.next_id += 1;
                let id = guard.next_id;
                guard.sinks.entry(name.clone()).or_default().push((id, sink));
                id
            };
            let state = state.clone();
            Disposable::new(move || {
                let mut guard = mutex_lock(&state, SOURCE, "cancel");
                let Some(sinks) = guard.sinks.get_mut(&name) else {
                    return;
                };
                let before = sinks.len();
                sinks.retain(|(sink_id, _)| *sink_id != id);
                if sinks.len() < before {
                    guard.cancelled.push(name);
                }
            })
        })
    }
}
