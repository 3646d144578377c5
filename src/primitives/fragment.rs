//! Fragment reads bound to the reactive substrate.
//!
//! A [`FragmentNode`] owns one (fragment, key) read: it resolves through the
//! fragment resource, keeps a store subscription while store updates are
//! enabled, and publishes every re-derived value into a [`DataState`]
//! signal. [`create_fragment`] layers key reactivity on top by swapping
//! nodes whenever the key changes.

use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use crate::cache::lock::mutex_lock;
use crate::error::RelayError;
use crate::resource::fragment::{FragmentResource, FragmentResult};
use crate::runtime::data::Data;
use crate::runtime::descriptor::{FragmentKey, ReaderFragment, fragment_identifier};
use crate::runtime::disposable::Disposable;
use crate::runtime::pending::{Resolution, resolve};

use super::reactive::{DataState, Owner, Signal};

const SOURCE: &str = "primitives::fragment";

#[derive(Default)]
struct NodeState {
    result: Option<FragmentResult>,
    subscription: Option<Disposable>,
    listening: bool,
    disposed: bool,
}

struct NodeInner {
    resource: Arc<FragmentResource>,
    fragment: Arc<ReaderFragment>,
    key: Option<FragmentKey>,
    identifier: String,
    target: Signal<DataState<Data>>,
    state: Mutex<NodeState>,
}

/// One fragment read and its store subscription.
#[derive(Clone)]
pub struct FragmentNode {
    inner: Arc<NodeInner>,
}

impl FragmentNode {
    /// Creates a node publishing into `target`. Store updates start enabled;
    /// the node is disposed with the owner's scope.
    pub fn new(
        owner: &Owner,
        fragment: Arc<ReaderFragment>,
        key: Option<FragmentKey>,
        target: Signal<DataState<Data>>,
    ) -> Self {
        let identifier = fragment_identifier(&fragment, key.as_ref());
        let node = Self {
            inner: Arc::new(NodeInner {
                resource: owner.context().fragment_resource().clone(),
                fragment,
                key,
                identifier,
                target,
                state: Mutex::new(NodeState {
                    listening: true,
                    ..NodeState::default()
                }),
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

    pub fn key(&self) -> Option<&FragmentKey> {
        self.inner.key.as_ref()
    }

    pub fn identifier(&self) -> &str {
        &self.inner.identifier
    }

    /// One read attempt. A ready value is published and subscribed to.
    pub fn read(&self) -> Result<Resolution<Data>, RelayError> {
        NodeInner::read(&self.inner)
    }

    /// Reads until a value is available.
    pub async fn resolve(&self) -> Result<Data, RelayError> {
        resolve(|| self.read()).await
    }

    pub fn result(&self) -> Option<FragmentResult> {
        mutex_lock(&self.inner.state, SOURCE, "result").result.clone()
    }

    /// Re-subscribes, first catching up with writes made while disabled.
    pub fn enable_store_updates(&self) {
        let result = {
            let mut state = mutex_lock(&self.inner.state, SOURCE, "enable_store_updates");
            if state.disposed || state.listening {
                return;
            }
            state.listening = true;
            state.result.clone()
        };
        if let Some(result) = result {
            NodeInner::subscribe(&self.inner, &result);
        }
    }

    pub fn disable_store_updates(&self) {
        let subscription = {
            let mut state = mutex_lock(&self.inner.state, SOURCE, "disable_store_updates");
            state.listening = false;
            state.subscription.take()
        };
        if let Some(mut subscription) = subscription {
            subscription.dispose();
        }
    }

    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

impl NodeInner {
    fn read(this: &Arc<Self>) -> Result<Resolution<Data>, RelayError> {
        if mutex_lock(&this.state, SOURCE, "read").disposed {
            return Err(RelayError::invariant(format!(
                "fragment `{}` was read after its node was disposed",
                this.fragment.name
            )));
        }
        let resolution = this.resource.read_with_identifier(
            &this.fragment,
            this.key.as_ref(),
            &this.identifier,
            &this.fragment.name,
        );
        match resolution {
            Ok(Resolution::Ready(result)) => {
                let data = result.data.clone();
                Self::commit(this, result);
                Ok(Resolution::Ready(data))
            }
            Ok(Resolution::Pending(pending)) => {
                this.target.update(|state| {
                    state.pending = true;
                    state.error = None;
                });
                Ok(Resolution::Pending(pending))
            }
            Err(error) => {
                this.target.set(DataState::failed(error.clone()));
                Err(error)
            }
        }
    }

    fn commit(this: &Arc<Self>, result: FragmentResult) {
        let subscribe = {
            let mut state = mutex_lock(&this.state, SOURCE, "commit");
            state.result = Some(result.clone());
            state.listening && state.subscription.is_none() && !state.disposed
        };
        this.target
            .set_if_changed(DataState::ready(result.data.clone()));
        if subscribe {
            Self::subscribe(this, &result);
        }
    }

    fn subscribe(this: &Arc<Self>, result: &FragmentResult) {
        let weak: Weak<Self> = Arc::downgrade(this);
        let subscription = this.resource.subscribe(
            result,
            Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_update();
                }
            }),
        );
        let stale = {
            let mut state = mutex_lock(&this.state, SOURCE, "subscribe");
            if state.disposed || !state.listening {
                Some(subscription)
            } else {
                state.subscription.replace(subscription)
            }
        };
        if let Some(mut stale) = stale {
            stale.dispose();
        }
    }

    /// Store callback: the resource cache already holds the new value.
    fn handle_update(&self) {
        if !mutex_lock(&self.state, SOURCE, "handle_update").listening {
            return;
        }
        match self.resource.read_with_identifier(
            &self.fragment,
            self.key.as_ref(),
            &self.identifier,
            &self.fragment.name,
        ) {
            Ok(Resolution::Ready(result)) => {
                let data = result.data.clone();
                mutex_lock(&self.state, SOURCE, "handle_update").result = Some(result);
                self.target.set_if_changed(DataState::ready(data));
            }
            Ok(Resolution::Pending(_)) => debug!(
                target_module = SOURCE,
                fragment = %self.identifier,
                "Store update left fragment pending; keeping last value"
            ),
            Err(error) => {
                warn!(
                    target_module = SOURCE,
                    fragment = %self.identifier,
                    error = %error,
                    "Fragment re-read failed after store update"
                );
                self.target.set(DataState::failed(error));
            }
        }
    }

    fn dispose(&self) {
        let subscription = {
            let mut state = mutex_lock(&self.state, SOURCE, "dispose");
            state.disposed = true;
            state.listening = false;
            state.subscription.take()
        };
        if let Some(mut subscription) = subscription {
            subscription.dispose();
        }
    }
}

struct BindingInner {
    owner: Owner,
    fragment: Arc<ReaderFragment>,
    node: Mutex<Option<FragmentNode>>,
    state: Signal<DataState<Data>>,
}

/// Reactive read of a fragment through a key signal.
#[derive(Clone)]
pub struct FragmentBinding {
    inner: Arc<BindingInner>,
}

/// Binds `fragment` to `key`: reads immediately, re-reads on key change and
/// stays subscribed to the store until the owner's scope is disposed.
pub fn create_fragment(
    owner: &Owner,
    fragment: Arc<ReaderFragment>,
    key: &Signal<Option<FragmentKey>>,
) -> FragmentBinding {
    let binding = FragmentBinding {
        inner: Arc::new(BindingInner {
            owner: owner.clone(),
            fragment,
            node: Mutex::new(None),
            state: Signal::new(DataState::default()),
        }),
    };
    binding.set_key(key.get());

    let weak = Arc::downgrade(&binding.inner);
    owner.scope().own(key.subscribe(move |next| {
        if let Some(inner) = weak.upgrade() {
            FragmentBinding { inner }.set_key(next.clone());
        }
    }));
    binding
}

impl FragmentBinding {
    /// Points the binding at `key`, replacing the node when it changed.
    pub fn set_key(&self, key: Option<FragmentKey>) {
        let previous = {
            let mut node = mutex_lock(&self.inner.node, SOURCE, "set_key");
            if node.as_ref().is_some_and(|current| current.key() == key.as_ref()) {
                return;
            }
            node.replace(FragmentNode::new(
                &self.inner.owner,
                self.inner.fragment.clone(),
                key,
                self.inner.state.clone(),
            ))
        };
        if let Some(previous) = previous {
            previous.dispose();
        }
        self.refresh();
    }

    /// One read attempt; a pending marker is registered with the owner's
    /// suspense boundary.
    pub fn refresh(&self) -> Option<Resolution<Data>> {
        let node = mutex_lock(&self.inner.node, SOURCE, "refresh").clone()?;
        match node.read() {
            Ok(Resolution::Pending(pending)) => {
                self.inner.owner.boundary().register(pending.clone());
                Some(Resolution::Pending(pending))
            }
            Ok(ready) => Some(ready),
            Err(_) => None,
        }
    }

    /// Waits for the current key's data, re-reading after each pending marker.
    pub async fn ready(&self) -> Result<Data, RelayError> {
        loop {
            let Some(node) = self.node() else {
                return Ok(Data::Null);
            };
            match node.read()? {
                Resolution::Ready(data) => return Ok(data),
                Resolution::Pending(pending) => pending.await,
            }
        }
    }

    pub fn state(&self) -> DataState<Data> {
        self.inner.state.get()
    }

    pub fn signal(&self) -> &Signal<DataState<Data>> {
        &self.inner.state
    }

    pub fn node(&self) -> Option<FragmentNode> {
        mutex_lock(&self.inner.node, SOURCE, "node").clone()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::resource::{RelayContext, ResourceConfig};
    use crate::runtime::descriptor::{ConcreteRequest, Field, OperationDescriptor, Selection, Variables};
    use crate::runtime::environment::Environment;
    use crate::runtime::memory::{EnvironmentOptions, MemoryEnvironment, ScriptedNetwork};

    struct Fixture {
        env: Arc<MemoryEnvironment>,
        owner: Owner,
        fragment: Arc<ReaderFragment>,
        operation: OperationDescriptor,
    }

    fn fixture() -> Fixture {
        let env = MemoryEnvironment::new(
            Arc::new(ScriptedNetwork::new()),
            EnvironmentOptions::default(),
        );
        let fragment = Arc::new(ReaderFragment::new(
            "UserName",
            vec![Field::scalar("id").into(), Field::scalar("name").into()],
        ));
        let request = Arc::new(ConcreteRequest::query(
            "UserQuery",
            vec![
                Field::linked("user", vec![Field::scalar("id").into(), Selection::spread(&fragment)])
                    .arg_var("id", "id")
                    .into(),
            ],
        ));
        let mut variables = Variables::new();
        variables.insert("id".into(), json!("1"));
        let operation = OperationDescriptor::new(&request, variables);
        let context = RelayContext::new(env.clone(), ResourceConfig::default()).expect("context");
        Fixture {
            env,
            owner: Owner::new(context),
            fragment,
            operation,
        }
    }

    fn user_key(fixture: &Fixture, name: &str) -> Option<FragmentKey> {
        fixture.env.commit_payload(
            &fixture.operation,
            json!({"user": {"id": "1", "name": name}}),
        );
        let root = fixture.env.lookup(&fixture.operation.fragment);
        root.data.get("user").and_then(FragmentKey::from_data)
    }

    #[test]
    fn binding_follows_store_writes() {
        let fixture = fixture();
        let key = Signal::new(user_key(&fixture, "Alice"));

        let binding = create_fragment(&fixture.owner, fixture.fragment.clone(), &key);
        assert_eq!(
            binding.state().data.and_then(|data| data.get("name").cloned()),
            Some(Data::string("Alice"))
        );

        fixture.env.commit_update("1", "name", json!("Bob"));
        assert_eq!(
            binding.state().data.and_then(|data| data.get("name").cloned()),
            Some(Data::string("Bob"))
        );
    }

    #[test]
    fn null_key_reads_null_without_subscribing() {
        let fixture = fixture();
        let key = Signal::new(None);

        let binding = create_fragment(&fixture.owner, fixture.fragment.clone(), &key);

        assert_eq!(binding.state().data, Some(Data::Null));
        assert_eq!(fixture.env.subscription_count(), 0);
    }

    #[test]
    fn disabled_updates_catch_up_when_re_enabled() {
        let fixture = fixture();
        let key = Signal::new(user_key(&fixture, "Alice"));
        let binding = create_fragment(&fixture.owner, fixture.fragment.clone(), &key);
        let node = binding.node().expect("node");

        node.disable_store_updates();
        fixture.env.commit_update("1", "name", json!("Carol"));
        assert_eq!(
            binding.state().data.and_then(|data| data.get("name").cloned()),
            Some(Data::string("Alice"))
        );

        node.enable_store_updates();
        assert_eq!(
            binding.state().data.and_then(|data| data.get("name").cloned()),
            Some(Data::string("Carol"))
        );
    }

    #[test]
    fn scope_disposal_drops_store_subscriptions() {
        let fixture = fixture();
        let key = Signal::new(user_key(&fixture, "Alice"));
        let _binding = create_fragment(&fixture.owner, fixture.fragment.clone(), &key);
        assert!(fixture.env.subscription_count() > 0);

        fixture.owner.scope().dispose();

        assert_eq!(fixture.env.subscription_count(), 0);
    }
}
