//! Fragments that can be re-read under new variables through their
//! generated refetch query.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::lock::mutex_lock;
use crate::error::RelayError;
use crate::runtime::data::Data;
use crate::runtime::descriptor::{
    FragmentKey, ReaderFragment, RefetchMetadata, Variables, variables_from_fragment,
};
use crate::runtime::disposable::Disposable;
use crate::runtime::observable::Observer;
use crate::runtime::policy::FetchPolicy;

use super::fetch_tracker::FetchTracker;
use super::fragment::{FragmentBinding, create_fragment};
use super::load_query::{LoadQueryOptions, PreloadedQuery};
use super::query_loader::{QueryLoader, create_query_loader};
use super::reactive::{DataState, Owner, Signal};

const SOURCE: &str = "primitives::refetchable";

pub type RefetchCallback = Box<dyn FnOnce(Option<RelayError>) + Send>;

#[derive(Default)]
pub struct RefetchOptions {
    /// Defaults to store-or-network.
    pub fetch_policy: Option<FetchPolicy>,
    pub on_complete: Option<RefetchCallback>,
}

/// Variables for the refetch query: the owner's variables, overlaid with the
/// fragment's own, then the caller's, plus the node identifier when the
/// fragment is refetched by id and the caller did not supply one.
pub fn refetch_variables(
    fragment: &ReaderFragment,
    metadata: &RefetchMetadata,
    key: Option<&FragmentKey>,
    data: Option<&Data>,
    provided: &Variables,
) -> Variables {
    let mut variables = key
        .map(|key| variables_from_fragment(fragment, key))
        .unwrap_or_default();
    for (name, value) in provided {
        variables.insert(name.clone(), value.clone());
    }

    if let Some(identifier_field) = &metadata.identifier_field
        && !provided.contains_key(&metadata.identifier_query_variable_name)
    {
        let identifier = data
            .and_then(|data| data.get(identifier_field))
            .and_then(Data::as_str)
            .map(|id| Value::String(id.to_string()));
        if identifier.is_none() {
            warn!(
                target_module = SOURCE,
                fragment = %fragment.name,
                field = %identifier_field,
                "Expected the fragment's identifier field to be a string when refetching"
            );
        }
        variables.insert(
            metadata.identifier_query_variable_name.clone(),
            identifier.unwrap_or(Value::Null),
        );
    }
    variables
}

pub(crate) struct RefetchInner {
    owner: Owner,
    fragment: Arc<ReaderFragment>,
    metadata: RefetchMetadata,
    current_key: Signal<Option<FragmentKey>>,
    binding: FragmentBinding,
    loader: QueryLoader,
    tracker: FetchTracker,
    callback: Mutex<Option<RefetchCallback>>,
}

/// A fragment binding plus the machinery to refetch it.
#[derive(Clone)]
pub struct RefetchableFragment {
    inner: Arc<RefetchInner>,
}

/// Binds a `@refetchable` fragment. The rendered key follows `key` until a
/// refetch re-points it at the refetch query's root; a new parent key resets
/// it.
pub fn create_refetchable_fragment(
    owner: &Owner,
    fragment: Arc<ReaderFragment>,
    key: &Signal<Option<FragmentKey>>,
) -> Result<RefetchableFragment, RelayError> {
    let metadata = fragment.metadata.refetch.clone().ok_or_else(|| {
        RelayError::invariant(format!(
            "fragment `{}` has no refetch metadata; is it annotated @refetchable?",
            fragment.name
        ))
    })?;

    let current_key = Signal::new(key.get());
    let follow = current_key.clone();
    owner.scope().own(key.subscribe(move |next| follow.set(next.clone())));

    let binding = create_fragment(owner, fragment.clone(), &current_key);
    let loader = create_query_loader(owner, metadata.request.clone(), None);
    let tracker = FetchTracker::new();
    let cleanup = tracker.clone();
    owner.scope().on_cleanup(move || cleanup.dispose_fetch());

    Ok(RefetchableFragment {
        inner: Arc::new(RefetchInner {
            owner: owner.clone(),
            fragment,
            metadata,
            current_key,
            binding,
            loader,
            tracker,
            callback: Mutex::new(None),
        }),
    })
}

impl RefetchableFragment {
    pub fn state(&self) -> DataState<Data> {
        self.inner.binding.state()
    }

    pub fn binding(&self) -> &FragmentBinding {
        &self.inner.binding
    }

    pub fn key(&self) -> Option<FragmentKey> {
        self.inner.current_key.get()
    }

    pub fn is_refetching(&self) -> bool {
        self.inner.tracker.is_fetching()
    }

    /// The query reference backing the latest refetch.
    pub fn query(&self) -> Option<PreloadedQuery> {
        self.inner.loader.query()
    }

    /// Refetches under `variables` merged over the current ones. The returned
    /// handle cancels the request.
    pub fn refetch(&self, variables: Variables, options: RefetchOptions) -> Disposable {
        RefetchInner::refetch(&self.inner, variables, options)
    }

    pub(crate) fn inner(&self) -> &Arc<RefetchInner> {
        &self.inner
    }
}

impl RefetchInner {
    pub(crate) fn owner(&self) -> &Owner {
        &self.owner
    }

    pub(crate) fn fragment(&self) -> &Arc<ReaderFragment> {
        &self.fragment
    }

    pub(crate) fn metadata(&self) -> &RefetchMetadata {
        &self.metadata
    }

    pub(crate) fn key(&self) -> Option<FragmentKey> {
        self.current_key.get()
    }

    pub(crate) fn data(&self) -> Option<Data> {
        self.binding.state().data
    }

    pub(crate) fn tracker(&self) -> &FetchTracker {
        &self.tracker
    }

    fn refetch(this: &Arc<Self>, provided: Variables, options: RefetchOptions) -> Disposable {
        let key = this.current_key.get();
        let data = this.data();
        let variables =
            refetch_variables(&this.fragment, &this.metadata, key.as_ref(), data.as_ref(), &provided);
        debug!(
            target_module = SOURCE,
            fragment = %this.fragment.name,
            "Refetching fragment"
        );

        let query = this.loader.load(
            variables,
            LoadQueryOptions {
                fetch_policy: Some(options.fetch_policy.unwrap_or(FetchPolicy::StoreOrNetwork)),
            },
        );
        *mutex_lock(&this.callback, SOURCE, "refetch") = options.on_complete;

        let Some(source) = query.source() else {
            this.tracker.dispose_fetch();
            this.repoint(&query);
            this.finish(None);
            return Disposable::noop();
        };

        let complete = (Arc::downgrade(this), query.clone());
        let error = Arc::downgrade(this);
        let subscription = source.subscribe(
            Observer::new()
                .on_complete(move || {
                    if let Some(inner) = complete.0.upgrade() {
                        inner.tracker.complete_fetch();
                        inner.repoint(&complete.1);
                        inner.finish(None);
                    }
                })
                .on_error(move |err| {
                    if let Some(inner) = error.upgrade() {
                        inner.tracker.complete_fetch();
                        inner.finish(Some(err));
                    }
                }),
        );
        if !subscription.is_closed() {
            this.tracker.start_fetch(subscription);
        }

        let tracker = this.tracker.clone();
        Disposable::new(move || tracker.dispose_fetch())
    }

    /// Points the binding at the fragment reference found in the refetch
    /// query's response.
    fn repoint(&self, query: &PreloadedQuery) {
        let env = self.owner.context().environment();
        let root = env.lookup(&query.operation().fragment);
        let key = root
            .data
            .get_path(&self.metadata.fragment_path_in_response)
            .and_then(FragmentKey::from_data);
        if key.is_none() {
            warn!(
                target_module = SOURCE,
                fragment = %self.fragment.name,
                path = ?self.metadata.fragment_path_in_response,
                "Refetch response has no fragment reference at the expected path"
            );
        }
        self.current_key.set(key);
    }

    fn finish(&self, error: Option<RelayError>) {
        let callback = mutex_lock(&self.callback, SOURCE, "finish").take();
        if let Some(callback) = callback {
            callback(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::resource::{RelayContext, ResourceConfig};
    use crate::runtime::descriptor::{ConcreteRequest, Field, OperationDescriptor, Selection};
    use crate::runtime::environment::Environment;
    use crate::runtime::memory::{EnvironmentOptions, MemoryEnvironment, ScriptedNetwork};

    struct Fixture {
        env: Arc<MemoryEnvironment>,
        network: ScriptedNetwork,
        owner: Owner,
        fragment: Arc<ReaderFragment>,
        key: Signal<Option<FragmentKey>>,
    }

    fn fixture() -> Fixture {
        let network = ScriptedNetwork::new();
        let env = MemoryEnvironment::new(Arc::new(network.clone()), EnvironmentOptions::default());
        let context = RelayContext::new(env.clone(), ResourceConfig::default()).expect("context");

        let selections: Vec<Selection> = vec![
            Field::scalar("id").into(),
            Field::scalar("name").arg_var("locale", "locale").into(),
        ];
        let placeholder = Arc::new(ReaderFragment::new("UserCard", selections.clone()));
        let refetch_request = Arc::new(ConcreteRequest::query(
            "UserCardRefetchQuery",
            vec![
                Field::linked("node", vec![Field::scalar("id").into(), Selection::spread(&placeholder)])
                    .arg_var("id", "id")
                    .into(),
            ],
        ));
        let fragment = Arc::new(ReaderFragment::new("UserCard", selections).with_refetch(
            RefetchMetadata {
                request: refetch_request,
                fragment_path_in_response: vec!["node".into()],
                identifier_field: Some("id".into()),
                identifier_query_variable_name: "id".into(),
            },
        ));

        let parent = Arc::new(ConcreteRequest::query(
            "ProfileQuery",
            vec![Field::linked("viewer", vec![Field::scalar("id").into(), Selection::spread(&placeholder)]).into()],
        ));
        let mut variables = Variables::new();
        variables.insert("locale".into(), json!("en"));
        let operation = OperationDescriptor::new(&parent, variables);
        env.commit_payload(&operation, json!({"viewer": {"id": "u1", "name": "Alice"}}));
        let root = env.lookup(&operation.fragment);
        let key = Signal::new(root.data.get("viewer").and_then(FragmentKey::from_data));

        Fixture {
            env,
            network,
            owner: Owner::new(context),
            fragment,
            key,
        }
    }

    #[test]
    fn variables_merge_owner_fragment_and_provided_with_identifier() {
        let fixture = fixture();
        let metadata = fixture.fragment.metadata.refetch.clone().expect("metadata");
        let data = Data::object([("id", Data::string("u1"))]);
        let mut provided = Variables::new();
        provided.insert("locale".into(), json!("fr"));

        let variables = refetch_variables(
            &fixture.fragment,
            &metadata,
            fixture.key.get().as_ref(),
            Some(&data),
            &provided,
        );

        assert_eq!(variables.get("locale"), Some(&json!("fr")));
        assert_eq!(variables.get("id"), Some(&json!("u1")));
    }

    #[test]
    fn refetch_repoints_the_binding_at_the_new_root() {
        let fixture = fixture();
        let refetchable =
            create_refetchable_fragment(&fixture.owner, fixture.fragment.clone(), &fixture.key)
                .expect("refetchable");
        assert_eq!(
            refetchable.state().data.and_then(|data| data.get("name").cloned()),
            Some(Data::string("Alice"))
        );

        let completed = Arc::new(Mutex::new(None));
        let sink = completed.clone();
        let mut provided = Variables::new();
        provided.insert("locale".into(), json!("fr"));
        let _handle = refetchable.refetch(
            provided,
            RefetchOptions {
                fetch_policy: Some(FetchPolicy::NetworkOnly),
                on_complete: Some(Box::new(move |error| *sink.lock().unwrap() = Some(error))),
            },
        );
        assert!(refetchable.is_refetching());
        let request = fixture.network.last_request().expect("request");
        assert_eq!(request.variables.get("id"), Some(&json!("u1")));

        fixture.network.respond(
            "UserCardRefetchQuery",
            json!({"node": {"id": "u1", "name": "Alicia"}}),
        );

        assert_eq!(*completed.lock().unwrap(), Some(None));
        assert!(!refetchable.is_refetching());
        let key = refetchable.key().expect("key");
        assert!(matches!(&key, FragmentKey::Single(reference) if reference.owner.node.name == "UserCardRefetchQuery"));
        assert_eq!(
            refetchable.state().data.and_then(|data| data.get("name").cloned()),
            Some(Data::string("Alicia"))
        );
        assert!(fixture.env.subscription_count() > 0);
    }

    #[test]
    fn missing_metadata_is_an_invariant_error() {
        let fixture = fixture();
        let plain = Arc::new(ReaderFragment::new("Plain", vec![]));

        assert!(matches!(
            create_refetchable_fragment(&fixture.owner, plain, &fixture.key),
            Err(RelayError::Invariant { .. })
        ));
    }
}
