use std::sync::{Arc, Mutex};

use tracing::error;

use crate::cache::lock::mutex_lock;
use crate::error::RelayError;
use crate::runtime::descriptor::{FragmentKey, ReaderFragment, Selector, get_selector};
use crate::runtime::environment::Environment;
use crate::runtime::observable::{Observer, Subscription};

use super::reactive::{Owner, Signal};

const SOURCE: &str = "primitives::active";

/// Whether the request that owns the fragment behind `key` is still in
/// flight. Follows key changes; plural fragments are rejected.
pub fn is_operation_node_active(
    owner: &Owner,
    fragment: Arc<ReaderFragment>,
    key: &Signal<Option<FragmentKey>>,
) -> Result<Signal<bool>, RelayError> {
    let active = Signal::new(false);
    let watch: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
    let env = owner.context().environment().clone();

    refresh_activity(env.as_ref(), &fragment, key.get().as_ref(), &active, &watch)?;

    let follow = (env, active.clone(), watch.clone());
    owner.scope().own(key.subscribe(move |next| {
        let (env, active, watch) = &follow;
        if let Err(err) = refresh_activity(env.as_ref(), &fragment, next.as_ref(), active, watch) {
            error!(
                target_module = SOURCE,
                fragment = %fragment.name,
                error = %err,
                "Could not track the fragment's owning request"
            );
            active.set_if_changed(false);
        }
    }));
    owner.scope().on_cleanup(move || {
        let subscription = mutex_lock(&watch, SOURCE, "cleanup").take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
    });
    Ok(active)
}

fn refresh_activity(
    env: &dyn Environment,
    fragment: &Arc<ReaderFragment>,
    key: Option<&FragmentKey>,
    active: &Signal<bool>,
    watch: &Mutex<Option<Subscription>>,
) -> Result<(), RelayError> {
    let previous = mutex_lock(watch, SOURCE, "refresh_activity").take();
    if let Some(previous) = previous {
        previous.unsubscribe();
    }

    let selector = match key {
        Some(key) => get_selector(fragment, key)?,
        None => None,
    };
    let owner = match selector {
        None => None,
        Some(Selector::Single(selector)) => Some(selector.owner),
        Some(Selector::Plural(_)) => {
            return Err(RelayError::invariant(
                "is_operation_node_active: plural fragments are not supported",
            ));
        }
    };
    let Some(observable) = owner.and_then(|owner| env.observable_for_active_request(&owner))
    else {
        active.set_if_changed(false);
        return Ok(());
    };

    active.set_if_changed(true);
    let on_complete = active.clone();
    let on_error = active.clone();
    let subscription = observable.subscribe(
        Observer::new()
            .on_complete(move || {
                on_complete.set_if_changed(false);
            })
            .on_error(move |_| {
                on_error.set_if_changed(false);
            }),
    );
    if !subscription.is_closed() {
        *mutex_lock(watch, SOURCE, "refresh_activity") = Some(subscription);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::resource::{RelayContext, ResourceConfig};
    use crate::runtime::descriptor::{ConcreteRequest, Field, OperationDescriptor, Selection, Variables};
    use crate::runtime::memory::{EnvironmentOptions, MemoryEnvironment, ScriptedNetwork};
    use crate::runtime::snapshot::GraphQlResponse;

    #[test]
    fn active_while_the_owner_request_is_in_flight() {
        let network = ScriptedNetwork::new();
        let env = MemoryEnvironment::new(Arc::new(network.clone()), EnvironmentOptions::default());
        let owner = Owner::new(RelayContext::new(env.clone(), ResourceConfig::default()).expect("context"));
        let fragment = Arc::new(ReaderFragment::new("Viewer", vec![Field::scalar("name").into()]));
        let request = Arc::new(ConcreteRequest::query(
            "ViewerQuery",
            vec![Field::linked("viewer", vec![Field::scalar("id").into(), Selection::spread(&fragment)]).into()],
        ));
        let operation = OperationDescriptor::new(&request, Variables::new());
        let _fetch = env.fetch_query(&operation).subscribe(Observer::new());
        network.push(
            "ViewerQuery",
            GraphQlResponse::incremental(json!({"viewer": {"id": "v", "name": "Ann"}})),
        );
        let root = env.lookup(&operation.fragment);
        let key = Signal::new(root.data.get("viewer").and_then(FragmentKey::from_data));

        let active = is_operation_node_active(&owner, fragment, &key).expect("activity");
        assert!(active.get());

        network.complete("ViewerQuery");
        assert!(!active.get());
    }

    #[test]
    fn plural_fragments_are_rejected() {
        let env = MemoryEnvironment::new(Arc::new(ScriptedNetwork::new()), EnvironmentOptions::default());
        let owner = Owner::new(RelayContext::new(env, ResourceConfig::default()).expect("context"));
        let fragment = Arc::new(ReaderFragment::new("Items", vec![]).plural());
        let key = Signal::new(Some(FragmentKey::Plural(Vec::new())));

        assert!(is_operation_node_active(&owner, fragment, &key).is_err());
    }
}
