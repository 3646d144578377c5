use std::sync::Arc;

use tracing::debug;

use crate::error::RelayError;
use crate::runtime::data::Data;
use crate::runtime::descriptor::{ConcreteRequest, OperationDescriptor, Variables};
use crate::runtime::observable::Observer;
use crate::runtime::snapshot::GraphQlResponse;

use super::reactive::Owner;

const SOURCE: &str = "primitives::subscription";

#[derive(Default)]
pub struct SubscriptionConfig {
    pub variables: Variables,
    /// Called with the root data after each payload is written to the store.
    pub on_next: Option<Arc<dyn Fn(Data) + Send + Sync>>,
    pub on_error: Option<Arc<dyn Fn(RelayError) + Send + Sync>>,
    pub on_completed: Option<Arc<dyn Fn() + Send + Sync>>,
}

/// Requests a GraphQL subscription now and cancels it when the owner's scope
/// is disposed.
pub fn create_subscription(owner: &Owner, request: Arc<ConcreteRequest>, config: SubscriptionConfig) {
    let env = owner.context().environment().clone();
    let operation = OperationDescriptor::new(&request, config.variables);
    debug!(
        target_module = SOURCE,
        operation = %operation.name(),
        "Requesting subscription"
    );

    let mut observer = Observer::<GraphQlResponse>::new();
    if let Some(on_next) = config.on_next {
        let (env, operation) = (env.clone(), operation.clone());
        observer = observer.on_next(move |_| on_next(env.lookup(&operation.fragment).data));
    }
    if let Some(on_error) = config.on_error {
        observer = observer.on_error(move |err| on_error(err));
    }
    if let Some(on_completed) = config.on_completed {
        observer = observer.on_complete(move || on_completed());
    }

    let subscription = env.execute(&operation).subscribe(observer);
    owner.scope().on_cleanup(move || subscription.unsubscribe());
}
