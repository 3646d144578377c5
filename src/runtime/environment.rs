use std::sync::Arc;

use tracing::warn;

use crate::error::RelayError;

use super::descriptor::{
    OperationDescriptor, ReaderFragment, RequestDescriptor, RequiredAction, SingularSelector,
};
use super::disposable::Disposable;
use super::observable::Observable;
use super::pending::Pending;
use super::policy::{Epoch, RenderPolicy};
use super::snapshot::{GraphQlResponse, OperationAvailability, Snapshot};

const SOURCE: &str = "runtime::environment";

pub type SnapshotCallback = Arc<dyn Fn(&Snapshot) + Send + Sync>;

/// In-flight operations a fragment read can wait on.
#[derive(Debug, Clone)]
pub struct PendingOperations {
    pub pending: Pending,
    pub operations: Vec<Arc<RequestDescriptor>>,
}

/// The store/network collaborator the resource layer is built on.
///
/// Store subscriptions must fire synchronously on write, in the order they
/// were established, and never while an internal lock is held.
pub trait Environment: Send + Sync {
    fn lookup(&self, selector: &SingularSelector) -> Snapshot;

    fn subscribe(&self, snapshot: &Snapshot, callback: SnapshotCallback) -> Disposable;

    fn retain(&self, operation: &OperationDescriptor) -> Disposable;

    fn check(&self, operation: &OperationDescriptor) -> OperationAvailability;

    /// Sends the operation to the network and publishes each payload to the
    /// store before forwarding it.
    fn execute(&self, operation: &OperationDescriptor) -> Observable<GraphQlResponse>;

    /// Like [`Environment::execute`], but concurrent fetches of the same
    /// request share one network execution.
    fn fetch_query(&self, operation: &OperationDescriptor) -> Observable<GraphQlResponse>;

    fn store_epoch(&self) -> Epoch;

    /// Server environments never commit, so temporary retains are skipped.
    fn is_server(&self) -> bool;

    fn default_render_policy(&self) -> RenderPolicy {
        RenderPolicy::Partial
    }

    fn pending_operations_for_fragment(
        &self,
        fragment: &ReaderFragment,
        owner: &RequestDescriptor,
    ) -> Option<PendingOperations>;

    fn promise_for_active_request(&self, request: &RequestDescriptor) -> Option<Pending>;

    /// Replaying stream of the active request, if one is in flight.
    fn observable_for_active_request(
        &self,
        request: &RequestDescriptor,
    ) -> Option<Observable<GraphQlResponse>>;

    fn is_request_active(&self, request: &RequestDescriptor) -> bool {
        self.promise_for_active_request(request).is_some()
    }

    /// Settles when the live resolver state is first written; `None` when it
    /// already has a value.
    fn live_resolver_promise(&self, live_state_id: &str) -> Option<Pending>;

    /// Surfaces required-field violations and field errors recorded in a
    /// snapshot just before its data reaches a reader.
    fn handle_potential_snapshot_errors(
        &self,
        snapshot: &Snapshot,
        throw_on_field_error: bool,
    ) -> Result<(), RelayError> {
        if let Some(missing) = &snapshot.missing_required_fields {
            match missing.action {
                RequiredAction::Throw => {
                    return Err(RelayError::MissingRequiredField {
                        owner: missing.owner.clone(),
                        path: missing.paths.join(", "),
                    });
                }
                RequiredAction::Log => warn!(
                    target_module = SOURCE,
                    owner = %missing.owner,
                    paths = ?missing.paths,
                    "Missing required field"
                ),
            }
        }
        if let Some(error) = snapshot.field_errors.first() {
            if throw_on_field_error {
                return Err(RelayError::FieldError {
                    owner: error.owner.clone(),
                    path: error.path.clone(),
                    message: error.message.clone(),
                });
            }
            for error in &snapshot.field_errors {
                warn!(
                    target_module = SOURCE,
                    owner = %error.owner,
                    path = %error.path,
                    error = %error.message,
                    "Field error in snapshot"
                );
            }
        }
        Ok(())
    }
}
