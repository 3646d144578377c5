use std::sync::Arc;

use crate::error::RelayError;

use super::load_query::PreloadedQuery;
use super::query::{QueryNode, QueryNodeOptions, create_query_node};
use super::reactive::Owner;

/// Reads a preloaded query through the query resource, consuming the
/// preload's replayed payloads before falling back to a fresh fetch.
///
/// The reference is disposed along with the owner's scope.
pub fn create_preloaded_query(
    owner: &Owner,
    preloaded: &PreloadedQuery,
) -> Result<QueryNode, RelayError> {
    if preloaded.is_disposed() {
        return Err(RelayError::invariant(format!(
            "preloaded query `{}` was read after it was disposed; load it again before rendering",
            preloaded.name()
        )));
    }
    if !Arc::ptr_eq(preloaded.environment(), owner.context().environment()) {
        return Err(RelayError::invariant(format!(
            "preloaded query `{}` was loaded with a different environment than the one rendering it",
            preloaded.name()
        )));
    }

    let operation = preloaded.operation().clone();
    let fallback = owner.context().environment().fetch_query(&operation);
    let fetch_observable = match preloaded.source() {
        Some(source) => source.if_empty(fallback),
        None => fallback,
    };
    let node = create_query_node(
        owner,
        operation,
        fetch_observable,
        QueryNodeOptions {
            fetch_policy: Some(preloaded.fetch_policy()),
            render_policy: None,
            fetch_key: Some(preloaded.fetch_key().to_string()),
        },
    );

    let reference = preloaded.clone();
    owner.scope().on_cleanup(move || reference.dispose());
    Ok(node)
}
