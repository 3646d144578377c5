//! Connection pagination on top of a refetchable fragment.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::lock::mutex_lock;
use crate::error::RelayError;
use crate::runtime::data::Data;
use crate::runtime::descriptor::{
    CacheConfig, ConnectionMetadata, FragmentKey, OperationDescriptor, ReaderFragment, Variables,
};
use crate::runtime::disposable::Disposable;
use crate::runtime::observable::Observer;

use super::active::is_operation_node_active;
use super::fetch_tracker::FetchTracker;
use super::reactive::{DataState, Owner, Signal};
use super::refetchable::{
    RefetchCallback, RefetchOptions, RefetchableFragment, create_refetchable_fragment,
    refetch_variables,
};

const SOURCE: &str = "primitives::pagination";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Backward => "backward",
        }
    }
}

/// Cursor to continue from and whether the server reported more items.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub cursor: Option<String>,
    pub has_more: bool,
}

/// Reads the connection at `path` inside the fragment's data.
///
/// A missing connection, or one without `edges` or `pageInfo`, has nothing
/// more to load. Malformed values are invariant errors.
pub fn get_connection_state(
    direction: Direction,
    fragment: &ReaderFragment,
    data: Option<&Data>,
    path: &[String],
) -> Result<ConnectionState, RelayError> {
    let connection = match data.and_then(|data| data.get_path(path)) {
        None | Some(Data::Null) => return Ok(ConnectionState::default()),
        Some(connection @ Data::Object(_)) => connection,
        Some(other) => {
            return Err(RelayError::invariant(format!(
                "fragment `{}`: expected the connection at {path:?} to be an object, got {other:?}",
                fragment.name
            )));
        }
    };

    let (edges, page_info) = match (connection.get("edges"), connection.get("pageInfo")) {
        (None | Some(Data::Null), _) | (_, None | Some(Data::Null)) => {
            return Ok(ConnectionState::default());
        }
        (Some(edges), Some(page_info)) => (edges, page_info),
    };
    if edges.as_list().is_none() {
        return Err(RelayError::invariant(format!(
            "fragment `{}`: expected the connection's edges to be a list",
            fragment.name
        )));
    }
    if page_info.as_object().is_none() {
        return Err(RelayError::invariant(format!(
            "fragment `{}`: expected the connection's pageInfo to be an object",
            fragment.name
        )));
    }

    let (cursor_field, has_more_field) = match direction {
        Direction::Forward => ("endCursor", "hasNextPage"),
        Direction::Backward => ("startCursor", "hasPreviousPage"),
    };
    let cursor = match page_info.get(cursor_field) {
        None | Some(Data::Null) => None,
        Some(Data::String(cursor)) => Some(cursor.to_string()),
        Some(other) => {
            return Err(RelayError::invariant(format!(
                "fragment `{}`: expected pageInfo.{cursor_field} to be a string, got {other:?}",
                fragment.name
            )));
        }
    };
    let has_more = cursor.is_some()
        && page_info
            .get(has_more_field)
            .and_then(Data::as_bool)
            .unwrap_or(false);
    Ok(ConnectionState { cursor, has_more })
}

/// Variables for fetching the next page in `direction`; the opposite
/// direction's count and cursor are nulled.
pub fn get_pagination_variables(
    direction: Direction,
    count: u64,
    cursor: Option<&str>,
    base: &Variables,
    extra: &Variables,
    metadata: &ConnectionMetadata,
) -> Result<Variables, RelayError> {
    let (wanted, other) = match direction {
        Direction::Forward => (&metadata.forward, &metadata.backward),
        Direction::Backward => (&metadata.backward, &metadata.forward),
    };
    let wanted = wanted.as_ref().ok_or_else(|| {
        RelayError::invariant(format!(
            "connection has no {} pagination variables",
            direction.label()
        ))
    })?;

    let mut variables = base.clone();
    for (name, value) in extra {
        variables.insert(name.clone(), value.clone());
    }
    if let Some(other) = other {
        variables.insert(other.cursor.clone(), Value::Null);
        variables.insert(other.count.clone(), Value::Null);
    }
    variables.insert(
        wanted.cursor.clone(),
        cursor.map_or(Value::Null, |cursor| Value::String(cursor.to_string())),
    );
    variables.insert(wanted.count.clone(), Value::from(count));
    Ok(variables)
}

/// A refetchable fragment exposing a connection that can be extended in
/// either direction.
#[derive(Clone)]
pub struct PaginationFragment {
    refetchable: RefetchableFragment,
    connection: ConnectionMetadata,
    next: FetchTracker,
    previous: FetchTracker,
    parent_active: Signal<bool>,
}

pub fn create_pagination_fragment(
    owner: &Owner,
    fragment: Arc<ReaderFragment>,
    key: &Signal<Option<FragmentKey>>,
) -> Result<PaginationFragment, RelayError> {
    let connection = fragment.metadata.connection.clone().ok_or_else(|| {
        RelayError::invariant(format!(
            "fragment `{}` has no connection metadata; does it select a @connection field?",
            fragment.name
        ))
    })?;
    let refetchable = create_refetchable_fragment(owner, fragment.clone(), key)?;
    let parent_active = is_operation_node_active(owner, fragment, key)?;

    let next = FetchTracker::new();
    let previous = FetchTracker::new();
    let cleanup = (next.clone(), previous.clone());
    owner.scope().on_cleanup(move || {
        cleanup.0.dispose_fetch();
        cleanup.1.dispose_fetch();
    });

    Ok(PaginationFragment {
        refetchable,
        connection,
        next,
        previous,
        parent_active,
    })
}

impl PaginationFragment {
    pub fn state(&self) -> DataState<Data> {
        self.refetchable.state()
    }

    pub fn refetchable(&self) -> &RefetchableFragment {
        &self.refetchable
    }

    pub fn has_next(&self) -> bool {
        self.connection_state(Direction::Forward).has_more
    }

    pub fn has_previous(&self) -> bool {
        self.connection_state(Direction::Backward).has_more
    }

    pub fn is_loading_next(&self) -> bool {
        self.next.is_fetching()
    }

    pub fn is_loading_previous(&self) -> bool {
        self.previous.is_fetching()
    }

    pub fn load_next(&self, count: u64, on_complete: Option<RefetchCallback>) -> Disposable {
        self.load_more(Direction::Forward, count, on_complete)
    }

    pub fn load_previous(&self, count: u64, on_complete: Option<RefetchCallback>) -> Disposable {
        self.load_more(Direction::Backward, count, on_complete)
    }

    /// Cancels any page fetches, then refetches the whole fragment.
    pub fn refetch(&self, variables: Variables, options: RefetchOptions) -> Disposable {
        self.next.dispose_fetch();
        self.previous.dispose_fetch();
        self.refetchable.refetch(variables, options)
    }

    fn tracker(&self, direction: Direction) -> &FetchTracker {
        match direction {
            Direction::Forward => &self.next,
            Direction::Backward => &self.previous,
        }
    }

    fn connection_state(&self, direction: Direction) -> ConnectionState {
        let inner = self.refetchable.inner();
        let data = inner.data();
        get_connection_state(direction, inner.fragment(), data.as_ref(), &self.connection.path)
            .unwrap_or_else(|err| {
                warn!(
                    target_module = SOURCE,
                    fragment = %inner.fragment().name,
                    error = %err,
                    "Could not read connection state"
                );
                ConnectionState::default()
            })
    }

    fn load_more(
        &self,
        direction: Direction,
        count: u64,
        on_complete: Option<RefetchCallback>,
    ) -> Disposable {
        let inner = self.refetchable.inner();
        let fragment = inner.fragment();
        if !inner.owner().is_mounted() {
            warn!(
                target_module = SOURCE,
                fragment = %fragment.name,
                direction = direction.label(),
                "Unexpected fetch on an unmounted pagination fragment"
            );
            return Disposable::noop();
        }

        let tracker = self.tracker(direction);
        let key = inner.key();
        let data = inner.data();
        if tracker.is_fetching() || data.as_ref().is_none_or(Data::is_null) || self.parent_active.get()
        {
            if key.is_none() {
                warn!(
                    target_module = SOURCE,
                    fragment = %fragment.name,
                    "Unexpected fetch while the fragment key is null"
                );
            }
            if let Some(callback) = on_complete {
                callback(None);
            }
            return Disposable::noop();
        }

        let state = match get_connection_state(direction, fragment, data.as_ref(), &self.connection.path)
        {
            Ok(state) => state,
            Err(err) => {
                if let Some(callback) = on_complete {
                    callback(Some(err));
                }
                return Disposable::noop();
            }
        };
        let base = refetch_variables(
            fragment,
            inner.metadata(),
            key.as_ref(),
            data.as_ref(),
            &Variables::new(),
        );
        let variables = match get_pagination_variables(
            direction,
            count,
            state.cursor.as_deref(),
            &base,
            &Variables::new(),
            &self.connection,
        ) {
            Ok(variables) => variables,
            Err(err) => {
                if let Some(callback) = on_complete {
                    callback(Some(err));
                }
                return Disposable::noop();
            }
        };
        debug!(
            target_module = SOURCE,
            fragment = %fragment.name,
            direction = direction.label(),
            count,
            "Loading page"
        );

        let operation = OperationDescriptor::with_cache_config(
            &inner.metadata().request,
            variables,
            CacheConfig { force: true },
        );
        let env = inner.owner().context().environment();
        let callback = Arc::new(Mutex::new(on_complete));

        let on_start = tracker.clone();
        let on_done = (tracker.clone(), callback.clone());
        let on_fail = (tracker.clone(), callback.clone());
        let on_cancel = (tracker.clone(), callback);
        env.fetch_query(&operation).subscribe(
            Observer::new()
                .on_start(move |subscription| on_start.start_fetch(subscription.clone()))
                .on_complete(move || {
                    on_done.0.complete_fetch();
                    settle(&on_done.1, None);
                })
                .on_error(move |err| {
                    on_fail.0.complete_fetch();
                    settle(&on_fail.1, Some(err));
                })
                .on_unsubscribe(move |_| {
                    on_cancel.0.complete_fetch();
                    settle(&on_cancel.1, None);
                }),
        );

        let tracker = tracker.clone();
        Disposable::new(move || tracker.dispose_fetch())
    }
}

/// Runs the page callback at most once, whichever terminal event comes first.
fn settle(callback: &Mutex<Option<RefetchCallback>>, error: Option<RelayError>) {
    let taken = mutex_lock(callback, SOURCE, "settle").take();
    if let Some(taken) = taken {
        taken(error);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::resource::{RelayContext, ResourceConfig};
    use crate::runtime::descriptor::{ConcreteRequest, Field, RefetchMetadata, Selection};
    use crate::runtime::environment::Environment;
    use crate::runtime::memory::{EnvironmentOptions, MemoryEnvironment, ScriptedNetwork};

    fn friends_selections() -> Vec<Selection> {
        vec![
            Field::linked(
                "friends",
                vec![
                    Field::plural(
                        "edges",
                        vec![
                            Field::scalar("cursor").into(),
                            Field::linked("node", vec![Field::scalar("id").into(), Field::scalar("name").into()])
                                .into(),
                        ],
                    )
                    .into(),
                    Field::linked(
                        "pageInfo",
                        vec![Field::scalar("endCursor").into(), Field::scalar("hasNextPage").into()],
                    )
                    .into(),
                ],
            )
            .arg_var("first", "first")
            .arg_var("after", "after")
            .connection()
            .into(),
        ]
    }

    struct Fixture {
        network: ScriptedNetwork,
        owner: Owner,
        fragment: Arc<ReaderFragment>,
        key: Signal<Option<FragmentKey>>,
    }

    fn fixture() -> Fixture {
        let network = ScriptedNetwork::new();
        let env = MemoryEnvironment::new(Arc::new(network.clone()), EnvironmentOptions::default());
        let context = RelayContext::new(env.clone(), ResourceConfig::default()).expect("context");

        let placeholder = Arc::new(ReaderFragment::new("FriendsList", friends_selections()));
        let pagination_request = Arc::new(ConcreteRequest::query(
            "FriendsListPaginationQuery",
            vec![Selection::spread(&placeholder)],
        ));
        let fragment = Arc::new(
            ReaderFragment::new("FriendsList", friends_selections())
                .with_connection(ConnectionMetadata::forward(&["friends"]))
                .with_refetch(RefetchMetadata {
                    request: pagination_request,
                    fragment_path_in_response: Vec::new(),
                    identifier_field: None,
                    identifier_query_variable_name: "id".into(),
                }),
        );

        let parent = Arc::new(ConcreteRequest::query("FriendsQuery", vec![Selection::spread(&placeholder)]));
        let mut variables = Variables::new();
        variables.insert("first".into(), json!(2));
        let operation = OperationDescriptor::new(&parent, variables);
        env.commit_payload(
            &operation,
            json!({"friends": {
                "edges": [
                    {"cursor": "c1", "node": {"id": "f1", "name": "Ann"}},
                    {"cursor": "c2", "node": {"id": "f2", "name": "Bo"}}
                ],
                "pageInfo": {"endCursor": "c2", "hasNextPage": true}
            }}),
        );
        let root = env.lookup(&operation.fragment);
        let key = Signal::new(FragmentKey::from_data(&root.data));

        Fixture {
            network,
            owner: Owner::new(context),
            fragment,
            key,
        }
    }

    fn names(state: &DataState<Data>) -> Vec<String> {
        state
            .data
            .as_ref()
            .and_then(|data| data.get_path(&["friends", "edges"]))
            .and_then(Data::as_list)
            .map(|edges| {
                edges
                    .iter()
                    .filter_map(|edge| edge.get_path(&["node", "name"]).and_then(Data::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn connection_state_reads_cursor_and_has_more() {
        let fragment = ReaderFragment::new("F", Vec::new());
        let data = Data::object([(
            "friends",
            Data::object([
                ("edges", Data::list([])),
                (
                    "pageInfo",
                    Data::object([
                        ("endCursor", Data::string("c9")),
                        ("hasNextPage", Data::Bool(true)),
                    ]),
                ),
            ]),
        )]);
        let path = vec!["friends".to_string()];

        let forward = get_connection_state(Direction::Forward, &fragment, Some(&data), &path).expect("state");
        assert_eq!(forward.cursor.as_deref(), Some("c9"));
        assert!(forward.has_more);

        let backward = get_connection_state(Direction::Backward, &fragment, Some(&data), &path).expect("state");
        assert_eq!(backward, ConnectionState::default());

        let broken = Data::object([("friends", Data::string("nope"))]);
        assert!(get_connection_state(Direction::Forward, &fragment, Some(&broken), &path).is_err());
    }

    #[test]
    fn pagination_variables_null_the_opposite_direction() {
        let metadata = ConnectionMetadata::bidirectional(&["friends"]);
        let mut base = Variables::new();
        base.insert("before".into(), json!("old"));

        let variables =
            get_pagination_variables(Direction::Forward, 5, Some("c2"), &base, &Variables::new(), &metadata)
                .expect("variables");

        assert_eq!(variables.get("after"), Some(&json!("c2")));
        assert_eq!(variables.get("first"), Some(&json!(5)));
        assert_eq!(variables.get("before"), Some(&Value::Null));
        assert_eq!(variables.get("last"), Some(&Value::Null));

        let forward_only = ConnectionMetadata::forward(&["friends"]);
        assert!(
            get_pagination_variables(Direction::Backward, 5, None, &base, &Variables::new(), &forward_only)
                .is_err()
        );
    }

    #[test]
    fn load_next_appends_the_fetched_page() {
        let fixture = fixture();
        let pagination = create_pagination_fragment(&fixture.owner, fixture.fragment.clone(), &fixture.key)
            .expect("pagination");
        assert_eq!(names(&pagination.state()), vec!["Ann", "Bo"]);
        assert!(pagination.has_next());

        let completed = Arc::new(Mutex::new(None));
        let sink = completed.clone();
        let _handle = pagination.load_next(2, Some(Box::new(move |error| *sink.lock().unwrap() = Some(error))));
        assert!(pagination.is_loading_next());

        let request = fixture.network.last_request().expect("request");
        assert_eq!(request.variables.get("after"), Some(&json!("c2")));
        assert_eq!(request.variables.get("first"), Some(&json!(2)));

        fixture.network.respond(
            "FriendsListPaginationQuery",
            json!({"friends": {
                "edges": [
                    {"cursor": "c3", "node": {"id": "f3", "name": "Cy"}}
                ],
                "pageInfo": {"endCursor": "c3", "hasNextPage": false}
            }}),
        );

        assert_eq!(*completed.lock().unwrap(), Some(None));
        assert!(!pagination.is_loading_next());
        assert_eq!(names(&pagination.state()), vec!["Ann", "Bo", "Cy"]);
        assert!(!pagination.has_next());
    }

    #[test]
    fn load_next_while_loading_completes_immediately() {
        let fixture = fixture();
        let pagination = create_pagination_fragment(&fixture.owner, fixture.fragment.clone(), &fixture.key)
            .expect("pagination");
        let _first = pagination.load_next(2, None);

        let completed = Arc::new(Mutex::new(None));
        let sink = completed.clone();
        let _second = pagination.load_next(2, Some(Box::new(move |error| *sink.lock().unwrap() = Some(error))));

        assert_eq!(*completed.lock().unwrap(), Some(None));
        assert_eq!(fixture.network.request_count(), 1);
    }
}
