use std::sync::{Arc, Mutex};

use relay_reactive::cache::LruCache;
use relay_reactive::primitives::{Owner, Signal, create_pagination_fragment};
use relay_reactive::resource::{PrepareOptions, QueryResult, RelayContext, ResourceConfig};
use relay_reactive::runtime::data::Data;
use relay_reactive::runtime::descriptor::{
    ConcreteRequest, ConnectionMetadata, Field, FragmentKey, OperationDescriptor, ReaderFragment,
    RefetchMetadata, Selection, Variables,
};
use relay_reactive::runtime::memory::{EnvironmentOptions, MemoryEnvironment, ScriptedNetwork};
use relay_reactive::runtime::policy::FetchPolicy;
use relay_reactive::runtime::snapshot::GraphQlResponse;
use relay_reactive::runtime::{Environment, Resolution};
use serde_json::json;

struct Harness {
    env: Arc<MemoryEnvironment>,
    network: ScriptedNetwork,
    context: RelayContext,
}

fn harness() -> Harness {
    let network = ScriptedNetwork::new();
    let env = MemoryEnvironment::new(Arc::new(network.clone()), EnvironmentOptions::default());
    let context = RelayContext::new(env.clone(), ResourceConfig::default())
        .expect("default config should build a context");
    Harness {
        env,
        network,
        context,
    }
}

fn node_query() -> Arc<ConcreteRequest> {
    Arc::new(ConcreteRequest::query(
        "NodeQuery",
        vec![
            Field::linked("node", vec![Field::scalar("id").into(), Field::scalar("name").into()])
                .arg("id", "1")
                .into(),
        ],
    ))
}

fn prepare(
    harness: &Harness,
    operation: &OperationDescriptor,
    fetch_policy: FetchPolicy,
) -> Resolution<QueryResult> {
    harness
        .context
        .query_resource()
        .prepare(
            operation,
            harness.env.fetch_query(operation),
            PrepareOptions {
                fetch_policy: Some(fetch_policy),
                ..PrepareOptions::default()
            },
        )
        .expect("prepare should not fail")
}

fn read_root(harness: &Harness, result: &QueryResult) -> (Data, bool) {
    let key = FragmentKey::Single(result.fragment_ref.clone());
    match harness
        .context
        .fragment_resource()
        .read(&result.fragment_node, Some(&key), "scenarios")
        .expect("read should not fail")
    {
        Resolution::Ready(fragment) => (fragment.data, fragment.is_missing_data),
        Resolution::Pending(_) => panic!("root fragment should be readable"),
    }
}

fn name_of(data: &Data) -> Option<&str> {
    data.get_path(&["node", "name"]).and_then(Data::as_str)
}

#[test]
fn store_or_network_cache_hit_reads_synchronously() {
    let harness = harness();
    let operation = OperationDescriptor::new(&node_query(), Variables::new());
    harness
        .env
        .commit_payload(&operation, json!({"node": {"id": "1", "name": "Alice"}}));

    let Resolution::Ready(result) = prepare(&harness, &operation, FetchPolicy::StoreOrNetwork) else {
        panic!("cached data should not suspend");
    };
    let (data, is_missing_data) = read_root(&harness, &result);

    assert_eq!(name_of(&data), Some("Alice"));
    assert!(!is_missing_data);
    assert_eq!(harness.network.request_count(), 0);
}

#[test]
fn store_or_network_cache_miss_suspends_until_the_network_resolves() {
    let harness = harness();
    let operation = OperationDescriptor::new(&node_query(), Variables::new());

    let first = prepare(&harness, &operation, FetchPolicy::StoreOrNetwork);
    let Resolution::Pending(pending) = first else {
        panic!("an empty store should suspend");
    };
    assert!(!pending.is_settled());

    harness
        .network
        .respond("NodeQuery", json!({"node": {"id": "1", "name": "Alice"}}));
    assert!(pending.is_settled());

    let Resolution::Ready(result) = prepare(&harness, &operation, FetchPolicy::StoreOrNetwork) else {
        panic!("resolved query should not suspend again");
    };
    let (data, is_missing_data) = read_root(&harness, &result);
    assert_eq!(name_of(&data), Some("Alice"));
    assert!(!is_missing_data);
}

#[test]
fn concurrent_reads_share_one_fetch() {
    let harness = harness();
    let operation = OperationDescriptor::new(&node_query(), Variables::new());

    for _ in 0..3 {
        assert!(prepare(&harness, &operation, FetchPolicy::NetworkOnly).is_pending());
    }

    assert_eq!(harness.network.request_count(), 1);
}

#[test]
fn incremental_error_keeps_earlier_data_readable() {
    let harness = harness();
    let operation = OperationDescriptor::new(&node_query(), Variables::new());
    assert!(prepare(&harness, &operation, FetchPolicy::NetworkOnly).is_pending());

    harness.network.push(
        "NodeQuery",
        GraphQlResponse::incremental(json!({"node": {"id": "1", "name": "Alice"}})),
    );
    harness.network.fail("NodeQuery", "deferred fragment failed");

    let Resolution::Ready(result) = prepare(&harness, &operation, FetchPolicy::NetworkOnly) else {
        panic!("the first payload already resolved the query");
    };
    let (data, _) = read_root(&harness, &result);
    assert_eq!(name_of(&data), Some("Alice"));
}

#[test]
fn retention_follows_the_net_outstanding_count() {
    let harness = harness();
    let operation = OperationDescriptor::new(&node_query(), Variables::new());
    harness
        .env
        .commit_payload(&operation, json!({"node": {"id": "1", "name": "Alice"}}));
    let resource = harness.context.query_resource();

    let Resolution::Ready(result) = prepare(&harness, &operation, FetchPolicy::StoreOrNetwork) else {
        panic!("cached data should not suspend");
    };
    assert_eq!(harness.env.retain_count(&operation), 1);

    let mut first = resource.retain(&result);
    let mut second = resource.retain(&result);
    assert_eq!(harness.env.retain_count(&operation), 1);

    first.dispose();
    assert_eq!(harness.env.retain_count(&operation), 1);
    second.dispose();
    second.dispose();
    assert_eq!(harness.env.retain_count(&operation), 0);
    assert!(!resource.has_entry(&result.cache_identifier));
}

#[test]
fn missed_updates_are_reported_once_per_write() {
    let harness = harness();
    let operation = OperationDescriptor::new(&node_query(), Variables::new());
    harness
        .env
        .commit_payload(&operation, json!({"node": {"id": "1", "name": "Alice"}}));
    let Resolution::Ready(result) = prepare(&harness, &operation, FetchPolicy::StoreOrNetwork) else {
        panic!("cached data should not suspend");
    };
    let key = FragmentKey::Single(result.fragment_ref.clone());
    let fragments = harness.context.fragment_resource();
    let Resolution::Ready(read) = fragments
        .read(&result.fragment_node, Some(&key), "scenarios")
        .expect("read")
    else {
        panic!("root fragment should be readable");
    };

    harness.env.commit_update("1", "name", json!("Alicia"));
    let missed = fragments.check_missed_updates(&read);
    assert!(missed.did_miss_updates);
    let updated = missed.result.expect("re-derived result");
    assert_eq!(name_of(&updated.data), Some("Alicia"));

    let again = fragments.check_missed_updates(&updated);
    assert!(!again.did_miss_updates);
}

#[test]
fn untouched_subtrees_keep_their_identity_across_writes() {
    let harness = harness();
    let request = Arc::new(ConcreteRequest::query(
        "PairQuery",
        vec![
            Field::linked("left", vec![Field::scalar("id").into(), Field::scalar("name").into()]).into(),
            Field::linked("right", vec![Field::scalar("id").into(), Field::scalar("name").into()]).into(),
        ],
    ));
    let operation = OperationDescriptor::new(&request, Variables::new());
    harness.env.commit_payload(
        &operation,
        json!({"left": {"id": "l", "name": "Lee"}, "right": {"id": "r", "name": "Ray"}}),
    );
    let Resolution::Ready(result) = prepare(&harness, &operation, FetchPolicy::StoreOnly) else {
        panic!("store-only should not suspend");
    };
    let key = FragmentKey::Single(result.fragment_ref.clone());
    let fragments = harness.context.fragment_resource();
    let Resolution::Ready(before) = fragments
        .read(&result.fragment_node, Some(&key), "scenarios")
        .expect("read")
    else {
        panic!("root fragment should be readable");
    };

    harness.env.commit_update("r", "name", json!("Roy"));
    let after = fragments
        .check_missed_updates(&before)
        .result
        .expect("re-derived result");

    let (left_before, left_after) = (before.data.get("left"), after.data.get("left"));
    assert!(matches!((left_before, left_after), (Some(a), Some(b)) if a.same_node(b)));
    assert_eq!(
        after.data.get_path(&["right", "name"]).and_then(Data::as_str),
        Some("Roy")
    );
}

#[test]
fn lru_eviction_drops_the_least_recently_used_key() {
    let mut cache = LruCache::new(3).expect("capacity");
    cache.set("a".to_string(), 1);
    cache.set("b".to_string(), 2);
    cache.set("c".to_string(), 3);

    assert_eq!(cache.get("a"), Some(&1));
    let evicted = cache.set("d".to_string(), 4);

    assert_eq!(evicted.map(|(key, _)| key), Some("b".to_string()));
    assert!(!cache.has("b"));
    assert!(cache.has("a"));
    assert_eq!(cache.size(), 3);
}

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

#[test]
fn load_next_fetches_after_the_end_cursor() {
    let harness = harness();
    let placeholder = Arc::new(ReaderFragment::new("Friends", friends_selections()));
    let pagination_query = Arc::new(ConcreteRequest::query(
        "FriendsPaginationQuery",
        vec![Selection::spread(&placeholder)],
    ));
    let fragment = Arc::new(
        ReaderFragment::new("Friends", friends_selections())
            .with_connection(ConnectionMetadata::forward(&["friends"]))
            .with_refetch(RefetchMetadata {
                request: pagination_query,
                fragment_path_in_response: Vec::new(),
                identifier_field: None,
                identifier_query_variable_name: "id".into(),
            }),
    );
    let parent = Arc::new(ConcreteRequest::query("FriendsQuery", vec![Selection::spread(&placeholder)]));
    let mut variables = Variables::new();
    variables.insert("first".into(), json!(1));
    let operation = OperationDescriptor::new(&parent, variables);
    harness.env.commit_payload(
        &operation,
        json!({"friends": {
            "edges": [{"cursor": "c1", "node": {"id": "f1", "name": "Ann"}}],
            "pageInfo": {"endCursor": "c1", "hasNextPage": true}
        }}),
    );
    let root = harness.env.lookup(&operation.fragment);
    let key = Signal::new(FragmentKey::from_data(&root.data));
    let owner = Owner::new(harness.context.clone());

    let pagination = create_pagination_fragment(&owner, fragment, &key).expect("pagination fragment");
    assert!(pagination.has_next());

    let outcome = Arc::new(Mutex::new(None));
    let sink = outcome.clone();
    let _handle = pagination.load_next(2, Some(Box::new(move |error| *sink.lock().unwrap() = Some(error))));

    let request = harness.network.last_request().expect("page request");
    assert_eq!(request.node.name, "FriendsPaginationQuery");
    assert_eq!(request.variables.get("after"), Some(&json!("c1")));
    assert_eq!(request.variables.get("first"), Some(&json!(2)));

    harness.network.respond(
        "FriendsPaginationQuery",
        json!({"friends": {
            "edges": [
                {"cursor": "c2", "node": {"id": "f2", "name": "Bo"}},
                {"cursor": "c3", "node": {"id": "f3", "name": "Cy"}}
            ],
            "pageInfo": {"endCursor": "c3", "hasNextPage": false}
        }}),
    );

    assert_eq!(*outcome.lock().unwrap(), Some(None));
    assert!(!pagination.has_next());
    let edges = pagination
        .state()
        .data
        .and_then(|data| data.get_path(&["friends", "edges"]).and_then(Data::as_list).map(<[Data]>::len));
    assert_eq!(edges, Some(3));
}
