use std::collections::HashMap;
use std::sync::Arc;

use metrics_util::debugging::{DebugValue, DebuggingRecorder};
use relay_reactive::resource::{PrepareOptions, RelayContext, ResourceConfig};
use relay_reactive::runtime::descriptor::{
    ConcreteRequest, Field, FragmentKey, OperationDescriptor, Variables,
};
use relay_reactive::runtime::memory::{EnvironmentOptions, MemoryEnvironment, ScriptedNetwork};
use relay_reactive::runtime::policy::FetchPolicy;
use relay_reactive::runtime::{Environment, Resolution};
use serde_json::json;

fn counters(recorder: &DebuggingRecorder) -> HashMap<String, u64> {
    recorder
        .snapshotter()
        .snapshot()
        .into_vec()
        .into_iter()
        .filter_map(|(key, _, _, value)| match value {
            DebugValue::Counter(count) => Some((key.key().name().to_string(), count)),
            _ => None,
        })
        .collect()
}

fn user_query(id: &str) -> OperationDescriptor {
    let request = Arc::new(ConcreteRequest::query(
        "UserQuery",
        vec![
            Field::linked("user", vec![Field::scalar("id").into(), Field::scalar("name").into()])
                .arg_var("id", "id")
                .into(),
        ],
    ));
    let mut variables = Variables::new();
    variables.insert("id".into(), json!(id));
    OperationDescriptor::new(&request, variables)
}

#[test]
fn resource_paths_emit_expected_counters() {
    let recorder = DebuggingRecorder::new();

    metrics::with_local_recorder(&recorder, || {
        let network = ScriptedNetwork::new();
        let env = MemoryEnvironment::new(Arc::new(network.clone()), EnvironmentOptions::default());
        let config = ResourceConfig {
            query_capacity: 1,
            ..ResourceConfig::default()
        };
        let context = RelayContext::new(env.clone(), config).expect("context");
        let queries = context.query_resource();
        let options = || PrepareOptions {
            fetch_policy: Some(FetchPolicy::StoreOrNetwork),
            ..PrepareOptions::default()
        };

        let first = user_query("1");
        env.commit_payload(&first, json!({"user": {"id": "1", "name": "Ann"}}));
        let Ok(Resolution::Ready(result)) =
            queries.prepare(&first, env.fetch_query(&first), options())
        else {
            panic!("cached data should not suspend");
        };
        let _ = queries.prepare(&first, env.fetch_query(&first), options());

        let key = FragmentKey::Single(result.fragment_ref.clone());
        let fragments = context.fragment_resource();
        let _ = fragments.read(&result.fragment_node, Some(&key), "metrics");
        let _ = fragments.read(&result.fragment_node, Some(&key), "metrics");

        let second = user_query("2");
        let _ = queries.prepare(&second, env.fetch_query(&second), options());
        network.respond("UserQuery", json!({"user": {"id": "2", "name": "Bo"}}));
    });

    let counters = counters(&recorder);
    assert_eq!(counters.get("relay_query_resource_miss_total"), Some(&2));
    assert_eq!(counters.get("relay_query_resource_hit_total"), Some(&1));
    assert_eq!(counters.get("relay_query_resource_evict_total"), Some(&1));
    assert_eq!(counters.get("relay_fragment_resource_miss_total"), Some(&1));
    assert_eq!(counters.get("relay_fragment_resource_hit_total"), Some(&1));
    assert_eq!(counters.get("relay_network_request_total"), Some(&1));
}
