use std::sync::Once;

use metrics::{Unit, describe_counter};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};
use crate::error::InitError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InitError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| InitError::telemetry(format!("failed to install tracing subscriber: {err}")))
}

/// Registers descriptions for every counter the crate emits. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "relay_query_resource_hit_total",
            Unit::Count,
            "Total number of query resource reads served from the cache."
        );
        describe_counter!(
            "relay_query_resource_miss_total",
            Unit::Count,
            "Total number of query resource reads that created a cache entry."
        );
        describe_counter!(
            "relay_query_resource_evict_total",
            Unit::Count,
            "Total number of query resource entries evicted due to capacity."
        );
        describe_counter!(
            "relay_fragment_resource_hit_total",
            Unit::Count,
            "Total number of fragment reads served from the cache."
        );
        describe_counter!(
            "relay_fragment_resource_miss_total",
            Unit::Count,
            "Total number of fragment reads that looked up the store."
        );
        describe_counter!(
            "relay_fragment_resource_evict_total",
            Unit::Count,
            "Total number of fragment results evicted due to capacity."
        );
        describe_counter!(
            "relay_network_request_total",
            Unit::Count,
            "Total number of requests sent to the network."
        );
    });
}
