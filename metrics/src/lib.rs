use std::time::{Duration, Instant};

use anyhow::Result;
use opentelemetry::{
    metrics::{Counter, Histogram},
    KeyValue,
};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};

pub fn low_latency_boundaries() -> Vec<f64> {
    vec![
        0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 250.0,
        500.0, 750.0, 1000.0, 2500.0, 5000.0, 7500.0, 10000.0,
    ]
}

pub fn init_provider(
    enable_metrics: bool,
    endpoint: Option<&String>,
    interval: Duration,
    instance_id: Option<&String>,
    service_version: &str,
) -> Result<()> {
    if !enable_metrics {
        return Ok(());
    }

    let mut resource_builder = Resource::builder()
        .with_attribute(KeyValue::new("service.namespace", "edge"))
        .with_attribute(KeyValue::new("service.name", "edge-server"))
        .with_attribute(KeyValue::new(
            "service.version",
            service_version.to_string(),
        ));
    if let Some(instance_id) = instance_id {
        resource_builder = resource_builder.with_attribute(KeyValue::new(
            "edge.instance.id",
            instance_id.to_owned(),
        ));
    }
    let resource = resource_builder.build();

    let mut exporter = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = endpoint {
        exporter = exporter.with_endpoint(endpoint.to_owned());
    }
    let exporter = exporter.build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(interval)
        .build();

    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    opentelemetry::global::set_meter_provider(provider);
    Ok(())
}

/// Counters for the agent-facing surface.
pub mod api_io_stats {
    use opentelemetry::metrics::Counter;

    #[derive(Debug)]
    pub struct Metrics {
        pub async_check_ins: Counter<u64>,
        pub status_check_ins: Counter<u64>,
        pub rejected_check_ins: Counter<u64>,
        pub delivered_commands: Counter<u64>,
        pub full_snapshot_requests: Counter<u64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("edge-api");
            let async_check_ins = meter
                .u64_counter("edge.async_check_ins")
                .with_description("number of async agent check-ins")
                .build();
            let status_check_ins = meter
                .u64_counter("edge.status_check_ins")
                .with_description("number of status polls from agents")
                .build();
            let rejected_check_ins = meter
                .u64_counter("edge.rejected_check_ins")
                .with_description("number of check-ins refused for untrusted or unknown agents")
                .build();
            let delivered_commands = meter
                .u64_counter("edge.delivered_commands")
                .with_description("number of async commands handed to agents")
                .build();
            let full_snapshot_requests = meter
                .u64_counter("edge.full_snapshot_requests")
                .with_description("number of check-ins answered with a full snapshot request")
                .build();
            Metrics {
                async_check_ins,
                status_check_ins,
                rejected_check_ins,
                delivered_commands,
                full_snapshot_requests,
            }
        }
    }
}

pub mod blob_storage {
    use opentelemetry::metrics::Histogram;

    use crate::low_latency_boundaries;

    #[derive(Debug)]
    pub struct Metrics {
        pub operations: Histogram<f64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("blob-storage");

            let operations = meter
                .f64_histogram("edge.blob_operations_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("blob store latencies in seconds")
                .build();

            Metrics { operations }
        }
    }
}

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
    labels: &'a [KeyValue],
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    pub fn start_with_labels(metric: &'a T, labels: &'a [KeyValue]) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels,
        }
    }
}

impl<T: TimerUpdate + Sync> Drop for Timer<'_, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), self.labels);
    }
}

pub trait AutoIncrement {
    fn increment(&self, labels: &[KeyValue]);
}

impl AutoIncrement for Counter<u64> {
    fn increment(&self, labels: &[KeyValue]) {
        self.add(1, labels);
    }
}

/// Increments the counter when dropped, so early returns are counted too.
pub struct Increment<'a, T: AutoIncrement + Sync> {
    metric: &'a T,
    labels: &'a [KeyValue],
}

impl<'a, T: AutoIncrement + Sync> Increment<'a, T> {
    pub fn inc(metric: &'a T, labels: &'a [KeyValue]) -> Self {
        Self { metric, labels }
    }
}

impl<T: AutoIncrement + Sync> Drop for Increment<'_, T> {
    fn drop(&mut self) {
        self.metric.increment(self.labels);
    }
}

#[derive(Clone, Debug)]
pub struct StateStoreMetrics {
    pub state_write: Histogram<f64>,
    pub state_read: Histogram<f64>,
    pub status_cache_hits: Counter<u64>,
    pub status_cache_misses: Counter<u64>,
}

impl Default for StateStoreMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStoreMetrics {
    pub fn new() -> Self {
        let meter = opentelemetry::global::meter("state_store");

        let state_write = meter
            .f64_histogram("edge.state_machine_write_duration")
            .with_unit("s")
            .with_boundaries(low_latency_boundaries())
            .with_description("State machine writing latency in seconds")
            .build();

        let state_read = meter
            .f64_histogram("edge.state_machine_read_duration")
            .with_unit("s")
            .with_boundaries(low_latency_boundaries())
            .with_description("State machine reading latency in seconds")
            .build();

        let status_cache_hits = meter
            .u64_counter("edge.status_cache_hits")
            .with_description("Status responses served from the relation cache")
            .build();

        let status_cache_misses = meter
            .u64_counter("edge.status_cache_misses")
            .with_description("Status responses rebuilt from storage")
            .build();

        Self {
            state_write,
            state_read,
            status_cache_hits,
            status_cache_misses,
        }
    }
}
