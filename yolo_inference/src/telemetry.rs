use opentelemetry::{
    global,
    metrics::{Counter, Histogram, MeterProvider},
    KeyValue,
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;
use std::collections::HashSet;

pub struct Metrics {
    request_counter: Counter<u64>,
    inference_duration: Histogram<f64>,
    error_counter: Counter<u64>,
    pub registry: Registry,
    // The global slot only holds the latest provider; this reference keeps our reader alive.
    _provider: SdkMeterProvider,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build prometheus exporter: {}", e))?;

        let provider = SdkMeterProvider::builder()
            .with_reader(exporter)
            .build();

        let meter = provider.meter("yolo_inference");
        global::set_meter_provider(provider.clone());

        let request_counter = meter
            .u64_counter("requests_total")
            .with_description("Total number of inference requests")
            .build();

        let boundaries = generate_boundaries((5, 30, 60, 500, 1000));

        let inference_duration = meter
            .f64_histogram("inference_duration_ms")
            .with_boundaries(boundaries)
            .with_description("Duration of guarded model calls in milliseconds")
            .build();

        let error_counter = meter
            .u64_counter("inference_errors_total")
            .with_description("Inference requests that ended in an error")
            .build();

        Ok(Metrics {
            request_counter,
            inference_duration,
            error_counter,
            registry,
            _provider: provider,
        })
    }

    pub fn record_request(&self, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.request_counter.add(1, &attributes);
    }

    pub fn record_inference_duration(&self, duration_ms: f64, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.inference_duration.record(duration_ms, &attributes);
    }

    pub fn record_error(&self, kind: &'static str, route: &str) {
        let attributes = vec![
            KeyValue::new("route", route.to_string()),
            KeyValue::new("kind", kind),
        ];
        self.error_counter.add(1, &attributes);
    }
}

fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 5;
    let middle_step: usize = 5;
    let end_step: usize = 20;
    let tail_step: usize = 100;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    // prometheus 0.14 keeps its `MessageFieldExt` (which provides `get_value`
    // on `MessageField<Counter>`) private; mirror it for the test.
    trait MessageFieldExt {
        fn get_value(&self) -> f64;
    }

    impl<T: std::ops::Deref<Target = prometheus::proto::Counter>> MessageFieldExt for T {
        fn get_value(&self) -> f64 {
            self.value()
        }
    }

    #[test]
    fn test_generate_boundaries() {
        let parts = (2, 12, 22, 42, 142);
        let get = generate_boundaries(parts);
        let expected = vec![2.0, 7.0, 12.0, 17.0, 22.0, 42.0, 142.0];

        assert_eq!(get, expected);
    }

    #[test]
    fn test_metrics_are_exported() {
        let metrics = Metrics::new().unwrap();
        metrics.record_request("/infer");
        metrics.record_inference_duration(12.5, "/infer");
        metrics.record_error("invalid_image", "/infer");

        let names: Vec<String> = metrics
            .registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();

        assert!(names.iter().any(|name| name.starts_with("requests_total")));
        assert!(names
            .iter()
            .any(|name| name.starts_with("inference_duration_ms")));
    }

    #[test]
    fn test_metrics_survive_a_newer_instance() {
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();
        drop(second);

        first.record_request("/ws/infer");

        let families = first.registry.gather();
        let requests = families
            .iter()
            .find(|family| family.get_name().starts_with("requests_total"))
            .expect("requests_total exported");
        assert_eq!(requests.get_metric()[0].get_counter().get_value(), 1.0);
    }
}
