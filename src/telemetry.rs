use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

pub struct Metrics {
    request_counter: IntCounterVec,
    unauthorized_counter: IntCounterVec,
    classification_duration: HistogramVec,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("image_classifier".to_string()), None)?;

        let request_counter = IntCounterVec::new(
            Opts::new("requests_total", "Total number of classification requests"),
            &["route", "status"],
        )?;

        let unauthorized_counter = IntCounterVec::new(
            Opts::new(
                "unauthorized_total",
                "Requests rejected for a missing or invalid bearer token",
            ),
            &["route"],
        )?;

        let boundaries =
            duration_boundaries(&[(10, 100, 10), (100, 1000, 100), (1000, 5000, 1000)]);
        let classification_duration = HistogramVec::new(
            HistogramOpts::new(
                "classification_duration_ms",
                "Duration of decode and inference in milliseconds",
            )
            .buckets(boundaries),
            &["route"],
        )?;

        registry.register(Box::new(request_counter.clone()))?;
        registry.register(Box::new(unauthorized_counter.clone()))?;
        registry.register(Box::new(classification_duration.clone()))?;

        Ok(Metrics {
            request_counter,
            unauthorized_counter,
            classification_duration,
            registry,
        })
    }

    pub fn record_request(&self, route: &str, status: u16) {
        let status = status.to_string();
        self.request_counter
            .with_label_values(&[route, status.as_str()])
            .inc();
    }

    pub fn record_unauthorized(&self, route: &str) {
        self.unauthorized_counter.with_label_values(&[route]).inc();
    }

    pub fn record_classification_duration(&self, duration_ms: u64, route: &str) {
        self.classification_duration
            .with_label_values(&[route])
            .observe(duration_ms as f64);
    }
}

/// Histogram bucket edges from `(start, end, step)` ranges, deduplicated
/// where ranges meet.
fn duration_boundaries(ranges: &[(u64, u64, usize)]) -> Vec<f64> {
    let mut boundaries: Vec<u64> = ranges
        .iter()
        .flat_map(|&(start, end, step)| (start..=end).step_by(step))
        .collect();
    boundaries.dedup();
    boundaries.into_iter().map(|x| x as f64).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{Encoder, TextEncoder};

    #[test]
    fn test_duration_boundaries() {
        let get = duration_boundaries(&[(2, 22, 10), (22, 26, 2), (26, 46, 20)]);
        let expected = vec![2.0, 12.0, 22.0, 24.0, 26.0, 46.0];

        assert_eq!(get, expected);
    }

    #[test]
    fn test_recorded_metrics_are_exported() {
        let metrics = Metrics::new().unwrap();
        metrics.record_request("/classify", 200);
        metrics.record_unauthorized("/classify");
        metrics.record_classification_duration(42, "/classify");

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&metrics.registry.gather(), &mut buffer)
            .unwrap();
        let exposition = String::from_utf8(buffer).unwrap();

        assert!(exposition
            .contains(r#"image_classifier_requests_total{route="/classify",status="200"} 1"#));
        assert!(
            exposition.contains(r#"image_classifier_unauthorized_total{route="/classify"} 1"#)
        );
        assert!(exposition.contains("image_classifier_classification_duration_ms_bucket"));
    }
}
