use opentelemetry::{
    metrics::{Counter, Meter},
    Key,
};
use strum_macros::{AsRefStr, Display};
use tracing::instrument;

const NODE_NAME_KEY: Key = Key::from_static_str("node_name");
const RESULT_KEY: Key = Key::from_static_str("result");

/// Whether a cordon or drain attempt succeeded.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, AsRefStr, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Outcome {
    Succeeded,
    Failed,
}

impl<T, E> From<&std::result::Result<T, E>> for Outcome {
    fn from(result: &std::result::Result<T, E>) -> Self {
        match result {
            Ok(_) => Outcome::Succeeded,
            Err(_) => Outcome::Failed,
        }
    }
}

/// A sink for the cordon and drain counters. Each attempt is recorded exactly once.
pub trait NodeMetrics: Send + Sync + 'static {
    fn record_cordon(&self, node_name: &str, outcome: Outcome);
    fn record_drain(&self, node_name: &str, outcome: Outcome);
}

/// Records cordon and drain attempts as opentelemetry counters.
pub struct DrainoMetrics {
    nodes_cordoned: Counter<u64>,
    nodes_drained: Counter<u64>,
}

impl DrainoMetrics {
    #[instrument(skip(meter))]
    pub fn new(meter: Meter) -> Self {
        let nodes_cordoned = meter
            .u64_counter("draino_nodes_cordoned")
            .with_description("Number of nodes cordoned.")
            .init();

        let nodes_drained = meter
            .u64_counter("draino_nodes_drained")
            .with_description("Number of nodes drained.")
            .init();

        DrainoMetrics {
            nodes_cordoned,
            nodes_drained,
        }
    }
}

impl NodeMetrics for DrainoMetrics {
    fn record_cordon(&self, node_name: &str, outcome: Outcome) {
        let labels = [
            NODE_NAME_KEY.string(node_name.to_string()),
            RESULT_KEY.string(outcome.to_string()),
        ];
        self.nodes_cordoned.add(1, &labels);
    }

    fn record_drain(&self, node_name: &str, outcome: Outcome) {
        let labels = [
            NODE_NAME_KEY.string(node_name.to_string()),
            RESULT_KEY.string(outcome.to_string()),
        ];
        self.nodes_drained.add(1, &labels);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use opentelemetry::metrics::MeterProvider;
    use opentelemetry_sdk::metrics::SdkMeterProvider;
    use prometheus::{Encoder, Registry, TextEncoder};

    #[test]
    fn test_outcome_labels() {
        assert_eq!(Outcome::Succeeded.to_string(), "succeeded");
        assert_eq!(Outcome::Failed.as_ref(), "failed");
        assert_eq!(Outcome::from(&Ok::<(), ()>(())), Outcome::Succeeded);
        assert_eq!(Outcome::from(&Err::<(), ()>(())), Outcome::Failed);
    }

    #[test]
    fn test_counters_are_exported() {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()
            .unwrap();
        let provider = SdkMeterProvider::builder().with_reader(exporter).build();

        let metrics = DrainoMetrics::new(provider.meter("draino-test"));
        metrics.record_cordon("ip-10-0-0-1", Outcome::Succeeded);
        metrics.record_cordon("ip-10-0-0-2", Outcome::Failed);
        metrics.record_drain("ip-10-0-0-1", Outcome::Succeeded);

        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buf)
            .unwrap();
        let exported = String::from_utf8(buf).unwrap();

        assert!(exported.contains("draino_nodes_cordoned"));
        assert!(exported.contains("draino_nodes_drained"));
        assert!(exported.contains(r#"node_name="ip-10-0-0-2""#));
        assert!(exported.contains(r#"result="failed""#));
    }
}
