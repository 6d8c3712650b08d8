use std::{env, sync::Arc};

use draino::{
    config::ControllerConfig, events::K8SEventRecorder, filters::FilterChain,
    metrics::DrainoMetrics, pacer::DrainPacer, telemetry::vending_metrics, DrainOrchestrator,
    NodeWatcher,
};
use models::{
    constants::METER_NAME,
    node::{CordonDrainer, DryRunCordonDrainer, K8SCordonDrainer},
    telemetry,
};

use actix_web::{web::Data, App, HttpServer};
use futures::{future::BoxFuture, FutureExt};
use k8s_openapi::api::core::v1::Node;
use kube::api::Api;
use opentelemetry::global;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use snafu::ResultExt;
use tracing::{event, Level};

/// The module-wide result type.
type Result<T> = std::result::Result<T, controller_error::Error>;

#[actix_web::main]
async fn main() -> Result<()> {
    telemetry::init_telemetry_from_env().context(controller_error::TelemetryInitSnafu)?;

    let config = ControllerConfig::from_environment().context(controller_error::ConfigSnafu)?;
    event!(
        Level::INFO,
        drain_buffer = ?config.drain_buffer,
        node_labels = ?config.node_labels,
        node_conditions = ?config.node_conditions,
        dry_run = config.dry_run,
        "Starting draino."
    );

    let k8s_client = kube::client::Client::try_default()
        .await
        .context(controller_error::ClientCreateSnafu)?;

    // The meter provider has to be installed before any counters are created.
    let registry = prometheus::Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()
        .context(controller_error::PrometheusExporterSnafu)?;
    global::set_meter_provider(SdkMeterProvider::builder().with_reader(exporter).build());
    let metrics = Arc::new(DrainoMetrics::new(global::meter(METER_NAME)));

    let recorder = Arc::new(K8SEventRecorder::new(
        k8s_client.clone(),
        config.event_reporter_name.clone(),
    ));
    let pacer = Arc::new(DrainPacer::new(config.drain_buffer));
    let filters =
        FilterChain::for_candidates(config.node_labels.clone(), config.node_conditions.clone());
    let nodes: Api<Node> = Api::all(k8s_client.clone());

    let node_watcher: BoxFuture<'static, draino::error::Result<()>> = if config.dry_run {
        watch_nodes(DryRunCordonDrainer, filters, recorder, metrics, pacer, nodes).boxed()
    } else {
        let drainer = K8SCordonDrainer::new(k8s_client, config.drain_options.clone());
        watch_nodes(drainer, filters, recorder, metrics, pacer, nodes).boxed()
    };

    let ipv6 = env::var("KUBERNETES_SERVICE_HOST")
        .map(|service_addr| service_addr.contains(':'))
        .unwrap_or(false);
    let bindaddress = if ipv6 { "[::]" } else { "0.0.0.0" };

    // Setup Http server to vend prometheus metrics
    let prometheus_server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(registry.clone()))
            .service(vending_metrics)
    })
    .bind(format!("{}:{}", bindaddress, config.metrics_port))
    .context(controller_error::PrometheusServerSnafu)?
    .run();

    tokio::select! {
        watched = node_watcher => {
            event!(Level::ERROR, "node watcher exited");
            watched.context(controller_error::WatcherSnafu)?
        },
        served = prometheus_server => {
            event!(Level::ERROR, "metric server exited");
            served.context(controller_error::PrometheusServerSnafu)?
        }
    };
    Ok(())
}

async fn watch_nodes<T: CordonDrainer + 'static>(
    drainer: T,
    filters: FilterChain,
    recorder: Arc<K8SEventRecorder>,
    metrics: Arc<DrainoMetrics>,
    pacer: Arc<DrainPacer>,
    nodes: Api<Node>,
) -> draino::error::Result<()> {
    let orchestrator = DrainOrchestrator::new(drainer, recorder, metrics, pacer);
    NodeWatcher::new(filters, orchestrator).run(nodes).await
}

pub mod controller_error {
    use draino::config::config_error;
    use models::telemetry;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Invalid configuration: '{}'", source))]
        Config { source: config_error::Error },

        #[snafu(display("Unable to create Kubernetes client: '{}'", source))]
        ClientCreate { source: kube::Error },

        #[snafu(display("Error watching nodes: '{}'", source))]
        Watcher { source: draino::error::Error },

        #[snafu(display("Unable to build prometheus exporter: '{}'", source))]
        PrometheusExporter {
            source: opentelemetry::metrics::MetricsError,
        },

        #[snafu(display("Error running prometheus HTTP server: '{}'", source))]
        PrometheusServer { source: std::io::Error },

        #[snafu(display("Error configuring telemetry: '{}'", source))]
        TelemetryInit {
            source: telemetry::TelemetryConfigError,
        },
    }
}
