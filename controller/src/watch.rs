//! Feeds the Kubernetes WATCH on Node objects through the filter chain and into the drain orchestrator.
use crate::error::{self, Result};
use crate::events::NodeEventRecorder;
use crate::filters::FilterChain;
use crate::metrics::NodeMetrics;
use crate::orchestrator::{DrainOrchestrator, NodeEvent, ScheduledDrain};

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::api::Api;
use kube::runtime::{
    watcher::{self, watcher, Config},
    WatchStreamExt,
};
use models::node::{CordonDrainer, NodeExt};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{event, instrument, Level};

/// Translates a watch event into node notifications.
///
/// The initial listing and every relist after a watch restart arrive as `Restarted`, and each node it carries is
/// reported as added.
pub fn node_events(watch_event: watcher::Event<Node>) -> Vec<NodeEvent> {
    match watch_event {
        watcher::Event::Applied(node) => vec![NodeEvent::Updated(node)],
        watcher::Event::Deleted(node) => vec![NodeEvent::Deleted(node)],
        watcher::Event::Restarted(nodes) => nodes.into_iter().map(NodeEvent::Added).collect(),
    }
}

/// Offers node notifications that pass the filter chain to the orchestrator.
pub struct NodeWatcher<T, R, M>
where
    T: CordonDrainer,
    R: NodeEventRecorder,
    M: NodeMetrics,
{
    filters: Arc<FilterChain>,
    orchestrator: DrainOrchestrator<T, R, M>,
}

impl<T, R, M> NodeWatcher<T, R, M>
where
    T: CordonDrainer + 'static,
    R: NodeEventRecorder,
    M: NodeMetrics,
{
    pub fn new(filters: FilterChain, orchestrator: DrainOrchestrator<T, R, M>) -> Self {
        NodeWatcher {
            filters: Arc::new(filters),
            orchestrator,
        }
    }

    /// Evaluates the filter chain for one notification and, if it passes, hands the notification to the orchestrator
    /// on its own task.
    ///
    /// The chain is evaluated before this returns, so notifications are deduplicated in arrival order even though
    /// handling them proceeds concurrently.
    pub fn dispatch(&self, node_event: NodeEvent) -> Option<JoinHandle<Option<ScheduledDrain>>> {
        match &node_event {
            NodeEvent::Deleted(node) => {
                self.orchestrator.on_delete(node);
                return None;
            }
            NodeEvent::Added(node) | NodeEvent::Updated(node) => {
                if !self.filters.evaluate(node) {
                    return None;
                }
                event!(Level::INFO, node = %node.node_name(), "Node is a candidate for draining.");
            }
        }

        let orchestrator = self.orchestrator.clone();
        Some(tokio::spawn(
            async move { orchestrator.handle(node_event).await },
        ))
    }

    /// Watches every node in the cluster until the watch stream ends.
    #[instrument(skip(self, nodes))]
    pub async fn run(self, nodes: Api<Node>) -> Result<()> {
        let mut watch_events = watcher(nodes, Config::default())
            .default_backoff()
            .boxed();

        while let Some(watch_event) = watch_events.next().await {
            match watch_event {
                Ok(watch_event) => {
                    for node_event in node_events(watch_event) {
                        // Scheduled drains run on their own; the handles are not needed here.
                        let _ = self.dispatch(node_event);
                    }
                }
                Err(err) => {
                    event!(Level::WARN, %err, "Error watching nodes, retrying.");
                }
            }
        }

        error::NodeWatchEndedSnafu.fail()
    }
}
