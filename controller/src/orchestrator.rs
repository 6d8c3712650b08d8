use crate::events::{EventReason, NodeEventRecorder, NodeLifecycleEvent};
use crate::metrics::{NodeMetrics, Outcome};
use crate::pacer::DrainPacer;

use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::{Node, ObjectReference};
use models::node::{CordonDrainer, NodeExt};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{event, info_span, instrument, Instrument, Level};

/// A change to a node, as delivered by the cluster watch.
#[derive(Clone, Debug)]
pub enum NodeEvent {
    Added(Node),
    Updated(Node),
    Deleted(Node),
}

impl NodeEvent {
    pub fn node(&self) -> &Node {
        match self {
            Self::Added(node) | Self::Updated(node) | Self::Deleted(node) => node,
        }
    }
}

/// A drain which will run once its reserved slot arrives.
///
/// Dropping the handle leaves the drain scheduled.
#[derive(Debug)]
pub struct ScheduledDrain {
    node_name: String,
    drain_at: Instant,
    scheduled_for: DateTime<Utc>,
    task: JoinHandle<Outcome>,
}

impl ScheduledDrain {
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// The instant at which the drain begins.
    pub fn drain_at(&self) -> Instant {
        self.drain_at
    }

    /// Wall clock equivalent of `drain_at`, as reported in the `DrainScheduled` event.
    pub fn scheduled_for(&self) -> DateTime<Utc> {
        self.scheduled_for
    }

    /// Stops the drain from running if it has not started yet.
    pub fn cancel(&self) {
        self.task.abort();
    }

    /// Waits for the drain to finish. Returns `None` if it was cancelled before it completed.
    pub async fn outcome(self) -> Option<Outcome> {
        self.task.await.ok()
    }
}

/// Cordons nodes as they are offered, then drains them one at a time, paced so that consecutive drains anywhere in
/// the cluster are at least the pacer's buffer apart.
///
/// Failures are reported through events, metrics and logs, and are never retried here or returned to the caller.
pub struct DrainOrchestrator<T, R, M>
where
    T: CordonDrainer,
    R: NodeEventRecorder,
    M: NodeMetrics,
{
    drainer: T,
    recorder: Arc<R>,
    metrics: Arc<M>,
    pacer: Arc<DrainPacer>,
}

impl<T, R, M> Clone for DrainOrchestrator<T, R, M>
where
    T: CordonDrainer,
    R: NodeEventRecorder,
    M: NodeMetrics,
{
    fn clone(&self) -> Self {
        DrainOrchestrator {
            drainer: self.drainer.clone(),
            recorder: Arc::clone(&self.recorder),
            metrics: Arc::clone(&self.metrics),
            pacer: Arc::clone(&self.pacer),
        }
    }
}

impl<T, R, M> DrainOrchestrator<T, R, M>
where
    T: CordonDrainer + 'static,
    R: NodeEventRecorder,
    M: NodeMetrics,
{
    pub fn new(drainer: T, recorder: Arc<R>, metrics: Arc<M>, pacer: Arc<DrainPacer>) -> Self {
        DrainOrchestrator {
            drainer,
            recorder,
            metrics,
            pacer,
        }
    }

    pub fn pacer(&self) -> &DrainPacer {
        &self.pacer
    }

    /// Reacts to a node notification. Added and updated nodes are cordoned and scheduled for draining.
    ///
    /// Offering the same node more than once cordons it again; callers deduplicate with a `ProcessedFilter`.
    pub async fn handle(&self, event: NodeEvent) -> Option<ScheduledDrain> {
        match event {
            NodeEvent::Added(node) | NodeEvent::Updated(node) => {
                self.cordon_and_schedule(node).await
            }
            NodeEvent::Deleted(node) => {
                self.on_delete(&node);
                None
            }
        }
    }

    /// Deleted nodes need no disruption, so there is nothing to do.
    pub fn on_delete(&self, node: &Node) {
        event!(Level::TRACE, node = %node.node_name(), "Ignoring deleted node.");
    }

    /// Cordons the node, then reserves the next drain slot and schedules the drain for it.
    ///
    /// Returns `None` if the cordon failed, in which case no drain is scheduled.
    #[instrument(skip(self, node), fields(node = %node.node_name()))]
    pub async fn cordon_and_schedule(&self, node: Node) -> Option<ScheduledDrain> {
        let node_name = node.node_name();
        let reference = node.event_reference();

        event!(Level::DEBUG, "Cordoning");
        self.record(
            &reference,
            NodeLifecycleEvent::warning(EventReason::CordonStarting, "Cordoning node"),
        )
        .await;

        let cordon_result = self.drainer.cordon(&node).await;
        self.metrics
            .record_cordon(&node_name, Outcome::from(&cordon_result));
        if let Err(err) = cordon_result {
            event!(Level::INFO, %err, "Failed to cordon");
            self.record(
                &reference,
                NodeLifecycleEvent::warning(
                    EventReason::CordonFailed,
                    format!("Cordoning failed: {}", err),
                ),
            )
            .await;
            return None;
        }

        event!(Level::INFO, "Cordoned");
        self.record(
            &reference,
            NodeLifecycleEvent::warning(EventReason::CordonSucceeded, "Cordoned node"),
        )
        .await;

        let drain_at = self.pacer.reserve_next_slot();
        let scheduled_for = wall_clock(drain_at);
        let scheduled_for_str = rfc3339(scheduled_for);

        event!(Level::INFO, after = %scheduled_for_str, "Scheduled drain");
        self.record(
            &reference,
            NodeLifecycleEvent::warning(
                EventReason::DrainScheduled,
                format!("Will drain node after {}", scheduled_for_str),
            ),
        )
        .await;

        let span = info_span!("scheduled_drain", node = %node_name);
        let task = tokio::spawn(
            self.clone()
                .drain_when_due(node, reference, drain_at)
                .instrument(span),
        );

        Some(ScheduledDrain {
            node_name,
            drain_at,
            scheduled_for,
            task,
        })
    }

    async fn drain_when_due(
        self,
        node: Node,
        reference: ObjectReference,
        drain_at: Instant,
    ) -> Outcome {
        sleep_until(drain_at).await;
        self.pacer.reset();

        event!(Level::DEBUG, "Draining");
        self.record(
            &reference,
            NodeLifecycleEvent::warning(EventReason::DrainStarting, "Draining node"),
        )
        .await;

        let drain_result = self.drainer.drain(&node).await;
        let outcome = Outcome::from(&drain_result);
        self.metrics.record_drain(&node.node_name(), outcome);

        match drain_result {
            Ok(()) => {
                event!(Level::INFO, "Drained");
                self.record(
                    &reference,
                    NodeLifecycleEvent::warning(EventReason::DrainSucceeded, "Drained node"),
                )
                .await;
            }
            Err(err) => {
                event!(Level::INFO, %err, "Failed to drain");
                self.record(
                    &reference,
                    NodeLifecycleEvent::warning(
                        EventReason::DrainFailed,
                        format!("Draining failed: {}", err),
                    ),
                )
                .await;
            }
        }

        outcome
    }

    /// Event recording is best effort.
    async fn record(&self, reference: &ObjectReference, lifecycle_event: NodeLifecycleEvent) {
        if let Err(err) = self.recorder.record(reference, lifecycle_event).await {
            event!(Level::WARN, %err, "Unable to record node event.");
        }
    }
}

/// RFC 3339 in UTC, with only as many fraction digits as the time needs.
fn rfc3339(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Converts a runtime instant to the wall clock, for reporting.
fn wall_clock(instant: Instant) -> DateTime<Utc> {
    let remaining = instant.saturating_duration_since(Instant::now());
    Utc::now() + chrono::Duration::from_std(remaining).unwrap_or_else(|_| chrono::Duration::zero())
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::events;
    use crate::filters::test::fake_node;
    use async_trait::async_trait;
    use maplit::btreemap;
    use models::node::{CordonDrainerError, MockCordonDrainer};
    use std::sync::Mutex;
    use tokio::time::{advance, Duration};

    #[derive(Default)]
    pub(crate) struct RecordingEventRecorder {
        events: Mutex<Vec<(String, NodeLifecycleEvent)>>,
    }

    impl RecordingEventRecorder {
        pub(crate) fn reasons(&self) -> Vec<EventReason> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|(_, event)| event.reason)
                .collect()
        }

        pub(crate) fn events(&self) -> Vec<(String, NodeLifecycleEvent)> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NodeEventRecorder for RecordingEventRecorder {
        async fn record(
            &self,
            node: &ObjectReference,
            event: NodeLifecycleEvent,
        ) -> events::Result<()> {
            let name = node.name.clone().unwrap_or_default();
            self.events.lock().unwrap().push((name, event));
            Ok(())
        }
    }

    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub(crate) enum Counter {
        Cordoned,
        Drained,
    }

    #[derive(Default)]
    pub(crate) struct RecordingMetrics {
        recorded: Mutex<Vec<(Counter, String, Outcome)>>,
    }

    impl RecordingMetrics {
        pub(crate) fn recorded(&self) -> Vec<(Counter, String, Outcome)> {
            self.recorded.lock().unwrap().clone()
        }
    }

    impl NodeMetrics for RecordingMetrics {
        fn record_cordon(&self, node_name: &str, outcome: Outcome) {
            self.recorded
                .lock()
                .unwrap()
                .push((Counter::Cordoned, node_name.to_string(), outcome));
        }

        fn record_drain(&self, node_name: &str, outcome: Outcome) {
            self.recorded
                .lock()
                .unwrap()
                .push((Counter::Drained, node_name.to_string(), outcome));
        }
    }

    pub(crate) type TestOrchestrator =
        DrainOrchestrator<Arc<MockCordonDrainer>, RecordingEventRecorder, RecordingMetrics>;

    pub(crate) struct Harness {
        pub(crate) orchestrator: TestOrchestrator,
        pub(crate) recorder: Arc<RecordingEventRecorder>,
        pub(crate) metrics: Arc<RecordingMetrics>,
    }

    impl Harness {
        pub(crate) fn new(drainer: MockCordonDrainer, buffer: Duration) -> Self {
            let recorder = Arc::new(RecordingEventRecorder::default());
            let metrics = Arc::new(RecordingMetrics::default());
            let orchestrator = DrainOrchestrator::new(
                Arc::new(drainer),
                Arc::clone(&recorder),
                Arc::clone(&metrics),
                Arc::new(DrainPacer::new(buffer)),
            );
            Harness {
                orchestrator,
                recorder,
                metrics,
            }
        }
    }

    fn node(name: &str) -> Node {
        fake_node(name, btreemap! {})
    }

    fn failure(message: &'static str) -> CordonDrainerError {
        CordonDrainerError::Drain {
            source: message.into(),
            node_name: "n1".to_string(),
        }
    }

    #[test]
    fn test_scheduled_time_format() {
        use chrono::TimeZone;

        let whole_seconds = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(rfc3339(whole_seconds), "2024-01-02T03:04:05Z");
        assert_eq!(
            rfc3339(whole_seconds + chrono::Duration::milliseconds(500)),
            "2024-01-02T03:04:05.500Z"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cordon_and_drain_node() {
        let mut drainer = MockCordonDrainer::new();
        drainer.expect_cordon().times(1).returning(|_| Ok(()));
        drainer.expect_drain().times(1).returning(|_| Ok(()));
        let harness = Harness::new(drainer, Duration::from_secs(1));
        let start = Instant::now();

        let scheduled = harness
            .orchestrator
            .handle(NodeEvent::Added(node("n1")))
            .await
            .expect("drain should have been scheduled");
        assert_eq!(scheduled.node_name(), "n1");
        assert_eq!(scheduled.drain_at(), start + Duration::from_secs(1));
        assert_eq!(
            harness.recorder.reasons(),
            vec![
                EventReason::CordonStarting,
                EventReason::CordonSucceeded,
                EventReason::DrainScheduled,
            ]
        );
        assert_eq!(
            harness.metrics.recorded(),
            vec![(Counter::Cordoned, "n1".to_string(), Outcome::Succeeded)]
        );

        assert_eq!(scheduled.outcome().await, Some(Outcome::Succeeded));
        assert!(Instant::now() >= start + Duration::from_secs(1));

        assert_eq!(
            harness.recorder.reasons(),
            vec![
                EventReason::CordonStarting,
                EventReason::CordonSucceeded,
                EventReason::DrainScheduled,
                EventReason::DrainStarting,
                EventReason::DrainSucceeded,
            ]
        );
        assert_eq!(
            harness.metrics.recorded(),
            vec![
                (Counter::Cordoned, "n1".to_string(), Outcome::Succeeded),
                (Counter::Drained, "n1".to_string(), Outcome::Succeeded),
            ]
        );
        assert!(harness
            .recorder
            .events()
            .iter()
            .all(|(name, event)| name == "n1" && event.severity == events::Severity::Warning));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drains_are_paced_across_nodes() {
        let mut drainer = MockCordonDrainer::new();
        drainer.expect_cordon().times(2).returning(|_| Ok(()));
        drainer.expect_drain().returning(|_| Ok(()));
        let harness = Harness::new(drainer, Duration::from_secs(600));

        let first = harness
            .orchestrator
            .handle(NodeEvent::Added(node("n1")))
            .await
            .unwrap();
        advance(Duration::from_secs(1)).await;
        let second = harness
            .orchestrator
            .handle(NodeEvent::Updated(node("n2")))
            .await
            .unwrap();

        // Spaced from the first node's drain, not merely from when the second node was cordoned.
        assert!(second.drain_at() - first.drain_at() >= Duration::from_secs(600));
        assert!(second.scheduled_for() > first.scheduled_for());
        assert_eq!(
            harness.orchestrator.pacer().last_drain_scheduled_for(),
            second.drain_at()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cordon_failure_skips_drain() {
        let mut drainer = MockCordonDrainer::new();
        drainer.expect_cordon().times(1).returning(|node| {
            Err(CordonDrainerError::Cordon {
                source: "api server unavailable".into(),
                node_name: node.node_name(),
            })
        });
        drainer.expect_drain().times(0);
        let harness = Harness::new(drainer, Duration::from_secs(1));
        let start = Instant::now();

        let scheduled = harness
            .orchestrator
            .handle(NodeEvent::Added(node("n1")))
            .await;
        assert!(scheduled.is_none());

        // Give any stray drain ample opportunity to fire.
        advance(Duration::from_secs(60)).await;

        assert_eq!(
            harness.recorder.reasons(),
            vec![EventReason::CordonStarting, EventReason::CordonFailed]
        );
        let (_, failed) = harness.recorder.events().pop().unwrap();
        assert!(failed.message.contains("api server unavailable"));
        assert_eq!(
            harness.metrics.recorded(),
            vec![(Counter::Cordoned, "n1".to_string(), Outcome::Failed)]
        );
        assert_eq!(harness.orchestrator.pacer().last_drain_scheduled_for(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_failure_is_terminal() {
        let mut drainer = MockCordonDrainer::new();
        drainer.expect_cordon().times(1).returning(|_| Ok(()));
        drainer
            .expect_drain()
            .times(1)
            .returning(|_| Err(failure("pdb violated")));
        let harness = Harness::new(drainer, Duration::from_secs(1));

        let scheduled = harness
            .orchestrator
            .handle(NodeEvent::Added(node("n1")))
            .await
            .unwrap();
        assert_eq!(scheduled.outcome().await, Some(Outcome::Failed));

        assert_eq!(
            harness.recorder.reasons().last(),
            Some(&EventReason::DrainFailed)
        );
        assert_eq!(
            harness.metrics.recorded(),
            vec![
                (Counter::Cordoned, "n1".to_string(), Outcome::Succeeded),
                (Counter::Drained, "n1".to_string(), Outcome::Failed),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_resets_pacing_clock() {
        let mut drainer = MockCordonDrainer::new();
        drainer.expect_cordon().times(2).returning(|_| Ok(()));
        drainer.expect_drain().returning(|_| Ok(()));
        let buffer = Duration::from_secs(60);
        let harness = Harness::new(drainer, buffer);
        let start = Instant::now();

        let first = harness
            .orchestrator
            .handle(NodeEvent::Added(node("n1")))
            .await
            .unwrap();
        first.outcome().await;
        assert_eq!(
            harness.orchestrator.pacer().last_drain_scheduled_for(),
            start + buffer
        );

        let second = harness
            .orchestrator
            .handle(NodeEvent::Added(node("n2")))
            .await
            .unwrap();
        assert_eq!(second.drain_at(), Instant::now() + buffer);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleted_nodes_are_ignored() {
        let harness = Harness::new(MockCordonDrainer::new(), Duration::from_secs(1));

        let scheduled = harness
            .orchestrator
            .handle(NodeEvent::Deleted(node("n1")))
            .await;

        assert!(scheduled.is_none());
        assert!(harness.recorder.events().is_empty());
        assert!(harness.metrics.recorded().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_drain_never_runs() {
        let mut drainer = MockCordonDrainer::new();
        drainer.expect_cordon().times(1).returning(|_| Ok(()));
        drainer.expect_drain().times(0);
        let harness = Harness::new(drainer, Duration::from_secs(1));

        let scheduled = harness
            .orchestrator
            .handle(NodeEvent::Added(node("n1")))
            .await
            .unwrap();
        scheduled.cancel();
        assert_eq!(scheduled.outcome().await, None);

        advance(Duration::from_secs(5)).await;
        assert_eq!(
            harness.recorder.reasons().last(),
            Some(&EventReason::DrainScheduled)
        );
    }

    struct FailingEventRecorder;

    #[async_trait]
    impl NodeEventRecorder for FailingEventRecorder {
        async fn record(
            &self,
            _node: &ObjectReference,
            event: NodeLifecycleEvent,
        ) -> events::Result<()> {
            Err(events::Error::Publish {
                source: kube::Error::Api(kube::error::ErrorResponse {
                    status: "Failure".to_string(),
                    message: "events are forbidden".to_string(),
                    reason: "Forbidden".to_string(),
                    code: 403,
                }),
                reason: event.reason,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_failures_do_not_stop_draining() {
        let mut drainer = MockCordonDrainer::new();
        drainer.expect_cordon().times(1).returning(|_| Ok(()));
        drainer.expect_drain().times(1).returning(|_| Ok(()));
        let metrics = Arc::new(RecordingMetrics::default());
        let orchestrator = DrainOrchestrator::new(
            Arc::new(drainer),
            Arc::new(FailingEventRecorder),
            Arc::clone(&metrics),
            Arc::new(DrainPacer::new(Duration::from_secs(1))),
        );

        let scheduled = orchestrator.handle(NodeEvent::Added(node("n1"))).await.unwrap();
        assert_eq!(scheduled.outcome().await, Some(Outcome::Succeeded));
        assert_eq!(metrics.recorded().len(), 2);
    }
}
