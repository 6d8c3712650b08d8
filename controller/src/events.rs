use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use snafu::{ResultExt, Snafu};
use strum_macros::{AsRefStr, Display};
use tracing::instrument;

/// Reasons attached to the events recorded as a node moves through cordoning and draining.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, AsRefStr, Display)]
pub enum EventReason {
    CordonStarting,
    CordonSucceeded,
    CordonFailed,
    DrainScheduled,
    DrainStarting,
    DrainSucceeded,
    DrainFailed,
}

impl EventReason {
    /// The action that the event describes.
    pub fn action(&self) -> &'static str {
        match self {
            Self::CordonStarting | Self::CordonSucceeded | Self::CordonFailed => "Cordon",
            Self::DrainScheduled | Self::DrainStarting | Self::DrainSucceeded | Self::DrainFailed => {
                "Drain"
            }
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, AsRefStr, Display)]
pub enum Severity {
    Normal,
    Warning,
}

/// An event describing progress in taking a node out of service.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeLifecycleEvent {
    pub severity: Severity,
    pub reason: EventReason,
    pub message: String,
}

impl NodeLifecycleEvent {
    /// All cordon and drain events are warnings: each one means a node is being disrupted.
    pub fn warning<S: Into<String>>(reason: EventReason, message: S) -> Self {
        NodeLifecycleEvent {
            severity: Severity::Warning,
            reason,
            message: message.into(),
        }
    }
}

#[async_trait]
/// A sink for node lifecycle events.
pub trait NodeEventRecorder: Send + Sync + 'static {
    async fn record(&self, node: &ObjectReference, event: NodeLifecycleEvent) -> Result<()>;
}

/// Publishes node lifecycle events to the Kubernetes API.
#[derive(Clone)]
pub struct K8SEventRecorder {
    k8s_client: kube::Client,
    reporter: Reporter,
}

impl K8SEventRecorder {
    pub fn new<S: Into<String>>(k8s_client: kube::Client, controller_name: S) -> Self {
        K8SEventRecorder {
            k8s_client,
            reporter: Reporter {
                controller: controller_name.into(),
                instance: std::env::var("HOSTNAME").ok(),
            },
        }
    }
}

#[async_trait]
impl NodeEventRecorder for K8SEventRecorder {
    #[instrument(skip(self), err)]
    async fn record(&self, node: &ObjectReference, event: NodeLifecycleEvent) -> Result<()> {
        let recorder = Recorder::new(self.k8s_client.clone(), self.reporter.clone(), node.clone());
        recorder
            .publish(Event {
                type_: match event.severity {
                    Severity::Normal => EventType::Normal,
                    Severity::Warning => EventType::Warning,
                },
                reason: event.reason.to_string(),
                note: Some(event.message),
                action: event.reason.action().to_string(),
                secondary: None,
            })
            .await
            .context(PublishSnafu {
                reason: event.reason,
            })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unable to publish '{}' event: '{}'", reason, source))]
    Publish {
        source: kube::Error,
        reason: EventReason,
    },
}
