mod client;
pub mod drain;
mod error;

pub use self::client::*;
pub use self::error::{CapabilityError, Error as CordonDrainerError};

use crate::constants::K8S_NODE_KIND;

use k8s_openapi::api::core::v1::{Node, NodeCondition, ObjectReference};
use kube::ResourceExt;

/// Read-only accessors over a Kubernetes `Node` used when deciding whether to cordon and drain it.
pub trait NodeExt {
    /// The node's name, or an empty string for a node without metadata.
    fn node_name(&self) -> String;

    /// A stable identifier for the node within this process.
    ///
    /// Nodes delivered by the API server always carry a UID. Objects constructed without one fall back to their name.
    fn node_key(&self) -> String;

    /// Whether the node has been marked unschedulable (cordoned).
    fn is_unschedulable(&self) -> bool;

    /// The node's current conditions, in the order reported by the kubelet.
    fn node_conditions(&self) -> &[NodeCondition];

    /// Builds the object reference to which cordon/drain events are attached.
    fn event_reference(&self) -> ObjectReference;
}

impl NodeExt for Node {
    fn node_name(&self) -> String {
        self.name_any()
    }

    fn node_key(&self) -> String {
        self.uid().unwrap_or_else(|| self.name_any())
    }

    fn is_unschedulable(&self) -> bool {
        self.spec
            .as_ref()
            .and_then(|spec| spec.unschedulable)
            .unwrap_or(false)
    }

    fn node_conditions(&self) -> &[NodeCondition] {
        self.status
            .as_ref()
            .and_then(|status| status.conditions.as_deref())
            .unwrap_or_default()
    }

    fn event_reference(&self) -> ObjectReference {
        // `kubectl describe node` looks up events by a reference whose UID is the node's name rather than its real
        // UID, so events must be attached to this reference in order to show up there.
        let name = self.name_any();
        ObjectReference {
            kind: Some(K8S_NODE_KIND.to_string()),
            name: Some(name.clone()),
            uid: Some(name),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeSpec, NodeStatus};
    use kube::api::ObjectMeta;

    fn node(uid: Option<&str>, unschedulable: Option<bool>) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("ip-10-0-0-1".to_string()),
                uid: uid.map(str::to_string),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                unschedulable,
                ..Default::default()
            }),
            status: Some(NodeStatus::default()),
        }
    }

    #[test]
    fn test_node_key() {
        assert_eq!(node(Some("1234"), None).node_key(), "1234");
        assert_eq!(node(None, None).node_key(), "ip-10-0-0-1");
    }

    #[test]
    fn test_is_unschedulable() {
        let test_cases = vec![(None, false), (Some(false), false), (Some(true), true)];
        for (unschedulable, expected) in test_cases {
            assert_eq!(node(None, unschedulable).is_unschedulable(), expected);
        }
        assert!(!Node::default().is_unschedulable());
    }

    #[test]
    fn test_event_reference_uses_name_as_uid() {
        let reference = node(Some("1234"), None).event_reference();
        assert_eq!(reference.kind.as_deref(), Some("Node"));
        assert_eq!(reference.name.as_deref(), Some("ip-10-0-0-1"));
        assert_eq!(reference.uid.as_deref(), Some("ip-10-0-0-1"));
    }

    #[test]
    fn test_missing_conditions() {
        assert!(Node::default().node_conditions().is_empty());
    }
}
