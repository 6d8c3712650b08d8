pub const DRAINO: &str = "draino";

// Identifies this controller as the reporter of the Kubernetes events it records.
pub const DEFAULT_EVENT_REPORTER: &str = DRAINO;
// Name of the opentelemetry meter that owns the cordon/drain counters.
pub const METER_NAME: &str = DRAINO;

pub const METRICS_INTERNAL_PORT: u16 = 10002; // The port on which prometheus metrics are vended.

pub const K8S_NODE_KIND: &str = "Node";

// Pods carrying this annotation are static mirror pods managed by the kubelet.
pub const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";
pub const DAEMONSET_KIND: &str = "DaemonSet";
