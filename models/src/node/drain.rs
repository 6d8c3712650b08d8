//! Provides an implementation for draining Pods from a Kubernetes Node, similar to `kubectl drain`.
//!
//! Draining is done client side by creating an Eviction for each Pod bound to the Node and then waiting for the
//! Pods to go away. Evictions respect PodDisruptionBudgets (PDBs).
//!
//! Cordoning is not handled here, because `kube-rs` provides `Api::cordon()`.
use crate::constants::{DAEMONSET_KIND, MIRROR_POD_ANNOTATION};

use futures::{stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{EvictParams, ListParams},
    Api, ResourceExt,
};
use snafu::ResultExt;
use tokio::time::{sleep, Duration, Instant};
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    RetryIf,
};
use tracing::{event, instrument, Level};

// Maximum number of Pods to evict concurrently, including the time spent waiting for their deletion.
const CONCURRENT_EVICTIONS: usize = 5;

// A 429 means a PodDisruptionBudget is not yet satisfied; we wait a fixed interval before asking again.
const EVICTION_RETRY_INTERVAL: Duration = Duration::from_secs(5);

const DELETION_CHECK_INTERVAL: Duration = Duration::from_secs(5);

const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(20);
const NUM_RETRIES: usize = 10;

/// Settings which control which Pods are evicted and how long to wait for them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DrainOptions {
    /// Evict Pods owned by a DaemonSet. The DaemonSet controller ignores cordons, so these usually come straight back.
    pub evict_daemonset_pods: bool,
    /// How long to wait for an evicted Pod to be deleted before giving up on it.
    pub deletion_timeout: Duration,
}

impl Default for DrainOptions {
    fn default() -> Self {
        DrainOptions {
            evict_daemonset_pods: false,
            deletion_timeout: Duration::from_secs(600),
        }
    }
}

struct EvictionRetryCondition;

impl tokio_retry::Condition<error::EvictionError> for EvictionRetryCondition {
    fn should_retry(&mut self, error: &error::EvictionError) -> bool {
        error.should_retry()
    }
}

fn eviction_retry_strategy() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(RETRY_BASE_DELAY.as_millis() as u64)
        .max_delay(RETRY_MAX_DELAY)
        .map(jitter)
        .take(NUM_RETRIES)
}

/// Drains a node of its pods.
///
/// Mirror Pods and Pods which have already terminated are never evicted. DaemonSet Pods are skipped unless
/// `options.evict_daemonset_pods` is set.
///
/// A Pod whose eviction or deletion fails is logged and skipped, and the drain still reports success. Only a
/// failure to list the node's Pods fails the drain.
#[instrument(skip(k8s_client), err)]
pub(crate) async fn drain_node(
    k8s_client: &kube::Client,
    node_name: &str,
    options: &DrainOptions,
) -> Result<(), error::DrainError> {
    let target_pods = find_target_pods(k8s_client, node_name, options).await?;

    stream::iter(target_pods)
        .for_each_concurrent(CONCURRENT_EVICTIONS, |pod| async move {
            if evict_pod(k8s_client, &pod).await.is_ok() {
                if let Err(err) = wait_for_deletion(k8s_client, &pod, options.deletion_timeout).await {
                    event!(Level::WARN, %err, "Proceeding with drain.");
                }
            }
        })
        .await;

    Ok(())
}

#[instrument(skip(k8s_client, options), err)]
async fn find_target_pods(
    k8s_client: &kube::Client,
    node_name: &str,
    options: &DrainOptions,
) -> Result<Vec<Pod>, error::DrainError> {
    let pods: Api<Pod> = Api::all(k8s_client.clone());

    let node_pods = pods
        .list(&ListParams::default().fields(&format!("spec.nodeName={}", node_name)))
        .await
        .context(error::FindTargetPodsSnafu {
            node_name: node_name.to_string(),
        })?;

    Ok(filter_pods(node_pods.into_iter(), options).collect())
}

/// Removes the Pods which a drain should leave alone.
fn filter_pods<'a, F: Iterator<Item = Pod> + 'a>(
    pods: F,
    options: &'a DrainOptions,
) -> impl Iterator<Item = Pod> + 'a {
    pods.filter(move |pod| {
        let terminated = pod
            .status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            .map_or(false, |phase| phase == "Succeeded" || phase == "Failed");
        if terminated {
            return false;
        }

        if pod.annotations().contains_key(MIRROR_POD_ANNOTATION) {
            event!(Level::DEBUG, pod = %pod.name_any(), "Skipping static mirror Pod.");
            return false;
        }

        let daemonset_owned = pod
            .owner_references()
            .iter()
            .any(|owner| owner.controller == Some(true) && owner.kind == DAEMONSET_KIND);
        if daemonset_owned && !options.evict_daemonset_pods {
            event!(Level::DEBUG, pod = %pod.name_any(), "Skipping DaemonSet Pod.");
            return false;
        }

        true
    })
}

/// Create an eviction for the desired Pod, retrying while the API server asks us to back off.
#[instrument(skip(k8s_client, pod), fields(pod = %pod.name_any()), err)]
async fn evict_pod(k8s_client: &kube::Client, pod: &Pod) -> Result<(), error::EvictionError> {
    let pod_api = namespaced_pod_api(k8s_client, pod);
    let pod_name = pod.name_any();

    RetryIf::spawn(
        eviction_retry_strategy(),
        || async {
            loop {
                match pod_api.evict(&pod_name, &EvictParams::default()).await {
                    Ok(_) => {
                        event!(Level::INFO, "Evicted Pod.");
                        return Ok(());
                    }
                    // 429: a PodDisruptionBudget is blocking the eviction. 500: the PDBs are likely misconfigured.
                    // Either way the eviction may eventually succeed, so keep asking without consuming a retry.
                    Err(kube::Error::Api(e)) if e.code == 429 || e.code == 500 => {
                        event!(
                            Level::WARN,
                            code = e.code,
                            "Eviction blocked: '{}'. Retrying in {:.2}s.",
                            e,
                            EVICTION_RETRY_INTERVAL.as_secs_f64()
                        );
                        sleep(EVICTION_RETRY_INTERVAL).await;
                    }
                    // 404: the Pod is already gone. 403: the namespace is being deleted.
                    Err(kube::Error::Api(e)) if e.code == 404 || e.code == 403 => {
                        return Err(error::EvictionError::NonRetriableEviction {
                            source: kube::Error::Api(e),
                            pod_name: pod_name.clone(),
                        });
                    }
                    Err(e) => {
                        return Err(error::EvictionError::RetriableEviction {
                            source: e,
                            pod_name: pod_name.clone(),
                        });
                    }
                }
            }
        },
        EvictionRetryCondition,
    )
    .await
}

/// Wait for the given Pod to be deleted by Kubernetes.
#[instrument(skip(k8s_client, pod), fields(pod = %pod.name_any()), err)]
async fn wait_for_deletion(
    k8s_client: &kube::Client,
    pod: &Pod,
    timeout: Duration,
) -> Result<(), error::DrainError> {
    let start_time = Instant::now();
    let pod_api = namespaced_pod_api(k8s_client, pod);
    let pod_name = pod.name_any();

    loop {
        match pod_api.get_opt(&pod_name).await {
            Ok(None) => {
                event!(Level::INFO, "Pod deleted.");
                return Ok(());
            }
            // A Pod with the same name but a new UID is a replacement, the one we evicted is gone.
            Ok(Some(current)) if current.uid() != pod.uid() => return Ok(()),
            Ok(Some(_)) => {
                event!(Level::DEBUG, "Pod not yet deleted.");
            }
            Err(err) => {
                event!(Level::WARN, %err, "Could not determine if Pod has been deleted.");
            }
        }

        if start_time.elapsed() > timeout {
            return error::WaitForDeletionSnafu {
                pod_name,
                max_wait: timeout,
            }
            .fail();
        }
        sleep(DELETION_CHECK_INTERVAL).await;
    }
}

/// Creates a kube::Api<Pod> for interacting with Pods in the namespace associated with the given Pod.
fn namespaced_pod_api(k8s_client: &kube::Client, pod: &Pod) -> Api<Pod> {
    match pod.metadata.namespace.as_ref() {
        Some(ns) => Api::namespaced(k8s_client.clone(), ns),
        None => Api::default_namespaced(k8s_client.clone()),
    }
}

pub mod error {
    use snafu::Snafu;
    use tokio::time::Duration;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum DrainError {
        #[snafu(display("Unable to find drainable Pods for Node '{}': '{}'", node_name, source))]
        FindTargetPods {
            source: kube::Error,
            node_name: String,
        },

        #[snafu(display("Pod '{}' was not deleted in the time allocated ({:.2}s).", pod_name, max_wait.as_secs_f64()))]
        WaitForDeletion {
            pod_name: String,
            max_wait: Duration,
        },
    }

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum EvictionError {
        /// An error occurred while attempting to evict a Pod. This may result in an attempt to retry the eviction.
        #[snafu(display("Unable to create eviction for Pod '{}': '{}'", pod_name, source))]
        RetriableEviction {
            source: kube::Error,
            pod_name: String,
        },

        /// A fatal error occurred while attempting to evict a Pod. This will not be retried.
        #[snafu(display("Unable to create eviction for Pod '{}': '{}'", pod_name, source))]
        NonRetriableEviction {
            source: kube::Error,
            pod_name: String,
        },
    }

    impl EvictionError {
        pub fn should_retry(&self) -> bool {
            matches!(self, Self::RetriableEviction { .. })
        }
    }
}
