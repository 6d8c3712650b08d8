use super::{
    drain::{self, DrainOptions},
    error::{self, CapabilityError, Result},
    NodeExt,
};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::Api;
use snafu::ResultExt;
use std::sync::Arc;
use tracing::{event, instrument, Level};

#[cfg(feature = "mockall")]
use mockall::mock;

#[async_trait]
/// A trait providing the disruptive operations that take a node out of service. This is provided as a trait
/// in order to allow mocks to be used for testing purposes.
pub trait CordonDrainer: Clone + Sized + Send + Sync {
    /// Marks the given node as unschedulable, preventing Pods from being deployed onto it.
    async fn cordon(&self, node: &Node) -> Result<()>;
    /// Evicts all pods on the given node.
    async fn drain(&self, node: &Node) -> Result<()>;
}

#[cfg(feature = "mockall")]
mock! {
    /// A Mock CordonDrainer for use in tests.
    pub CordonDrainer {}
    #[async_trait]
    impl CordonDrainer for CordonDrainer {
        async fn cordon(&self, node: &Node) -> Result<()>;
        async fn drain(&self, node: &Node) -> Result<()>;
    }

    impl Clone for CordonDrainer {
        fn clone(&self) -> Self;
    }
}

#[async_trait]
impl<T> CordonDrainer for Arc<T>
where
    T: CordonDrainer,
{
    async fn cordon(&self, node: &Node) -> Result<()> {
        (**self).cordon(node).await
    }

    async fn drain(&self, node: &Node) -> Result<()> {
        (**self).drain(node).await
    }
}

#[derive(Clone)]
/// Concrete implementation of the `CordonDrainer` trait which acts on the cluster through the Kubernetes API.
pub struct K8SCordonDrainer {
    k8s_client: kube::client::Client,
    drain_options: DrainOptions,
}

impl K8SCordonDrainer {
    pub fn new(k8s_client: kube::client::Client, drain_options: DrainOptions) -> Self {
        K8SCordonDrainer {
            k8s_client,
            drain_options,
        }
    }
}

#[async_trait]
impl CordonDrainer for K8SCordonDrainer {
    #[instrument(skip(self, node), fields(node = %node.node_name()), err)]
    async fn cordon(&self, node: &Node) -> Result<()> {
        let node_name = node.node_name();
        let nodes: Api<Node> = Api::all(self.k8s_client.clone());
        nodes
            .cordon(&node_name)
            .await
            .map_err(|err| Box::new(err) as CapabilityError)
            .context(error::CordonSnafu { node_name })?;

        Ok(())
    }

    #[instrument(skip(self, node), fields(node = %node.node_name()), err)]
    async fn drain(&self, node: &Node) -> Result<()> {
        let node_name = node.node_name();
        drain::drain_node(&self.k8s_client, &node_name, &self.drain_options)
            .await
            .map_err(|err| Box::new(err) as CapabilityError)
            .context(error::DrainSnafu { node_name })?;

        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
/// A `CordonDrainer` which only logs what it would have done. Used when the controller runs in dry-run mode.
pub struct DryRunCordonDrainer;

#[async_trait]
impl CordonDrainer for DryRunCordonDrainer {
    async fn cordon(&self, node: &Node) -> Result<()> {
        event!(Level::INFO, node = %node.node_name(), "Dry run: would have cordoned node.");
        Ok(())
    }

    async fn drain(&self, node: &Node) -> Result<()> {
        event!(Level::INFO, node = %node.node_name(), "Dry run: would have drained node.");
        Ok(())
    }
}
