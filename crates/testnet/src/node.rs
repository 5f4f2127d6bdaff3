//! A node bundles the execution, beacon and validator client of one index.

use std::sync::Arc;

use color_eyre::eyre::{self, eyre};
use hivenet_consensus::{
    BeaconClient, BeaconClients, BlsToExecutionChangeInfo, ValidatorClient, ValidatorClients,
};
use hivenet_execution::{ExecutionClient, ExecutionClients};
use hivenet_node::NodeDefinition;
use hivenet_types::{
    aliases::{Epoch, ValidatorIndex},
    beacon::{SignedBlsToExecutionChange, SignedVoluntaryExit},
    constants::{DOMAIN_BLS_TO_EXECUTION_CHANGE, DOMAIN_VOLUNTARY_EXIT},
};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Clone, Debug)]
pub struct NodeBundle {
    pub index: usize,
    pub definition: NodeDefinition,
    pub execution: Arc<ExecutionClient>,
    pub beacon: Option<Arc<BeaconClient>>,
    pub validator: Option<Arc<ValidatorClient>>,
    /// Marks a node whose view is used to verify test outcomes.
    pub verification: bool,
}

impl NodeBundle {
    /// Starts the EL, then the beacon node, then the validator client.
    pub async fn start(&self, cancel: &CancellationToken) -> eyre::Result<()> {
        info!(node = self.index, "Starting node {}", self.definition);
        self.execution.start().await?;
        match &self.beacon {
            Some(bn) => bn.start(cancel).await?,
            None => info!(node = self.index, "No beacon client started"),
        }
        match &self.validator {
            Some(vc) => vc.start().await?,
            None => info!(node = self.index, "No validator client started"),
        }
        Ok(())
    }

    pub async fn shutdown(&self) -> eyre::Result<()> {
        self.execution.shutdown().await?;
        if let Some(bn) = &self.beacon {
            bn.shutdown().await?;
        }
        if let Some(vc) = &self.validator {
            vc.shutdown().await?;
        }
        Ok(())
    }

    /// An EL-only node is running when its EL is.
    pub fn is_running(&self) -> bool {
        self.execution.is_running() && self.beacon.as_ref().is_none_or(|bn| bn.is_running())
    }

    /// `el/cl` client names, for log and error prefixes.
    pub fn client_names(&self) -> String {
        match &self.beacon {
            Some(bn) => format!("{}/{}", self.execution.client_type(), bn.client_name()),
            None => self.execution.client_type().to_owned(),
        }
    }

    pub fn beacon(&self) -> eyre::Result<&Arc<BeaconClient>> {
        self.beacon.as_ref().ok_or_else(|| eyre!("node {} has no beacon client", self.index))
    }

    fn validator_with(&self, index: ValidatorIndex) -> eyre::Result<&Arc<ValidatorClient>> {
        self.validator
            .as_ref()
            .filter(|vc| vc.contains_validator_index(index))
            .ok_or_else(|| eyre!("validator does not contain specified validator index {index}"))
    }

    /// Signs with the genesis fork version so the change stays valid across forks.
    pub async fn sign_bls_to_execution_change(
        &self,
        info: &BlsToExecutionChangeInfo,
    ) -> eyre::Result<SignedBlsToExecutionChange> {
        let vc = self.validator_with(info.validator_index)?;
        let bn = self.beacon()?;
        let version = bn.spec()?.genesis_fork_version;
        let domain = bn.compute_domain(DOMAIN_BLS_TO_EXECUTION_CHANGE, Some(version)).await?;
        vc.sign_bls_to_execution_change(domain, info)
    }

    pub async fn sign_submit_bls_to_execution_changes(&self, infos: &[BlsToExecutionChangeInfo]) -> eyre::Result<()> {
        let mut signed = Vec::with_capacity(infos.len());
        for info in infos {
            signed.push(self.sign_bls_to_execution_change(info).await?);
        }
        self.beacon()?.submit_pool_bls_to_execution_change(&signed).await
    }

    pub async fn sign_voluntary_exit(&self, epoch: Epoch, index: ValidatorIndex) -> eyre::Result<SignedVoluntaryExit> {
        let vc = self.validator_with(index)?;
        let domain = self.beacon()?.compute_domain(DOMAIN_VOLUNTARY_EXIT, None).await?;
        vc.sign_voluntary_exit(domain, epoch, index)
    }

    pub async fn sign_submit_voluntary_exit(&self, epoch: Epoch, index: ValidatorIndex) -> eyre::Result<()> {
        let exit = self.sign_voluntary_exit(epoch, index).await?;
        self.beacon()?.submit_voluntary_exit(&exit).await
    }
}

#[derive(Clone, Debug, Default)]
pub struct Nodes(pub Vec<NodeBundle>);

impl Nodes {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, NodeBundle> {
        self.0.iter()
    }

    pub fn get(&self, index: usize) -> Option<&NodeBundle> {
        self.0.get(index)
    }

    fn filtered(&self, f: impl Fn(&NodeBundle) -> bool) -> Nodes {
        Nodes(self.0.iter().filter(|n| f(n)).cloned().collect())
    }

    pub fn running(&self) -> Nodes {
        self.filtered(NodeBundle::is_running)
    }

    /// Nodes flagged for verification; every node when none is.
    pub fn verification(&self) -> Nodes {
        if self.0.iter().any(|n| n.verification) { self.filtered(|n| n.verification) } else { self.clone() }
    }

    pub fn filter_by_cl(&self, filters: &[&str]) -> Nodes {
        self.filtered(|n| n.beacon.as_ref().is_some_and(|bn| filters.iter().any(|f| bn.client_name().contains(f))))
    }

    pub fn filter_by_el(&self, filters: &[&str]) -> Nodes {
        self.filtered(|n| filters.iter().any(|f| n.execution.client_type().contains(f)))
    }

    pub fn by_validator_index(&self, index: ValidatorIndex) -> Option<&NodeBundle> {
        self.0.iter().find(|n| n.validator.as_ref().is_some_and(|vc| vc.contains_validator_index(index)))
    }

    /// Every client of its kind, running or not.
    pub fn execution_clients(&self) -> ExecutionClients {
        ExecutionClients(self.0.iter().map(|n| n.execution.clone()).collect())
    }

    pub fn beacon_clients(&self) -> BeaconClients {
        BeaconClients(self.0.iter().filter_map(|n| n.beacon.clone()).collect())
    }

    pub fn validator_clients(&self) -> ValidatorClients {
        ValidatorClients(self.0.iter().filter_map(|n| n.validator.clone()).collect())
    }

    /// Excludes node `id` from verification; with no node flagged, every other node becomes a verifier.
    pub fn remove_node_as_verifier(&mut self, id: usize) -> eyre::Result<()> {
        if id >= self.0.len() {
            return Err(eyre!("node {id} does not exist"));
        }
        if self.0.iter().any(|n| n.verification) {
            self.0[id].verification = false;
        } else {
            for (i, n) in self.0.iter_mut().enumerate() {
                n.verification = i != id;
            }
        }
        Ok(())
    }

    /// Signs every change with the node holding its key, then submits the whole
    /// batch to every beacon node.
    pub async fn sign_submit_bls_to_execution_changes(&self, infos: &[BlsToExecutionChangeInfo]) -> eyre::Result<()> {
        let mut signed = Vec::with_capacity(infos.len());
        for info in infos {
            let node = self
                .by_validator_index(info.validator_index)
                .ok_or_else(|| eyre!("validator index {} not found", info.validator_index))?;
            signed.push(node.sign_bls_to_execution_change(info).await?);
        }
        for bn in self.beacon_clients().iter() {
            bn.submit_pool_bls_to_execution_change(&signed).await?;
        }
        Ok(())
    }
}

impl FromIterator<NodeBundle> for Nodes {
    fn from_iter<T: IntoIterator<Item = NodeBundle>>(iter: T) -> Self {
        Nodes(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Nodes {
    type Item = &'a NodeBundle;
    type IntoIter = std::slice::Iter<'a, NodeBundle>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
