//! Split-network setup where a late joiner has to pick the heaviest chain.

use color_eyre::eyre;
use hivenet_node::NodeDefinitions;
use hivenet_testnet::Testnet;
use hivenet_types::HarnessError;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Partitions every node but the last into `chain_weights.len()` subnets.
///
/// Node `i` joins subnet `i % chains` and validates with weight
/// `chain_weights[i % chains]`; the last node starts later and validates
/// nothing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReorgSetup {
    pub chain_weights: Vec<u64>,
}

impl Default for ReorgSetup {
    fn default() -> Self {
        Self { chain_weights: vec![1, 1] }
    }
}

impl ReorgSetup {
    pub fn chains(&self) -> usize {
        self.chain_weights.len()
    }

    pub fn apply(&self, nodes: &NodeDefinitions) -> eyre::Result<NodeDefinitions> {
        let chains = self.chains();
        if chains == 0 {
            return Err(HarnessError::config("reorg needs at least one chain").into());
        }
        if nodes.len() < chains + 1 {
            return Err(HarnessError::config(format!(
                "reorg over {chains} chains needs at least {} nodes, got {}",
                chains + 1,
                nodes.len()
            ))
            .into());
        }
        let last = nodes.len() - 1;
        let mut out = nodes.clone();
        for (i, node) in out.0.iter_mut().enumerate() {
            if i == last {
                node.disable_startup = true;
                node.validator_shares = 0;
                continue;
            }
            let chain = i % chains;
            node.subnet = chain.to_string();
            node.validator_shares = self.chain_weights[chain];
        }
        Ok(out)
    }

    pub fn joiner_index(nodes: &NodeDefinitions) -> Option<usize> {
        nodes.len().checked_sub(1)
    }

    /// Starts the node left out at creation.
    pub async fn start_joiner(testnet: &Testnet, cancel: &CancellationToken) -> eyre::Result<usize> {
        let index = testnet.nodes.len().checked_sub(1).ok_or_else(|| HarnessError::config("testnet has no nodes"))?;
        let node = testnet.nodes.get(index).ok_or_else(|| HarnessError::config("joiner node missing"))?;
        info!(node = index, client = %node.client_names(), "Starting late joiner");
        node.start(cancel).await?;
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use hivenet_node::NodeDefinition;

    use super::*;

    fn nodes(n: usize) -> NodeDefinitions {
        NodeDefinitions((0..n).map(|_| NodeDefinition::new("geth", "lighthouse")).collect())
    }

    #[test]
    fn weighted_chains_and_disabled_joiner() {
        let setup = ReorgSetup { chain_weights: vec![2, 1] };
        let out = setup.apply(&nodes(5)).unwrap();

        let subnets: Vec<_> = out.iter().take(4).map(|n| n.subnet.as_str()).collect();
        assert_eq!(subnets, ["0", "1", "0", "1"]);
        let shares: Vec<_> = out.iter().map(|n| n.validator_shares).collect();
        assert_eq!(shares, [2, 1, 2, 1, 0]);
        assert!(out.0[4].disable_startup);
        assert!(out.iter().take(4).all(|n| !n.disable_startup));
        assert_eq!(ReorgSetup::joiner_index(&out), Some(4));
    }

    #[test]
    fn too_few_nodes_is_a_config_error() {
        let err = ReorgSetup::default().apply(&nodes(2)).unwrap_err();
        assert!(matches!(hivenet_types::error::harness_error(&err), Some(HarnessError::ConfigError(..))));
    }
}
