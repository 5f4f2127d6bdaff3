//! Which client images make up a node, and how nodes are grouped.

use std::{fmt, path::PathBuf};

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

/// Beacon clients able to run with six second slots.
pub const MINIMAL_SLOT_TIME_CLIENTS: [&str; 5] = ["lighthouse", "teku", "prysm", "lodestar", "grandine"];

/// One node of the testnet: an EL, optionally a beacon node and its validator client.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeDefinition {
    pub execution_client: String,
    /// Empty for an EL-only node.
    pub consensus_client: String,
    /// Empty to derive it from the beacon client name.
    pub validator_client: String,

    pub execution_client_ttd: Option<U256>,
    pub beacon_node_ttd: Option<U256>,
    /// RLP-encoded blocks imported by the EL at start (`/chain.rlp`).
    pub chain_file: Option<PathBuf>,

    /// Relative weight of the validator keys assigned to this node.
    pub validator_shares: u64,

    pub test_verification_node: bool,
    pub disable_startup: bool,

    pub execution_subnet: String,
    pub consensus_subnet: String,
    pub subnet: String,
}

impl NodeDefinition {
    pub fn new(execution_client: impl Into<String>, consensus_client: impl Into<String>) -> Self {
        Self {
            execution_client: execution_client.into(),
            consensus_client: consensus_client.into(),
            validator_shares: 1,
            ..Default::default()
        }
    }

    pub fn has_consensus(&self) -> bool {
        !self.consensus_client.is_empty()
    }

    pub fn validator_client_name(&self) -> String {
        if self.validator_client.is_empty() {
            beacon_node_to_validator(&self.consensus_client)
        } else {
            self.validator_client.clone()
        }
    }

    pub fn execution_subnet(&self) -> &str {
        if !self.execution_subnet.is_empty() { &self.execution_subnet } else { &self.subnet }
    }

    pub fn consensus_subnet(&self) -> &str {
        if !self.consensus_subnet.is_empty() { &self.consensus_subnet } else { &self.subnet }
    }
}

impl fmt::Display for NodeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.consensus_client, self.execution_client)
    }
}

/// `lighthouse-bn_unstable` becomes `lighthouse-vc_unstable`.
pub fn beacon_node_to_validator(name: &str) -> String {
    let (base, branch) = match name.split_once('_') {
        Some((base, branch)) => (base, Some(branch)),
        None => (name, None),
    };
    let mut validator = format!("{}-vc", base.strip_suffix("-bn").unwrap_or(base));
    if let Some(branch) = branch {
        validator.push('_');
        validator.push_str(branch);
    }
    validator
}

/// Client family without the role suffix: `teku-bn` becomes `teku`.
pub fn client_family(name: &str) -> &str {
    let base = name.split('_').next().unwrap_or(name);
    base.strip_suffix("-bn").or_else(|| base.strip_suffix("-vc")).unwrap_or(base)
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeDefinitions(pub Vec<NodeDefinition>);

impl NodeDefinitions {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, NodeDefinition> {
        self.0.iter()
    }

    /// Distinct client images, in order of first appearance.
    pub fn client_types(&self) -> Vec<String> {
        let mut types: Vec<String> = Vec::new();
        for node in &self.0 {
            for name in [&node.execution_client, &node.consensus_client] {
                if !name.is_empty() && !types.contains(name) {
                    types.push(name.clone());
                }
            }
        }
        types
    }

    pub fn shares(&self) -> Vec<u64> {
        self.0.iter().map(|n| n.validator_shares).collect()
    }

    pub fn filter_by_cl(&self, filters: &[&str]) -> NodeDefinitions {
        NodeDefinitions(
            self.0
                .iter()
                .filter(|n| filters.iter().any(|f| n.consensus_client.contains(f)))
                .cloned()
                .collect(),
        )
    }

    pub fn filter_by_el(&self, filters: &[&str]) -> NodeDefinitions {
        NodeDefinitions(
            self.0
                .iter()
                .filter(|n| filters.iter().any(|f| n.execution_client.contains(f)))
                .cloned()
                .collect(),
        )
    }

    /// True when every beacon client supports six second slots.
    pub fn all_support_minimal_slot_time(&self) -> bool {
        self.filter_by_cl(&MINIMAL_SLOT_TIME_CLIENTS).len() == self.len()
    }
}

impl From<Vec<NodeDefinition>> for NodeDefinitions {
    fn from(nodes: Vec<NodeDefinition>) -> Self {
        Self(nodes)
    }
}

impl<'a> IntoIterator for &'a NodeDefinitions {
    type Item = &'a NodeDefinition;
    type IntoIter = std::slice::Iter<'a, NodeDefinition>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validator_name_is_derived_by_suffix() {
        assert_eq!(beacon_node_to_validator("lighthouse-bn"), "lighthouse-vc");
        assert_eq!(beacon_node_to_validator("teku-bn_develop"), "teku-vc_develop");
        assert_eq!(beacon_node_to_validator("nimbus"), "nimbus-vc");

        let mut node = NodeDefinition::new("geth", "prysm-bn");
        assert_eq!(node.validator_client_name(), "prysm-vc");
        node.validator_client = "custom-vc".into();
        assert_eq!(node.validator_client_name(), "custom-vc");
        assert_eq!(client_family("lodestar-bn_main"), "lodestar");
    }

    #[test]
    fn subnets_fall_back_to_shared_label() {
        let mut node = NodeDefinition::new("geth", "teku-bn");
        node.subnet = "a".into();
        assert_eq!(node.execution_subnet(), "a");
        node.consensus_subnet = "b".into();
        assert_eq!(node.consensus_subnet(), "b");
        assert_eq!(node.execution_subnet(), "a");
    }

    #[test]
    fn minimal_slot_time_needs_every_client() {
        let mut nodes = NodeDefinitions(vec![
            NodeDefinition::new("geth", "lighthouse-bn"),
            NodeDefinition::new("nethermind", "teku-bn"),
        ]);
        assert!(nodes.all_support_minimal_slot_time());
        assert_eq!(nodes.client_types(), ["geth", "lighthouse-bn", "nethermind", "teku-bn"]);
        nodes.0.push(NodeDefinition::new("besu", "nimbus-bn"));
        assert!(!nodes.all_support_minimal_slot_time());
        assert_eq!(nodes.filter_by_el(&["besu"]).len(), 1);
        assert_eq!(nodes.shares(), [1, 1, 1]);
    }
}
