//! Post-run checks of the chain as seen by the verification nodes.

use alloy_consensus::{Transaction, TxEnvelope};
use alloy_eips::eip2718::Decodable2718;
use alloy_primitives::B256;
use color_eyre::eyre::{self, WrapErr, eyre};
use hivenet_consensus::{BeaconClient, BlockId, StateId, ValidatorId, VersionedSignedBeaconBlock, shorten};
use hivenet_execution::BlockTag;
use hivenet_types::{
    aliases::Slot,
    beacon::Checkpoint,
};
use sha2::{Digest, Sha256};
use tracing::info;
use tree_hash::TreeHash;

use crate::{
    health::health,
    node::NodeBundle,
    testnet::{Testnet, unix_now},
};

const VERSIONED_HASH_VERSION_KZG: u8 = 0x01;

/// Which slot a verification is performed at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerificationSlot {
    /// First slot of the epoch after the checkpoint's.
    FirstSlotAfterCheckpoint(Checkpoint),
    /// Start slot of the checkpoint's epoch.
    LastSlotAtCheckpoint(Checkpoint),
    LatestSlotByTime,
    /// Head slot of the beacon node asked.
    LatestSlotByHead,
}

impl VerificationSlot {
    pub async fn slot(&self, testnet: &Testnet, bn: &BeaconClient) -> eyre::Result<Slot> {
        let spec = testnet.spec();
        Ok(match self {
            VerificationSlot::FirstSlotAfterCheckpoint(cp) => spec.epoch_start_slot(cp.epoch + 1),
            VerificationSlot::LastSlotAtCheckpoint(cp) => spec.epoch_start_slot(cp.epoch),
            VerificationSlot::LatestSlotByTime => spec.time_to_slot(unix_now(), testnet.genesis_time()),
            VerificationSlot::LatestSlotByHead => {
                bn.block_header(BlockId::Head).await.wrap_err("failed to poll head")?.slot()
            }
        })
    }
}

/// `0x01 || sha256(commitment)[1..]`
pub fn kzg_versioned_hash(commitment: &[u8]) -> B256 {
    let mut hash: [u8; 32] = Sha256::digest(commitment).into();
    hash[0] = VERSIONED_HASH_VERSION_KZG;
    B256::from(hash)
}

/// Blob versioned hashes of the payload's transactions, in inclusion order.
pub fn payload_blob_hashes(block: &VersionedSignedBeaconBlock) -> eyre::Result<Vec<B256>> {
    let Some(payload) = block.execution_payload() else {
        return Ok(Vec::new());
    };
    let mut hashes = Vec::new();
    for raw in &payload.as_v1().transactions {
        let tx = TxEnvelope::decode_2718(&mut raw.as_ref()).map_err(|e| eyre!("undecodable transaction: {e}"))?;
        if let Some(blob_hashes) = tx.blob_versioned_hashes() {
            hashes.extend_from_slice(blob_hashes);
        }
    }
    Ok(hashes)
}

fn node_label(node: &NodeBundle) -> String {
    format!("node {} ({})", node.index, node.client_names())
}

impl Testnet {
    fn verification_nodes(&self) -> eyre::Result<Vec<NodeBundle>> {
        let nodes: Vec<NodeBundle> =
            self.nodes.verification().running().iter().filter(|n| n.beacon.is_some()).cloned().collect();
        if nodes.is_empty() {
            return Err(eyre!("no running verification nodes"));
        }
        Ok(nodes)
    }

    /// Fails if any verification node's participation at `vs` is below `expected`.
    pub async fn verify_participation(&self, vs: VerificationSlot, expected: f64) -> eyre::Result<()> {
        let nodes = self.verification_nodes()?;
        let mut slot = vs.slot(self, nodes[0].beacon()?).await?;
        let spec = self.spec();
        if spec.bellatrix_fork_epoch <= spec.slot_to_epoch(slot) {
            // The last slot of the epoch before.
            slot = slot.saturating_sub(1);
        }
        for node in &nodes {
            let health = health(node.beacon()?, spec, slot).await?;
            if health < expected {
                return Err(eyre!(
                    "{}: participation not healthy (got:{health:.2}, want:{expected:.2})",
                    node_label(node)
                ));
            }
            info!(node = node.index, epoch = spec.slot_to_epoch(slot), participation = health, "Participation");
        }
        Ok(())
    }

    /// Checks that the payload of the block at `vs` is canonical on every verification EL.
    pub async fn verify_execution_payload_is_canonical(&self, vs: VerificationSlot) -> eyre::Result<()> {
        let nodes = self.verification_nodes()?;
        let bn = nodes[0].beacon()?;
        let slot = vs.slot(self, bn).await?;
        let block = bn
            .block_v2(BlockId::Slot(slot))
            .await
            .wrap_err_with(|| format!("{}: failed to retrieve block", node_label(&nodes[0])))?;
        let (number, hash) = block
            .execution_block_number()
            .zip(block.execution_block_hash())
            .ok_or_else(|| eyre!("block at slot {slot} has no execution payload"))?;

        for node in &nodes {
            let header = node
                .execution
                .header_by_number(BlockTag::Number(number))
                .await?
                .ok_or_else(|| eyre!("{}: execution block {number} not found", node_label(node)))?;
            if header.hash != hash {
                return Err(eyre!(
                    "{}: execution blocks don't match (got={}, expected={})",
                    node_label(node),
                    shorten(header.hash),
                    shorten(hash)
                ));
            }
        }
        Ok(())
    }

    /// First beacon block, walking down from `vs`, whose payload hash is `hash`.
    pub async fn verify_execution_payload_hash_inclusion(
        &self,
        vs: VerificationSlot,
        hash: B256,
    ) -> eyre::Result<Option<VersionedSignedBeaconBlock>> {
        for node in self.verification_nodes()? {
            let bn = node.beacon()?;
            let last = vs.slot(self, bn).await?;
            for slot in (1..=last).rev() {
                let Ok(block) = bn.block_v2(BlockId::Slot(slot)).await else {
                    continue;
                };
                match block.execution_block_hash() {
                    None => break,
                    Some(h) if h == hash => return Ok(Some(block)),
                    Some(_) => {}
                }
            }
        }
        Ok(None)
    }

    /// Node index of the validator client that proposed the block at `vs`.
    pub async fn proposer(&self, vs: VerificationSlot) -> eyre::Result<usize> {
        let nodes = self.verification_nodes()?;
        let bn = nodes[0].beacon()?;
        let slot = vs.slot(self, bn).await?;
        let block = bn
            .block_v2(BlockId::Slot(slot))
            .await
            .wrap_err_with(|| format!("{}: failed to retrieve beacon block", node_label(&nodes[0])))?;
        self.proposer_of(bn, &block).await
    }

    async fn proposer_of(&self, bn: &BeaconClient, block: &VersionedSignedBeaconBlock) -> eyre::Result<usize> {
        let validators = bn
            .state_validators(StateId::Slot(block.slot()), &[ValidatorId::Index(block.proposer_index())], &[])
            .await
            .wrap_err("failed to retrieve validator")?;
        let validator = validators.first().ok_or_else(|| eyre!("proposer {} not found", block.proposer_index()))?;
        let pubkey = <[u8; 48]>::try_from(&validator.validator.pubkey[..])
            .map_err(|_| eyre!("malformed pubkey of validator {}", validator.index))?;
        self.validator_client_index(&pubkey)
    }

    /// Every validator client of a verification node proposed at least one block up to `vs`.
    pub async fn verify_proposers(&self, vs: VerificationSlot, allow_empty_blocks: bool) -> eyre::Result<()> {
        let nodes = self.verification_nodes()?;
        let bn = nodes[0].beacon()?;
        let last = vs.slot(self, bn).await?;
        let mut proposed = vec![false; self.nodes.validator_clients().len()];
        for slot in 0..=last {
            let block = match bn.block_v2(BlockId::Slot(slot)).await {
                Ok(block) => block,
                Err(_) if allow_empty_blocks => continue,
                Err(err) => {
                    return Err(err.wrap_err(format!("{}: failed to retrieve beacon block", node_label(&nodes[0]))));
                }
            };
            let index = self.proposer_of(bn, &block).await?;
            if let Some(p) = proposed.get_mut(index) {
                *p = true;
            }
        }
        for (vc, proposed) in self.nodes.validator_clients().iter().zip(proposed) {
            if !proposed && !vc.keys().is_empty() {
                return Err(eyre!("node {} ({}): did not propose a block", vc.index(), vc.client_type()));
            }
        }
        Ok(())
    }

    /// EL `latest`, `safe` and `finalized` blocks match the payloads of the
    /// beacon head, justified and finalized blocks.
    pub async fn verify_el_block_labels(&self) -> eyre::Result<()> {
        for node in self.verification_nodes()? {
            let bn = node.beacon()?;
            let head = bn.block_header(BlockId::Head).await?;
            let checkpoints = bn.block_finality_checkpoints(BlockId::Head).await?;
            let labels = [
                (BlockTag::Latest, head.root),
                (BlockTag::Finalized, checkpoints.finalized.root),
                (BlockTag::Safe, checkpoints.current_justified.root),
            ];
            for (tag, root) in labels {
                let block = bn.block_v2(BlockId::Root(root)).await?;
                let Some(expected) = block.execution_block_hash() else {
                    continue;
                };
                match node.execution.header_by_number(tag).await {
                    Ok(Some(header)) if header.hash != expected => {
                        return Err(eyre!(
                            "{}: execution hash found in checkpoint block ({tag}) does not match what the el \
                             returns: {expected} != {}",
                            node_label(&node),
                            header.hash
                        ));
                    }
                    Ok(Some(header)) => {
                        info!(node = node.index, label = %tag, hash = %header.hash, "Execution hash matches beacon block");
                    }
                    Ok(None) | Err(_) if expected.is_zero() => {}
                    Ok(None) => return Err(eyre!("{}: el has no {tag} block", node_label(&node))),
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(())
    }

    /// Every running verification EL reports the same `latest` block hash.
    pub async fn verify_el_heads(&self) -> eyre::Result<()> {
        let els = self.nodes.verification().execution_clients().running();
        let first = els.iter().next().ok_or_else(|| eyre!("no running execution clients"))?;
        let head = first.header_by_number(BlockTag::Latest).await?.ok_or_else(|| eyre!("el 0 has no head"))?;
        info!(hash = %head.hash, "Verifying EL heads");
        for el in els.iter() {
            let other = el
                .header_by_number(BlockTag::Latest)
                .await?
                .ok_or_else(|| eyre!("el {} has no head", el.index()))?;
            if head.hash != other.hash {
                return Err(eyre!(
                    "different heads: {}: {} (#{}), {}: {} (#{})",
                    first.index(),
                    head.hash,
                    head.number,
                    el.index(),
                    other.hash,
                    other.number
                ));
            }
        }
        Ok(())
    }

    /// Checks blob sidecars of every block from `vs` down to the first pre-Deneb
    /// block: commitments match the payload's versioned hashes, sidecars are in
    /// index order and point at their block, and every verification node serves
    /// the same sidecars. Returns the number of blobs seen.
    pub async fn verify_blobs(&self, vs: VerificationSlot) -> eyre::Result<u64> {
        let nodes = self.verification_nodes()?;
        if nodes.len() == 1 {
            return Err(eyre!("only one beacon client running, can't verify blobs"));
        }
        let reference = &nodes[0];
        let bn = reference.beacon()?;
        let label = node_label(reference);
        let last = vs.slot(self, bn).await?;
        let mut blob_count = 0u64;

        for slot in (1..=last).rev() {
            let Ok(block) = bn.block_v2(BlockId::Slot(slot)).await else {
                continue;
            };
            if !block.fork_name().deneb_enabled() {
                break;
            }
            let root = bn.block_v2_root(BlockId::Slot(slot)).await?;
            let commitments = block.blob_kzg_commitments();

            let sidecars = match bn.blob_sidecars(BlockId::Slot(slot)).await {
                Ok(sidecars) => sidecars,
                // Some clients answer an error instead of an empty list.
                Err(_) if commitments.is_empty() => Vec::new(),
                Err(err) => {
                    return Err(err.wrap_err(format!("{label}: failed to retrieve blobs for slot {slot}")));
                }
            };
            blob_count += sidecars.len() as u64;
            if sidecars.len() != commitments.len() {
                return Err(eyre!(
                    "{label}: slot {slot}, block kzg commitments and sidecars length differ (sidecar count={}, block \
                     kzg commitments={})",
                    sidecars.len(),
                    commitments.len()
                ));
            }

            let blob_hashes = payload_blob_hashes(&block)?;
            if blob_hashes.len() != commitments.len() {
                return Err(eyre!(
                    "{label}: slot {slot}, block kzg commitments and execution block hashes length differ (block kzg \
                     commitment count={}, execution block hash count={})",
                    commitments.len(),
                    blob_hashes.len()
                ));
            }
            for (commitment, blob_hash) in commitments.iter().zip(&blob_hashes) {
                if blob_hash[0] != VERSIONED_HASH_VERSION_KZG {
                    return Err(eyre!(
                        "{label}: slot {slot}, execution blob hash does not contain the correct version: {}",
                        blob_hash[0]
                    ));
                }
                if kzg_versioned_hash(commitment.as_slice()) != *blob_hash {
                    return Err(eyre!(
                        "{label}: slot {slot}, block kzg commitments and execution block hashes differ (block kzg \
                         commitment={commitment}, execution block hash={blob_hash})"
                    ));
                }
            }

            for (i, sidecar) in sidecars.iter().enumerate() {
                if sidecar.index != i as u64 {
                    return Err(eyre!(
                        "{label}: slot {slot}, blob index does not match (got={}, expected={i})",
                        sidecar.index
                    ));
                }
                let header_root = sidecar.signed_block_header.message.tree_hash_root();
                if header_root != root {
                    return Err(eyre!(
                        "{label}: block root of included signed header does not match (got={header_root}, \
                         expected={root})"
                    ));
                }
                if sidecar.kzg_commitment != commitments[i] {
                    return Err(eyre!(
                        "{label}: block kzg commitment and sidecar kzg commitment differ (block kzg commitment={}, \
                         sidecar kzg commitment={})",
                        commitments[i],
                        sidecar.kzg_commitment
                    ));
                }
                if sidecar.signed_block_header.signature != *block.signature() {
                    return Err(eyre!("{label}: block signature and sidecar signature differ"));
                }
            }

            for node in &nodes[1..] {
                let other = match node.beacon()?.blob_sidecars(BlockId::Slot(slot)).await {
                    Ok(other) => other,
                    Err(_) if commitments.is_empty() => Vec::new(),
                    Err(err) => return Err(err),
                };
                if other.len() != sidecars.len() {
                    return Err(eyre!(
                        "{}: different number of blobs (got={}, expected={})",
                        node_label(node),
                        other.len(),
                        sidecars.len()
                    ));
                }
                if let Some(j) = other.iter().zip(&sidecars).position(|(a, b)| a != b) {
                    return Err(eyre!("{}: slot {slot}, sidecar {j} differs from {label}", node_label(node)));
                }
            }
        }
        Ok(blob_count)
    }
}
