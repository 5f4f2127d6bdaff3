//! Fork-versioned beacon blocks as served by `/eth/v2/beacon/blocks/{id}`.

use alloy_eips::eip4895::Withdrawal as ExecutionWithdrawal;
use alloy_primitives::{Address, B256, Bloom, Bytes, FixedBytes, U256};
use alloy_rpc_types_engine::{ExecutionPayload, ExecutionPayloadV1, ExecutionPayloadV2, ExecutionPayloadV3};
use color_eyre::eyre::{self, WrapErr};
use hivenet_types::{
    ForkName,
    aliases::{Root, Slot, ValidatorIndex},
    beacon::{BeaconBlockHeader, Eth1Data, SignedBlsToExecutionChange, Withdrawal},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::api::VersionedResponse;

pub type KzgCommitment = FixedBytes<48>;
pub type KzgProof = FixedBytes<48>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPayloadBellatrix {
    pub parent_hash: B256,
    pub fee_recipient: Address,
    pub state_root: B256,
    pub receipts_root: B256,
    pub logs_bloom: Bloom,
    pub prev_randao: B256,
    #[serde(with = "serde_utils::quoted_u64")]
    pub block_number: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub gas_limit: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub gas_used: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub timestamp: u64,
    pub extra_data: Bytes,
    #[serde(with = "serde_utils::quoted_u256")]
    pub base_fee_per_gas: U256,
    pub block_hash: B256,
    pub transactions: Vec<Bytes>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPayloadCapella {
    #[serde(flatten)]
    pub inner: ExecutionPayloadBellatrix,
    pub withdrawals: Vec<Withdrawal>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPayloadDeneb {
    #[serde(flatten)]
    pub inner: ExecutionPayloadCapella,
    #[serde(with = "serde_utils::quoted_u64")]
    pub blob_gas_used: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub excess_blob_gas: u64,
}

impl From<&ExecutionPayloadBellatrix> for ExecutionPayloadV1 {
    fn from(p: &ExecutionPayloadBellatrix) -> Self {
        ExecutionPayloadV1 {
            parent_hash: p.parent_hash,
            fee_recipient: p.fee_recipient,
            state_root: p.state_root,
            receipts_root: p.receipts_root,
            logs_bloom: p.logs_bloom,
            prev_randao: p.prev_randao,
            block_number: p.block_number,
            gas_limit: p.gas_limit,
            gas_used: p.gas_used,
            timestamp: p.timestamp,
            extra_data: p.extra_data.clone(),
            base_fee_per_gas: p.base_fee_per_gas,
            block_hash: p.block_hash,
            transactions: p.transactions.clone(),
        }
    }
}

impl From<&ExecutionPayloadCapella> for ExecutionPayloadV2 {
    fn from(p: &ExecutionPayloadCapella) -> Self {
        ExecutionPayloadV2 {
            payload_inner: (&p.inner).into(),
            withdrawals: p.withdrawals.iter().map(ExecutionWithdrawal::from).collect(),
        }
    }
}

impl From<&ExecutionPayloadDeneb> for ExecutionPayloadV3 {
    fn from(p: &ExecutionPayloadDeneb) -> Self {
        ExecutionPayloadV3 {
            payload_inner: (&p.inner).into(),
            blob_gas_used: p.blob_gas_used,
            excess_blob_gas: p.excess_blob_gas,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyBase {
    pub randao_reveal: Bytes,
    pub eth1_data: Eth1Data,
    pub graffiti: B256,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyBellatrix {
    #[serde(flatten)]
    pub base: BodyBase,
    pub execution_payload: ExecutionPayloadBellatrix,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyCapella {
    #[serde(flatten)]
    pub base: BodyBase,
    pub execution_payload: ExecutionPayloadCapella,
    #[serde(default)]
    pub bls_to_execution_changes: Vec<SignedBlsToExecutionChange>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyDeneb {
    #[serde(flatten)]
    pub base: BodyBase,
    pub execution_payload: ExecutionPayloadDeneb,
    #[serde(default)]
    pub bls_to_execution_changes: Vec<SignedBlsToExecutionChange>,
    #[serde(default)]
    pub blob_kzg_commitments: Vec<KzgCommitment>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconBlock<B> {
    #[serde(with = "serde_utils::quoted_u64")]
    pub slot: Slot,
    #[serde(with = "serde_utils::quoted_u64")]
    pub proposer_index: ValidatorIndex,
    pub parent_root: Root,
    pub state_root: Root,
    pub body: B,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedBeaconBlock<B> {
    pub message: BeaconBlock<B>,
    pub signature: Bytes,
}

/// A signed beacon block of any fork.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VersionedSignedBeaconBlock {
    Phase0(SignedBeaconBlock<BodyBase>),
    Altair(SignedBeaconBlock<BodyBase>),
    Bellatrix(SignedBeaconBlock<BodyBellatrix>),
    Capella(SignedBeaconBlock<BodyCapella>),
    Deneb(SignedBeaconBlock<BodyDeneb>),
}

macro_rules! map_block {
    ($self:expr, $b:ident => $e:expr) => {
        match $self {
            VersionedSignedBeaconBlock::Phase0($b) => $e,
            VersionedSignedBeaconBlock::Altair($b) => $e,
            VersionedSignedBeaconBlock::Bellatrix($b) => $e,
            VersionedSignedBeaconBlock::Capella($b) => $e,
            VersionedSignedBeaconBlock::Deneb($b) => $e,
        }
    };
}

fn decode<T: DeserializeOwned>(fork: ForkName, data: serde_json::Value) -> eyre::Result<T> {
    serde_json::from_value(data).wrap_err_with(|| format!("badly formatted {fork} beacon block"))
}

impl VersionedSignedBeaconBlock {
    pub fn from_response(res: VersionedResponse) -> eyre::Result<Self> {
        let fork = res.version;
        Ok(match fork {
            ForkName::Phase0 => Self::Phase0(decode(fork, res.data)?),
            ForkName::Altair => Self::Altair(decode(fork, res.data)?),
            ForkName::Bellatrix => Self::Bellatrix(decode(fork, res.data)?),
            ForkName::Capella => Self::Capella(decode(fork, res.data)?),
            ForkName::Deneb => Self::Deneb(decode(fork, res.data)?),
        })
    }

    pub fn fork_name(&self) -> ForkName {
        match self {
            Self::Phase0(_) => ForkName::Phase0,
            Self::Altair(_) => ForkName::Altair,
            Self::Bellatrix(_) => ForkName::Bellatrix,
            Self::Capella(_) => ForkName::Capella,
            Self::Deneb(_) => ForkName::Deneb,
        }
    }

    pub fn version(&self) -> &'static str {
        self.fork_name().as_str()
    }

    pub fn slot(&self) -> Slot {
        map_block!(self, b => b.message.slot)
    }

    pub fn proposer_index(&self) -> ValidatorIndex {
        map_block!(self, b => b.message.proposer_index)
    }

    pub fn parent_root(&self) -> Root {
        map_block!(self, b => b.message.parent_root)
    }

    pub fn state_root(&self) -> Root {
        map_block!(self, b => b.message.state_root)
    }

    pub fn signature(&self) -> &Bytes {
        map_block!(self, b => &b.signature)
    }

    pub fn graffiti(&self) -> B256 {
        match self {
            Self::Phase0(b) | Self::Altair(b) => b.message.body.graffiti,
            Self::Bellatrix(b) => b.message.body.base.graffiti,
            Self::Capella(b) => b.message.body.base.graffiti,
            Self::Deneb(b) => b.message.body.base.graffiti,
        }
    }

    /// The execution payload in Engine API form; `None` before Bellatrix.
    pub fn execution_payload(&self) -> Option<ExecutionPayload> {
        match self {
            Self::Phase0(_) | Self::Altair(_) => None,
            Self::Bellatrix(b) => Some(ExecutionPayload::V1((&b.message.body.execution_payload).into())),
            Self::Capella(b) => Some(ExecutionPayload::V2((&b.message.body.execution_payload).into())),
            Self::Deneb(b) => Some(ExecutionPayload::V3((&b.message.body.execution_payload).into())),
        }
    }

    fn payload_inner(&self) -> Option<&ExecutionPayloadBellatrix> {
        match self {
            Self::Phase0(_) | Self::Altair(_) => None,
            Self::Bellatrix(b) => Some(&b.message.body.execution_payload),
            Self::Capella(b) => Some(&b.message.body.execution_payload.inner),
            Self::Deneb(b) => Some(&b.message.body.execution_payload.inner.inner),
        }
    }

    /// Block hash of the execution payload, which is zero before the merge.
    pub fn execution_block_hash(&self) -> Option<B256> {
        self.payload_inner().map(|p| p.block_hash)
    }

    pub fn execution_block_number(&self) -> Option<u64> {
        self.payload_inner().map(|p| p.block_number)
    }

    pub fn execution_extra_data(&self) -> Option<&Bytes> {
        self.payload_inner().map(|p| &p.extra_data)
    }

    /// Whether the block carries a non-empty execution payload.
    pub fn has_execution_payload(&self) -> bool {
        self.execution_block_hash().is_some_and(|h| h != B256::ZERO)
    }

    pub fn withdrawals(&self) -> Option<&[Withdrawal]> {
        match self {
            Self::Capella(b) => Some(&b.message.body.execution_payload.withdrawals),
            Self::Deneb(b) => Some(&b.message.body.execution_payload.inner.withdrawals),
            _ => None,
        }
    }

    pub fn bls_to_execution_changes(&self) -> &[SignedBlsToExecutionChange] {
        match self {
            Self::Capella(b) => &b.message.body.bls_to_execution_changes,
            Self::Deneb(b) => &b.message.body.bls_to_execution_changes,
            _ => &[],
        }
    }

    pub fn blob_kzg_commitments(&self) -> &[KzgCommitment] {
        match self {
            Self::Deneb(b) => &b.message.body.blob_kzg_commitments,
            _ => &[],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedBeaconBlockHeader {
    pub message: BeaconBlockHeader,
    pub signature: Bytes,
}

/// Response of `/eth/v1/beacon/headers/{id}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeaderAndInfo {
    pub root: Root,
    #[serde(default)]
    pub canonical: bool,
    pub header: SignedBeaconBlockHeader,
}

impl BlockHeaderAndInfo {
    pub fn slot(&self) -> Slot {
        self.header.message.slot
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobSidecar {
    #[serde(with = "serde_utils::quoted_u64")]
    pub index: u64,
    #[serde(default)]
    pub blob: Bytes,
    pub kzg_commitment: KzgCommitment,
    pub kzg_proof: KzgProof,
    pub signed_block_header: SignedBeaconBlockHeader,
}

#[cfg(test)]
pub(crate) mod tests {
    use serde_json::{Value, json};

    use super::*;

    pub(crate) fn payload_json(number: u64, hash: B256) -> Value {
        json!({
            "parent_hash": B256::repeat_byte(1),
            "fee_recipient": Address::repeat_byte(2),
            "state_root": B256::repeat_byte(3),
            "receipts_root": B256::repeat_byte(4),
            "logs_bloom": Bloom::ZERO,
            "prev_randao": B256::repeat_byte(5),
            "block_number": number.to_string(),
            "gas_limit": "30000000",
            "gas_used": "0",
            "timestamp": "1700000012",
            "extra_data": "0x",
            "base_fee_per_gas": "7",
            "block_hash": hash,
            "transactions": [],
            "withdrawals": [{"index": "3", "validator_index": "9", "address": Address::repeat_byte(7), "amount": "12"}],
            "blob_gas_used": "0",
            "excess_blob_gas": "0"
        })
    }

    pub(crate) fn block_json(version: &str, slot: u64, parent: Root, payload: Option<Value>) -> Value {
        let mut body = json!({
            "randao_reveal": format!("0x{}", "00".repeat(96)),
            "eth1_data": {"deposit_root": Root::ZERO, "deposit_count": "0", "block_hash": B256::ZERO},
            "graffiti": B256::ZERO,
            "blob_kzg_commitments": [format!("0x{}", "11".repeat(48))]
        });
        if let Some(payload) = payload {
            body["execution_payload"] = payload;
        }
        json!({
            "version": version,
            "execution_optimistic": false,
            "data": {
                "message": {
                    "slot": slot.to_string(),
                    "proposer_index": "4",
                    "parent_root": parent,
                    "state_root": Root::repeat_byte(0x55),
                    "body": body
                },
                "signature": format!("0x{}", "00".repeat(96))
            }
        })
    }

    fn parse(raw: Value) -> VersionedSignedBeaconBlock {
        VersionedSignedBeaconBlock::from_response(serde_json::from_value(raw).unwrap()).unwrap()
    }

    #[test]
    fn deneb_block_exposes_payload_and_commitments() {
        let hash = B256::repeat_byte(0x99);
        let block = parse(block_json("deneb", 40, Root::repeat_byte(0x44), Some(payload_json(8, hash))));
        assert_eq!(block.fork_name(), ForkName::Deneb);
        assert_eq!(block.slot(), 40);
        assert_eq!(block.proposer_index(), 4);
        assert_eq!(block.parent_root(), Root::repeat_byte(0x44));
        assert_eq!(block.execution_block_hash(), Some(hash));
        assert_eq!(block.blob_kzg_commitments().len(), 1);

        let payload = block.execution_payload().unwrap();
        assert_eq!(payload.as_v1().block_number, 8);
        assert_eq!(payload.as_v1().base_fee_per_gas, U256::from(7u64));
        let withdrawals = &payload.as_v2().unwrap().withdrawals;
        assert_eq!(withdrawals[0].validator_index, 9);
        assert_eq!(block.withdrawals().unwrap()[0].amount, 12);
    }

    #[test]
    fn altair_block_has_no_payload() {
        let block = parse(block_json("altair", 3, Root::ZERO, None));
        assert_eq!(block.version(), "altair");
        assert!(block.execution_payload().is_none());
        assert!(!block.has_execution_payload());
        assert!(block.blob_kzg_commitments().is_empty());
    }

    #[test]
    fn bellatrix_block_with_zero_hash_is_not_an_execution_block() {
        let block = parse(block_json("bellatrix", 3, Root::ZERO, Some(payload_json(0, B256::ZERO))));
        assert!(block.execution_payload().is_some());
        assert!(!block.has_execution_payload());
        assert!(block.withdrawals().is_none());
    }

    #[test]
    fn mismatched_version_fails_to_decode() {
        let raw: VersionedResponse =
            serde_json::from_value(block_json("capella", 3, Root::ZERO, None)).unwrap();
        assert!(VersionedSignedBeaconBlock::from_response(raw).is_err());
    }
}
