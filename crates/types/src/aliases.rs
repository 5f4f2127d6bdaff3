use ssz_types::{FixedVector, typenum};

pub type U64 = alloy_primitives::U64;
pub type U256 = alloy_primitives::U256;
pub type B256 = alloy_primitives::B256;
pub type B64 = alloy_primitives::B64;
pub type Address = alloy_primitives::Address;

pub type BlockHash = alloy_primitives::BlockHash;
pub type BlockNumber = alloy_primitives::BlockNumber;
pub type BlockTimestamp = alloy_primitives::BlockTimestamp;
pub type Bloom = alloy_primitives::Bloom;
pub type Bytes = alloy_primitives::Bytes;

/// SSZ `Root`; tree_hash's `Hash256` is the same alloy type.
pub type Root = B256;
pub type Slot = u64;
pub type Epoch = u64;
pub type ValidatorIndex = u64;
pub type Gwei = u64;
pub type Version = [u8; 4];
pub type DomainType = [u8; 4];
pub type Domain = B256;

pub type BlsPubkey = FixedVector<u8, typenum::U48>;
pub type BlsSignature = FixedVector<u8, typenum::U96>;
pub type KzgCommitment = FixedVector<u8, typenum::U48>;

/// Builds an SSZ pubkey from raw compressed bytes.
pub fn bls_pubkey(bytes: &[u8; 48]) -> BlsPubkey {
    FixedVector::from(bytes.to_vec())
}

/// Builds an SSZ signature from raw compressed bytes.
pub fn bls_signature(bytes: &[u8; 96]) -> BlsSignature {
    FixedVector::from(bytes.to_vec())
}
