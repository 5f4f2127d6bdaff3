//! Deterministic prefunded EL accounts used by transaction spammers.

use std::collections::BTreeMap;

use alloy_genesis::GenesisAccount;
use alloy_primitives::{Address, B256, U256};
use alloy_signer_local::PrivateKeySigner;
use color_eyre::eyre;
use sha2::{Digest, Sha256};

pub const TEST_ACCOUNT_COUNT: u64 = 1000;

/// 1_000_000 ETH in wei, enough for any spam run.
pub fn vault_start_amount() -> U256 {
    U256::from(1_000_000u64) * U256::from(10u64).pow(U256::from(18u64))
}

/// A funded account whose key is `sha256(be_u64(index))`.
#[derive(Clone, Debug)]
pub struct TestAccount {
    pub index: u64,
    pub signer: PrivateKeySigner,
}

impl TestAccount {
    pub fn new(index: u64) -> eyre::Result<Self> {
        let key = B256::from(<[u8; 32]>::from(Sha256::digest(index.to_be_bytes())));
        Ok(Self { index, signer: PrivateKeySigner::from_bytes(&key)? })
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }
}

pub fn test_accounts(count: u64) -> eyre::Result<Vec<TestAccount>> {
    (0..count).map(TestAccount::new).collect()
}

/// Genesis allocations funding every account with `balance`.
pub fn funded_allocs(
    accounts: &[TestAccount],
    balance: U256,
) -> BTreeMap<Address, GenesisAccount> {
    accounts
        .iter()
        .map(|account| {
            (account.address(), GenesisAccount { balance, ..Default::default() })
        })
        .collect()
}
