//! Validator key derivation from a mnemonic and distribution of keys across nodes.

use std::collections::BTreeMap;

use alloy_signer_local::coins_bip39::{English, Mnemonic};
use base64::{Engine, engine::general_purpose::URL_SAFE};
use color_eyre::eyre::{self, WrapErr};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::debug;

use hivenet_types::{
    HarnessError, StartBundle,
    aliases::{Address, B256, Gwei, ValidatorIndex},
    constants::{BLS_WITHDRAWAL_PREFIX, ETH1_ADDRESS_WITHDRAWAL_PREFIX},
};

use crate::{bls, keystore::Keystore};

/// Mnemonic every testnet derives its validator keys from.
pub const DEFAULT_VALIDATOR_MNEMONIC: &str =
    "couple kiwi radio river setup fortune hunt grief buddy forward perfect empty slim wear bounce drift execute nation tobacco dutch chapter festival ice fog";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WithdrawalCredentialType {
    #[default]
    Bls,
    Eth1,
}

/// `0x00 || sha256(pubkey)[1..]`
pub fn bls_withdrawal_credentials(pubkey: &[u8; 48]) -> B256 {
    let mut out: [u8; 32] = Sha256::digest(pubkey).into();
    out[0] = BLS_WITHDRAWAL_PREFIX;
    B256::from(out)
}

/// `0x01 || 0x00 * 11 || address`
pub fn eth1_withdrawal_credentials(address: &Address) -> B256 {
    let mut out = [0u8; 32];
    out[0] = ETH1_ADDRESS_WITHDRAWAL_PREFIX;
    out[12..].copy_from_slice(address.as_slice());
    B256::from(out)
}

/// Key material and genesis setup of one validator.
#[derive(Clone, Debug)]
pub struct ValidatorKey {
    pub validator_pubkey: [u8; 48],
    pub validator_secret: [u8; 32],
    pub withdrawal_pubkey: [u8; 48],
    pub withdrawal_secret: [u8; 32],
    pub withdrawal_credential_type: WithdrawalCredentialType,
    pub withdrawal_exec_address: Address,
    pub extra_initial_balance: Gwei,
    pub exited: bool,
    pub slashed: bool,
    pub keystore_json: String,
    pub keystore_pass: String,
}

impl ValidatorKey {
    pub fn withdrawal_credentials(&self) -> B256 {
        match self.withdrawal_credential_type {
            WithdrawalCredentialType::Bls => bls_withdrawal_credentials(&self.withdrawal_pubkey),
            WithdrawalCredentialType::Eth1 => {
                eth1_withdrawal_credentials(&self.withdrawal_exec_address)
            }
        }
    }

    pub fn pubkey_hex(&self) -> String {
        format!("0x{}", hex::encode(self.validator_pubkey))
    }

    pub fn keystore(&self) -> eyre::Result<Keystore> {
        Keystore::from_json(&self.keystore_json)
    }
}

pub type ValidatorKeys = Vec<ValidatorKey>;

fn mnemonic_seed(phrase: &str) -> eyre::Result<Vec<u8>> {
    let mnemonic = Mnemonic::<English>::new_from_phrase(phrase.trim())
        .map_err(|e| HarnessError::config(format!("mnemonic is not valid: {e}")))?;
    let seed = mnemonic.to_seed(None).wrap_err("failed to derive mnemonic seed")?;
    Ok(seed.to_vec())
}

/// A range of validator and withdrawal keys derived from two mnemonics.
///
/// Validator keys use `m/12381/3600/i/0/0`, withdrawal keys `m/12381/3600/i/0`.
#[derive(Clone, Debug)]
pub struct KeySource {
    pub from: u64,
    pub to: u64,
    pub validator_mnemonic: String,
    pub withdrawal_mnemonic: String,
}

impl KeySource {
    pub fn new(mnemonic: &str, from: u64, to: u64) -> Self {
        Self {
            from,
            to,
            validator_mnemonic: mnemonic.to_string(),
            withdrawal_mnemonic: mnemonic.to_string(),
        }
    }

    pub fn keys(&self) -> eyre::Result<ValidatorKeys> {
        if self.from > self.to {
            return Err(HarnessError::config(format!(
                "invalid key range: from {} > to {}",
                self.from, self.to
            ))
            .into());
        }
        let val_seed = mnemonic_seed(&self.validator_mnemonic).wrap_err("bad validator seed")?;
        let wd_seed = mnemonic_seed(&self.withdrawal_mnemonic).wrap_err("bad withdrawal seed")?;
        let mut rng = rand::thread_rng();

        let mut out = Vec::with_capacity((self.to - self.from) as usize);
        for i in self.from..self.to {
            let index = u32::try_from(i)
                .map_err(|_| HarnessError::config(format!("validator index {i} out of range")))?;
            let val_path = format!("m/12381/3600/{i}/0/0");
            let validator_secret = bls::derive_secret(&val_seed, &[12381, 3600, index, 0, 0])
                .wrap_err_with(|| format!("failed to create validator key for path {val_path}"))?;
            let withdrawal_secret = bls::derive_secret(&wd_seed, &[12381, 3600, index, 0])
                .wrap_err_with(|| format!("failed to create withdrawal key for index {i}"))?;
            let validator_pubkey = bls::public_key(&validator_secret)?;
            let withdrawal_pubkey = bls::public_key(&withdrawal_secret)?;

            let mut pass_randomness = [0u8; 32];
            rng.fill_bytes(&mut pass_randomness);
            let keystore_pass = URL_SAFE.encode(pass_randomness);
            let keystore_json = Keystore::encrypt(
                &validator_secret,
                &validator_pubkey,
                keystore_pass.as_bytes(),
                &val_path,
            )
            .to_json()?;

            out.push(ValidatorKey {
                validator_pubkey,
                validator_secret,
                withdrawal_pubkey,
                withdrawal_secret,
                withdrawal_credential_type: WithdrawalCredentialType::Bls,
                withdrawal_exec_address: Address::ZERO,
                extra_initial_balance: 0,
                exited: false,
                slashed: false,
                keystore_json,
                keystore_pass,
            });
        }
        debug!(from = self.from, to = self.to, "derived validator keys");
        Ok(out)
    }
}

/// Keys `[from, to)` derived from one mnemonic for both validator and withdrawal paths.
pub fn derive_validator_keys(mnemonic: &str, from: u64, to: u64) -> eyre::Result<ValidatorKeys> {
    KeySource::new(mnemonic, from, to).keys()
}

/// Relative weights by which validator keys are split over nodes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Shares(pub Vec<u64>);

impl Shares {
    pub fn total(&self) -> u64 {
        self.0.iter().sum()
    }

    /// `total * weight_i / sum(weights)`, or an even split if every weight is zero.
    pub fn validator_splits(&self, total: u64) -> Vec<u64> {
        let sum = self.total();
        let n = self.0.len() as u64;
        self.0
            .iter()
            .map(|s| if sum == 0 { total / n.max(1) } else { total * s / sum })
            .collect()
    }

    /// Splits `keys` into consecutive tranches keyed by validator index.
    pub fn key_tranches(
        &self,
        keys: &[ValidatorKey],
    ) -> Vec<BTreeMap<ValidatorIndex, ValidatorKey>> {
        let mut start = 0u64;
        self.validator_splits(keys.len() as u64)
            .into_iter()
            .map(|count| {
                let tranche = (start..start + count)
                    .map(|j| (j, keys[j as usize].clone()))
                    .collect();
                start += count;
                tranche
            })
            .collect()
    }
}

/// Keystore and secret files for the keys a validator client owns.
pub fn keys_bundle<'a>(keys: impl IntoIterator<Item = &'a ValidatorKey>) -> StartBundle {
    keys.into_iter().fold(StartBundle::new(), |bundle, k| {
        let pubkey = k.pubkey_hex();
        bundle
            .file(
                format!("/hive/input/keystores/{pubkey}/keystore.json"),
                k.keystore_json.clone().into_bytes(),
            )
            .file(format!("/hive/input/secrets/{pubkey}"), k.keystore_pass.clone().into_bytes())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(n: u64) -> ValidatorKeys {
        bls::init().unwrap();
        derive_validator_keys(DEFAULT_VALIDATOR_MNEMONIC, 0, n).unwrap()
    }

    #[test]
    fn derived_keys_are_deterministic_and_unlock() {
        let a = keys(2);
        let b = keys(2);
        assert_eq!(a.len(), 2);
        assert_eq!(a[0].validator_pubkey, b[0].validator_pubkey);
        assert_ne!(a[0].validator_pubkey, a[1].validator_pubkey);
        assert_ne!(a[0].validator_pubkey, a[0].withdrawal_pubkey);
        let secret = a[1].keystore().unwrap().decrypt(a[1].keystore_pass.as_bytes()).unwrap();
        assert_eq!(secret, a[1].validator_secret);
    }

    #[test]
    fn inverted_range_is_a_config_error() {
        bls::init().unwrap();
        let err = derive_validator_keys(DEFAULT_VALIDATOR_MNEMONIC, 3, 1).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::ConfigError(..))
        ));
    }

    #[test]
    fn credentials_by_type() {
        let mut key = keys(1).remove(0);
        let bls = key.withdrawal_credentials();
        assert_eq!(bls[0], 0x00);
        key.withdrawal_credential_type = WithdrawalCredentialType::Eth1;
        key.withdrawal_exec_address = Address::repeat_byte(0x11);
        let eth1 = key.withdrawal_credentials();
        assert_eq!(eth1[0], 0x01);
        assert_eq!(&eth1[1..12], &[0u8; 11]);
        assert_eq!(&eth1[12..], &[0x11; 20]);
    }

    #[test]
    fn splits_follow_weights() {
        assert_eq!(Shares(vec![2, 1]).validator_splits(96), vec![64, 32]);
        assert_eq!(Shares(vec![1, 1, 1]).validator_splits(100), vec![33, 33, 33]);
        assert_eq!(Shares(vec![0, 0]).validator_splits(10), vec![5, 5]);
        // an extra share keeps keys out of every node
        assert_eq!(Shares(vec![1, 1, 2]).validator_splits(8), vec![2, 2, 4]);
    }

    #[test]
    fn tranches_are_consecutive() {
        let ks = keys(4);
        let tranches = Shares(vec![1, 1]).key_tranches(&ks);
        assert_eq!(tranches[0].keys().copied().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(tranches[1].keys().copied().collect::<Vec<_>>(), vec![2, 3]);
        let bundle = keys_bundle(tranches[1].values());
        assert_eq!(bundle.files.len(), 4);
        let path = format!("/hive/input/secrets/{}", ks[2].pubkey_hex());
        assert_eq!(bundle.files[&path].as_ref(), ks[2].keystore_pass.as_bytes());
    }
}
