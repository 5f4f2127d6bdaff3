use std::path::PathBuf;

use clap::Parser;
use color_eyre::eyre::{self, WrapErr};
use hivenet_genesis::{ValidatorKeys, bls, derive_validator_keys, keys::DEFAULT_VALIDATOR_MNEMONIC, keys_bundle};
use tracing::info;

use super::write_bundle;

#[derive(Parser, Clone, Debug, PartialEq)]
pub struct KeysCmd {
    /// Index of the first validator
    #[arg(long, default_value_t = 0)]
    pub from: u64,

    /// Number of validators to derive
    #[arg(long, default_value_t = 64)]
    pub count: u64,

    #[arg(long, default_value = DEFAULT_VALIDATOR_MNEMONIC)]
    pub mnemonic: String,

    /// Directory receiving `keystores/` and `secrets/`; nothing is written when omitted
    #[arg(long, short)]
    pub out: Option<PathBuf>,
}

impl Default for KeysCmd {
    fn default() -> Self {
        Self { from: 0, count: 64, mnemonic: DEFAULT_VALIDATOR_MNEMONIC.into(), out: None }
    }
}

impl KeysCmd {
    pub fn run(&self) -> eyre::Result<ValidatorKeys> {
        bls::init()?;
        let keys = derive_validator_keys(&self.mnemonic, self.from, self.from + self.count)?;
        for (offset, key) in keys.iter().enumerate() {
            info!(
                index = self.from + offset as u64,
                pubkey = %key.pubkey_hex(),
                withdrawal = %key.withdrawal_credentials(),
                "Derived validator key"
            );
        }

        if let Some(out) = &self.out {
            let bundle = keys_bundle(&keys);
            // Validator clients find these under /hive/input.
            let written = write_bundle(out, &bundle).wrap_err("failed to write keystores")?;
            info!(files = written, dir = %out.display(), "Wrote keystores");
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use hivenet_genesis::keystore::Keystore;

    use super::*;

    #[test]
    fn keystores_decrypt_to_the_derived_secret() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = KeysCmd { from: 3, count: 2, out: Some(dir.path().to_path_buf()), ..Default::default() };
        let keys = cmd.run().unwrap();
        assert_eq!(keys.len(), 2);

        let key = &keys[1];
        let input = dir.path().join("hive/input");
        let pubkey = key.pubkey_hex();
        let raw = std::fs::read_to_string(input.join("keystores").join(&pubkey).join("keystore.json")).unwrap();
        let pass = std::fs::read_to_string(input.join("secrets").join(&pubkey)).unwrap();
        let secret = Keystore::from_json(&raw).unwrap().decrypt(pass.as_bytes()).unwrap();
        assert_eq!(secret, key.validator_secret);
    }
}
