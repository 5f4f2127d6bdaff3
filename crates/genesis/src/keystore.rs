//! EIP-2335 keystores encrypted with PBKDF2-HMAC-SHA256 and AES-128-CTR.
//!
//! The KDF runs with a deliberately tiny iteration count so that clients holding
//! hundreds of test keys decrypt them in milliseconds. Never use for real funds.

use aes::Aes128;
use color_eyre::eyre::{self, bail, eyre};
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

pub const WEAK_PBKDF2_ROUNDS: u32 = 2;
const DKLEN: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keystore {
    pub crypto: KeystoreCrypto,
    pub description: String,
    pub pubkey: String,
    pub path: String,
    pub uuid: Uuid,
    pub version: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeystoreCrypto {
    pub kdf: Module<KdfParams>,
    pub checksum: Module<EmptyParams>,
    pub cipher: Module<CipherParams>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module<P> {
    pub function: String,
    pub params: P,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub dklen: usize,
    pub c: u32,
    pub prf: String,
    pub salt: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyParams {}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherParams {
    pub iv: String,
}

fn derive_key(passphrase: &[u8], salt: &[u8], rounds: u32) -> [u8; DKLEN] {
    let mut dk = [0u8; DKLEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase, salt, rounds, &mut dk);
    dk
}

fn checksum(dk: &[u8; DKLEN], ciphertext: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(&dk[16..32]);
    hasher.update(ciphertext);
    hasher.finalize().into()
}

impl Keystore {
    /// Encrypts `secret` under `passphrase` with fresh salt and IV.
    pub fn encrypt(secret: &[u8; 32], pubkey: &[u8; 48], passphrase: &[u8], path: &str) -> Self {
        let mut rng = rand::thread_rng();
        let mut salt = [0u8; 32];
        let mut iv = [0u8; 16];
        rng.fill_bytes(&mut salt);
        rng.fill_bytes(&mut iv);

        let dk = derive_key(passphrase, &salt, WEAK_PBKDF2_ROUNDS);
        let mut ciphertext = secret.to_vec();
        let mut cipher = Aes128Ctr::new(dk[..16].into(), iv[..].into());
        cipher.apply_keystream(&mut ciphertext);

        Keystore {
            crypto: KeystoreCrypto {
                kdf: Module {
                    function: "pbkdf2".into(),
                    params: KdfParams {
                        dklen: DKLEN,
                        c: WEAK_PBKDF2_ROUNDS,
                        prf: "hmac-sha256".into(),
                        salt: hex::encode(salt),
                    },
                    message: String::new(),
                },
                checksum: Module {
                    function: "sha256".into(),
                    params: EmptyParams {},
                    message: hex::encode(checksum(&dk, &ciphertext)),
                },
                cipher: Module {
                    function: "aes-128-ctr".into(),
                    params: CipherParams { iv: hex::encode(iv) },
                    message: hex::encode(&ciphertext),
                },
            },
            description: String::new(),
            pubkey: hex::encode(pubkey),
            path: path.to_string(),
            uuid: Uuid::new_v4(),
            version: 4,
        }
    }

    pub fn decrypt(&self, passphrase: &[u8]) -> eyre::Result<[u8; 32]> {
        let kdf = &self.crypto.kdf.params;
        if self.crypto.kdf.function != "pbkdf2" || kdf.dklen != DKLEN {
            bail!("unsupported kdf {} (dklen {})", self.crypto.kdf.function, kdf.dklen);
        }
        let salt = hex::decode(&kdf.salt)?;
        let ciphertext = hex::decode(&self.crypto.cipher.message)?;
        let iv: [u8; 16] = hex::decode(&self.crypto.cipher.params.iv)?
            .try_into()
            .map_err(|_| eyre!("keystore iv must be 16 bytes"))?;

        let dk = derive_key(passphrase, &salt, kdf.c);
        if hex::encode(checksum(&dk, &ciphertext)) != self.crypto.checksum.message {
            bail!("keystore checksum mismatch, wrong passphrase");
        }
        let mut plain = ciphertext;
        let mut cipher = Aes128Ctr::new(dk[..16].into(), iv[..].into());
        cipher.apply_keystream(&mut plain);
        plain.try_into().map_err(|_| eyre!("keystore secret must be 32 bytes"))
    }

    pub fn to_json(&self) -> eyre::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(raw: &str) -> eyre::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}
