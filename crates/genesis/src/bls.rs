//! BLS12-381 signing facade over `blst` (min-pk, proof-of-possession ciphersuite).
//!
//! [`init`] must run once per process before any other function here; it checks the
//! backend with a sign/verify round and every later call refuses to run without it.

use std::sync::OnceLock;

use blst::{
    BLST_ERROR,
    min_pk::{AggregatePublicKey, PublicKey, SecretKey, Signature},
};
use color_eyre::eyre::{self, eyre};
use hivenet_types::HarnessError;

pub const DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";

static INITIALISED: OnceLock<()> = OnceLock::new();

pub fn init() -> eyre::Result<()> {
    if INITIALISED.get().is_some() {
        return Ok(());
    }
    let sk = SecretKey::key_gen(&[0x42; 32], &[]).map_err(bls_error)?;
    let sig = sk.sign(b"hivenet", DST, &[]);
    let res = sig.verify(true, b"hivenet", DST, &[], &sk.sk_to_pk(), true);
    if res != BLST_ERROR::BLST_SUCCESS {
        return Err(eyre!("bls self-check failed: {res:?}"));
    }
    let _ = INITIALISED.set(());
    Ok(())
}

fn ensure_init() -> eyre::Result<()> {
    if INITIALISED.get().is_none() {
        return Err(HarnessError::config("bls::init was not called").into());
    }
    Ok(())
}

fn bls_error(e: BLST_ERROR) -> eyre::Report {
    eyre!("bls error: {e:?}")
}

/// EIP-2333 derivation of the key at `path` from a seed.
pub fn derive_secret(seed: &[u8], path: &[u32]) -> eyre::Result<[u8; 32]> {
    ensure_init()?;
    let mut sk = SecretKey::derive_master_eip2333(seed).map_err(bls_error)?;
    for index in path {
        sk = sk.derive_child_eip2333(*index);
    }
    Ok(sk.to_bytes())
}

pub fn public_key(secret: &[u8; 32]) -> eyre::Result<[u8; 48]> {
    ensure_init()?;
    let sk = SecretKey::from_bytes(secret).map_err(bls_error)?;
    Ok(sk.sk_to_pk().compress())
}

pub fn sign(secret: &[u8; 32], message: &[u8]) -> eyre::Result<[u8; 96]> {
    ensure_init()?;
    let sk = SecretKey::from_bytes(secret).map_err(bls_error)?;
    Ok(sk.sign(message, DST, &[]).compress())
}

pub fn verify(pubkey: &[u8; 48], message: &[u8], signature: &[u8; 96]) -> eyre::Result<bool> {
    ensure_init()?;
    let pk = PublicKey::uncompress(pubkey).map_err(bls_error)?;
    let sig = Signature::uncompress(signature).map_err(bls_error)?;
    Ok(sig.verify(true, message, DST, &[], &pk, true) == BLST_ERROR::BLST_SUCCESS)
}

pub fn aggregate_pubkeys(pubkeys: &[[u8; 48]]) -> eyre::Result<[u8; 48]> {
    ensure_init()?;
    let keys = pubkeys
        .iter()
        .map(|p| PublicKey::uncompress(p).map_err(bls_error))
        .collect::<eyre::Result<Vec<_>>>()?;
    let refs: Vec<&PublicKey> = keys.iter().collect();
    let agg = AggregatePublicKey::aggregate(&refs, false).map_err(bls_error)?;
    Ok(agg.to_public_key().compress())
}
