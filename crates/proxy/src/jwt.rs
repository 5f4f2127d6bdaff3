//! HS256 bearer tokens over `{iat}` for the Engine API channel.
//!
//! Tokens carry only an `iat` claim. ELs reject tokens whose `iat` drifts more
//! than 60s from their clock, so cached tokens are regenerated before that.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::http::{HeaderMap, header::AUTHORIZATION};
use color_eyre::eyre::{self, eyre};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

const TOKEN_VALIDITY_DURATION: Duration = Duration::from_secs(55);
pub const MAX_TIME_DRIFT: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iat: u64,
}

#[derive(Clone)]
struct JwtCache {
    token: String,
    created_at: SystemTime,
}

/// Provides JWT tokens for authenticating with the Engine API.
pub struct JwtProvider {
    key: EncodingKey,
    cache: RwLock<Option<JwtCache>>,
}

impl JwtProvider {
    pub fn new(secret: [u8; 32]) -> Self {
        Self { key: EncodingKey::from_secret(&secret), cache: RwLock::new(None) }
    }

    /// Returns a valid token, either from the cache or freshly signed.
    pub async fn get_token(&self) -> eyre::Result<String> {
        {
            let cached_guard = self.cache.read().await;
            if let Some(cached) = cached_guard.as_ref() {
                if cached.created_at.elapsed()? < TOKEN_VALIDITY_DURATION {
                    return Ok(cached.token.clone());
                }
            }
        }

        let mut cache = self.cache.write().await;
        if let Some(cached) = cache.as_ref() {
            if cached.created_at.elapsed()? < TOKEN_VALIDITY_DURATION {
                return Ok(cached.token.clone());
            }
        }

        let now = SystemTime::now();
        let token = sign_token(&self.key, now)?;
        cache.replace(JwtCache { token: token.clone(), created_at: now });
        Ok(token)
    }
}

impl std::fmt::Debug for JwtProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtProvider").finish_non_exhaustive()
    }
}

fn sign_token(key: &EncodingKey, iat: SystemTime) -> eyre::Result<String> {
    let claims = Claims { iat: iat.duration_since(UNIX_EPOCH)?.as_secs() };
    Ok(encode(&Header::default(), &claims, key)?)
}

/// Signs a one-off token with an explicit issue time.
pub fn token_at(secret: &[u8; 32], iat: SystemTime) -> eyre::Result<String> {
    sign_token(&EncodingKey::from_secret(secret), iat)
}

/// Checks the HS256 signature and that `iat` is within [`MAX_TIME_DRIFT`] of now.
pub fn verify_token(secret: &[u8; 32], token: &str) -> eyre::Result<()> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.required_spec_claims.clear();
    validation.validate_exp = false;
    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)?;

    let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
    let drift = now.abs_diff(data.claims.iat);
    if drift > MAX_TIME_DRIFT.as_secs() {
        return Err(eyre!("token iat is {drift}s away from now"));
    }
    Ok(())
}

/// Verifies the `Authorization: Bearer` header of an inbound request.
pub fn verify_headers(secret: &[u8; 32], headers: &HeaderMap) -> eyre::Result<()> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| eyre!("missing authorization header"))?
        .to_str()?;
    let token = value
        .strip_prefix("Bearer ")
        .ok_or_else(|| eyre!("authorization is not a bearer token"))?;
    verify_token(secret, token)
}
