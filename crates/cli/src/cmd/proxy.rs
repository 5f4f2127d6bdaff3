use std::path::{Path, PathBuf};

use clap::Parser;
use color_eyre::eyre;
use hivenet_proxy::{Proxy, ProxyConfig};
use hivenet_types::constants::DEFAULT_JWT_SECRET;
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

use crate::error::Error;

#[derive(Parser, Clone, Debug, PartialEq)]
pub struct ProxyCmd {
    #[arg(long, default_value = "127.0.0.1")]
    pub listen_host: String,

    /// `0` picks a free port
    #[arg(long, default_value_t = 0)]
    pub listen_port: u16,

    /// Engine API the proxy forwards to, e.g. http://localhost:8551
    #[arg(long)]
    pub destination: Url,

    /// File with the hex-encoded JWT secret shared with the EL; the harness default when omitted
    #[arg(long)]
    pub jwt_secret: Option<PathBuf>,
}

impl ProxyCmd {
    /// Serves until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> eyre::Result<()> {
        let jwt_secret = match &self.jwt_secret {
            Some(path) => read_jwt_secret(path)?,
            None => DEFAULT_JWT_SECRET,
        };
        let proxy = Proxy::spawn(ProxyConfig {
            listen_host: self.listen_host.clone(),
            listen_port: self.listen_port,
            destination: self.destination.clone(),
            jwt_secret,
            name: "standalone".into(),
        })
        .await?;
        info!(url = %proxy.url(), "Forwarding Engine API traffic, ctrl-c to stop");

        cancel.cancelled().await;
        proxy.cancel().await;
        Ok(())
    }
}

/// Reads a 32-byte secret written as hex, with or without `0x`.
pub fn read_jwt_secret(path: &Path) -> Result<[u8; 32], Error> {
    let raw = std::fs::read_to_string(path).map_err(|_| Error::OpenFile(path.to_path_buf()))?;
    let invalid = |reason: String| Error::JwtSecret { path: path.to_path_buf(), reason };
    let trimmed = raw.trim();
    let bytes = hex::decode(trimmed.strip_prefix("0x").unwrap_or(trimmed)).map_err(|e| invalid(e.to_string()))?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| invalid(format!("expected 32 bytes, got {}", bytes.len())))
}
