//! Thin client for the standard beacon node REST API.

use std::{fmt, str::FromStr, time::Duration};

use color_eyre::eyre::{self, eyre};
use hivenet_types::{ErrorContext, ForkName, HarnessError, aliases::{Root, Slot}};
use reqwest::{StatusCode, header::ACCEPT};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::trace;
use url::Url;

/// Per-call timeout of every beacon API request.
pub const BEACON_RPC_TIMEOUT: Duration = Duration::from_secs(5);

const CONSENSUS_VERSION_HEADER: &str = "Eth-Consensus-Version";
const SSZ_CONTENT_TYPE: &str = "application/octet-stream";

/// Block or state selector used in beacon API paths.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlockId {
    Head,
    Genesis,
    Finalized,
    Justified,
    Slot(Slot),
    Root(Root),
}

/// States are selected the same way blocks are.
pub type StateId = BlockId;

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockId::Head => f.write_str("head"),
            BlockId::Genesis => f.write_str("genesis"),
            BlockId::Finalized => f.write_str("finalized"),
            BlockId::Justified => f.write_str("justified"),
            BlockId::Slot(slot) => write!(f, "{slot}"),
            BlockId::Root(root) => write!(f, "{root}"),
        }
    }
}

impl FromStr for BlockId {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "head" => BlockId::Head,
            "genesis" => BlockId::Genesis,
            "finalized" => BlockId::Finalized,
            "justified" => BlockId::Justified,
            s if s.starts_with("0x") => BlockId::Root(s.parse()?),
            s => BlockId::Slot(s.parse().map_err(|e| eyre!("invalid block id {s}: {e}"))?),
        })
    }
}

#[derive(Debug, Deserialize)]
struct DataResponse<T> {
    data: T,
}

/// `{version, execution_optimistic, data}` envelope of the v2 endpoints.
#[derive(Clone, Debug, Deserialize)]
pub struct VersionedResponse {
    pub version: ForkName,
    #[serde(default)]
    pub execution_optimistic: bool,
    #[serde(default)]
    pub finalized: bool,
    pub data: Value,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
}

#[derive(Clone, Debug)]
pub struct BeaconApi {
    http: reqwest::Client,
    base: Url,
    context: ErrorContext,
}

impl BeaconApi {
    pub fn new(base: Url, context: ErrorContext) -> eyre::Result<Self> {
        let http = reqwest::Client::builder().timeout(BEACON_RPC_TIMEOUT).build()?;
        Ok(Self { http, base, context })
    }

    pub fn url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> eyre::Result<Url> {
        Ok(self.base.join(path.trim_start_matches('/'))?)
    }

    fn transport_error(&self, path: &str, err: reqwest::Error) -> eyre::Report {
        let ctx = self.context.clone().with_method(path);
        if err.is_timeout() {
            HarnessError::RpcTimeout(ctx).into()
        } else {
            eyre!("{ctx}beacon api request failed: {err}")
        }
    }

    /// Sends a request; `Ok(None)` when the node answers 404.
    async fn send(&self, path: &str, req: reqwest::RequestBuilder) -> eyre::Result<Option<reqwest::Response>> {
        trace!(url = %self.base, path, "Beacon API request");
        let res = req.send().await.map_err(|e| self.transport_error(path, e))?;
        match res.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(res)),
            status => {
                let body = res.text().await.unwrap_or_default();
                let message = serde_json::from_str::<ApiErrorBody>(&body)
                    .map(|b| b.message)
                    .unwrap_or(body);
                Err(eyre!("{}beacon api {path} returned {status}: {message}", self.context))
            }
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> eyre::Result<Option<T>> {
        let req = self.http.get(self.endpoint(path)?);
        match self.send(path, req).await? {
            Some(res) => Ok(Some(res.json::<T>().await.map_err(|e| self.transport_error(path, e))?)),
            None => Ok(None),
        }
    }

    /// GET of a `{"data": ...}` endpoint.
    pub async fn get_data<T: DeserializeOwned>(&self, path: &str) -> eyre::Result<Option<T>> {
        Ok(self.get::<DataResponse<T>>(path).await?.map(|r| r.data))
    }

    /// GET in SSZ encoding, returning the advertised fork with the body.
    pub async fn get_ssz(&self, path: &str) -> eyre::Result<Option<(Option<ForkName>, Vec<u8>)>> {
        let req = self.http.get(self.endpoint(path)?).header(ACCEPT, SSZ_CONTENT_TYPE);
        let Some(res) = self.send(path, req).await? else {
            return Ok(None);
        };
        let fork = res
            .headers()
            .get(CONSENSUS_VERSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<ForkName>().ok());
        let body = res.bytes().await.map_err(|e| self.transport_error(path, e))?;
        Ok(Some((fork, body.to_vec())))
    }

    pub async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> eyre::Result<()> {
        let req = self.http.post(self.endpoint(path)?).json(body);
        self.send(path, req)
            .await?
            .map(|_| ())
            .ok_or_else(|| eyre!("{}endpoint {path} not found on beacon client", self.context))
    }
}
