//! Facade over the container runtime that launches client images.

use std::{net::IpAddr, time::Duration};

use async_trait::async_trait;
use color_eyre::eyre::{self, WrapErr, eyre};
use hivenet_types::StartBundle;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

/// A launched container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientInfo {
    pub container: String,
    pub ip: IpAddr,
}

/// Launches and stops client containers for the running test.
#[async_trait]
pub trait Simulator: Send + Sync {
    async fn start_client(&self, client_type: &str, bundle: StartBundle) -> eyre::Result<ClientInfo>;

    async fn stop_client(&self, container: &str) -> eyre::Result<()>;

    /// Returns the devp2p enode URL of an execution client container.
    async fn client_enode(&self, container: &str) -> eyre::Result<String>;
}

#[derive(Serialize)]
struct NodeConfig<'a> {
    client: &'a str,
    environment: &'a std::collections::BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct StartNodeResponse {
    id: String,
    ip: String,
}

#[derive(Serialize)]
struct ExecRequest<'a> {
    command: &'a [&'a str],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecInfo {
    stdout: String,
    #[serde(default)]
    stderr: String,
    exit_code: i32,
}

/// Client of the hive simulation HTTP API, scoped to one test.
#[derive(Clone, Debug)]
pub struct HiveSimulator {
    url: Url,
    suite: u32,
    test: u32,
    http: reqwest::Client,
}

impl HiveSimulator {
    pub fn new(url: Url, suite: u32, test: u32) -> eyre::Result<Self> {
        let http = reqwest::Client::builder().timeout(Duration::from_secs(300)).build()?;
        Ok(Self { url, suite, test, http })
    }

    fn node_url(&self, suffix: &str) -> eyre::Result<Url> {
        let path = format!("testsuite/{}/test/{}/node{suffix}", self.suite, self.test);
        Ok(self.url.join(&path)?)
    }
}

#[async_trait]
impl Simulator for HiveSimulator {
    async fn start_client(&self, client_type: &str, bundle: StartBundle) -> eyre::Result<ClientInfo> {
        let config = NodeConfig { client: client_type, environment: &bundle.params };
        let mut form = Form::new().text("config", serde_json::to_string(&config)?);
        for (path, content) in bundle.files {
            let filename = path.rsplit('/').next().unwrap_or(path.as_str()).to_owned();
            form = form.part(path, Part::bytes(content.to_vec()).file_name(filename));
        }

        let res: StartNodeResponse = self
            .http
            .post(self.node_url("")?)
            .multipart(form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .wrap_err_with(|| format!("starting {client_type}"))?;
        let ip = res.ip.parse().wrap_err("simulator returned no IP address")?;
        debug!(client = client_type, container = %res.id, %ip, "Container started");
        Ok(ClientInfo { container: res.id, ip })
    }

    async fn stop_client(&self, container: &str) -> eyre::Result<()> {
        self.http.delete(self.node_url(&format!("/{container}"))?).send().await?.error_for_status()?;
        Ok(())
    }

    async fn client_enode(&self, container: &str) -> eyre::Result<String> {
        let info: ExecInfo = self
            .http
            .post(self.node_url(&format!("/{container}/exec"))?)
            .json(&ExecRequest { command: &["enode.sh"] })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if info.exit_code != 0 {
            return Err(eyre!("enode.sh exited with {}: {}", info.exit_code, info.stderr));
        }
        Ok(info.stdout.trim().to_owned())
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        Json, Router,
        extract::Path,
        routing::{delete, post},
    };
    use serde_json::{Value, json};
    use tokio::net::TcpListener;

    use super::*;

    async fn fake_hive() -> Url {
        let app = Router::new()
            .route(
                "/testsuite/{suite}/test/{test}/node",
                post(|| async { Json(json!({"id": "c0ffee", "ip": "10.0.0.2"})) }),
            )
            .route(
                "/testsuite/{suite}/test/{test}/node/{id}",
                delete(|Path((_, _, id)): Path<(u32, u32, String)>| async move {
                    assert_eq!(id, "c0ffee");
                }),
            )
            .route(
                "/testsuite/{suite}/test/{test}/node/{id}/exec",
                post(|Json(body): Json<Value>| async move {
                    assert_eq!(body["command"][0], "enode.sh");
                    Json(json!({"stdout": "enode://abc@10.0.0.2:30303\n", "stderr": "", "exitCode": 0}))
                }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        Url::parse(&format!("http://{addr}/")).unwrap()
    }

    #[tokio::test]
    async fn hive_simulator_round_trip() {
        let sim = HiveSimulator::new(fake_hive().await, 1, 2).unwrap();
        let bundle = StartBundle::new().param("HIVE_LOGLEVEL", 3).file("/hive/input/genesis.ssz", vec![1u8, 2]);
        let info = sim.start_client("lighthouse-bn", bundle).await.unwrap();
        assert_eq!(info.container, "c0ffee");
        assert_eq!(info.ip.to_string(), "10.0.0.2");
        assert_eq!(sim.client_enode(&info.container).await.unwrap(), "enode://abc@10.0.0.2:30303");
        sim.stop_client(&info.container).await.unwrap();
    }
}
