use std::{
    collections::HashSet,
    net::{IpAddr, Ipv4Addr},
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use color_eyre::eyre::{self, eyre};
use hivenet_node::{ClientInfo, Simulator};
use hivenet_types::StartBundle;

/// A client start as seen by [`RecordingSimulator`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartedClient {
    pub container: String,
    pub client_type: String,
    pub bundle: StartBundle,
}

#[derive(Debug, Default)]
struct Recorded {
    started: Vec<StartedClient>,
    stopped: Vec<String>,
}

/// [`Simulator`] that launches nothing and remembers every request.
///
/// Every client "runs" on the same IP, loopback unless overridden, so tests
/// can point the handles at in-process fakes.
#[derive(Debug)]
pub struct RecordingSimulator {
    ip: IpAddr,
    failing: HashSet<String>,
    recorded: Mutex<Recorded>,
}

impl Default for RecordingSimulator {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingSimulator {
    pub fn new() -> Self {
        Self { ip: IpAddr::V4(Ipv4Addr::LOCALHOST), failing: HashSet::new(), recorded: Mutex::default() }
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = ip;
        self
    }

    /// Makes every start of `client_type` fail.
    pub fn fail_client(mut self, client_type: impl Into<String>) -> Self {
        self.failing.insert(client_type.into());
        self
    }

    pub fn started(&self) -> Vec<StartedClient> {
        self.recorded.lock().unwrap_or_else(PoisonError::into_inner).started.clone()
    }

    pub fn started_of_type(&self, client_type: &str) -> Vec<StartedClient> {
        self.started().into_iter().filter(|c| c.client_type == client_type).collect()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.recorded.lock().unwrap_or_else(PoisonError::into_inner).stopped.clone()
    }
}

#[async_trait]
impl Simulator for RecordingSimulator {
    async fn start_client(&self, client_type: &str, bundle: StartBundle) -> eyre::Result<ClientInfo> {
        if self.failing.contains(client_type) {
            return Err(eyre!("client {client_type} failed to start"));
        }
        let mut recorded = self.recorded.lock().unwrap_or_else(PoisonError::into_inner);
        let container = format!("{client_type}-{}", recorded.started.len());
        recorded.started.push(StartedClient {
            container: container.clone(),
            client_type: client_type.to_owned(),
            bundle,
        });
        Ok(ClientInfo { container, ip: self.ip })
    }

    async fn stop_client(&self, container: &str) -> eyre::Result<()> {
        self.recorded.lock().unwrap_or_else(PoisonError::into_inner).stopped.push(container.to_owned());
        Ok(())
    }

    async fn client_enode(&self, container: &str) -> eyre::Result<String> {
        Ok(format!("enode://{container}@{}:30303", self.ip))
    }
}
