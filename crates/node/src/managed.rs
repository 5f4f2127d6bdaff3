//! Lifecycle of a single client container.

use std::{
    net::IpAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use color_eyre::eyre::{self, WrapErr, eyre};
use futures::future::BoxFuture;
use hivenet_types::{ErrorContext, HarnessError, StartBundle};
use tracing::info;

use crate::simulator::{ClientInfo, Simulator};

/// Produces the start options of a client at the moment it is started.
///
/// Options are generated lazily so they can reference peers started earlier
/// (boot nodes, static peers).
pub type OptionsGenerator = Arc<dyn Fn() -> BoxFuture<'static, eyre::Result<StartBundle>> + Send + Sync>;

/// Wraps a fixed bundle as an [`OptionsGenerator`].
pub fn static_options(bundle: StartBundle) -> OptionsGenerator {
    Arc::new(move || {
        let bundle = bundle.clone();
        Box::pin(async move { Ok(bundle) })
    })
}

/// A client process the harness can start and stop.
#[async_trait]
pub trait ManagedClient: Send + Sync {
    fn is_running(&self) -> bool;

    fn ip(&self) -> Option<IpAddr>;

    fn client_type(&self) -> &str;

    /// Appends options applied on top of the generated ones at start.
    fn add_start_option(&self, bundle: StartBundle);

    async fn start(&self) -> eyre::Result<()>;

    async fn shutdown(&self) -> eyre::Result<()>;

    async fn enode_url(&self) -> eyre::Result<String>;
}

pub struct HiveManagedClient {
    simulator: Arc<dyn Simulator>,
    client_type: String,
    options: OptionsGenerator,
    extra_options: Mutex<StartBundle>,
    running: Mutex<Option<ClientInfo>>,
}

impl HiveManagedClient {
    pub fn new(simulator: Arc<dyn Simulator>, client_type: impl Into<String>, options: OptionsGenerator) -> Self {
        Self {
            simulator,
            client_type: client_type.into(),
            options,
            extra_options: Mutex::new(StartBundle::new()),
            running: Mutex::new(None),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<ClientInfo>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn container(&self) -> Option<String> {
        self.running().as_ref().map(|info| info.container.clone())
    }
}

impl std::fmt::Debug for HiveManagedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HiveManagedClient")
            .field("client_type", &self.client_type)
            .field("running", &*self.running())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ManagedClient for HiveManagedClient {
    fn is_running(&self) -> bool {
        self.running().is_some()
    }

    fn ip(&self) -> Option<IpAddr> {
        self.running().as_ref().map(|info| info.ip)
    }

    fn client_type(&self) -> &str {
        &self.client_type
    }

    fn add_start_option(&self, bundle: StartBundle) {
        let mut extra = self.extra_options.lock().unwrap_or_else(PoisonError::into_inner);
        *extra = std::mem::take(&mut *extra).merge(bundle);
    }

    async fn start(&self) -> eyre::Result<()> {
        if self.is_running() {
            return Err(HarnessError::ClientStartupError(
                ErrorContext::default(),
                format!("{} already started", self.client_type),
            )
            .into());
        }
        info!(client = %self.client_type, "Starting client");

        let generated = (self.options)().await.wrap_err("unable to get start options")?;
        let extra = self.extra_options.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let bundle = generated.merge(extra);

        let launched = self.simulator.start_client(&self.client_type, bundle).await.map_err(|e| {
            HarnessError::ClientStartupError(ErrorContext::default(), format!("{}: {e}", self.client_type))
        })?;
        info!(client = %self.client_type, container = %launched.container, ip = %launched.ip, "Started client");
        *self.running() = Some(launched);
        Ok(())
    }

    async fn shutdown(&self) -> eyre::Result<()> {
        let container = self.container().ok_or_else(|| eyre!("{} is not running", self.client_type))?;
        self.simulator.stop_client(&container).await?;
        *self.running() = None;
        Ok(())
    }

    async fn enode_url(&self) -> eyre::Result<String> {
        let container = self.container().ok_or_else(|| eyre!("{} is not running", self.client_type))?;
        self.simulator.client_enode(&container).await
    }
}

/// A client started outside the harness, reachable at a fixed address.
#[derive(Clone, Debug)]
pub struct ExternalClient {
    client_type: String,
    ip: IpAddr,
    enode: Option<String>,
}

impl ExternalClient {
    pub fn new(client_type: impl Into<String>, ip: IpAddr) -> Self {
        Self { client_type: client_type.into(), ip, enode: None }
    }

    pub fn with_enode(mut self, enode: impl Into<String>) -> Self {
        self.enode = Some(enode.into());
        self
    }
}

#[async_trait]
impl ManagedClient for ExternalClient {
    fn is_running(&self) -> bool {
        true
    }

    fn ip(&self) -> Option<IpAddr> {
        Some(self.ip)
    }

    fn client_type(&self) -> &str {
        &self.client_type
    }

    fn add_start_option(&self, _bundle: StartBundle) {}

    async fn start(&self) -> eyre::Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> eyre::Result<()> {
        Ok(())
    }

    async fn enode_url(&self) -> eyre::Result<String> {
        self.enode.clone().ok_or_else(|| eyre!("{} has no enode", self.client_type))
    }
}
