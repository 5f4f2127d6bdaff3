//! Background transaction load against the running ELs.

use std::{collections::HashMap, time::Duration};

use alloy_primitives::Address;
use color_eyre::eyre;
use hivenet_execution::{BlockTag, ExecutionClients};
use hivenet_genesis::TestAccount;
use hivenet_types::{HarnessError, constants::DEFAULT_CHAIN_ID};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::tx::{TransactionCreator, TransactionType};

const DEFAULT_TRANSACTIONS_PER_ITERATION: usize = 40;
const DEFAULT_BLOBS_PER_ITERATION: usize = 2;
const DEFAULT_SECONDS_BETWEEN_ITERATIONS: u64 = 12;

/// Sends a batch of transactions every few seconds, rotating over the ELs.
///
/// Nonces are tracked locally per account and advance even when a send
/// fails, so a rejected transaction leaves a gap the EL queues behind.
#[derive(Clone, Debug)]
pub struct TransactionSpammer {
    pub name: String,
    pub accounts: Vec<TestAccount>,
    pub recipient: Option<Address>,
    pub transaction_type: TransactionType,
    pub transactions_per_iteration: usize,
    pub seconds_between_iterations: u64,
    pub chain_id: u64,
}

#[derive(Debug, Default)]
struct SpamState {
    nonces: HashMap<Address, u64>,
    sent: usize,
    iteration: usize,
}

impl TransactionSpammer {
    pub fn new(name: impl Into<String>, accounts: Vec<TestAccount>, transaction_type: TransactionType) -> Self {
        Self {
            name: name.into(),
            accounts,
            recipient: None,
            transaction_type,
            transactions_per_iteration: DEFAULT_TRANSACTIONS_PER_ITERATION,
            seconds_between_iterations: DEFAULT_SECONDS_BETWEEN_ITERATIONS,
            chain_id: DEFAULT_CHAIN_ID,
        }
    }

    pub fn with_recipient(mut self, recipient: Address) -> Self {
        self.recipient = Some(recipient);
        self
    }

    pub fn with_transactions_per_iteration(mut self, count: usize) -> Self {
        self.transactions_per_iteration = count;
        self
    }

    pub fn with_seconds_between_iterations(mut self, secs: u64) -> Self {
        self.seconds_between_iterations = secs;
        self
    }

    pub fn with_chain_id(mut self, chain_id: u64) -> Self {
        self.chain_id = chain_id;
        self
    }

    fn creator(&self) -> TransactionCreator {
        TransactionCreator { chain_id: self.chain_id, recipient: self.recipient, tx_type: self.transaction_type }
    }

    /// Spams until `cancel` fires.
    pub async fn run(self, clients: ExecutionClients, cancel: CancellationToken) -> eyre::Result<()> {
        if self.accounts.is_empty() {
            return Err(HarnessError::config(format!("spammer {} has no accounts", self.name)).into());
        }
        if clients.is_empty() {
            return Err(HarnessError::config(format!("spammer {} has no execution clients", self.name)).into());
        }
        info!(
            spammer = %self.name,
            accounts = self.accounts.len(),
            per_iteration = self.transactions_per_iteration,
            "Starting transaction spammer"
        );
        let creator = self.creator();
        let period = Duration::from_secs(self.seconds_between_iterations.max(1));
        let mut state = SpamState::default();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(spammer = %self.name, sent = state.sent, "Transaction spammer stopped");
                    return Ok(());
                }
                _ = tokio::time::sleep(period) => {}
            }
            self.iteration(&clients, &creator, &mut state).await?;
        }
    }

    /// Sends one batch; returns how many transactions the EL accepted.
    async fn iteration(
        &self,
        clients: &ExecutionClients,
        creator: &TransactionCreator,
        state: &mut SpamState,
    ) -> eyre::Result<usize> {
        let client = &clients.0[state.iteration % clients.len()];
        if let Err(e) = client.header_by_number(BlockTag::Latest).await {
            info!(spammer = %self.name, node = client.index(), "Error fetching header: {e:#}");
            return Ok(0);
        }

        let mut accepted = 0;
        for _ in 0..self.transactions_per_iteration {
            let sender = &self.accounts[state.sent % self.accounts.len()];
            let address = sender.address();
            let nonce = state.nonces.get(&address).copied().unwrap_or_default();
            let raw = creator.make_transaction(&sender.signer, nonce).await?;
            match client.send_raw_transaction(&raw).await {
                Ok(hash) => {
                    debug!(spammer = %self.name, %hash, nonce, "Sent transaction");
                    accepted += 1;
                }
                Err(e) => info!(
                    spammer = %self.name,
                    sender = %address,
                    account = sender.index,
                    nonce,
                    "Error sending tx: {e:#}"
                ),
            }
            state.nonces.insert(address, nonce + 1);
            state.sent += 1;
        }
        state.iteration += 1;
        Ok(accepted)
    }

    /// Runs the spammer in the background; errors other than cancellation are logged.
    pub fn spawn(self, clients: ExecutionClients, cancel: CancellationToken) -> JoinHandle<()> {
        let name = self.name.clone();
        tokio::spawn(async move {
            if let Err(e) = self.run(clients, cancel).await {
                error!(spammer = %name, "Transaction spammer failed: {e:#}");
            }
        })
    }
}

/// A [`TransactionSpammer`] sending type-3 transactions with one blob each.
#[derive(Clone, Debug)]
pub struct BlobSpammer {
    inner: TransactionSpammer,
}

impl BlobSpammer {
    pub fn new(accounts: Vec<TestAccount>) -> Self {
        Self {
            inner: TransactionSpammer::new("blobs", accounts, TransactionType::Blob)
                .with_transactions_per_iteration(DEFAULT_BLOBS_PER_ITERATION),
        }
    }

    pub fn with_recipient(self, recipient: Address) -> Self {
        Self { inner: self.inner.with_recipient(recipient) }
    }

    pub fn with_blobs_per_iteration(self, count: usize) -> Self {
        Self { inner: self.inner.with_transactions_per_iteration(count) }
    }

    pub fn with_seconds_between_iterations(self, secs: u64) -> Self {
        Self { inner: self.inner.with_seconds_between_iterations(secs) }
    }

    pub fn with_chain_id(self, chain_id: u64) -> Self {
        Self { inner: self.inner.with_chain_id(chain_id) }
    }

    pub fn into_inner(self) -> TransactionSpammer {
        self.inner
    }

    pub fn spawn(self, clients: ExecutionClients, cancel: CancellationToken) -> JoinHandle<()> {
        self.inner.spawn(clients, cancel)
    }
}
