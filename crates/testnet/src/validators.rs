//! Validator registry as tracked by the harness, updated from beacon states.
//!
//! [`Validators`] is a shared view: subsets returned by the selectors point at
//! the same entries, so an update applied through any of them is seen by all.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use alloy_primitives::{Address, U256};
use color_eyre::eyre::{self, WrapErr, eyre};
use hivenet_consensus::{BeaconClient, BlockId, StateId, VersionedBeaconState, VersionedSignedBeaconBlock, signing_root};
use hivenet_execution::{BlockTag, ExecutionClient};
use hivenet_genesis::{ValidatorKey, ValidatorKeys, bls};
use hivenet_types::{
    aliases::{Domain, Epoch, Gwei, Root, Slot, ValidatorIndex, bls_pubkey, bls_signature},
    beacon::{self, BlsToExecutionChange, SignedBlsToExecutionChange, SignedVoluntaryExit, VoluntaryExit},
    constants::{MAX_EFFECTIVE_BALANCE, WEI_PER_GWEI},
};
use tracing::{debug, info};

/// A block together with its post-state.
#[derive(Debug)]
pub struct BeaconBlockState {
    pub block: VersionedSignedBeaconBlock,
    pub state: VersionedBeaconState,
}

impl BeaconBlockState {
    pub fn slot(&self) -> Slot {
        self.block.slot()
    }

    pub fn balance(&self, index: ValidatorIndex) -> Gwei {
        self.state.balances().get(index as usize).copied().unwrap_or_default()
    }
}

/// Block/state pairs keyed by block root, shared by every validator view.
#[derive(Clone, Debug, Default)]
pub struct BeaconCache(Arc<Mutex<HashMap<Root, Arc<BeaconBlockState>>>>);

impl BeaconCache {
    pub fn clear(&self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn block_state_by_root(&self, bn: &BeaconClient, root: Root) -> eyre::Result<Arc<BeaconBlockState>> {
        if let Some(cached) = self.0.lock().unwrap_or_else(PoisonError::into_inner).get(&root) {
            return Ok(cached.clone());
        }
        let block = bn.block_v2(BlockId::Root(root)).await.wrap_err("failed to fetch block")?;
        let state = bn.beacon_state_v2(StateId::Root(block.state_root())).await.wrap_err("failed to fetch state")?;
        if state.root() != block.state_root() {
            return Err(eyre!(
                "state root mismatch while fetching state: want={}, got={}",
                block.state_root(),
                state.root()
            ));
        }
        let entry = Arc::new(BeaconBlockState { block, state });
        self.0.lock().unwrap_or_else(PoisonError::into_inner).insert(root, entry.clone());
        Ok(entry)
    }

    /// Walks back from `head_root` to the block at `slot`; `None` if that slot is empty.
    pub async fn block_state_by_slot_from_head_root(
        &self,
        bn: &BeaconClient,
        head_root: Root,
        slot: Slot,
    ) -> eyre::Result<Option<Arc<BeaconBlockState>>> {
        let mut current = self.block_state_by_root(bn, head_root).await?;
        if current.slot() < slot {
            return Err(eyre!("requested for slot above head: head={}, slot={slot}", current.slot()));
        }
        loop {
            if current.slot() == slot {
                return Ok(Some(current));
            }
            if current.slot() < slot || current.slot() == 0 {
                return Ok(None);
            }
            current = self.block_state_by_root(bn, current.block.parent_root()).await?;
        }
    }
}

/// Withdrawal status of one validator.
#[derive(Clone, Debug)]
pub struct Validator {
    pub index: ValidatorIndex,
    pub pubkey: [u8; 48],
    pub withdraw_address: Option<Address>,
    pub exited: bool,
    pub exit_initiated: bool,
    pub slashed: bool,
    /// Balance expected on the withdrawal address once the validator exited.
    pub exact_withdrawable_balance: Option<U256>,
    pub key: ValidatorKey,
    pub initial_balance: Gwei,
    pub balance: Gwei,
}

impl Validator {
    fn new(index: ValidatorIndex, key: ValidatorKey) -> Self {
        Self {
            index,
            pubkey: key.validator_pubkey,
            withdraw_address: None,
            exited: false,
            exit_initiated: false,
            slashed: false,
            exact_withdrawable_balance: None,
            key,
            initial_balance: 0,
            balance: 0,
        }
    }

    pub fn sign_bls_to_execution_change(
        &self,
        execution_address: Address,
        domain: Domain,
    ) -> eyre::Result<SignedBlsToExecutionChange> {
        if self.withdraw_address.is_some() {
            return Err(eyre!("execution address already set"));
        }
        let message = BlsToExecutionChange {
            validator_index: self.index,
            from_bls_pubkey: bls_pubkey(&self.key.withdrawal_pubkey),
            to_execution_address: execution_address,
        };
        let signature = bls::sign(&self.key.withdrawal_secret, signing_root(&message, domain).as_slice())?;
        Ok(SignedBlsToExecutionChange { message, signature: bls_signature(&signature) })
    }

    pub fn sign_voluntary_exit(&self, epoch: Epoch, domain: Domain) -> eyre::Result<SignedVoluntaryExit> {
        let message = VoluntaryExit { epoch, validator_index: self.index };
        let signature = bls::sign(&self.key.validator_secret, signing_root(&message, domain).as_slice())?;
        Ok(SignedVoluntaryExit { message, signature: bls_signature(&signature) })
    }

    fn update_from_beacon_validator(&mut self, source: &beacon::Validator, current_epoch: Epoch, balance: Gwei) {
        if let Some(address) = source.eth1_withdrawal_address() {
            self.withdraw_address = Some(address);
        }
        let exited = source.exit_epoch <= current_epoch;
        if exited && !self.exited {
            self.exact_withdrawable_balance = Some(U256::from(balance) * U256::from(WEI_PER_GWEI));
        }
        self.exited = exited;
        self.exit_initiated = source.exit_initiated();
        self.slashed = source.slashed;
        self.balance = balance;
    }
}

/// Expected partially withdrawn amount in gwei.
///
/// `history` yields, per non-empty slot in ascending order, whether the
/// slot's payload withdrew from the validator and its balance after the slot.
pub fn partial_withdrawn_sum(initial_balance: Gwei, history: impl IntoIterator<Item = (bool, Gwei)>) -> Gwei {
    let mut previous = initial_balance;
    let mut sum: Gwei = 0;
    for (withdrawn, balance) in history {
        if withdrawn {
            sum += previous.saturating_sub(MAX_EFFECTIVE_BALANCE);
        }
        previous = balance;
    }
    sum
}

#[derive(Clone)]
pub struct Validators {
    inner: Arc<RwLock<BTreeMap<ValidatorIndex, Validator>>>,
    /// `None` on the full registry.
    members: Option<Arc<BTreeSet<ValidatorIndex>>>,
    cache: BeaconCache,
    keys: Arc<ValidatorKeys>,
}

impl fmt::Debug for Validators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Validators").field("indexes", &self.indexes()).finish()
    }
}

impl Validators {
    /// Registry of every validator in `state`; balances at this point become the initial ones.
    pub fn new(state: &VersionedBeaconState, keys: Arc<ValidatorKeys>) -> eyre::Result<Self> {
        let vs = Self {
            inner: Arc::default(),
            members: None,
            cache: BeaconCache::default(),
            keys,
        };
        vs.update(state, true)?;
        for v in vs.inner.write().unwrap_or_else(PoisonError::into_inner).values_mut() {
            v.initial_balance = v.balance;
        }
        Ok(vs)
    }

    pub fn cache(&self) -> &BeaconCache {
        &self.cache
    }

    pub fn keys(&self) -> &Arc<ValidatorKeys> {
        &self.keys
    }

    fn contains(&self, index: ValidatorIndex) -> bool {
        self.members.as_ref().is_none_or(|m| m.contains(&index))
    }

    pub fn indexes(&self) -> Vec<ValidatorIndex> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.keys().copied().filter(|i| self.contains(*i)).collect()
    }

    pub fn count(&self) -> usize {
        self.indexes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn get(&self, index: ValidatorIndex) -> Option<Validator> {
        if !self.contains(index) {
            return None;
        }
        self.inner.read().unwrap_or_else(PoisonError::into_inner).get(&index).cloned()
    }

    /// Copies of the member validators, in index order.
    pub fn snapshot(&self) -> Vec<Validator> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.values().filter(|v| self.contains(v.index)).cloned().collect()
    }

    fn with_members(&self, members: BTreeSet<ValidatorIndex>) -> Self {
        Self {
            inner: self.inner.clone(),
            members: Some(Arc::new(members)),
            cache: self.cache.clone(),
            keys: self.keys.clone(),
        }
    }

    pub fn subset(&self, mut include: impl FnMut(&Validator) -> bool) -> Self {
        let members = self.snapshot().iter().filter(|v| include(v)).map(|v| v.index).collect();
        self.with_members(members)
    }

    pub fn withdrawable(&self) -> Self {
        self.subset(|v| v.withdraw_address.is_some())
    }

    pub fn non_withdrawable(&self) -> Self {
        self.subset(|v| v.withdraw_address.is_none())
    }

    pub fn fully_withdrawable(&self) -> Self {
        self.subset(|v| v.withdraw_address.is_some() && v.exited)
    }

    pub fn active(&self) -> Self {
        self.subset(|v| !v.exited && !v.slashed)
    }

    pub fn slashed(&self) -> Self {
        self.subset(|v| v.slashed)
    }

    pub fn exited(&self) -> Self {
        self.subset(|v| v.exited)
    }

    pub fn exit_initiated(&self) -> Self {
        self.subset(|v| v.exit_initiated)
    }

    pub fn select_by_index(&self, indexes: &[ValidatorIndex]) -> Self {
        self.subset(|v| indexes.contains(&v.index))
    }

    /// First `count` members in index order.
    pub fn select_by_count(&self, count: usize) -> Self {
        self.with_members(self.indexes().into_iter().take(count).collect())
    }

    /// Splits the members round-robin into `total` views.
    pub fn chunks(&self, total: usize) -> Vec<Self> {
        let mut sets = vec![BTreeSet::new(); total];
        if total > 0 {
            for (i, index) in self.indexes().into_iter().enumerate() {
                sets[i % total].insert(index);
            }
        }
        sets.into_iter().map(|m| self.with_members(m)).collect()
    }

    /// Refreshes status and balances; only the full registry adds unseen validators.
    pub fn update_from_beacon_state(&self, state: &VersionedBeaconState) -> eyre::Result<()> {
        self.update(state, self.members.is_none())
    }

    fn update(&self, state: &VersionedBeaconState, append_new: bool) -> eyre::Result<()> {
        let current_epoch = state.spec().slot_to_epoch(state.slot());
        let validators = state.validators();
        let balances = state.balances();
        if validators.is_empty() {
            return Err(eyre!("got zero validators"));
        }
        if validators.len() != self.keys.len() {
            return Err(eyre!("incorrect amount of keys: want={}, got={}", validators.len(), self.keys.len()));
        }

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        for (i, source) in validators.iter().enumerate() {
            let index = i as ValidatorIndex;
            let balance = balances.get(i).copied().unwrap_or_default();
            if !inner.contains_key(&index) && append_new {
                let key = &self.keys[i];
                if key.validator_pubkey[..] != source.pubkey[..] {
                    return Err(eyre!("pubkey mismatch for validator {index}"));
                }
                inner.insert(index, Validator::new(index, key.clone()));
            }
            if !self.contains(index) {
                continue;
            }
            if let Some(v) = inner.get_mut(&index) {
                v.update_from_beacon_validator(source, current_epoch, balance);
            }
        }
        Ok(())
    }

    fn member(&self, index: ValidatorIndex) -> eyre::Result<Validator> {
        self.get(index).ok_or_else(|| eyre!("validator {index} not tracked"))
    }

    /// Signs and submits a credential change, then records the new address.
    pub async fn sign_send_bls_to_execution_change(
        &self,
        index: ValidatorIndex,
        bn: &BeaconClient,
        execution_address: Address,
        domain: Domain,
    ) -> eyre::Result<()> {
        let signed = self.member(index)?.sign_bls_to_execution_change(execution_address, domain)?;
        bn.submit_pool_bls_to_execution_change(&[signed]).await?;
        if let Some(v) = self.inner.write().unwrap_or_else(PoisonError::into_inner).get_mut(&index) {
            v.withdraw_address = Some(execution_address);
        }
        Ok(())
    }

    pub async fn sign_send_voluntary_exit(
        &self,
        index: ValidatorIndex,
        bn: &BeaconClient,
        epoch: Epoch,
        domain: Domain,
    ) -> eyre::Result<()> {
        let signed = self.member(index)?.sign_voluntary_exit(epoch, domain)?;
        bn.submit_voluntary_exit(&signed).await
    }

    /// Checks the EL balance of the validator's withdrawal address at the
    /// payload of `head_root`.
    ///
    /// Returns `false` while nothing was withdrawn yet, `true` when the
    /// balance matches the expected amount and an error when it doesn't.
    pub async fn verify_withdrawn_balance(
        &self,
        index: ValidatorIndex,
        bn: &BeaconClient,
        ec: &ExecutionClient,
        head_root: Root,
    ) -> eyre::Result<bool> {
        let v = self.member(index)?;
        let address = v
            .withdraw_address
            .ok_or_else(|| eyre!("checked balance for validator without a withdrawal address"))?;

        let head = self.cache.block_state_by_root(bn, head_root).await.wrap_err("failed to get head block state")?;
        info!(validator = index, slot = head.slot(), "Verifying withdrawn balance");
        let number = head
            .block
            .execution_block_number()
            .ok_or_else(|| eyre!("failed to get execution payload from head"))?;
        let balance = ec.balance_at(address, BlockTag::Number(number)).await.wrap_err("failed to get balance")?;
        debug!(validator = index, block = number, %balance, "Execution balance");

        if balance.is_zero() {
            return Ok(false);
        }

        if let Some(expected) = v.exact_withdrawable_balance {
            if expected != balance {
                return Err(eyre!("unexpected balance: want={expected}, got={balance}"));
            }
            let condition = if v.slashed { "Slashed" } else { "Exited" };
            info!(validator = index, %balance, "{condition} validator fully withdrawn");
            return Ok(true);
        }

        let mut history = Vec::new();
        for slot in 0..=head.slot() {
            let Some(bs) = self
                .cache
                .block_state_by_slot_from_head_root(bn, head_root, slot)
                .await
                .wrap_err_with(|| format!("failed to get block state, slot {slot}"))?
            else {
                continue;
            };
            let withdrawn = bs.block.withdrawals().is_some_and(|ws| ws.iter().any(|w| w.validator_index == index));
            history.push((withdrawn, bs.balance(index)));
        }
        let expected = partial_withdrawn_sum(v.initial_balance, history);
        if expected == 0 {
            info!(validator = index, "Expected withdrawn balance is zero");
            return Ok(false);
        }
        let expected = U256::from(expected) * U256::from(WEI_PER_GWEI);
        if expected != balance {
            return Err(eyre!("unexpected balance: want={expected}, got={balance}"));
        }
        info!(validator = index, %balance, "Validator partially withdrawn");
        Ok(true)
    }
}
