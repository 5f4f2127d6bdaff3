use std::{collections::BTreeMap, fmt, sync::Arc};

use color_eyre::eyre;
use hivenet_genesis::{ValidatorKey, bls};
use hivenet_node::ManagedClient;
use hivenet_types::{
    ErrorContext, HarnessError, StartBundle,
    aliases::{Address, Domain, Epoch, Root, ValidatorIndex, bls_pubkey, bls_signature},
    beacon::{
        BlsToExecutionChange, SignedBlsToExecutionChange, SignedVoluntaryExit, SigningData,
        VoluntaryExit,
    },
};
use tracing::info;
use tree_hash::TreeHash;

use crate::beacon::BeaconClient;

/// Root signed for `object` under `domain`.
pub fn signing_root<T: TreeHash>(object: &T, domain: Domain) -> Root {
    SigningData { object_root: object.tree_hash_root(), domain }.tree_hash_root()
}

/// Request to move a validator's withdrawal credentials to an execution address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlsToExecutionChangeInfo {
    pub validator_index: ValidatorIndex,
    /// Must be exactly 20 bytes.
    pub execution_address: Vec<u8>,
}

/// A validator client container and the keys it was started with.
pub struct ValidatorClient {
    index: usize,
    managed: Arc<dyn ManagedClient>,
    keys: BTreeMap<ValidatorIndex, ValidatorKey>,
    beacon: Option<Arc<BeaconClient>>,
}

impl ValidatorClient {
    pub fn new(
        index: usize,
        managed: Arc<dyn ManagedClient>,
        keys: BTreeMap<ValidatorIndex, ValidatorKey>,
        beacon: Option<Arc<BeaconClient>>,
    ) -> Self {
        Self { index, managed, keys, beacon }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn client_type(&self) -> &str {
        self.managed.client_type()
    }

    pub fn keys(&self) -> &BTreeMap<ValidatorIndex, ValidatorKey> {
        &self.keys
    }

    pub fn beacon(&self) -> Option<&Arc<BeaconClient>> {
        self.beacon.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.managed.is_running()
    }

    fn context(&self) -> ErrorContext {
        ErrorContext::node(self.index, self.client_type())
    }

    /// Starts the container; a client without keys is not started at all.
    pub async fn start(&self) -> eyre::Result<()> {
        if self.managed.is_running() {
            return Err(HarnessError::ClientStartupError(self.context(), "already running".into()).into());
        }
        if self.keys.is_empty() {
            info!(node = self.index, client = %self.client_type(), "Skipping validator client without keys");
            return Ok(());
        }
        if let Some(endpoint) = self.beacon.as_ref().and_then(|b| b.builder_endpoint()) {
            self.managed.add_start_option(StartBundle::new().param("HIVE_ETH2_BUILDER_ENDPOINT", endpoint));
        }
        self.managed.start().await
    }

    pub async fn shutdown(&self) -> eyre::Result<()> {
        self.managed.shutdown().await
    }

    pub fn contains_key(&self, pubkey: &[u8; 48]) -> bool {
        self.keys.values().any(|k| &k.validator_pubkey == pubkey)
    }

    pub fn contains_validator_index(&self, index: ValidatorIndex) -> bool {
        self.keys.contains_key(&index)
    }

    fn key(&self, index: ValidatorIndex) -> eyre::Result<&ValidatorKey> {
        self.keys.get(&index).ok_or_else(|| HarnessError::UnknownValidatorIndex(index).into())
    }

    /// Signs the credential change with the validator's BLS withdrawal key.
    pub fn sign_bls_to_execution_change(
        &self,
        domain: Domain,
        info: &BlsToExecutionChangeInfo,
    ) -> eyre::Result<SignedBlsToExecutionChange> {
        if info.execution_address.len() != 20 {
            return Err(HarnessError::BadAddressLength(info.execution_address.len()).into());
        }
        let key = self.key(info.validator_index)?;
        let message = BlsToExecutionChange {
            validator_index: info.validator_index,
            from_bls_pubkey: bls_pubkey(&key.withdrawal_pubkey),
            to_execution_address: Address::from_slice(&info.execution_address),
        };
        let signature = bls::sign(&key.withdrawal_secret, signing_root(&message, domain).as_slice())?;
        Ok(SignedBlsToExecutionChange { message, signature: bls_signature(&signature) })
    }

    pub fn sign_voluntary_exit(
        &self,
        domain: Domain,
        epoch: Epoch,
        validator_index: ValidatorIndex,
    ) -> eyre::Result<SignedVoluntaryExit> {
        let key = self.key(validator_index)?;
        let message = VoluntaryExit { epoch, validator_index };
        let signature = bls::sign(&key.validator_secret, signing_root(&message, domain).as_slice())?;
        Ok(SignedVoluntaryExit { message, signature: bls_signature(&signature) })
    }
}

impl fmt::Debug for ValidatorClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatorClient")
            .field("index", &self.index)
            .field("client", &self.client_type())
            .field("keys", &self.keys.len())
            .finish()
    }
}

#[derive(Clone, Debug, Default)]
pub struct ValidatorClients(pub Vec<Arc<ValidatorClient>>);

impl ValidatorClients {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Arc<ValidatorClient>> {
        self.0.iter()
    }

    pub fn running(&self) -> ValidatorClients {
        ValidatorClients(self.0.iter().filter(|v| v.is_running()).cloned().collect())
    }

    pub fn by_validator_index(&self, index: ValidatorIndex) -> Option<&Arc<ValidatorClient>> {
        self.0.iter().find(|v| v.contains_validator_index(index))
    }

    /// Signs with whichever client owns the validator.
    pub fn sign_bls_to_execution_change(
        &self,
        domain: Domain,
        info: &BlsToExecutionChangeInfo,
    ) -> eyre::Result<SignedBlsToExecutionChange> {
        self.by_validator_index(info.validator_index)
            .ok_or(HarnessError::UnknownValidatorIndex(info.validator_index))?
            .sign_bls_to_execution_change(domain, info)
    }
}

impl From<Vec<Arc<ValidatorClient>>> for ValidatorClients {
    fn from(clients: Vec<Arc<ValidatorClient>>) -> Self {
        Self(clients)
    }
}

impl<'a> IntoIterator for &'a ValidatorClients {
    type Item = &'a Arc<ValidatorClient>;
    type IntoIter = std::slice::Iter<'a, Arc<ValidatorClient>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{IpAddr, Ipv4Addr},
        sync::{
            Mutex,
            atomic::{AtomicBool, Ordering},
        },
    };

    use async_trait::async_trait;
    use hivenet_node::ExternalClient;
    use hivenet_types::{constants::DOMAIN_VOLUNTARY_EXIT, error::harness_error};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        beacon::BeaconClientConfig,
        fake::FakeBeaconNode,
        state::tests::keys,
    };

    #[derive(Default)]
    struct StoppedClient {
        running: AtomicBool,
        options: Mutex<Vec<StartBundle>>,
    }

    #[async_trait]
    impl ManagedClient for StoppedClient {
        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn ip(&self) -> Option<IpAddr> {
            None
        }

        fn client_type(&self) -> &str {
            "lighthouse-vc"
        }

        fn add_start_option(&self, bundle: StartBundle) {
            self.options.lock().unwrap().push(bundle);
        }

        async fn start(&self) -> eyre::Result<()> {
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn shutdown(&self) -> eyre::Result<()> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn enode_url(&self) -> eyre::Result<String> {
            Err(eyre::eyre!("validator clients have no enode"))
        }
    }

    fn tranche(from: u64, to: u64) -> BTreeMap<ValidatorIndex, ValidatorKey> {
        keys(to).into_iter().enumerate().skip(from as usize).map(|(i, k)| (i as u64, k)).collect()
    }

    fn external_vc(keys: BTreeMap<ValidatorIndex, ValidatorKey>) -> ValidatorClient {
        let managed = Arc::new(ExternalClient::new("lighthouse-vc", IpAddr::V4(Ipv4Addr::LOCALHOST)));
        ValidatorClient::new(0, managed, keys, None)
    }

    #[test]
    fn bls_change_is_signed_by_withdrawal_key() {
        let vc = external_vc(tranche(0, 2));
        let domain = Domain::repeat_byte(3);
        let info = BlsToExecutionChangeInfo { validator_index: 1, execution_address: vec![0xaa; 20] };
        let signed = vc.sign_bls_to_execution_change(domain, &info).unwrap();

        let key = &vc.keys()[&1];
        assert_eq!(signed.message.to_execution_address, Address::repeat_byte(0xaa));
        assert_eq!(&signed.message.from_bls_pubkey[..], &key.withdrawal_pubkey[..]);
        let sig: [u8; 96] = signed.signature[..].try_into().unwrap();
        let root = signing_root(&signed.message, domain);
        assert!(bls::verify(&key.withdrawal_pubkey, root.as_slice(), &sig).unwrap());
        assert!(!bls::verify(&key.validator_pubkey, root.as_slice(), &sig).unwrap());
    }

    #[test]
    fn bls_change_rejects_bad_input() {
        let vc = external_vc(tranche(0, 2));
        let short = BlsToExecutionChangeInfo { validator_index: 0, execution_address: vec![1; 19] };
        let err = vc.sign_bls_to_execution_change(Domain::ZERO, &short).unwrap_err();
        assert!(matches!(harness_error(&err), Some(HarnessError::BadAddressLength(19))));

        let foreign = BlsToExecutionChangeInfo { validator_index: 7, execution_address: vec![1; 20] };
        let err = vc.sign_bls_to_execution_change(Domain::ZERO, &foreign).unwrap_err();
        assert!(matches!(harness_error(&err), Some(HarnessError::UnknownValidatorIndex(7))));
    }

    #[test]
    fn clients_route_signing_to_key_owner() {
        let clients = ValidatorClients(vec![
            Arc::new(external_vc(tranche(0, 2))),
            Arc::new(external_vc(tranche(2, 4))),
        ]);
        assert!(Arc::ptr_eq(clients.by_validator_index(3).unwrap(), &clients.0[1]));
        assert!(clients.by_validator_index(4).is_none());
        let info = BlsToExecutionChangeInfo { validator_index: 3, execution_address: vec![2; 20] };
        assert_eq!(clients.sign_bls_to_execution_change(Domain::ZERO, &info).unwrap().message.validator_index, 3);
        let pubkey = clients.0[0].keys()[&0].validator_pubkey;
        assert!(clients.0[0].contains_key(&pubkey));
        assert!(!clients.0[1].contains_key(&pubkey));
    }

    #[tokio::test]
    async fn start_skips_empty_key_sets_and_refuses_restart() {
        let stopped = Arc::new(StoppedClient::default());
        let empty = ValidatorClient::new(0, stopped.clone(), BTreeMap::new(), None);
        empty.start().await.unwrap();
        assert!(!empty.is_running());

        let vc = ValidatorClient::new(1, stopped.clone(), tranche(0, 1), None);
        vc.start().await.unwrap();
        assert!(vc.is_running());
        assert!(stopped.options.lock().unwrap().is_empty());
        let err = vc.start().await.unwrap_err();
        assert!(matches!(harness_error(&err), Some(HarnessError::ClientStartupError(..))));
    }

    #[tokio::test]
    async fn start_passes_builder_endpoint() {
        let bn = BeaconClient::new(
            BeaconClientConfig::new(0),
            Arc::new(ExternalClient::new("lighthouse-bn", IpAddr::V4(Ipv4Addr::LOCALHOST))),
        );
        bn.set_builder_endpoint("http://10.0.0.9:18550");
        let stopped = Arc::new(StoppedClient::default());
        let vc = ValidatorClient::new(0, stopped.clone(), tranche(0, 1), Some(Arc::new(bn)));
        vc.start().await.unwrap();
        let options = stopped.options.lock().unwrap();
        assert_eq!(options[0].get("HIVE_ETH2_BUILDER_ENDPOINT"), Some("http://10.0.0.9:18550"));
    }

    #[tokio::test]
    async fn signed_exit_reaches_beacon_pool() {
        let node = FakeBeaconNode::spawn().await;
        let mut config = BeaconClientConfig::new(0);
        config.api_port = node.port();
        let bn = BeaconClient::new(
            config,
            Arc::new(ExternalClient::new("lighthouse-bn", IpAddr::V4(Ipv4Addr::LOCALHOST))),
        );
        bn.init(&CancellationToken::new()).await.unwrap();

        let owned: BTreeMap<_, _> = node.keys().iter().cloned().enumerate().map(|(i, k)| (i as u64, k)).collect();
        let vc = external_vc(owned);
        let domain = bn.compute_domain(DOMAIN_VOLUNTARY_EXIT, None).await.unwrap();
        let exit = vc.sign_voluntary_exit(domain, 0, 3).unwrap();
        bn.submit_voluntary_exit(&exit).await.unwrap();

        let submitted = node.submitted_exits();
        assert_eq!(submitted, vec![exit.clone()]);
        let sig: [u8; 96] = exit.signature[..].try_into().unwrap();
        let root = signing_root(&exit.message, domain);
        assert!(bls::verify(&node.keys()[3].validator_pubkey, root.as_slice(), &sig).unwrap());
    }
}
