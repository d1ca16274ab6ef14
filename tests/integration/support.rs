use std::{
    collections::HashMap,
    net::IpAddr,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Result, anyhow};
use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};
use serde::Deserialize;
use serde_json::{Value, json};
use tempfile::TempDir;

use acme_renewer::{
    core::types::{
        CertificateInfo, PluginCategory, PluginSelection, RenewalDefinition, StoreLocation, Target,
    },
    dns::{DelegationResolver, DnsError, DnsResponse, DnsTransport, LookupClientProvider, QueryType},
    domain::DomainParser,
    issuance::{
        AcmeProtocol, CertificateAuthorityClient, IssuerError, PollPolicy,
        issuer::{
            Authorization, ChallengeKind, ChallengeOffer, ChallengeStatus, IssuedCertificate,
            OrderHandle, SigningRequest,
        },
    },
    plugins::{
        InputService, InstallationPlugin, PluginDescriptor, PluginFactory, PluginInstance,
        PluginRegistry, PluginServices, StorePlugin,
        validation::{Dns01Validation, RecordPublisher},
    },
    renewal::{RenewalManager, RenewalOrchestrator},
    storage::SqliteRenewalStore,
};

pub const FAKE_DNS: &str = "fake-dns";
pub const BROKEN_STORE: &str = "broken-store";
pub const FAKE_INSTALL: &str = "fake-install";

/// Ordered log shared between the fakes and the test body.
#[derive(Clone, Default)]
pub struct Events(Arc<Mutex<Vec<String>>>);

impl Events {
    pub fn push(&self, event: String) {
        self.0.lock().unwrap().push(event);
    }

    pub fn all(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn starting_with(&self, prefix: &str) -> Vec<String> {
        self.all()
            .into_iter()
            .filter(|event| event.starts_with(prefix))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaMode {
    /// Every authorization turns valid on the first poll.
    Valid,
    /// Authorizations stay pending forever.
    NeverValid,
    /// The named identifier is rejected, the rest turn valid.
    Reject(String),
}

/// In-process CA that signs a real chain for whatever the order asked for.
pub struct FakeCa {
    mode: Mutex<CaMode>,
    orders: Mutex<u32>,
    issued: Mutex<HashMap<String, IssuedCertificate>>,
    pub events: Events,
}

impl FakeCa {
    pub fn new(mode: CaMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            orders: Mutex::new(0),
            issued: Mutex::new(HashMap::new()),
            events: Events::default(),
        }
    }

    pub fn set_mode(&self, mode: CaMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn calls(&self) -> Vec<String> {
        self.events.all()
    }
}

impl AcmeProtocol for FakeCa {
    fn new_order(&self, identifiers: &[String]) -> Result<OrderHandle, IssuerError> {
        let mut orders = self.orders.lock().unwrap();
        *orders += 1;
        self.events.push(format!("new_order {}", identifiers.join(",")));
        Ok(OrderHandle {
            id: format!("order-{orders}"),
            identifiers: identifiers.to_vec(),
        })
    }

    fn authorizations(&self, order: &OrderHandle) -> Result<Vec<Authorization>, IssuerError> {
        Ok(order
            .identifiers
            .iter()
            .map(|identifier| Authorization {
                identifier: identifier.clone(),
                status: ChallengeStatus::Pending,
                challenges: vec![
                    ChallengeOffer {
                        kind: ChallengeKind::Dns01,
                        token: format!("token-{identifier}"),
                        proof: proof_for(identifier),
                    },
                    ChallengeOffer {
                        kind: ChallengeKind::Http01,
                        token: format!("token-{identifier}"),
                        proof: format!("token-{identifier}.thumbprint"),
                    },
                ],
            })
            .collect())
    }

    fn submit_challenge(
        &self,
        _order: &OrderHandle,
        identifier: &str,
        kind: ChallengeKind,
    ) -> Result<(), IssuerError> {
        self.events.push(format!("submit {identifier} {}", kind.as_str()));
        Ok(())
    }

    fn authorization_status(
        &self,
        _order: &OrderHandle,
        identifier: &str,
    ) -> Result<ChallengeStatus, IssuerError> {
        Ok(match &*self.mode.lock().unwrap() {
            CaMode::Valid => ChallengeStatus::Valid,
            CaMode::NeverValid => ChallengeStatus::Pending,
            CaMode::Reject(rejected) if rejected == identifier => {
                ChallengeStatus::Invalid("incorrect TXT record".into())
            }
            CaMode::Reject(_) => ChallengeStatus::Valid,
        })
    }

    fn finalize(&self, order: &OrderHandle, request: &SigningRequest) -> Result<(), IssuerError> {
        self.events.push(format!("finalize {}", order.id));
        let names: Vec<&str> = order.identifiers.iter().map(String::as_str).collect();
        let chain_pem = signed_chain(&names).map_err(|err| IssuerError::Operation(err.to_string()))?;
        self.issued.lock().unwrap().insert(
            order.id.clone(),
            IssuedCertificate {
                chain_pem,
                private_key_pem: request.private_key_pem.clone(),
            },
        );
        Ok(())
    }

    fn certificate(&self, order: &OrderHandle) -> Result<IssuedCertificate, IssuerError> {
        self.issued
            .lock()
            .unwrap()
            .get(&order.id)
            .cloned()
            .ok_or_else(|| IssuerError::NotReady(order.id.clone()))
    }

    fn discard(&self, order: &OrderHandle) {
        self.events.push(format!("discard {}", order.id));
    }
}

pub fn proof_for(identifier: &str) -> String {
    format!("proof-{identifier}")
}

/// Leaf for `names` plus the throwaway issuer that signed it.
pub fn signed_chain(names: &[&str]) -> Result<String> {
    let mut ca_params = CertificateParams::new(vec!["fake-ca.test".to_string()])?;
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_key = KeyPair::generate()?;
    let ca = ca_params.self_signed(&ca_key)?;

    let mut leaf_params =
        CertificateParams::new(names.iter().map(|name| name.to_string()).collect::<Vec<_>>())?;
    leaf_params.is_ca = IsCa::NoCa;
    let leaf_key = KeyPair::generate()?;
    let leaf = leaf_params.signed_by(&leaf_key, &ca, &ca_key)?;
    Ok(format!("{}{}", leaf.pem(), ca.pem()))
}

struct RecordingPublisher {
    events: Events,
}

impl RecordPublisher for RecordingPublisher {
    fn name(&self) -> &'static str {
        FAKE_DNS
    }

    fn create_record(&self, identifier: &str, record_name: &str, value: &str) -> Result<()> {
        self.events
            .push(format!("create {identifier} {record_name} {value}"));
        Ok(())
    }

    fn delete_record(&self, identifier: &str, record_name: &str, _value: &str) -> Result<()> {
        self.events.push(format!("delete {identifier} {record_name}"));
        Ok(())
    }
}

/// DNS-01 validation that publishes into an in-memory log.
pub struct RecordingDnsFactory {
    pub events: Events,
}

impl PluginFactory for RecordingDnsFactory {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            id: FAKE_DNS,
            category: PluginCategory::Validation,
            description: "records DNS-01 publications",
        }
    }

    fn default_options(&self, arguments: &Value) -> Result<Value> {
        Ok(arguments.clone())
    }

    fn acquire_options(&self, _target: Option<&Target>, _input: &dyn InputService) -> Result<Value> {
        Ok(json!({}))
    }

    fn create(&self, _options: &Value, services: &PluginServices) -> Result<PluginInstance> {
        Ok(PluginInstance::Validation(Box::new(Dns01Validation::new(
            Box::new(RecordingPublisher {
                events: self.events.clone(),
            }),
            services,
        ))))
    }
}

struct BrokenStore;

impl StorePlugin for BrokenStore {
    fn save(&self, _certificate: &CertificateInfo) -> Result<StoreLocation> {
        Err(anyhow!("disk full"))
    }
}

pub struct BrokenStoreFactory;

impl PluginFactory for BrokenStoreFactory {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            id: BROKEN_STORE,
            category: PluginCategory::Store,
            description: "always fails",
        }
    }

    fn default_options(&self, arguments: &Value) -> Result<Value> {
        Ok(arguments.clone())
    }

    fn acquire_options(&self, _target: Option<&Target>, _input: &dyn InputService) -> Result<Value> {
        Ok(json!({}))
    }

    fn create(&self, _options: &Value, _services: &PluginServices) -> Result<PluginInstance> {
        Ok(PluginInstance::Store(Box::new(BrokenStore)))
    }
}

#[derive(Debug, Default, Deserialize)]
struct InstallOptions {
    #[serde(default)]
    fail: bool,
}

struct RecordingInstallation {
    events: Events,
    fail: bool,
}

impl InstallationPlugin for RecordingInstallation {
    fn install(
        &self,
        stores: &[StoreLocation],
        new_certificate: &CertificateInfo,
        old_certificate: Option<&CertificateInfo>,
    ) -> Result<()> {
        let stores: Vec<&str> = stores.iter().map(|store| store.plugin.as_str()).collect();
        self.events.push(format!(
            "install stores={} new={} old={}",
            stores.join(","),
            new_certificate.thumbprint,
            old_certificate.map_or("none", |old| old.thumbprint.as_str())
        ));
        if self.fail {
            return Err(anyhow!("service refused the certificate"));
        }
        Ok(())
    }
}

pub struct RecordingInstallFactory {
    pub events: Events,
}

impl PluginFactory for RecordingInstallFactory {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            id: FAKE_INSTALL,
            category: PluginCategory::Installation,
            description: "records installations",
        }
    }

    fn default_options(&self, arguments: &Value) -> Result<Value> {
        Ok(arguments.clone())
    }

    fn acquire_options(&self, _target: Option<&Target>, _input: &dyn InputService) -> Result<Value> {
        Ok(json!({}))
    }

    fn create(&self, options: &Value, _services: &PluginServices) -> Result<PluginInstance> {
        let options: InstallOptions = serde_json::from_value(options.clone())?;
        Ok(PluginInstance::Installation(Box::new(RecordingInstallation {
            events: self.events.clone(),
            fail: options.fail,
        })))
    }
}

type QueryKey = (IpAddr, String, QueryType);

/// Answers only what it was scripted with; everything else times out.
#[derive(Default)]
pub struct ScriptedTransport {
    responses: HashMap<QueryKey, DnsResponse>,
    calls: Mutex<Vec<QueryKey>>,
}

impl ScriptedTransport {
    pub fn on(mut self, server: &str, name: &str, query_type: QueryType, response: DnsResponse) -> Self {
        self.responses
            .insert((ip(server), name.to_string(), query_type), response);
        self
    }

    pub fn calls(&self) -> Vec<QueryKey> {
        self.calls.lock().unwrap().clone()
    }
}

impl DnsTransport for ScriptedTransport {
    fn query(&self, name: &str, query_type: QueryType, server: IpAddr) -> Result<DnsResponse, DnsError> {
        let key = (server, name.to_string(), query_type);
        self.calls.lock().unwrap().push(key.clone());
        self.responses.get(&key).cloned().ok_or(DnsError::Transient {
            name: name.to_string(),
            query_type,
            server,
            reason: "timed out".into(),
        })
    }
}

/// Treats the last two labels as the registrable domain.
pub struct LastTwoLabels;

impl DomainParser for LastTwoLabels {
    fn registrable_domain(&self, hostname: &str) -> Option<String> {
        let labels: Vec<&str> = hostname.split('.').collect();
        (labels.len() >= 2).then(|| labels[labels.len() - 2..].join("."))
    }
}

pub fn ip(raw: &str) -> IpAddr {
    raw.parse().unwrap()
}

pub fn answers(records: Vec<acme_renewer::dns::DnsRecord>) -> DnsResponse {
    DnsResponse {
        server: None,
        answers: records,
        authorities: vec![],
    }
}

pub fn resolver(transport: Arc<ScriptedTransport>, servers: &[&str]) -> DelegationResolver {
    let servers: Vec<IpAddr> = servers.iter().map(|server| ip(server)).collect();
    let provider = LookupClientProvider::new(&servers, transport).unwrap();
    DelegationResolver::new(provider, Arc::new(LastTwoLabels))
}

/// A manager wired to the fake CA, the recording plugins and the builtin ones.
pub struct Harness {
    pub dir: TempDir,
    pub ca: Arc<FakeCa>,
    pub events: Events,
    pub sleeps: Arc<Mutex<Vec<Duration>>>,
    pub repository: Arc<SqliteRenewalStore>,
    pub manager: RenewalManager,
}

pub struct HarnessOptions {
    pub mode: CaMode,
    pub poll: PollPolicy,
    pub resolver: Option<Arc<DelegationResolver>>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            mode: CaMode::Valid,
            poll: PollPolicy::new(3, Duration::from_secs(1), Duration::from_secs(5)),
            resolver: None,
        }
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with(HarnessOptions::default())
    }

    pub fn with(options: HarnessOptions) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let events = Events::default();
        let ca = Arc::new(FakeCa::new(options.mode));

        let mut registry = PluginRegistry::with_builtin();
        registry.register(Arc::new(RecordingDnsFactory {
            events: events.clone(),
        }));
        registry.register(Arc::new(BrokenStoreFactory));
        registry.register(Arc::new(RecordingInstallFactory {
            events: events.clone(),
        }));

        let services = PluginServices {
            resolver: options.resolver,
            preflight_attempts: 2,
            preflight_delay: Duration::ZERO,
            http_timeout: Duration::from_secs(2),
            key_cache_dir: dir.path().join("keys"),
        };

        let sleeps = Arc::new(Mutex::new(Vec::new()));
        let recorded = sleeps.clone();
        let poll = options
            .poll
            .with_sleeper(move |delay| recorded.lock().unwrap().push(delay));
        let client = CertificateAuthorityClient::new(ca.clone(), poll);
        let orchestrator = RenewalOrchestrator::new(Arc::new(registry), services, client);
        let repository = Arc::new(SqliteRenewalStore::in_memory().unwrap());
        let manager = RenewalManager::new(repository.clone(), orchestrator, 30);

        Self {
            dir,
            ca,
            events,
            sleeps,
            repository,
            manager,
        }
    }

    pub fn store_root(&self) -> PathBuf {
        self.dir.path().join("certs")
    }

    pub fn pem_store(&self) -> PluginSelection {
        pem_store(&self.store_root())
    }

    /// Manual target over `hosts`, recording DNS-01, EC key, PEM files.
    pub fn definition(&self, hosts: &[&str]) -> RenewalDefinition {
        RenewalDefinition::new(
            "integration",
            PluginSelection::new("manual", json!({ "hosts": hosts })),
            PluginSelection::new(FAKE_DNS, json!({})),
            PluginSelection::new("ec", json!({})),
            vec![self.pem_store()],
            vec![],
        )
    }

    pub fn recorded_sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

pub fn pem_store(path: &Path) -> PluginSelection {
    PluginSelection::new(
        "pem-files",
        json!({ "path": path, "include_private_key": true }),
    )
}

pub fn install(fail: bool) -> PluginSelection {
    PluginSelection::new(FAKE_INSTALL, json!({ "fail": fail }))
}
