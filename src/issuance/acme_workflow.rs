//! [`AcmeProtocol`] on top of `acme-lib`.
//!
//! acme-lib's challenge validation and finalization poll the CA in loops of
//! their own. Each of those calls runs on a detached worker thread so
//! `submit_challenge` and `finalize` return at once; `authorization_status`
//! and `certificate` report the worker's result once it lands, and the order
//! state machine keeps polling on its own schedule. A worker the caller has
//! given up on ends when the CA settles the authorization or order.

use std::{
    collections::HashMap,
    fs,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
    thread,
};

use acme_lib::{
    Account, Directory, DirectoryUrl, Error as AcmeError, create_p256_key,
    order::{Auth, NewOrder},
    persist::{Persist, PersistKey, PersistKind},
};
use anyhow::{Context, Result, anyhow};
use log::{debug, info, warn};
use uuid::Uuid;

use super::issuer::{
    AcmeProtocol, Authorization, ChallengeKind, ChallengeOffer, ChallengeStatus,
    IssuedCertificate, IssuerError, OrderHandle, SigningRequest,
};
use crate::{core::config::Settings, plugins::store::write_secure_file};

const DEFAULT_REALM: &str = "acme-renewer";

/// In-memory persistence for acme-lib, seeded with the account key so nothing else touches disk.
#[derive(Clone, Default)]
pub struct EphemeralPersist {
    inner: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl EphemeralPersist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_account_key(&self, realm: &str, pem: &[u8]) -> Result<()> {
        let key = PersistKey::new(realm, PersistKind::AccountPrivateKey, "acme_account");
        self.put(&key, pem).map_err(|e| anyhow!(e.to_string()))
    }
}

impl Persist for EphemeralPersist {
    fn put(&self, key: &PersistKey, value: &[u8]) -> acme_lib::Result<()> {
        let mut lock = self
            .inner
            .lock()
            .map_err(|e| AcmeError::Other(e.to_string()))?;
        lock.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &PersistKey) -> acme_lib::Result<Option<Vec<u8>>> {
        let lock = self
            .inner
            .lock()
            .map_err(|e| AcmeError::Other(e.to_string()))?;
        Ok(lock.get(&key.to_string()).cloned())
    }
}

/// Reads the ACME account key, generating and saving a P-256 key on first use.
pub fn load_or_create_account_key(path: &Path) -> Result<String> {
    if path.exists() {
        return fs::read_to_string(path)
            .with_context(|| format!("failed to read account key {}", path.display()));
    }
    let pem = create_p256_key()
        .private_key_to_pem_pkcs8()
        .map_err(|e| anyhow!("failed to serialize account key: {e}"))?;
    let pem = String::from_utf8(pem).map_err(|_| anyhow!("account key PEM contained invalid UTF-8"))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    write_secure_file(path, pem.as_bytes(), false)?;
    info!("[acme] created account key at {}", path.display());
    Ok(pem)
}

/// Result slot of a detached worker thread.
struct Background<T> {
    slot: Arc<Mutex<Option<T>>>,
}

impl<T: Clone + Send + 'static> Background<T> {
    fn spawn(name: &str, work: impl FnOnce() -> T + Send + 'static) -> Result<Self, IssuerError> {
        let slot = Arc::new(Mutex::new(None));
        let sink = slot.clone();
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let value = work();
                match sink.lock() {
                    Ok(mut guard) => *guard = Some(value),
                    Err(poisoned) => *poisoned.into_inner() = Some(value),
                }
            })
            .map_err(|e| IssuerError::Unavailable(format!("failed to start {name}: {e}")))?;
        Ok(Self { slot })
    }

    fn finished(&self) -> Option<T> {
        match self.slot.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

struct PendingOrder {
    order: NewOrder<EphemeralPersist>,
    auths: Vec<Auth<EphemeralPersist>>,
    validations: HashMap<String, Background<ChallengeStatus>>,
    issuance: Option<Background<Result<IssuedCertificate, IssuerError>>>,
}

pub struct AcmeLibProtocol {
    account: Account<EphemeralPersist>,
    validate_delay_ms: u64,
    orders: Mutex<HashMap<String, PendingOrder>>,
}

impl AcmeLibProtocol {
    /// Connects to the configured directory and registers (or finds) the account.
    pub fn connect(settings: &Settings) -> Result<Self> {
        let account_key = load_or_create_account_key(&settings.account_key_path())?;
        let realm = settings
            .acme
            .contact_email
            .clone()
            .unwrap_or_else(|| DEFAULT_REALM.to_string());
        let persist = EphemeralPersist::new();
        persist.seed_account_key(&realm, account_key.as_bytes())?;

        let directory = Directory::from_url(
            persist,
            DirectoryUrl::Other(&settings.acme.directory_url),
        )
        .map_err(|e: AcmeError| anyhow!("failed to load ACME directory: {e}"))?;
        let contact = settings
            .acme
            .contact_email
            .as_ref()
            .map(|email| vec![format!("mailto:{email}")]);
        let account = directory
            .account_with_realm(&realm, contact)
            .map_err(|e: AcmeError| anyhow!("ACME account registration failed: {e}"))?;
        info!("[acme] account ready at {}", settings.acme.directory_url);

        Ok(Self {
            account,
            validate_delay_ms: settings.polling.initial_delay_secs.max(1) * 1000,
            orders: Mutex::new(HashMap::new()),
        })
    }

    fn orders(&self) -> MutexGuard<'_, HashMap<String, PendingOrder>> {
        match self.orders.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn unknown_order(order: &OrderHandle) -> IssuerError {
    IssuerError::Operation(format!("unknown or finished order {}", order.id))
}

fn offers(auth: &Auth<EphemeralPersist>) -> Vec<ChallengeOffer> {
    let dns = auth.dns_challenge();
    let http = auth.http_challenge();
    vec![
        ChallengeOffer {
            kind: ChallengeKind::Dns01,
            // acme-lib exposes only the derived TXT value for DNS-01.
            token: String::new(),
            proof: dns.dns_proof(),
        },
        ChallengeOffer {
            kind: ChallengeKind::Http01,
            token: http.http_token().to_string(),
            proof: http.http_proof(),
        },
    ]
}

impl AcmeProtocol for AcmeLibProtocol {
    fn new_order(&self, identifiers: &[String]) -> Result<OrderHandle, IssuerError> {
        let (primary, alt) = identifiers
            .split_first()
            .ok_or_else(|| IssuerError::InvalidConfig("order needs an identifier".into()))?;
        let alt_names: Vec<&str> = alt.iter().map(String::as_str).collect();
        let order = self
            .account
            .new_order(primary, &alt_names)
            .map_err(|e| IssuerError::Unavailable(e.to_string()))?;
        let id = Uuid::new_v4().as_simple().to_string();
        self.orders().insert(
            id.clone(),
            PendingOrder {
                order,
                auths: Vec::new(),
                validations: HashMap::new(),
                issuance: None,
            },
        );
        Ok(OrderHandle {
            id,
            identifiers: identifiers.to_vec(),
        })
    }

    fn authorizations(&self, order: &OrderHandle) -> Result<Vec<Authorization>, IssuerError> {
        let mut orders = self.orders();
        let pending = orders.get_mut(&order.id).ok_or_else(|| unknown_order(order))?;
        pending.auths = pending
            .order
            .authorizations()
            .map_err(|e| IssuerError::Operation(e.to_string()))?;
        Ok(pending
            .auths
            .iter()
            .map(|auth| Authorization {
                identifier: auth.domain_name().to_string(),
                status: if auth.need_challenge() {
                    ChallengeStatus::Pending
                } else {
                    ChallengeStatus::Valid
                },
                challenges: offers(auth),
            })
            .collect())
    }

    fn submit_challenge(
        &self,
        order: &OrderHandle,
        identifier: &str,
        kind: ChallengeKind,
    ) -> Result<(), IssuerError> {
        let mut orders = self.orders();
        let pending = orders.get_mut(&order.id).ok_or_else(|| unknown_order(order))?;
        let auth = pending
            .auths
            .iter()
            .find(|auth| auth.domain_name() == identifier)
            .ok_or_else(|| IssuerError::Operation(format!("no authorization for {identifier}")))?;
        debug!("[acme] asking CA to check {} for {}", kind.as_str(), identifier);
        let delay = self.validate_delay_ms;
        let name = identifier.to_string();
        let worker = match kind {
            ChallengeKind::Dns01 => {
                let challenge = auth.dns_challenge();
                Background::spawn("acme-validate", move || {
                    challenge_outcome(&name, kind, challenge.validate(delay))
                })?
            }
            ChallengeKind::Http01 => {
                let challenge = auth.http_challenge();
                Background::spawn("acme-validate", move || {
                    challenge_outcome(&name, kind, challenge.validate(delay))
                })?
            }
        };
        pending.validations.insert(identifier.to_string(), worker);
        Ok(())
    }

    fn authorization_status(
        &self,
        order: &OrderHandle,
        identifier: &str,
    ) -> Result<ChallengeStatus, IssuerError> {
        let orders = self.orders();
        let pending = orders.get(&order.id).ok_or_else(|| unknown_order(order))?;
        if let Some(worker) = pending.validations.get(identifier) {
            return Ok(worker.finished().unwrap_or(ChallengeStatus::Pending));
        }
        let auth = pending
            .auths
            .iter()
            .find(|auth| auth.domain_name() == identifier)
            .ok_or_else(|| IssuerError::Operation(format!("no authorization for {identifier}")))?;
        Ok(if auth.need_challenge() {
            ChallengeStatus::Pending
        } else {
            ChallengeStatus::Valid
        })
    }

    /// acme-lib derives the CSR from the private key and the order's names,
    /// so only the request's key is used here.
    fn finalize(&self, order: &OrderHandle, request: &SigningRequest) -> Result<(), IssuerError> {
        let mut orders = self.orders();
        let pending = orders.get_mut(&order.id).ok_or_else(|| unknown_order(order))?;
        let csr_order = match pending.order.confirm_validations() {
            Some(csr) => csr,
            None => {
                pending
                    .order
                    .refresh()
                    .map_err(|e| IssuerError::Unavailable(e.to_string()))?;
                pending.order.confirm_validations().ok_or_else(|| {
                    IssuerError::Operation("order is not ready for finalization".into())
                })?
            }
        };
        let delay = self.validate_delay_ms;
        let private_key_pem = request.private_key_pem.clone();
        let finalize = move || -> Result<IssuedCertificate, IssuerError> {
            let cert_order = csr_order
                .finalize(&private_key_pem, delay)
                .map_err(|e| IssuerError::Operation(e.to_string()))?;
            let certificate = cert_order
                .download_and_save_cert()
                .map_err(|e| IssuerError::Unavailable(e.to_string()))?;
            Ok(IssuedCertificate {
                chain_pem: certificate.certificate().to_string(),
                private_key_pem: certificate.private_key().to_string(),
            })
        };
        let worker = Background::spawn("acme-finalize", finalize)?;
        pending.issuance = Some(worker);
        Ok(())
    }

    fn certificate(&self, order: &OrderHandle) -> Result<IssuedCertificate, IssuerError> {
        let mut orders = self.orders();
        let pending = orders.get(&order.id).ok_or_else(|| unknown_order(order))?;
        let finished = match &pending.issuance {
            Some(worker) => worker.finished(),
            None => {
                return Err(IssuerError::Operation(format!(
                    "order {} was never finalized",
                    order.id
                )));
            }
        };
        match finished {
            Some(result) => {
                orders.remove(&order.id);
                result
            }
            None => Err(IssuerError::NotReady(format!("order {} still processing", order.id))),
        }
    }

    fn discard(&self, order: &OrderHandle) {
        if self.orders().remove(&order.id).is_some() {
            debug!("[acme] dropped order {}", order.id);
        }
    }
}

fn challenge_outcome(
    identifier: &str,
    kind: ChallengeKind,
    outcome: acme_lib::Result<()>,
) -> ChallengeStatus {
    match outcome {
        Ok(()) => ChallengeStatus::Valid,
        Err(err) => {
            warn!("[acme] {} challenge for {} failed: {}", kind.as_str(), identifier, err);
            ChallengeStatus::Invalid(err.to_string())
        }
    }
}
