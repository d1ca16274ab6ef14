use thiserror::Error;

/// Wire-level ACME operations, one call per CA round-trip.
///
/// Implementations hold whatever per-order state the CA library needs behind
/// the opaque [`OrderHandle`]; the order state machine drives them.
pub trait AcmeProtocol: Send + Sync {
    fn new_order(&self, identifiers: &[String]) -> Result<OrderHandle, IssuerError>;
    fn authorizations(&self, order: &OrderHandle) -> Result<Vec<Authorization>, IssuerError>;
    /// Tells the CA the challenge for `identifier` is ready to be checked.
    fn submit_challenge(
        &self,
        order: &OrderHandle,
        identifier: &str,
        kind: ChallengeKind,
    ) -> Result<(), IssuerError>;
    fn authorization_status(
        &self,
        order: &OrderHandle,
        identifier: &str,
    ) -> Result<ChallengeStatus, IssuerError>;
    fn finalize(&self, order: &OrderHandle, request: &SigningRequest) -> Result<(), IssuerError>;
    /// Returns `IssuerError::NotReady` while the CA is still processing.
    fn certificate(&self, order: &OrderHandle) -> Result<IssuedCertificate, IssuerError>;
    /// Forgets an order the caller abandoned; unknown orders are ignored.
    fn discard(&self, order: &OrderHandle);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderHandle {
    pub id: String,
    pub identifiers: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChallengeKind {
    Dns01,
    Http01,
}

impl ChallengeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeKind::Dns01 => "dns-01",
            ChallengeKind::Http01 => "http-01",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeStatus {
    Pending,
    Valid,
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeOffer {
    pub kind: ChallengeKind,
    pub token: String,
    /// What must be published: the TXT value for DNS-01, the response body for HTTP-01.
    pub proof: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub identifier: String,
    pub status: ChallengeStatus,
    pub challenges: Vec<ChallengeOffer>,
}

impl Authorization {
    pub fn offer(&self, kind: ChallengeKind) -> Option<&ChallengeOffer> {
        self.challenges.iter().find(|offer| offer.kind == kind)
    }
}

/// Key material and CSR produced by a CSR plugin.
#[derive(Clone)]
pub struct SigningRequest {
    pub common_name: String,
    pub identifiers: Vec<String>,
    pub csr_pem: String,
    pub csr_der: Vec<u8>,
    pub private_key_pem: String,
}

impl std::fmt::Debug for SigningRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningRequest")
            .field("common_name", &self.common_name)
            .field("identifiers", &self.identifiers)
            .field("csr_der_len", &self.csr_der.len())
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct IssuedCertificate {
    /// Leaf first, then issuer chain.
    pub chain_pem: String,
    pub private_key_pem: String,
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("chain_pem_len", &self.chain_pem.len())
            .finish_non_exhaustive()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IssuerError {
    #[error("issuer unavailable: {0}")]
    Unavailable(String),
    #[error("issuer configuration invalid: {0}")]
    InvalidConfig(String),
    #[error("issuer operation failed: {0}")]
    Operation(String),
    #[error("order not ready: {0}")]
    NotReady(String),
}
