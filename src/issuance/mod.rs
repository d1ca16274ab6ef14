pub mod acme_workflow;
pub mod ca_client;
pub mod certificate;
pub mod issuer;
pub mod order_state;
pub mod retry;

pub use acme_workflow::AcmeLibProtocol;
pub use ca_client::{CertificateAuthorityClient, IssuedOrder};
pub use issuer::{AcmeProtocol, IssuerError};
pub use order_state::{OrderMachine, OrderState};
pub use retry::PollPolicy;
