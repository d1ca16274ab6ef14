pub mod manager;
pub mod orchestrator;

pub use manager::RenewalManager;
pub use orchestrator::RenewalOrchestrator;
