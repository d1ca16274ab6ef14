//! Unattended ACME certificate renewal.
//!
//! A [`renewal::RenewalManager`] loads persisted definitions and hands each due
//! one to the [`renewal::RenewalOrchestrator`], which runs the plugin chain
//! (target, validation, CSR, CA order, stores, installations). DNS-01 records
//! are read back from their authoritative servers through
//! [`dns::DelegationResolver`] before the CA is asked to look.

pub mod core;
pub mod dns;
pub mod domain;
pub mod issuance;
pub mod plugins;
pub mod renewal;
pub mod storage;
