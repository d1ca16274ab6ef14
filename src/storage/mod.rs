pub mod renewals;

pub use renewals::{RenewalRepository, SqliteRenewalStore};
