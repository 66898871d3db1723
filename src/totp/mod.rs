//! Time-based one-time password factor.

pub mod crypto;
pub mod service;

pub use crypto::SeedCipher;
pub use service::{TotpEnrollment, TotpService};
