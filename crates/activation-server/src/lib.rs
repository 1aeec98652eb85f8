//! Activation Server - single-use activation of approved registrations.
//!
//! This service redeems the emailed activation link of a pending
//! registration:
//! - Per-client fixed-window rate limiting of activation attempts
//! - Exactly-once token consumption with a compare-and-swap on the token digest
//! - Account provisioning with token restoration when it fails
//! - An audit trail of every attempt, with redacted subjects

pub mod activation;
pub mod api;
pub mod audit;
pub mod config;
pub mod error;
pub mod registry;

pub use activation::{ActivationOutcome, ActivationRequest, ActivationService, ActivationSettings};
pub use config::Config;
pub use error::ActivationError;
pub use registry::{
    ActivationToken, PersistentRegistry, Registration, RegistrationStatus, RegistrationStore,
    Registry, Store,
};
