//! Client for the hosted identity provider that owns verified accounts,
//! profile rows and one-time sign-in links.

mod client;
mod error;
mod types;

pub use client::IdentityClient;
pub use error::IdentityError;
pub use types::*;
