//! Device-trust SDK core for mobile banking clients.
//!
//! Establishes a cryptographically verifiable device identity, signs every
//! outbound API request with HMAC-SHA256, negotiates short-lived AES session
//! keys over ECDH P-256 and encrypts payloads with AES-256-GCM. Key material
//! lives behind the [`keystore::KeyCustody`] boundary; the SDK never handles
//! private keys directly outside of it.

mod error;
pub use error::*;

mod config;
pub use config::*;

pub mod client;
pub mod crypto;
pub mod fingerprint;
pub mod keystore;
pub mod logger;
pub mod payload;
pub mod provisioning;
pub mod reprovision;
pub mod session;
pub mod signing;
pub mod state;

// private modules
mod http_request;
