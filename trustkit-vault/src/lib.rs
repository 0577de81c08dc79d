//! Envelope-encrypted local storage.
//!
//! Each stored item gets its own random AES-256 data key; the item is
//! sealed with AES-256-GCM and the data key is wrapped with an RSA-2048
//! key held behind [`trustkit_core::keystore::KeyCustody`]. Reading an
//! item unwraps its data key in custody and decrypts in memory; the RSA
//! private key never leaves the custody boundary.

mod error;
pub use error::VaultError;

mod envelope;
pub use envelope::VaultEnvelope;

mod backend;
pub use backend::{FsBackend, MemoryBackend, VaultBackend};

mod vault;
pub use vault::SecureVault;
