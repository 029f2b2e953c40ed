//! Sealed envelope and in-memory secret store
//!
//! The envelope binds each secret to the exact set of hosts it may be sent
//! to and travels on disk only in age-encrypted form. The store holds the
//! unsealed values in protected buffers that zero their plaintext on release
//! and on destruction.

pub mod envelope;
pub mod store;

pub use envelope::{
    allowed_hosts_equal, parse_identities, parse_recipient, AllowedHostsDiff, EnvelopeError,
    SealedEnvelope, ENVELOPE_VERSION,
};
pub use store::{SecretStore, SecretView, StoreError};

use std::collections::HashMap;

/// Secret name to the set of host patterns it may be injected against.
/// Value semantics: pattern order and duplicates are irrelevant.
pub type AllowedHosts = HashMap<String, Vec<String>>;
