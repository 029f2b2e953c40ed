//! Protected in-memory secret storage
//!
//! Each secret lives in a protected buffer. The contract:
//!
//! - `put` copies the plaintext and immediately zeroes the caller's bytes
//! - `view` yields a bounded-lifetime copy whose backing storage is zeroed
//!   when the view is released (dropped)
//! - `destroy` wipes a buffer; all later views of it fail
//!
//! Concurrent views of the same secret each get their own zeroed-on-release
//! copy. Page pinning and core-dump exclusion are applied process-wide at
//! startup (see `harden`), not per buffer.

use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

/// Secret store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("secret {0:?} not found in store")]
    NotFound(String),

    #[error("secret {0:?} has been destroyed")]
    Destroyed(String),
}

/// A single secret held in memory, zeroed on destruction and on drop.
struct ProtectedBuffer {
    /// `None` after explicit destruction.
    bytes: Option<Zeroizing<Vec<u8>>>,
}

impl ProtectedBuffer {
    /// Copy `plaintext` into the buffer and zero the source bytes.
    fn new(plaintext: &mut [u8]) -> Self {
        let copied = Zeroizing::new(plaintext.to_vec());
        plaintext.zeroize();
        Self { bytes: Some(copied) }
    }

    fn destroy(&mut self) {
        // Zeroizing wipes the contents as the allocation is dropped.
        self.bytes = None;
    }
}

/// A short-lived view of a secret's plaintext. The backing bytes are zeroed
/// when the view is dropped; callers must not copy the plaintext out beyond
/// the single use it was opened for.
pub struct SecretView {
    bytes: Zeroizing<Vec<u8>>,
}

impl SecretView {
    /// The plaintext bytes. Valid only while the view is alive.
    pub fn expose(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for SecretView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretView")
            .field("bytes", &"[REDACTED]")
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Mapping from secret name to protected buffer.
pub struct SecretStore {
    buffers: HashMap<String, ProtectedBuffer>,
}

impl SecretStore {
    pub fn new() -> Self {
        Self {
            buffers: HashMap::new(),
        }
    }

    /// Store a secret, zeroing the caller's plaintext bytes.
    pub fn put(&mut self, name: impl Into<String>, plaintext: &mut [u8]) {
        self.buffers
            .insert(name.into(), ProtectedBuffer::new(plaintext));
    }

    /// Open a view of a secret's plaintext.
    pub fn view(&self, name: &str) -> Result<SecretView, StoreError> {
        let buffer = self
            .buffers
            .get(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        let bytes = buffer
            .bytes
            .as_ref()
            .ok_or_else(|| StoreError::Destroyed(name.to_string()))?;
        Ok(SecretView {
            bytes: Zeroizing::new(bytes.to_vec()),
        })
    }

    /// Destroy a single secret. Later views of it fail.
    pub fn destroy(&mut self, name: &str) {
        if let Some(buffer) = self.buffers.get_mut(name) {
            buffer.destroy();
        }
    }

    /// Destroy every secret in the store.
    pub fn destroy_all(&mut self) {
        for buffer in self.buffers.values_mut() {
            buffer.destroy();
        }
    }

    /// Whether a (live or destroyed) entry exists for `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.buffers.contains_key(name)
    }

    /// Secret names currently in the store, without exposing values.
    pub fn names(&self) -> Vec<&str> {
        self.buffers.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

impl Default for SecretStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretStore")
            .field("count", &self.buffers.len())
            .field("names", &self.names())
            .finish()
    }
}
