//! botlockbox - credential-injecting HTTPS/HTTP MITM forward proxy
//!
//! Semi-trusted local programs (coding agents, CI runners, bots) route
//! their traffic through the proxy and trust its ephemeral root CA. The
//! proxy terminates their TLS, rewrites matching requests by substituting
//! `{{secrets.name}}` placeholders with values unsealed from an
//! age-encrypted envelope, verifies upstream TLS, and scrubs known
//! credential shapes from response bodies.
//!
//! ## Architecture
//!
//! - `config` - YAML rule model and the AllowedHosts derivation
//! - `matcher` - exact and `*.suffix` host matching
//! - `secrets` - sealed envelope (age) and protected in-memory store
//! - `injector` - per-request rule enforcement and atomic rotation
//! - `mitm` - ephemeral CA, TLS configs, and the proxy front-end
//! - `upstream` - verifying upstream HTTP client
//! - `scrubber` - response-body credential redaction
//! - `audit` - one JSON line per injection attempt, names only
//!
//! The envelope is the trust anchor: it freezes which hosts each secret may
//! reach, and neither a config edit nor a reload can widen that binding
//! without an operator re-sealing.

pub mod audit;
pub mod cli;
pub mod config;
pub mod harden;
pub mod injector;
pub mod matcher;
pub mod mitm;
pub mod scrubber;
pub mod secrets;
pub mod upstream;

pub use config::{Config, ConfigError, Inject, Match, Rule};
pub use injector::{Handled, Injector, SwapError, SwapRejected};
pub use matcher::{host_matches, rule_matches};
pub use mitm::{EphemeralCa, ProxyServer};
pub use secrets::{AllowedHosts, SealedEnvelope, SecretStore};
pub use upstream::{UpstreamClient, UpstreamError};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
        assert_eq!(NAME, "botlockbox");
    }
}
