//! MITM interception
//!
//! TLS interception for the forward proxy:
//! - ephemeral in-memory certificate authority with per-host leaf minting
//! - hardened TLS configs for both sides of the interception
//! - the proxy front-end that terminates CONNECT tunnels

pub mod ca;
pub mod server;
pub mod tls;

pub use ca::{CaError, EphemeralCa};
pub use server::ProxyServer;
pub use tls::{terminating_server_config, verifying_client_config, TlsError};
