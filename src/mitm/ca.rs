//! Ephemeral Certificate Authority
//!
//! A fresh root CA is generated entirely in memory at serve start and lives
//! for the process lifetime. The private key is never serialized; the only
//! part that may leave the process is the public certificate PEM, which
//! agents install to trust the proxy. The 24 hour lifetime caps blast radius
//! if the certificate escapes.
//!
//! Leaf certificates for intercepted hosts are minted on demand, signed by
//! the CA, and cached in an LRU keyed by host.

use lru::LruCache;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose, SanType, SerialNumber,
};
use rand::RngCore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::num::NonZeroUsize;
use std::sync::Arc;
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use tracing::{debug, info};

const CA_COMMON_NAME: &str = "botlockbox";
const CA_ORGANIZATION: &str = "botlockbox ephemeral CA";
const CA_LIFETIME_HOURS: i64 = 24;
const LEAF_CACHE_SIZE: usize = 1024;

/// CA errors
#[derive(Debug, Error)]
pub enum CaError {
    #[error("generating CA key pair: {0}")]
    KeyGeneration(String),

    #[error("self-signing CA certificate: {0}")]
    CaGeneration(String),

    #[error("generating leaf certificate for {host}: {reason}")]
    LeafGeneration { host: String, reason: String },

    #[error("building TLS server config for {host}: {reason}")]
    TlsConfig { host: String, reason: String },
}

/// In-memory root CA with a per-host leaf certificate cache.
pub struct EphemeralCa {
    ca_cert: Certificate,
    ca_key: KeyPair,
    ca_pem: String,
    leaf_cache: Mutex<LruCache<String, Arc<ServerConfig>>>,
}

impl EphemeralCa {
    /// Generate a fresh CA: P-256 ECDSA key, self-signed certificate with
    /// certSign|crlSign usage, 128-bit random serial, valid from one hour in
    /// the past to 24 hours in the future.
    pub fn generate() -> Result<Self, CaError> {
        let ca_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| CaError::KeyGeneration(e.to_string()))?;

        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);

        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, CA_ORGANIZATION);
        dn.push(DnType::CommonName, CA_COMMON_NAME);
        params.distinguished_name = dn;

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::hours(1);
        params.not_after = now + Duration::hours(CA_LIFETIME_HOURS);

        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let mut serial = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut serial);
        params.serial_number = Some(SerialNumber::from(serial.to_vec()));

        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| CaError::CaGeneration(e.to_string()))?;
        let ca_pem = ca_cert.pem();

        info!(
            not_after_hours = CA_LIFETIME_HOURS,
            "ephemeral CA generated"
        );

        Ok(Self {
            ca_cert,
            ca_key,
            ca_pem,
            leaf_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(LEAF_CACHE_SIZE).expect("nonzero cache size"),
            )),
        })
    }

    /// The PEM-encoded public certificate. Safe to write to disk or hand to
    /// agents that need to trust the proxy.
    pub fn ca_pem(&self) -> &str {
        &self.ca_pem
    }

    /// Get a ready-to-serve TLS config presenting a leaf certificate for
    /// `host`, minting and caching one on first use.
    pub async fn server_config_for(&self, host: &str) -> Result<Arc<ServerConfig>, CaError> {
        {
            let mut cache = self.leaf_cache.lock().await;
            if let Some(config) = cache.get(host) {
                debug!(host = %host, "leaf certificate cache hit");
                return Ok(Arc::clone(config));
            }
        }

        debug!(host = %host, "minting leaf certificate");
        let (cert_der, key_der) = self.mint_leaf(host)?;
        let config = super::tls::terminating_server_config(cert_der, key_der).map_err(|e| {
            CaError::TlsConfig {
                host: host.to_string(),
                reason: e.to_string(),
            }
        })?;
        let config = Arc::new(config);

        let mut cache = self.leaf_cache.lock().await;
        cache.put(host.to_string(), Arc::clone(&config));
        Ok(config)
    }

    /// Mint a leaf certificate for `host` signed by the CA.
    fn mint_leaf(
        &self,
        host: &str,
    ) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>), CaError> {
        let leaf_err = |reason: String| CaError::LeafGeneration {
            host: host.to_string(),
            reason,
        };

        let leaf_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| leaf_err(e.to_string()))?;

        let mut params = CertificateParams::default();
        params.subject_alt_names = vec![SanType::DnsName(
            host.to_string()
                .try_into()
                .map_err(|e: rcgen::Error| leaf_err(e.to_string()))?,
        )];

        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, CA_ORGANIZATION);
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::hours(1);
        params.not_after = now + Duration::hours(CA_LIFETIME_HOURS);

        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];

        let mut serial = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut serial);
        params.serial_number = Some(SerialNumber::from(serial.to_vec()));

        let leaf = params
            .signed_by(&leaf_key, &self.ca_cert, &self.ca_key)
            .map_err(|e| leaf_err(e.to_string()))?;

        let cert_der = leaf.der().clone();
        let key_der =
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
        Ok((cert_der, key_der))
    }
}
