//! Sealed envelope
//!
//! The envelope is the trust anchor of the system: it binds each secret to
//! the exact set of hosts it is allowed to reach, as committed by the
//! operator at seal time. On disk it exists only as the age-encrypted
//! serialization of the JSON form below; the recipient key is an X25519
//! public key.
//!
//! Validation is deliberately asymmetric. The live config may ask for a
//! subset of what was sealed (a re-seal superset is legal), but any secret or
//! host the config adds beyond the sealed binding is a policy violation that
//! names the offender.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::path::Path;
use thiserror::Error;

use super::store::SecretStore;
use super::AllowedHosts;

/// Current on-disk envelope version.
pub const ENVELOPE_VERSION: u32 = 1;

/// Envelope errors
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error(
        "secret {name:?} is referenced in the config but was not present at seal time; \
         re-seal to add new secrets"
    )]
    UnknownSecret { name: String },

    #[error(
        "config uses secret {name:?} against host {host:?}, but that host was not \
         committed at seal time (sealed allowed hosts for {name:?}: {sealed:?}); \
         re-run `botlockbox seal` with the updated config to add hosts"
    )]
    HostNotCommitted {
        name: String,
        host: String,
        sealed: Vec<String>,
    },

    #[error("unsupported envelope version {0} (expected {ENVELOPE_VERSION})")]
    UnsupportedVersion(u32),

    #[error("encrypting envelope: {0}")]
    Encrypt(String),

    #[error("decrypting envelope: {0}")]
    Decrypt(String),

    #[error("parsing age identity: {0}")]
    Identity(String),

    #[error("parsing age recipient: {0}")]
    Recipient(String),

    #[error("envelope serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error("envelope I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// The structure that gets age-encrypted to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedEnvelope {
    pub version: u32,
    pub sealed_at: DateTime<Utc>,
    pub allowed_hosts: AllowedHosts,
    pub secrets: HashMap<String, String>,
}

impl SealedEnvelope {
    /// Build a fresh envelope stamped with the current time.
    pub fn new(allowed_hosts: AllowedHosts, secrets: HashMap<String, String>) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            sealed_at: Utc::now(),
            allowed_hosts,
            secrets,
        }
    }

    /// Check that every secret+host pair the config asks for is present in
    /// the sealed allowed-hosts map. Envelope-side extras are tolerated;
    /// config-side extras fail with an error naming the new secret or host.
    pub fn validate(&self, config_allowed_hosts: &AllowedHosts) -> Result<(), EnvelopeError> {
        for (secret_name, config_hosts) in config_allowed_hosts {
            let sealed_hosts = self.allowed_hosts.get(secret_name).ok_or_else(|| {
                EnvelopeError::UnknownSecret {
                    name: secret_name.clone(),
                }
            })?;

            let sealed_set: HashSet<&str> = sealed_hosts.iter().map(String::as_str).collect();
            for config_host in config_hosts {
                if !sealed_set.contains(config_host.as_str()) {
                    return Err(EnvelopeError::HostNotCommitted {
                        name: secret_name.clone(),
                        host: config_host.clone(),
                        sealed: sealed_hosts.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Serialize to JSON and age-encrypt to `out` for a single recipient.
    pub fn seal(
        &self,
        recipient: &age::x25519::Recipient,
        out: impl Write,
    ) -> Result<(), EnvelopeError> {
        let payload = serde_json::to_vec(self)?;

        let recipients: Vec<Box<dyn age::Recipient + Send>> = vec![Box::new(recipient.clone())];
        let encryptor = age::Encryptor::with_recipients(recipients)
            .ok_or_else(|| EnvelopeError::Encrypt("no recipients supplied".to_string()))?;

        let mut writer = encryptor
            .wrap_output(out)
            .map_err(|e| EnvelopeError::Encrypt(e.to_string()))?;
        writer.write_all(&payload)?;
        writer
            .finish()
            .map_err(|e| EnvelopeError::Encrypt(e.to_string()))?;
        Ok(())
    }

    /// Decrypt from `input` with the given identities and deserialize.
    pub fn unseal(
        identities: &[age::x25519::Identity],
        input: impl Read,
    ) -> Result<Self, EnvelopeError> {
        let decryptor = match age::Decryptor::new(input)
            .map_err(|e| EnvelopeError::Decrypt(e.to_string()))?
        {
            age::Decryptor::Recipients(d) => d,
            age::Decryptor::Passphrase(_) => {
                return Err(EnvelopeError::Decrypt(
                    "file is passphrase-encrypted; expected recipient encryption".to_string(),
                ))
            }
        };

        let mut reader = decryptor
            .decrypt(identities.iter().map(|i| i as &dyn age::Identity))
            .map_err(|e| EnvelopeError::Decrypt(e.to_string()))?;

        let mut payload = Vec::new();
        reader.read_to_end(&mut payload)?;

        let envelope: SealedEnvelope = serde_json::from_slice(&payload)?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(EnvelopeError::UnsupportedVersion(envelope.version));
        }
        Ok(envelope)
    }

    /// Seal to a file with 0600 permissions, creating the parent directory
    /// with 0700 if needed.
    pub fn seal_to_file(
        &self,
        recipient: &age::x25519::Recipient,
        path: impl AsRef<Path>,
    ) -> Result<(), EnvelopeError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                std::fs::create_dir_all(dir)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
                }
            }
        }

        let mut opts = std::fs::OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let file = opts.open(path)?;
        self.seal(recipient, file)
    }

    /// Unseal from a file on disk.
    pub fn unseal_from_file(
        identities: &[age::x25519::Identity],
        path: impl AsRef<Path>,
    ) -> Result<Self, EnvelopeError> {
        let file = std::fs::File::open(path.as_ref())?;
        Self::unseal(identities, file)
    }

    /// Drain the plaintext secrets into a protected store. The envelope's
    /// own `secrets` map is left empty; the retained copy carries only the
    /// allowed-hosts binding and metadata.
    pub fn take_store(&mut self) -> SecretStore {
        let mut store = SecretStore::new();
        for (name, value) in std::mem::take(&mut self.secrets) {
            let mut bytes = value.into_bytes();
            store.put(name, &mut bytes);
        }
        store
    }
}

/// How two allowed-hosts maps differ. Rotation uses this to name the first
/// divergence when rejecting a reload.
#[derive(Debug, Error)]
pub enum AllowedHostsDiff {
    #[error("key count changed: {old} -> {new}")]
    KeyCount { old: usize, new: usize },

    #[error("secret {name:?} removed from allowed hosts")]
    SecretRemoved { name: String },

    #[error("secret {name:?} host count changed: {old} -> {new}")]
    HostCount {
        name: String,
        old: usize,
        new: usize,
    },

    #[error("secret {name:?} host {host:?} removed from allowed hosts")]
    HostRemoved { name: String, host: String },
}

/// Compare two allowed-hosts maps as set-valued maps: same key set, and per
/// key the same set of host patterns regardless of order or duplicates
/// within a list of equal length.
pub fn allowed_hosts_equal(
    old: &AllowedHosts,
    new: &AllowedHosts,
) -> Result<(), AllowedHostsDiff> {
    if old.len() != new.len() {
        return Err(AllowedHostsDiff::KeyCount {
            old: old.len(),
            new: new.len(),
        });
    }
    for (secret_name, old_hosts) in old {
        let new_hosts = new
            .get(secret_name)
            .ok_or_else(|| AllowedHostsDiff::SecretRemoved {
                name: secret_name.clone(),
            })?;
        if old_hosts.len() != new_hosts.len() {
            return Err(AllowedHostsDiff::HostCount {
                name: secret_name.clone(),
                old: old_hosts.len(),
                new: new_hosts.len(),
            });
        }
        let new_set: HashSet<&str> = new_hosts.iter().map(String::as_str).collect();
        for host in old_hosts {
            if !new_set.contains(host.as_str()) {
                return Err(AllowedHostsDiff::HostRemoved {
                    name: secret_name.clone(),
                    host: host.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Parse age X25519 identities from file contents. Comment lines (`#`) and
/// blank lines are skipped, matching the age identity file format.
pub fn parse_identities(contents: &str) -> Result<Vec<age::x25519::Identity>, EnvelopeError> {
    let mut identities = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let identity = line
            .parse::<age::x25519::Identity>()
            .map_err(|e| EnvelopeError::Identity(e.to_string()))?;
        identities.push(identity);
    }
    if identities.is_empty() {
        return Err(EnvelopeError::Identity(
            "no identities found".to_string(),
        ));
    }
    Ok(identities)
}

/// Parse an X25519 recipient public key string (`age1...`).
pub fn parse_recipient(s: &str) -> Result<age::x25519::Recipient, EnvelopeError> {
    s.trim()
        .parse::<age::x25519::Recipient>()
        .map_err(|e| EnvelopeError::Recipient(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn envelope_with(allowed: AllowedHosts) -> SealedEnvelope {
        SealedEnvelope::new(allowed, HashMap::new())
    }

    #[test]
    fn test_validate_exact_match() {
        let mut allowed = AllowedHosts::new();
        allowed.insert("tok".into(), hosts(&["api.example.com"]));
        let envelope = envelope_with(allowed.clone());
        assert!(envelope.validate(&allowed).is_ok());
    }

    #[test]
    fn test_validate_envelope_superset_ok() {
        let mut sealed = AllowedHosts::new();
        sealed.insert("tok".into(), hosts(&["api.example.com", "extra.example.com"]));
        sealed.insert("unused".into(), hosts(&["other.com"]));
        let envelope = envelope_with(sealed);

        let mut config = AllowedHosts::new();
        config.insert("tok".into(), hosts(&["api.example.com"]));
        assert!(envelope.validate(&config).is_ok());
    }

    #[test]
    fn test_validate_unknown_secret() {
        let envelope = envelope_with(AllowedHosts::new());

        let mut config = AllowedHosts::new();
        config.insert("tok".into(), hosts(&["api.example.com"]));

        let err = envelope.validate(&config).unwrap_err();
        match err {
            EnvelopeError::UnknownSecret { name } => assert_eq!(name, "tok"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_validate_host_not_committed_names_offender() {
        let mut sealed = AllowedHosts::new();
        sealed.insert("tok".into(), hosts(&["api.other.com"]));
        let envelope = envelope_with(sealed);

        let mut config = AllowedHosts::new();
        config.insert("tok".into(), hosts(&["api.example.com"]));

        let err = envelope.validate(&config).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("tok"));
        assert!(msg.contains("api.example.com"));
        assert!(msg.contains("api.other.com"));
    }

    #[test]
    fn test_allowed_hosts_equal_cases() {
        let make = |pairs: &[(&str, &[&str])]| {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), hosts(v)))
                .collect::<AllowedHosts>()
        };

        // identical
        let a = make(&[("tok", &["a.com", "b.com"]), ("key", &["c.com"])]);
        assert!(allowed_hosts_equal(&a, &a.clone()).is_ok());

        // order differs, still equal
        let b = make(&[("tok", &["b.com", "a.com"]), ("key", &["c.com"])]);
        assert!(allowed_hosts_equal(&a, &b).is_ok());

        // both empty
        assert!(allowed_hosts_equal(&AllowedHosts::new(), &AllowedHosts::new()).is_ok());

        // extra key in new
        let extra = make(&[
            ("tok", &["a.com", "b.com"]),
            ("key", &["c.com"]),
            ("more", &["d.com"]),
        ]);
        assert!(matches!(
            allowed_hosts_equal(&a, &extra),
            Err(AllowedHostsDiff::KeyCount { .. })
        ));

        // key renamed
        let renamed = make(&[("tok", &["a.com", "b.com"]), ("other", &["c.com"])]);
        assert!(matches!(
            allowed_hosts_equal(&a, &renamed),
            Err(AllowedHostsDiff::SecretRemoved { .. })
        ));

        // host added
        let grown = make(&[("tok", &["a.com", "b.com", "x.com"]), ("key", &["c.com"])]);
        assert!(matches!(
            allowed_hosts_equal(&a, &grown),
            Err(AllowedHostsDiff::HostCount { .. })
        ));

        // host swapped
        let swapped = make(&[("tok", &["a.com", "z.com"]), ("key", &["c.com"])]);
        assert!(matches!(
            allowed_hosts_equal(&a, &swapped),
            Err(AllowedHostsDiff::HostRemoved { .. })
        ));
    }

    #[test]
    fn test_seal_unseal_roundtrip() {
        let identity = age::x25519::Identity::generate();
        let recipient = identity.to_public();

        let mut allowed = AllowedHosts::new();
        allowed.insert("tok".into(), hosts(&["api.example.com"]));
        let mut secrets = HashMap::new();
        secrets.insert("tok".to_string(), "ABC".to_string());

        let envelope = SealedEnvelope::new(allowed.clone(), secrets);

        let mut sealed = Vec::new();
        envelope.seal(&recipient, &mut sealed).unwrap();
        // Ciphertext must not leak the plaintext.
        assert!(!sealed
            .windows(3)
            .any(|w| w == b"ABC" || w == b"tok"));

        let unsealed = SealedEnvelope::unseal(&[identity], &sealed[..]).unwrap();
        assert_eq!(unsealed.version, ENVELOPE_VERSION);
        assert_eq!(unsealed.allowed_hosts, allowed);
        assert_eq!(unsealed.secrets.get("tok").unwrap(), "ABC");
    }

    #[test]
    fn test_unseal_wrong_identity_fails() {
        let identity = age::x25519::Identity::generate();
        let envelope = SealedEnvelope::new(AllowedHosts::new(), HashMap::new());

        let mut sealed = Vec::new();
        envelope.seal(&identity.to_public(), &mut sealed).unwrap();

        let wrong = age::x25519::Identity::generate();
        assert!(matches!(
            SealedEnvelope::unseal(&[wrong], &sealed[..]),
            Err(EnvelopeError::Decrypt(_))
        ));
    }

    #[test]
    fn test_take_store_moves_and_clears() {
        let mut secrets = HashMap::new();
        secrets.insert("tok".to_string(), "value".to_string());
        let mut envelope = SealedEnvelope::new(AllowedHosts::new(), secrets);

        let store = envelope.take_store();
        assert!(envelope.secrets.is_empty());
        assert_eq!(store.view("tok").unwrap().expose(), b"value");
    }

    #[test]
    fn test_json_shape() {
        let mut allowed = AllowedHosts::new();
        allowed.insert("tok".into(), hosts(&["api.example.com"]));
        let mut secrets = HashMap::new();
        secrets.insert("tok".to_string(), "v".to_string());
        let envelope = SealedEnvelope::new(allowed, secrets);

        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"version\":1"));
        assert!(json.contains("\"sealed_at\""));
        assert!(json.contains("\"allowed_hosts\""));
        assert!(json.contains("\"secrets\""));
    }

    #[test]
    fn test_parse_identities_skips_comments() {
        let identity = age::x25519::Identity::generate();
        use secrecy::ExposeSecret;
        let contents = format!(
            "# created: today\n# public key: {}\n{}\n",
            identity.to_public(),
            identity.to_string().expose_secret()
        );
        let parsed = parse_identities(&contents).unwrap();
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn test_parse_identities_empty_input() {
        assert!(matches!(
            parse_identities("# only a comment\n"),
            Err(EnvelopeError::Identity(_))
        ));
    }

    #[test]
    fn test_parse_recipient() {
        let identity = age::x25519::Identity::generate();
        let s = identity.to_public().to_string();
        assert!(parse_recipient(&s).is_ok());
        assert!(parse_recipient("not-a-key").is_err());
    }
}
