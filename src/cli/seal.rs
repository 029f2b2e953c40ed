//! `seal` subcommand
//!
//! Reads `name: value` secrets from stdin, derives the AllowedHosts binding
//! from the config's rules, verifies every referenced secret was supplied,
//! and writes the age-encrypted envelope. The config file is chmod'd
//! read-only afterwards so the committed binding cannot drift casually.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::io::Read;
use zeroize::Zeroizing;

use super::SealArgs;
use crate::config::Config;
use crate::secrets::{parse_identities, parse_recipient, SealedEnvelope};

pub fn run(args: SealArgs) -> Result<()> {
    let cfg = Config::load(&args.config).context("loading config")?;
    let allowed_hosts = cfg.allowed_hosts_from_rules();

    // Secrets arrive on stdin only; they never touch argv or the config.
    let mut stdin_data = Zeroizing::new(String::new());
    std::io::stdin()
        .read_to_string(&mut stdin_data)
        .context("reading secrets from stdin")?;
    let input_secrets: HashMap<String, String> =
        serde_yaml::from_str(&stdin_data).context("parsing secrets from stdin")?;

    for secret_name in allowed_hosts.keys() {
        if !input_secrets.contains_key(secret_name) {
            bail!(
                "secret {secret_name:?} is referenced in config rules but was not provided on stdin"
            );
        }
    }

    let recipient = resolve_recipient(&args)?;

    let envelope = SealedEnvelope::new(allowed_hosts, input_secrets);
    envelope
        .seal_to_file(&recipient, &cfg.secrets_file)
        .context("writing sealed envelope")?;

    make_read_only(&args.config);

    println!("Secrets sealed to {}", cfg.secrets_file);
    println!("Config set to read-only (0444): {}", args.config.display());
    Ok(())
}

/// Resolve the age recipient from either the public key string or an X25519
/// identity file. clap guarantees exactly one selector is present.
fn resolve_recipient(args: &SealArgs) -> Result<age::x25519::Recipient> {
    if let Some(recipient) = &args.recipient {
        return parse_recipient(recipient).context("parsing recipient");
    }

    let identity_path = args
        .identity
        .as_ref()
        .context("one of --identity or --recipient is required")?;
    let contents = Zeroizing::new(
        std::fs::read_to_string(identity_path).context("reading identity file")?,
    );
    let identities = parse_identities(&contents).context("parsing identity file")?;
    Ok(identities[0].to_public())
}

fn make_read_only(config_path: &std::path::Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) =
            std::fs::set_permissions(config_path, std::fs::Permissions::from_mode(0o444))
        {
            eprintln!("warning: could not set config read-only: {e}");
        }
    }
    #[cfg(not(unix))]
    let _ = config_path;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_resolve_recipient_from_string() {
        let identity = age::x25519::Identity::generate();
        let args = SealArgs {
            config: PathBuf::from("botlockbox.yaml"),
            identity: None,
            recipient: Some(identity.to_public().to_string()),
        };
        assert!(resolve_recipient(&args).is_ok());
    }

    #[test]
    fn test_resolve_recipient_from_identity_file() {
        use secrecy::ExposeSecret;
        let identity = age::x25519::Identity::generate();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.txt");
        std::fs::write(
            &path,
            format!("# comment\n{}\n", identity.to_string().expose_secret()),
        )
        .unwrap();

        let args = SealArgs {
            config: PathBuf::from("botlockbox.yaml"),
            identity: Some(path),
            recipient: None,
        };
        let recipient = resolve_recipient(&args).unwrap();
        assert_eq!(recipient.to_string(), identity.to_public().to_string());
    }
}
