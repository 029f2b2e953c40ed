//! `serve` subcommand
//!
//! Startup order matters: config, identities, unseal + validate (fatal on
//! policy violation), process hardening, ephemeral CA, injector, optional
//! CA PEM and PID file exports, reload watcher, then the accept loop.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use zeroize::Zeroizing;

use super::ServeArgs;
use crate::config::Config;
use crate::harden;
use crate::injector::Injector;
use crate::mitm::{EphemeralCa, ProxyServer};
use crate::secrets::{
    parse_identities, AllowedHosts, EnvelopeError, SealedEnvelope, SecretStore,
};

pub async fn run(args: ServeArgs) -> Result<()> {
    let cfg = Config::load(&args.config).context("loading config")?;
    init_logging(cfg.verbose);

    let allowed_hosts = cfg.allowed_hosts_from_rules();
    let identities = load_identities(&args)?;

    let (envelope, store) = unseal(&cfg, &identities, &allowed_hosts)?;

    harden::apply();

    let ca = Arc::new(EphemeralCa::generate().context("generating ephemeral CA")?);
    let injector = Arc::new(Injector::new(
        cfg.rules.clone(),
        envelope,
        store,
        ca.ca_pem().as_bytes().to_vec(),
    ));

    if let Some(ca_cert_path) = &args.ca_cert {
        std::fs::write(ca_cert_path, ca.ca_pem()).context("writing CA cert")?;
        info!(path = %ca_cert_path.display(), "CA certificate written");
    }

    let _pidfile = match &args.pidfile {
        Some(path) => Some(PidFile::write(path)?),
        None => None,
    };

    #[cfg(unix)]
    spawn_reload_watcher(
        Arc::clone(&injector),
        cfg.clone(),
        identities,
        allowed_hosts,
    );

    println!("Host binding verified");
    println!("botlockbox listening on {}", cfg.listen);

    let listener = TcpListener::bind(&cfg.listen)
        .await
        .with_context(|| format!("binding {}", cfg.listen))?;
    let server = Arc::new(ProxyServer::new(injector, ca));
    server.run(listener).await.context("proxy server")?;
    Ok(())
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default_filter = if verbose { "botlockbox=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    // Diagnostics go to stderr; stdout is reserved for AUDIT lines.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Load age identities from the selected source. The stdin buffer is zeroed
/// immediately after parsing so key material does not linger here.
fn load_identities(args: &ServeArgs) -> Result<Vec<age::x25519::Identity>> {
    let contents = if args.identity_stdin {
        let mut buf = Zeroizing::new(String::new());
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("reading identity from stdin")?;
        buf
    } else {
        let path = args
            .identity
            .as_ref()
            .context("one of --identity or --identity-stdin is required")?;
        Zeroizing::new(std::fs::read_to_string(path).context("reading identity file")?)
    };
    parse_identities(&contents).context("parsing age identities")
}

/// Decrypt the envelope and validate it against the live config. Policy
/// violations surface with a distinctive prefix; the secrets move into a
/// protected store and the retained envelope keeps only the binding.
fn unseal(
    cfg: &Config,
    identities: &[age::x25519::Identity],
    allowed_hosts: &AllowedHosts,
) -> Result<(SealedEnvelope, SecretStore)> {
    let mut envelope = SealedEnvelope::unseal_from_file(identities, &cfg.secrets_file)
        .with_context(|| format!("unsealing {}", cfg.secrets_file))?;

    envelope.validate(allowed_hosts).map_err(|e| match e {
        EnvelopeError::UnknownSecret { .. } | EnvelopeError::HostNotCommitted { .. } => {
            anyhow!("SECURITY VIOLATION: {e}")
        }
        other => anyhow!(other),
    })?;

    let store = envelope.take_store();
    Ok((envelope, store))
}

/// Listen for SIGHUP and hot-swap secrets. Any failure keeps the current
/// secrets; a rejected store is destroyed here.
#[cfg(unix)]
fn spawn_reload_watcher(
    injector: Arc<Injector>,
    cfg: Config,
    identities: Vec<age::x25519::Identity>,
    allowed_hosts: AllowedHosts,
) {
    tokio::spawn(async move {
        let mut hangups = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "cannot install SIGHUP handler; live reload disabled");
                return;
            }
        };

        while hangups.recv().await.is_some() {
            info!("SIGHUP received, reloading secrets");
            let (envelope, store) = match unseal(&cfg, &identities, &allowed_hosts) {
                Ok(unsealed) => unsealed,
                Err(e) => {
                    error!(error = %e, "reload FAILED (keeping current secrets)");
                    continue;
                }
            };
            match injector.swap(envelope, store, &allowed_hosts).await {
                Ok(()) => info!("secrets reloaded successfully"),
                Err(mut rejected) => {
                    error!(reason = %rejected.reason, "reload REJECTED (keeping current secrets)");
                    rejected.store.destroy_all();
                }
            }
        }
    });
}

/// PID file that unlinks itself when serve winds down.
struct PidFile {
    path: PathBuf,
}

impl PidFile {
    fn write(path: &Path) -> Result<Self> {
        std::fs::write(path, format!("{}\n", std::process::id()))
            .with_context(|| format!("writing PID file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
