//! CLI argument definitions
//!
//! Three subcommands: `seal` commits secrets and their host binding into an
//! age-encrypted envelope, `serve` runs the proxy, `reload` signals a
//! running proxy to hot-swap its secrets.

use clap::{ArgGroup, Args, Parser, Subcommand};
use std::path::PathBuf;

pub mod reload;
pub mod seal;
pub mod serve;

/// botlockbox - credential-injecting HTTPS/HTTP MITM proxy
///
/// Agents route their traffic through the proxy and trust its ephemeral
/// root certificate; the proxy injects sealed credentials into matching
/// requests and scrubs known credential shapes from responses.
#[derive(Parser, Debug)]
#[command(name = "botlockbox")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Seal secrets into an age-encrypted envelope
    ///
    /// Reads secrets from stdin as YAML (key: value pairs), derives the
    /// secret-to-host binding from the config's rules, and writes the
    /// encrypted envelope. The config file is made read-only afterwards.
    Seal(SealArgs),

    /// Run the proxy server
    ///
    /// Decrypts the envelope, validates it against the live config,
    /// generates the ephemeral MITM CA, and starts listening. SIGHUP
    /// triggers a live secret reload.
    Serve(ServeArgs),

    /// Send SIGHUP to a running serve process to reload secrets
    Reload(ReloadArgs),
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("key_source").required(true).args(["identity", "recipient"])))]
pub struct SealArgs {
    /// Path to botlockbox.yaml
    #[arg(long, default_value = "botlockbox.yaml")]
    pub config: PathBuf,

    /// Path to an age X25519 identity file (the recipient is derived from
    /// the key)
    #[arg(long)]
    pub identity: Option<PathBuf>,

    /// age recipient public key string (age1...)
    #[arg(long)]
    pub recipient: Option<String>,
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("identity_source").required(true).args(["identity", "identity_stdin"])))]
pub struct ServeArgs {
    /// Path to botlockbox.yaml
    #[arg(long, default_value = "botlockbox.yaml")]
    pub config: PathBuf,

    /// Path to an age identity file
    #[arg(long)]
    pub identity: Option<PathBuf>,

    /// Read the age identity from stdin; the key is never written to disk
    #[arg(long)]
    pub identity_stdin: bool,

    /// Write a PID file (used with `botlockbox reload`)
    #[arg(long)]
    pub pidfile: Option<PathBuf>,

    /// Write the ephemeral MITM CA public certificate PEM to this path so
    /// clients can trust it
    #[arg(long)]
    pub ca_cert: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ReloadArgs {
    /// Path to the PID file written by `botlockbox serve`
    #[arg(long)]
    pub pidfile: PathBuf,
}
