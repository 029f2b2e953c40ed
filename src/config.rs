//! Configuration file model and loader
//!
//! The config file (`botlockbox.yaml`) contains NO secrets, only routing
//! rules and references of the form `{{secrets.name}}`. Actual secret values
//! live in the age-encrypted envelope pointed to by `secrets_file`.
//!
//! This module also derives the AllowedHosts map (secret name to the set of
//! host patterns it may be injected against) from the rule list. That map is
//! committed into the envelope at seal time and recomputed from the live
//! config at serve time; the two must agree.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

use crate::secrets::AllowedHosts;

const DEFAULT_LISTEN: &str = "127.0.0.1:8080";
const DEFAULT_SECRETS_FILE: &str = "~/.botlockbox/secrets.age";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parsing config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Structure of `botlockbox.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Listen address for the proxy, `host:port`.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path to the age-encrypted sealed envelope. `~/` expands to `$HOME`.
    #[serde(default = "default_secrets_file")]
    pub secrets_file: String,

    /// Enables debug-level logging.
    #[serde(default)]
    pub verbose: bool,

    /// Injection rules, evaluated in declaration order.
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// A rule binds match conditions to a credential injection action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    #[serde(rename = "match")]
    pub match_: Match,
    pub inject: Inject,
}

/// Which requests a rule applies to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Match {
    /// Host patterns, exact or wildcard-prefix (`*.s3.amazonaws.com`).
    pub hosts: Vec<String>,

    /// Optional URL path prefixes. Empty means any path.
    #[serde(default)]
    pub path_prefixes: Vec<String>,
}

/// What credentials to add to matching requests. Each template holds at most
/// one `{{secrets.name}}` placeholder.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inject {
    /// Header name to template, e.g. `Authorization: "Bearer {{secrets.tok}}"`.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Query parameter name to template.
    #[serde(default)]
    pub query_params: BTreeMap<String, String>,
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

fn default_secrets_file() -> String {
    DEFAULT_SECRETS_FILE.to_string()
}

impl Config {
    /// Read and parse a config file, applying defaults and `~/` expansion.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = expand_home(path.as_ref());
        let data = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;

        let mut cfg: Config = serde_yaml::from_str(&data)?;
        cfg.secrets_file = expand_home(Path::new(&cfg.secrets_file))
            .to_string_lossy()
            .into_owned();
        Ok(cfg)
    }

    /// Derive the secret name to host pattern map from the rules.
    ///
    /// Every secret referenced in a rule's inject block inherits every host
    /// pattern of that rule's match block. Duplicate patterns are collapsed;
    /// first-seen order is preserved.
    pub fn allowed_hosts_from_rules(&self) -> AllowedHosts {
        let mut result = AllowedHosts::new();

        for rule in &self.rules {
            for secret_name in referenced_secrets(&rule.inject) {
                let hosts = result.entry(secret_name).or_default();
                for pattern in &rule.match_.hosts {
                    if !hosts.contains(pattern) {
                        hosts.push(pattern.clone());
                    }
                }
            }
        }
        result
    }
}

/// Matches `{{secrets.key_name}}` placeholders in templates.
pub fn secret_placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{secrets\.([A-Za-z0-9_]+)\}\}").unwrap())
}

/// All secret names referenced in an inject block, deduplicated in
/// first-seen order (headers before query params).
fn referenced_secrets(inject: &Inject) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    {
        let mut collect = |tmpl: &str| {
            for caps in secret_placeholder_re().captures_iter(tmpl) {
                let name = caps[1].to_string();
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        };
        for tmpl in inject.headers.values() {
            collect(tmpl);
        }
        for tmpl in inject.query_params.values() {
            collect(tmpl);
        }
    }
    names
}

fn expand_home(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.to_path_buf()
}
