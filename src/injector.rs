//! Request-level credential injection
//!
//! The injector owns the quadruple (rules, envelope, store, CA PEM) behind a
//! single reader-writer lock. `handle` runs under the read side for the
//! whole rewrite; `swap` validates outside the lock and takes the write side
//! only for the field assignment, so rotation cannot tear and a slow
//! validation never stalls requests.
//!
//! Per matched rule, each template goes through extract, authorize, fetch,
//! render, apply. Any failure short-circuits the rule with a synthetic 503
//! and a blocked audit event; the request is never forwarded upstream.

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::uri::PathAndQuery;
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};
use zeroize::Zeroize;

use crate::audit::{self, AuditEvent};
use crate::config::{secret_placeholder_re, Rule};
use crate::matcher;
use crate::secrets::{
    allowed_hosts_equal, AllowedHosts, AllowedHostsDiff, EnvelopeError, SealedEnvelope,
    SecretStore, SecretView,
};

/// Outcome of running a request through the injector.
pub enum Handled {
    /// Forward the (possibly rewritten) request upstream.
    Forward(Request<Full<Bytes>>),
    /// Return a synthetic response; the request never goes upstream.
    Blocked(Response<Full<Bytes>>),
}

/// Why a rotation was refused.
#[derive(Debug, Error)]
pub enum SwapError {
    #[error("reload validation failed: {0}")]
    Validation(#[from] EnvelopeError),

    #[error("allowed hosts changed, re-seal required: {0}")]
    AllowedHostsChanged(#[from] AllowedHostsDiff),
}

/// A refused rotation. The new store comes back to the caller, which is
/// responsible for destroying its buffers; live state is untouched.
#[derive(Debug)]
pub struct SwapRejected {
    pub reason: SwapError,
    pub store: SecretStore,
}

/// The fields read together on every request and replaced together on
/// rotation.
struct InjectorState {
    rules: Vec<Rule>,
    envelope: SealedEnvelope,
    store: SecretStore,
    ca_pem: Vec<u8>,
}

/// Holds the rules, sealed envelope binding, and protected secrets.
pub struct Injector {
    state: RwLock<InjectorState>,
}

impl Injector {
    pub fn new(
        rules: Vec<Rule>,
        envelope: SealedEnvelope,
        store: SecretStore,
        ca_pem: Vec<u8>,
    ) -> Self {
        Self {
            state: RwLock::new(InjectorState {
                rules,
                envelope,
                store,
                ca_pem,
            }),
        }
    }

    /// The PEM-encoded public certificate of the ephemeral MITM CA. Safe to
    /// write to disk or share with clients that need to trust the proxy.
    pub async fn ca_pem(&self) -> Vec<u8> {
        self.state.read().await.ca_pem.clone()
    }

    /// Run a request against the rules. The first rule whose match succeeds
    /// is applied; requests no rule covers pass through unchanged.
    pub async fn handle(&self, host: &str, req: Request<Full<Bytes>>) -> Handled {
        let state = self.state.read().await;
        let path = req.uri().path().to_string();

        let rule = state
            .rules
            .iter()
            .find(|rule| matcher::rule_matches(host, &path, &rule.match_));
        match rule {
            Some(rule) => apply_rule(&state, rule, host, req),
            None => Handled::Forward(req),
        }
    }

    /// Atomically replace the envelope and secret store.
    ///
    /// Preconditions, both evaluated before any lock is taken for writing:
    /// the new envelope must validate against the live config's allowed
    /// hosts, and its allowed-hosts map must equal the currently installed
    /// one as a set-valued map. Changing the binding requires re-sealing
    /// with fresh operator intent; a file reload must not silently grant new
    /// reach. Old buffers are destroyed after the write lock is released.
    pub async fn swap(
        &self,
        new_envelope: SealedEnvelope,
        new_store: SecretStore,
        config_allowed_hosts: &AllowedHosts,
    ) -> Result<(), SwapRejected> {
        if let Err(e) = new_envelope.validate(config_allowed_hosts) {
            return Err(SwapRejected {
                reason: SwapError::Validation(e),
                store: new_store,
            });
        }

        {
            let state = self.state.read().await;
            if let Err(diff) =
                allowed_hosts_equal(&state.envelope.allowed_hosts, &new_envelope.allowed_hosts)
            {
                return Err(SwapRejected {
                    reason: SwapError::AllowedHostsChanged(diff),
                    store: new_store,
                });
            }
        }

        let mut old_store = {
            let mut state = self.state.write().await;
            state.envelope = new_envelope;
            std::mem::replace(&mut state.store, new_store)
        };
        old_store.destroy_all();

        info!("secrets swapped");
        Ok(())
    }
}

/// Apply one rule to the request: headers first, then query parameters.
fn apply_rule(
    state: &InjectorState,
    rule: &Rule,
    host: &str,
    mut req: Request<Full<Bytes>>,
) -> Handled {
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();

    let audit_ok = |secret_name: &str| {
        audit::emit(&AuditEvent::new(
            host,
            &method,
            &path,
            &rule.name,
            secret_name,
            true,
            false,
            "",
        ))
    };
    let audit_blocked = |secret_name: &str, reason: &str| {
        warn!(rule = %rule.name, secret_name = %secret_name, reason = %reason, "injection blocked");
        audit::emit(&AuditEvent::new(
            host,
            &method,
            &path,
            &rule.name,
            secret_name,
            false,
            true,
            reason,
        ))
    };

    for (header, template) in &rule.inject.headers {
        let (secret_name, rendered) = match expand_template(state, template, host) {
            Ok(expanded) => expanded,
            Err(failure) => {
                audit_blocked(&failure.secret_name, &failure.reason);
                return Handled::Blocked(blocked_response(failure.body));
            }
        };

        let (name, value) = match header_pair(header, &rendered) {
            Ok(pair) => pair,
            Err(reason) => {
                audit_blocked(&secret_name, &reason);
                return Handled::Blocked(blocked_response("botlockbox: template render error"));
            }
        };
        req.headers_mut().insert(name, value);
        audit_ok(&secret_name);
    }

    if !rule.inject.query_params.is_empty() {
        let mut pairs: Vec<(String, String)> =
            url::form_urlencoded::parse(req.uri().query().unwrap_or("").as_bytes())
                .into_owned()
                .collect();

        for (param, template) in &rule.inject.query_params {
            match expand_template(state, template, host) {
                Ok((secret_name, rendered)) => {
                    set_query_param(&mut pairs, param, rendered);
                    audit_ok(&secret_name);
                }
                Err(failure) => {
                    audit_blocked(&failure.secret_name, &failure.reason);
                    return Handled::Blocked(blocked_response(failure.body));
                }
            }
        }

        req = rewrite_query(req, &pairs);
    }

    Handled::Forward(req)
}

/// A failed template expansion: what to log and what to answer.
struct ExpandFailure {
    secret_name: String,
    reason: String,
    body: &'static str,
}

/// Run one template through extract, authorize, fetch, render. Returns the
/// secret name (for the audit trail) and the rendered value.
fn expand_template(
    state: &InjectorState,
    template: &str,
    host: &str,
) -> Result<(String, String), ExpandFailure> {
    let secret_name = extract_single_secret_name(template).map_err(|reason| ExpandFailure {
        secret_name: "unknown".to_string(),
        reason,
        body: "botlockbox: template error",
    })?;

    assert_host_allowed(&state.envelope, &secret_name, host).map_err(|reason| ExpandFailure {
        secret_name: secret_name.clone(),
        reason,
        body: "botlockbox: security block -- credential injection refused",
    })?;

    let view = state.store.view(&secret_name).map_err(|e| ExpandFailure {
        secret_name: secret_name.clone(),
        reason: e.to_string(),
        body: "botlockbox: secret unavailable",
    })?;

    let rendered = render_template(template, &secret_name, &view).map_err(|reason| {
        ExpandFailure {
            secret_name: secret_name.clone(),
            reason,
            body: "botlockbox: template render error",
        }
    })?;
    // The view's backing copy is zeroed here, before the next template.
    drop(view);

    Ok((secret_name, rendered))
}

/// Extract the secret name from the template's `{{secrets.NAME}}`
/// placeholder. Templates reference exactly one secret; the first reference
/// wins.
fn extract_single_secret_name(template: &str) -> Result<String, String> {
    secret_placeholder_re()
        .captures(template)
        .map(|caps| caps[1].to_string())
        .ok_or_else(|| format!("no {{{{secrets.NAME}}}} reference found in template {template:?}"))
}

/// Check the sealed allowlist before any plaintext is touched.
fn assert_host_allowed(
    envelope: &SealedEnvelope,
    secret_name: &str,
    host: &str,
) -> Result<(), String> {
    let allowed = envelope
        .allowed_hosts
        .get(secret_name)
        .ok_or_else(|| format!("secret {secret_name:?} has no allowlist in sealed envelope"))?;

    if allowed.iter().any(|p| matcher::host_matches(host, p)) {
        return Ok(());
    }
    Err(format!(
        "secret {secret_name:?} may not be sent to host {host:?}; sealed allowlist: {allowed:?}"
    ))
}

/// Substitute the known placeholder textually. If the result still contains
/// `{{`, it is handed to the general template engine with an empty context,
/// which preserves operator-side templating without exposing secrets to it.
/// The intermediate buffer holding the plaintext is scrambled before
/// returning.
fn render_template(
    template: &str,
    secret_name: &str,
    view: &SecretView,
) -> Result<String, String> {
    let secret = std::str::from_utf8(view.expose())
        .map_err(|_| format!("secret {secret_name:?} is not valid UTF-8"))?;

    let placeholder = format!("{{{{secrets.{secret_name}}}}}");
    let mut rendered = template.replace(&placeholder, secret);

    if rendered.contains("{{") {
        let result = minijinja::Environment::new()
            .render_str(&rendered, minijinja::context! {})
            .map_err(|e| e.to_string());
        rendered.zeroize();
        return result;
    }
    Ok(rendered)
}

/// Replace every existing value for `param` with the rendered value,
/// preserving the relative order of other parameters.
fn set_query_param(pairs: &mut Vec<(String, String)>, param: &str, value: String) {
    pairs.retain(|(k, _)| k != param);
    pairs.push((param.to_string(), value));
}

/// Re-encode the query string onto the request URI.
fn rewrite_query(req: Request<Full<Bytes>>, pairs: &[(String, String)]) -> Request<Full<Bytes>> {
    let (mut parts, body) = req.into_parts();

    let path = parts.uri.path();
    let encoded = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish();
    let path_and_query = if encoded.is_empty() {
        path.to_string()
    } else {
        format!("{path}?{encoded}")
    };

    let mut uri_parts = parts.uri.into_parts();
    // The serializer output is always a valid query string.
    uri_parts.path_and_query = Some(
        path_and_query
            .parse::<PathAndQuery>()
            .expect("form-encoded query is a valid path-and-query"),
    );
    parts.uri = http::Uri::from_parts(uri_parts).expect("rebuilt URI parts are valid");

    Request::from_parts(parts, body)
}

fn header_pair(name: &str, value: &str) -> Result<(HeaderName, HeaderValue), String> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| format!("invalid header name {name:?}"))?;
    let value = HeaderValue::from_str(value)
        .map_err(|_| format!("rendered value for header {name:?} contains invalid bytes"))?;
    Ok((name, value))
}

/// Synthesize the 503 returned for any injection failure.
fn blocked_response(body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::SERVICE_UNAVAILABLE)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .unwrap()
}
