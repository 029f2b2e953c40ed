//! Audit logging for injection attempts
//!
//! Every injection attempt emits one JSON line on stdout, prefixed `AUDIT `.
//! Secret VALUES are never logged, only names and patterns. The block reason
//! carries enough detail for an operator to diagnose a refusal.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;
use tracing::debug;

/// One credential injection attempt.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub ts: DateTime<Utc>,
    pub host: String,
    pub method: String,
    pub path: String,
    pub rule: String,
    pub secret_name: String,
    pub injected: bool,
    pub blocked: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub block_reason: String,
}

impl AuditEvent {
    pub fn new(
        host: &str,
        method: &str,
        path: &str,
        rule: &str,
        secret_name: &str,
        injected: bool,
        blocked: bool,
        block_reason: impl Into<String>,
    ) -> Self {
        Self {
            ts: Utc::now(),
            host: host.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            rule: rule.to_string(),
            secret_name: secret_name.to_string(),
            injected,
            blocked,
            block_reason: block_reason.into(),
        }
    }

    /// The serialized log line, without trailing newline.
    pub fn render(&self) -> String {
        // Serialization of this struct cannot fail; fall back to an empty
        // object rather than dropping the event on the floor.
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("AUDIT {json}")
    }
}

/// Emit an audit event to stdout.
pub fn emit(event: &AuditEvent) {
    let line = event.render();
    debug!(
        rule = %event.rule,
        secret_name = %event.secret_name,
        injected = event.injected,
        blocked = event.blocked,
        "audit event"
    );
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    let _ = writeln!(handle, "{line}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_injected_event() {
        let event = AuditEvent::new(
            "api.example.com",
            "GET",
            "/v1",
            "github-api",
            "tok",
            true,
            false,
            "",
        );
        let line = event.render();
        assert!(line.starts_with("AUDIT {"));
        assert!(line.contains("\"host\":\"api.example.com\""));
        assert!(line.contains("\"rule\":\"github-api\""));
        assert!(line.contains("\"secret_name\":\"tok\""));
        assert!(line.contains("\"injected\":true"));
        assert!(line.contains("\"blocked\":false"));
        // Empty reasons are omitted entirely.
        assert!(!line.contains("block_reason"));
    }

    #[test]
    fn test_render_blocked_event_carries_reason() {
        let event = AuditEvent::new(
            "evil.example.com",
            "POST",
            "/v1",
            "github-api",
            "tok",
            false,
            true,
            "host \"evil.example.com\" not in sealed allowlist",
        );
        let line = event.render();
        assert!(line.contains("\"blocked\":true"));
        assert!(line.contains("\"block_reason\""));
        assert!(line.contains("evil.example.com"));
    }

    #[test]
    fn test_timestamp_is_utc_rfc3339() {
        let event = AuditEvent::new("h", "GET", "/", "r", "s", true, false, "");
        let json = serde_json::to_value(&event).unwrap();
        let ts = json.get("ts").unwrap().as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok());
    }
}
