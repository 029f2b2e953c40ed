//! Host and rule matching
//!
//! Decides whether a request (host + path) is covered by a rule's match
//! block. Host patterns are either exact strings or wildcard-prefix globs
//! (`*.example.com`). Comparison is case-sensitive on the ASCII host; the
//! proxy front-end hands us hosts that are already lowercased.

use crate::config::Match;

/// Check whether `host` matches a single pattern.
///
/// Exact strings match themselves. A pattern starting with `*.` matches any
/// host ending in the pattern minus the leading `*`, which includes the bare
/// apex: `*.s3.amazonaws.com` matches both `foo.s3.amazonaws.com` and
/// `s3.amazonaws.com`. No other wildcard forms are honored.
pub fn host_matches(host: &str, pattern: &str) -> bool {
    if host == pattern {
        return true;
    }
    if let Some(rest) = pattern.strip_prefix('*') {
        if rest.starts_with('.') {
            return host.ends_with(rest) || host == &rest[1..];
        }
    }
    false
}

/// Check whether a request against `host` with `path` satisfies a rule's
/// match block: at least one host pattern must match, and when path prefixes
/// are present at least one must be a byte-prefix of the path. An empty
/// prefix list means any path.
pub fn rule_matches(host: &str, path: &str, criteria: &Match) -> bool {
    if !criteria.hosts.iter().any(|p| host_matches(host, p)) {
        return false;
    }
    if criteria.path_prefixes.is_empty() {
        return true;
    }
    criteria.path_prefixes.iter().any(|p| path.starts_with(p))
}
