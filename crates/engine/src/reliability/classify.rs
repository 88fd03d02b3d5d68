//! Failure classification
//!
//! Maps the free-form text of a job failure onto a small taxonomy. Matching
//! is case-insensitive and ordered: identity-fatal classes win over rate
//! limits, which win over transport noise.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::JobError;

/// What a failure means for the worker that saw it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "wait_secs", rename_all = "snake_case")]
pub enum Classification {
    /// The service is throttling; wait this many seconds
    FloodWait(u64),

    /// The credential is no longer accepted
    Unauthorized,

    /// The identity is banned or blocked
    Blocked,

    /// The identity was deleted or deactivated
    Deactivated,

    /// Connection, TLS, proxy or gateway failure
    TransportError,

    /// Nothing the policy has an opinion on
    Other,
}

impl Classification {
    /// Whether this is a rate-limit hit
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::FloodWait(_))
    }

    /// Whether the identity can no longer be used
    pub fn is_identity_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized | Self::Blocked | Self::Deactivated)
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FloodWait(secs) => write!(f, "flood_wait({secs}s)"),
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::Blocked => write!(f, "blocked"),
            Self::Deactivated => write!(f, "deactivated"),
            Self::TransportError => write!(f, "transport_error"),
            Self::Other => write!(f, "other"),
        }
    }
}

struct Patterns {
    deactivated: Regex,
    unauthorized: Regex,
    blocked: Regex,
    rate_limit: Regex,
    flood: Regex,
    wait_secs: Vec<Regex>,
    transport: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        deactivated: compile(r"(?i)deactivated|deleted account|user_deactivated"),
        unauthorized: compile(
            r"(?i)unauthori[sz]ed|auth_key_unregistered|session_revoked|session revoked|session expired|not authori[sz]ed|\bhttp\s*401\b|\bstatus(?:\s*code)?:?\s*401\b",
        ),
        blocked: compile(r"(?i)\bbanned\b|\bblocked\b|user_banned|peer_banned|\bforbidden\b"),
        rate_limit: compile(
            r"(?i)too many requests|retry after|flood|wait of \d+ seconds?|a wait of|slow ?mode|\b429\b",
        ),
        flood: compile(r"(?i)flood"),
        wait_secs: vec![
            compile(r"(?i)flood_wait_(\d+)"),
            compile(r"(?i)retry after:?\s*(\d+)"),
            compile(r"(?i)wait of (\d+) seconds?"),
            compile(r"(?i)wait (\d+) seconds?"),
            compile(r"(?i)(\d+) seconds?"),
        ],
        transport: compile(
            r"(?i)\bssl\b|\btls\b|handshake|connection|bad gateway|\b502\b|\b503\b|\b504\b|timed out|timeout|proxy|broken pipe|\beof\b",
        ),
    })
}

// Constant patterns; `test_patterns_compile` checks every one of them.
fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("classification patterns are valid")
}

/// Classify a failure message
///
/// `fallback_wait_secs` is used when a rate-limit phrase is present but no
/// wait time can be extracted.
///
/// # Example
///
/// ```
/// use fleetrun_engine::reliability::{classify, Classification};
///
/// assert_eq!(
///     classify("A wait of 42 seconds is required", 5),
///     Classification::FloodWait(42)
/// );
/// assert_eq!(classify("Too Many Requests", 5), Classification::FloodWait(5));
/// assert_eq!(classify("The user has been deactivated", 5), Classification::Deactivated);
/// ```
pub fn classify(message: &str, fallback_wait_secs: u64) -> Classification {
    let p = patterns();

    if p.deactivated.is_match(message) {
        return Classification::Deactivated;
    }
    if p.unauthorized.is_match(message) {
        return Classification::Unauthorized;
    }
    if p.rate_limit.is_match(message) {
        return Classification::FloodWait(extract_wait_secs(message).unwrap_or(fallback_wait_secs));
    }
    if p.blocked.is_match(message) {
        return Classification::Blocked;
    }
    if p.transport.is_match(message) {
        return Classification::TransportError;
    }
    Classification::Other
}

/// Classify a job failure, trusting its variant before its text
///
/// A [`JobError::Transport`] is a transport error unless its text names a
/// rate limit; a [`JobError::Cancelled`] is never a failure worth counting.
pub fn classify_error(err: &JobError, fallback_wait_secs: u64) -> Classification {
    match err {
        JobError::Cancelled => Classification::Other,
        JobError::Transport(message) => match classify(message, fallback_wait_secs) {
            wait @ Classification::FloodWait(_) => wait,
            _ => Classification::TransportError,
        },
        other => classify(&other.to_string(), fallback_wait_secs),
    }
}

/// Whether the message describes a flood-style limit rather than a generic wait
pub fn is_flood_message(message: &str) -> bool {
    patterns().flood.is_match(message)
}

/// Pull the wait time out of a rate-limit message, if it has one
pub fn extract_wait_secs(message: &str) -> Option<u64> {
    patterns()
        .wait_secs
        .iter()
        .find_map(|re| re.captures(message))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Render a wait for humans: "1 second", "45 seconds", "2 minutes 5 seconds"
pub fn format_wait(secs: u64) -> String {
    fn unit(n: u64, singular: &str) -> String {
        if n == 1 {
            format!("1 {singular}")
        } else {
            format!("{n} {singular}s")
        }
    }

    if secs < 60 {
        return unit(secs, "second");
    }

    let minutes = secs / 60;
    let rest = secs % 60;
    if rest == 0 {
        unit(minutes, "minute")
    } else {
        format!("{} {}", unit(minutes, "minute"), unit(rest, "second"))
    }
}
