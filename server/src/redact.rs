//! Redaction of sensitive data in error messages and log fields.
//!
//! Every error body returned to a client and every upstream error that gets
//! logged passes through [`redact`], which masks credentials, personal data
//! and secrets that may have leaked into a message from Supabase or from
//! user input.
//!
//! # Example
//!
//! ```rust
//! use voicehub_server::redact::redact;
//!
//! let message = redact("login failed for alice@example.com from 10.1.2.3");
//! assert_eq!(message, "login failed for *****@***** from *.*.*.*");
//! ```

use std::sync::LazyLock;

use regex_lite::Regex;
use serde_json::Value;

/// Replacement for masked values.
pub const MASK: &str = "*****";

/// Object keys whose values are always masked by [`sanitize_context`].
const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "access_token",
    "refresh_token",
    "api_key",
    "apikey",
    "authorization",
    "key",
    "credit_card",
    "ssn",
];

/// Ordered list of patterns. Earlier entries win because later patterns only
/// see the already-masked text.
const PATTERNS: &[(&str, &str)] = &[
    // Database connection strings
    (
        r"(?i)\b(postgres(?:ql)?|mysql|mongodb(?:\+srv)?|redis|amqp)://[^\s'\x22]+",
        "${1}://*****",
    ),
    // Credentials embedded in URLs
    (
        r"([a-zA-Z][a-zA-Z0-9+.-]*://)[^:/\s@]+:[^@/\s]+@",
        "${1}*****:*****@",
    ),
    // Bearer tokens
    (r"(?i)(bearer\s+)[A-Za-z0-9\-._~+/]+=*", "${1}*****"),
    // key=value and key: value credentials
    (
        r#"(?i)((?:api[_-]?key|apikey|access[_-]?token|refresh[_-]?token|token|secret|password|passwd|pwd|authorization|auth)["']?\s*[:=]\s*["']?)[^\s"',;&]+"#,
        "${1}*****",
    ),
    // JSON web tokens
    (
        r"eyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]*",
        "*****",
    ),
    // VoiceHub API keys
    (r"vhk_[A-Za-z0-9_-]{20,}", "vhk_*****"),
    // AWS access keys
    (r"AKIA[0-9A-Z]{16}", "*****"),
    // E-mail addresses
    (
        r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}",
        "*****@*****",
    ),
    // Card numbers
    (r"\b(?:\d{4}[- ]?){3}\d{4}\b", "*****"),
    // US social security numbers
    (r"\b\d{3}-\d{2}-\d{4}\b", "*****"),
    // Phone numbers
    (
        r"(?:\+\d{1,3}[-. ]?)?\(?\b\d{3}\)?[-. ]\d{3}[-. ]\d{4}\b",
        "*****",
    ),
    // IPv4 addresses
    (r"\b(?:\d{1,3}\.){3}\d{1,3}\b", "*.*.*.*"),
    // Hex digests and API secrets (MD5, SHA-1, SHA-256 lengths)
    (
        r"\b(?:[0-9a-fA-F]{64}|[0-9a-fA-F]{40}|[0-9a-fA-F]{32})\b",
        "*****",
    ),
];

static DEFAULT_REDACTOR: LazyLock<Redactor> = LazyLock::new(Redactor::new);

/// Masks sensitive substrings using an ordered set of regular expressions.
#[derive(Debug)]
pub struct Redactor {
    rules: Vec<(Regex, &'static str)>,
}

impl Redactor {
    /// Builds a redactor with the built-in pattern set.
    pub fn new() -> Self {
        let rules = PATTERNS
            .iter()
            .filter_map(|(pattern, replacement)| match Regex::new(pattern) {
                Ok(re) => Some((re, *replacement)),
                Err(err) => {
                    tracing::error!(error = %err, "Invalid redaction pattern");
                    None
                }
            })
            .collect();

        Self { rules }
    }

    /// Returns `text` with every sensitive match masked.
    pub fn redact(&self, text: &str) -> String {
        let mut output = text.to_string();
        for (re, replacement) in &self.rules {
            if re.is_match(&output) {
                output = re.replace_all(&output, *replacement).into_owned();
            }
        }
        output
    }

    /// Number of active rules.
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new()
    }
}

/// Redacts `text` with the shared default [`Redactor`].
pub fn redact(text: &str) -> String {
    DEFAULT_REDACTOR.redact(text)
}

/// Returns a copy of `value` with sensitive keys masked and every remaining
/// string redacted.
pub fn sanitize_context(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| {
                    let sanitized = if is_sensitive_key(key) {
                        Value::String(MASK.to_string())
                    } else {
                        sanitize_context(value)
                    };
                    (key.clone(), sanitized)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_context).collect()),
        Value::String(s) => Value::String(redact(s)),
        other => other.clone(),
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SENSITIVE_KEYS
        .iter()
        .any(|sensitive| key == *sensitive || key.ends_with(&format!("_{sensitive}")))
}
