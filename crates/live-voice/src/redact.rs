//! Credential redaction for log output.
//!
//! Connect URLs carry the API key or access token in the query string, and
//! server errors sometimes echo bearer tokens back. Everything that might hold a
//! credential goes through [`redact_secrets`] before reaching a log line.

use once_cell::sync::Lazy;
use regex::Regex;

/// Placeholder used in place of any credential in sanitized output.
pub const REDACTED_PLACEHOLDER: &str = "[REDACTED]";

static QUERY_SECRET: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)\b(key|access_token|token)=[^&\s]+").ok());

static BEARER: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9._~+/=-]+").ok());

/// Replace query-string credentials and bearer tokens with [`REDACTED_PLACEHOLDER`].
pub fn redact_secrets(text: &str) -> String {
    let mut out = text.to_string();
    if let Some(re) = QUERY_SECRET.as_ref() {
        out = re
            .replace_all(&out, format!("${{1}}={REDACTED_PLACEHOLDER}"))
            .into_owned();
    }
    if let Some(re) = BEARER.as_ref() {
        out = re
            .replace_all(&out, format!("Bearer {REDACTED_PLACEHOLDER}"))
            .into_owned();
    }
    out
}
