//! Input checks shared by the store operations.

use std::sync::LazyLock;

use regex::Regex;

use crate::errors::{MarketError, MarketResult};

static SLUG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?$").unwrap());

static EMAIL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap());

static CURRENCY_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Z]{3}$").unwrap());

static ENV_KEY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

static HOSTNAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?$")
        .unwrap()
});

/// Lowercase `[a-z0-9-]`, 1–63 chars, no leading or trailing dash.
pub fn is_valid_slug(s: &str) -> bool {
    SLUG_REGEX.is_match(s)
}

pub fn is_valid_email(s: &str) -> bool {
    EMAIL_REGEX.is_match(s)
}

pub fn is_valid_hostname(s: &str) -> bool {
    s.len() <= 253 && HOSTNAME_REGEX.is_match(s)
}

pub fn require_slug(s: &str) -> MarketResult<()> {
    if is_valid_slug(s) {
        Ok(())
    } else {
        Err(MarketError::Validation(format!("invalid slug '{}'", s)))
    }
}

pub fn require_email(s: &str) -> MarketResult<()> {
    if is_valid_email(s) {
        Ok(())
    } else {
        Err(MarketError::Validation(format!("invalid email '{}'", s)))
    }
}

/// Container environment names as POSIX shells accept them.
pub fn require_env_key(key: &str) -> MarketResult<()> {
    if ENV_KEY_REGEX.is_match(key) {
        Ok(())
    } else {
        Err(MarketError::Validation(format!(
            "invalid environment variable name '{}'",
            key
        )))
    }
}

pub fn require_hostname(field: &str, s: &str) -> MarketResult<()> {
    if is_valid_hostname(s) {
        Ok(())
    } else {
        Err(MarketError::Validation(format!("invalid {} '{}'", field, s)))
    }
}

pub fn require_currency(s: &str) -> MarketResult<()> {
    if CURRENCY_REGEX.is_match(s) {
        Ok(())
    } else {
        Err(MarketError::Validation(format!(
            "currency must be a 3-letter upper-case code, got '{}'",
            s
        )))
    }
}

pub fn require_non_empty(field: &str, value: &str) -> MarketResult<()> {
    if value.trim().is_empty() {
        Err(MarketError::Validation(format!("{} must not be empty", field)))
    } else {
        Ok(())
    }
}
