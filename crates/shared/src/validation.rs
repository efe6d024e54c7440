//! Input validators shared by the payment and notification services
//!
//! All predicates are pure. Field-level failures are collected into
//! [`ValidationErrors`] so the gateway can return a structured error map.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::Serialize;

/// Currencies accepted for payments. All use two minor-unit digits.
pub const SUPPORTED_CURRENCIES: &[&str] = &[
    "usd", "eur", "gbp", "cad", "aud", "nzd", "chf", "sek", "nok", "dkk", "sgd", "hkd", "mxn",
    "brl", "inr", "pln",
];

#[allow(clippy::expect_used)] // Literal patterns, verified by tests
static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9](?:[A-Za-z0-9\-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9\-]*[A-Za-z0-9])?)*\.[A-Za-z]{2,}$")
        .expect("email pattern compiles")
});

#[allow(clippy::expect_used)] // Literal patterns, verified by tests
static PHONE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+[1-9][0-9]{7,14}$").expect("phone pattern compiles"));

/// Field-level validation failures
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("Validation failed: {}", self.summary())]
pub struct ValidationErrors {
    fields: BTreeMap<String, String>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single-field error
    pub fn field(name: &str, message: impl Into<String>) -> Self {
        let mut errors = Self::new();
        errors.add(name, message);
        errors
    }

    /// Record a failure; the first message for a field wins.
    pub fn add(&mut self, name: &str, message: impl Into<String>) {
        self.fields
            .entry(name.to_string())
            .or_insert_with(|| message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    pub fn into_result(self) -> Result<(), Self> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }

    fn summary(&self) -> String {
        self.fields
            .iter()
            .map(|(field, message)| format!("{}: {}", field, message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// True only for syntactically valid `http`/`https` URLs with a host.
pub fn is_valid_http_url(raw: &str) -> bool {
    match url::Url::parse(raw) {
        Ok(parsed) => {
            matches!(parsed.scheme(), "http" | "https")
                && parsed.host_str().is_some_and(|h| !h.is_empty())
        }
        Err(_) => false,
    }
}

/// Largest amount accepted for a single payment or refund.
pub fn max_amount() -> Decimal {
    Decimal::new(99_999_999, 2)
}

/// Validate a monetary amount: positive, at most two fraction digits, bounded.
pub fn validate_amount(amount: Decimal) -> Result<(), &'static str> {
    if amount <= Decimal::ZERO {
        return Err("must be greater than zero");
    }
    if amount.normalize().scale() > 2 {
        return Err("must have at most 2 decimal places");
    }
    if amount > max_amount() {
        return Err("exceeds the maximum of 999999.99");
    }
    Ok(())
}

/// Lowercase 3-letter code from [`SUPPORTED_CURRENCIES`].
pub fn is_supported_currency(code: &str) -> bool {
    SUPPORTED_CURRENCIES.contains(&code)
}

pub fn is_valid_email(raw: &str) -> bool {
    raw.len() <= 254 && EMAIL_RE.is_match(raw)
}

/// E.164 phone number (`+` followed by 8 to 15 digits).
pub fn is_valid_phone(raw: &str) -> bool {
    PHONE_RE.is_match(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_urls() {
        assert!(is_valid_http_url("https://example.com/hooks"));
        assert!(is_valid_http_url("http://localhost:8080/a?b=c"));
        assert!(!is_valid_http_url("ftp://example.com/file"));
        assert!(!is_valid_http_url("example.com/hooks"));
        assert!(!is_valid_http_url("javascript:alert(1)"));
        assert!(!is_valid_http_url(""));
        assert!(!is_valid_http_url("https://"));
    }

    #[test]
    fn test_amounts() {
        assert!(validate_amount(Decimal::new(1, 2)).is_ok());
        assert!(validate_amount(Decimal::new(1999, 2)).is_ok());
        assert!(validate_amount(Decimal::new(1000, 3)).is_ok(), "1.000 normalizes to 1");
        assert!(validate_amount(max_amount()).is_ok());

        assert!(validate_amount(Decimal::ZERO).is_err());
        assert!(validate_amount(Decimal::new(-500, 2)).is_err());
        assert!(validate_amount(Decimal::new(1001, 3)).is_err());
        assert!(validate_amount(max_amount() + Decimal::new(1, 2)).is_err());
    }

    #[test]
    fn test_currencies() {
        assert!(is_supported_currency("usd"));
        assert!(is_supported_currency("eur"));
        assert!(!is_supported_currency("USD"));
        assert!(!is_supported_currency("jpy"));
        assert!(!is_supported_currency("dollars"));
    }

    #[test]
    fn test_emails() {
        assert!(is_valid_email("billing@example.com"));
        assert!(is_valid_email("first.last+tag@sub.example.co.uk"));
        assert!(!is_valid_email("no-at-sign.example.com"));
        assert!(!is_valid_email("user@"));
        assert!(!is_valid_email("user@-bad.com"));
        assert!(!is_valid_email("user@example"));
    }

    #[test]
    fn test_phones() {
        assert!(is_valid_phone("+14155550123"));
        assert!(is_valid_phone("+447911123456"));
        assert!(!is_valid_phone("4155550123"));
        assert!(!is_valid_phone("+0123456789"));
        assert!(!is_valid_phone("+1 415 555 0123"));
        assert!(!is_valid_phone("+1234"));
    }

    #[test]
    fn test_validation_errors_collect_first_message() {
        let mut errors = ValidationErrors::new();
        assert!(errors.clone().into_result().is_ok());

        errors.add("amount", "must be greater than zero");
        errors.add("amount", "ignored");
        errors.add("currency", "unsupported");

        assert_eq!(errors.fields().len(), 2);
        assert_eq!(errors.fields()["amount"], "must be greater than zero");
        assert!(errors.to_string().contains("currency: unsupported"));
        assert!(errors.into_result().is_err());
    }
}
