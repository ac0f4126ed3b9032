//! # Data sanitizer
//!
//! Any text that enters a composed prompt passes through here first. The
//! sanitizer replaces sensitive substrings with category-tagged markers like
//! `[REDACTED:EMAIL]`.
//!
//! The rules are an ordered table of `(category, pattern)` pairs, evaluated
//! deterministically from top to bottom; the data lives apart from the logic
//! so each pattern can be tested on its own. Markers contain no digits and no
//! `@`, so no rule can match inside a marker and sanitizing twice yields the
//! same text as sanitizing once.
//!
//! The default policy redacts every category. A caller may disable individual
//! categories via [SanitizePolicy::without]; there is no way to widen
//! redaction beyond the full set, so omission never leaks.

use std::collections::HashSet;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Categories of sensitive data the sanitizer knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensitiveCategory {
    EmailAddress,
    PaymentCard,
    NationalId,
    PhoneNumber,
    IpAddress,
}

impl SensitiveCategory {
    /// The marker text substituted for a match of this category.
    pub fn marker(self) -> &'static str {
        match self {
            SensitiveCategory::EmailAddress => "[REDACTED:EMAIL]",
            SensitiveCategory::PaymentCard => "[REDACTED:PAYMENT-CARD]",
            SensitiveCategory::NationalId => "[REDACTED:NATIONAL-ID]",
            SensitiveCategory::PhoneNumber => "[REDACTED:PHONE]",
            SensitiveCategory::IpAddress => "[REDACTED:IP]",
        }
    }
}

lazy_static! {
    /// Ordered rule table. Payment cards and national ids come before phone
    /// numbers so the longer digit runs are claimed by the right category.
    static ref SANITIZE_RULES: Vec<(SensitiveCategory, Regex)> = vec![
        (
            SensitiveCategory::EmailAddress,
            Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap(),
        ),
        (
            SensitiveCategory::PaymentCard,
            Regex::new(r"\b\d{4}[ -]?\d{4}[ -]?\d{4}[ -]?\d{1,4}\b").unwrap(),
        ),
        (
            SensitiveCategory::NationalId,
            Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap(),
        ),
        (
            SensitiveCategory::PhoneNumber,
            Regex::new(r"\b(?:\+?\d{1,2}[ .-]?)?(?:\(\d{3}\)|\d{3})[ .-]?\d{3}[ .-]?\d{4}\b")
                .unwrap(),
        ),
        (
            SensitiveCategory::IpAddress,
            Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap(),
        ),
    ];
}

/// Which categories to redact. Defaults to all of them.
#[derive(Debug, Clone, Default)]
pub struct SanitizePolicy {
    disabled: HashSet<SensitiveCategory>,
}

impl SanitizePolicy {
    /// The default policy: every category redacted.
    pub fn redact_all() -> Self {
        Self::default()
    }

    /// Disable redaction of one category for this policy.
    pub fn without(mut self, category: SensitiveCategory) -> Self {
        self.disabled.insert(category);
        self
    }

    /// Whether this policy redacts the given category.
    pub fn redacts(&self, category: SensitiveCategory) -> bool {
        !self.disabled.contains(&category)
    }
}

/// Sanitize `text` under the given policy.
pub fn sanitize_with(text: &str, policy: &SanitizePolicy) -> String {
    let mut out = text.to_string();
    for (category, pattern) in SANITIZE_RULES.iter() {
        if policy.redacts(*category) {
            out = pattern.replace_all(&out, category.marker()).to_string();
        }
    }
    out
}

/// Sanitize `text` under the default redact-everything policy.
pub fn sanitize(text: &str) -> String {
    sanitize_with(text, &SanitizePolicy::redact_all())
}

#[cfg(test)]
mod sanitize_tests {
    use super::*;

    #[test]
    fn test_redacts_each_category() {
        let text = "Contact ops@example.com or 555-867-5309. Host 10.0.3.12, \
                    card 4111 1111 1111 1111, ssn 078-05-1120.";
        let clean = sanitize(text);
        assert!(clean.contains("[REDACTED:EMAIL]"));
        assert!(clean.contains("[REDACTED:PHONE]"));
        assert!(clean.contains("[REDACTED:IP]"));
        assert!(clean.contains("[REDACTED:PAYMENT-CARD]"));
        assert!(clean.contains("[REDACTED:NATIONAL-ID]"));
        assert!(!clean.contains("example.com"));
        assert!(!clean.contains("10.0.3.12"));
    }

    #[test]
    fn test_idempotent() {
        let samples = [
            "plain text with no secrets",
            "mail me at admin@corp.io from 192.168.1.1",
            "card 4111-1111-1111-1111 phone (415) 555-0100 ssn 078-05-1120",
            "[REDACTED:EMAIL] already sanitized",
        ];
        for s in samples {
            let once = sanitize(s);
            assert_eq!(once, sanitize(&once), "not idempotent for {:?}", s);
        }
    }

    #[test]
    fn test_policy_disables_single_category() {
        let policy = SanitizePolicy::redact_all().without(SensitiveCategory::IpAddress);
        let clean = sanitize_with("node 10.0.0.1 owner ops@example.com", &policy);
        assert!(clean.contains("10.0.0.1"));
        assert!(clean.contains("[REDACTED:EMAIL]"));
    }

    #[test]
    fn test_card_claimed_before_phone() {
        let clean = sanitize("pan 4111111111111111");
        assert!(clean.contains("[REDACTED:PAYMENT-CARD]"));
        assert!(!clean.contains("[REDACTED:PHONE]"));
    }
}
