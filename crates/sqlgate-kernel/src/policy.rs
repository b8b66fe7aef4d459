use std::sync::LazyLock;

use regex::Regex;
use sqlgate_contracts::{Intent, PolicyVerdict};

pub const DEFAULT_RESTRICTED_ROLES: [&str; 1] = ["teller"];

/// Personal-data terms a restricted role may not ask about.
pub const DEFAULT_PII_TERMS: [&str; 14] = [
    "tc",
    "tckn",
    "kimlik",
    "iban",
    "adres",
    "telefon",
    "email",
    "e-mail",
    "e-posta",
    "eposta",
    "national id",
    "ssn",
    "address",
    "phone",
];

pub const REFUSAL_REASON: &str = "Güvensiz/zararlı istek.";

static DEFAULT_PII_RE: LazyLock<Regex> = LazyLock::new(|| {
    lexicon_regex(DEFAULT_PII_TERMS.iter().copied()).expect("invalid default pii lexicon")
});
// Literal account numbers count as PII even without the word "IBAN".
static IBAN_SHAPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Z]{2}\d{2}(?:\s?[A-Z0-9]{4}){3,7}").expect("invalid iban pattern")
});

fn lexicon_regex<'a>(terms: impl Iterator<Item = &'a str>) -> Result<Regex, regex::Error> {
    let alternatives: Vec<String> = terms
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| regex::escape(t).replace(' ', r"\s+"))
        .collect();
    if alternatives.is_empty() {
        // Never matches.
        return Regex::new(r"[^\s\S]");
    }
    Regex::new(&format!(r"(?i)\b(?:{})\b", alternatives.join("|")))
}

/// Role-based gate between classification and any schema access.
#[derive(Debug, Clone)]
pub struct PolicyGate {
    restricted_roles: Vec<String>,
    pii: Regex,
}

impl Default for PolicyGate {
    fn default() -> Self {
        Self {
            restricted_roles: DEFAULT_RESTRICTED_ROLES
                .iter()
                .map(|r| r.to_string())
                .collect(),
            pii: DEFAULT_PII_RE.clone(),
        }
    }
}

impl PolicyGate {
    pub fn new(restricted_roles: &[String], pii_terms: Option<&[String]>) -> Result<Self, regex::Error> {
        let pii = match pii_terms {
            Some(terms) => lexicon_regex(terms.iter().map(String::as_str))?,
            None => DEFAULT_PII_RE.clone(),
        };
        Ok(Self {
            restricted_roles: restricted_roles
                .iter()
                .map(|r| r.trim().to_lowercase())
                .filter(|r| !r.is_empty())
                .collect(),
            pii,
        })
    }

    pub fn is_restricted(&self, role: &str) -> bool {
        let role = role.trim().to_lowercase();
        self.restricted_roles.iter().any(|r| *r == role)
    }

    pub fn mentions_pii(&self, message: &str) -> bool {
        self.pii.is_match(message) || IBAN_SHAPE_RE.is_match(message)
    }

    pub fn evaluate(&self, role: &str, message: &str, intent: Intent) -> PolicyVerdict {
        if self.is_restricted(role) && self.mentions_pii(message) {
            return PolicyVerdict::deny(format!(
                "{} rolü PII içeren alanlara erişemez.",
                capitalize(role.trim())
            ));
        }
        if intent == Intent::Refuse {
            return PolicyVerdict::deny(REFUSAL_REASON);
        }
        PolicyVerdict::allow()
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn teller_cannot_ask_for_pii_whatever_the_intent() {
        let gate = PolicyGate::default();
        for intent in Intent::ALL {
            let v = gate.evaluate("teller", "müşterinin IBAN bilgisini getir", intent);
            assert!(!v.allowed, "{intent}");
            assert_eq!(v.reason, "Teller rolü PII içeren alanlara erişemez.");
        }
    }

    #[test]
    fn iban_shaped_value_counts_as_pii() {
        let gate = PolicyGate::default();
        let v = gate.evaluate("Teller", "TR33 0006 1005 1978 6457 8413 26 kimin", Intent::GenerateSql);
        assert!(!v.allowed);
    }

    #[test]
    fn unrestricted_role_may_mention_pii() {
        let gate = PolicyGate::default();
        let v = gate.evaluate("manager", "müşteri telefon listesi", Intent::GenerateSql);
        assert!(v.allowed);
        assert!(v.reason.is_empty());
    }

    #[test]
    fn refuse_intent_is_denied_with_reason() {
        let gate = PolicyGate::default();
        let v = gate.evaluate("manager", "DROP TABLE satislar", Intent::Refuse);
        assert!(!v.allowed);
        assert_eq!(v.reason, REFUSAL_REASON);
    }

    #[test]
    fn pii_terms_need_word_boundaries() {
        let gate = PolicyGate::default();
        assert!(!gate.mentions_pii("etc raporu"));
        assert!(gate.mentions_pii("e-posta adresleri"));
        assert!(gate.mentions_pii("national   id numbers"));
    }

    #[test]
    fn custom_lexicon_replaces_default() {
        let terms = vec!["maas".to_string()];
        let gate = PolicyGate::new(&["Gise".to_string()], Some(terms.as_slice())).unwrap();
        assert!(!gate.evaluate("gise", "maas listesi", Intent::GenerateSql).allowed);
        assert!(gate.evaluate("gise", "telefon listesi", Intent::GenerateSql).allowed);
        assert!(gate.evaluate("teller", "maas listesi", Intent::GenerateSql).allowed);

        let empty = PolicyGate::new(&["teller".to_string()], Some(&[][..])).unwrap();
        assert!(empty.evaluate("teller", "iban", Intent::GenerateSql).allowed);
    }
}
