//! Ordered rule cascade that turns a request into an [`Intent`].
//!
//! Rules are tried top to bottom and the first match wins. The order is part
//! of the contract: provided SQL beats message SQL, which beats a stated
//! intent to mutate, which beats metadata questions, which beat the
//! too-short check.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use sqlgate_contracts::{Classification, Intent};

use crate::validator::contains_mutating_keyword;

pub const CLARIFY_PROMPT: &str = "Ne sorgulamak istiyorsun? (örn: zaman aralığı, metrik, filtre)";

pub const ENTITY_SQL: &str = "sql";
pub const ENTITY_TIME_WINDOW_DAYS: &str = "time_window_days";

const MIN_MESSAGE_CHARS: usize = 3;
const BARE_TOKENS: [&str; 7] = ["?", "??", "؟", "؟؟", "…", "...", "!"];

static SELECT_START_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*SELECT\b").expect("invalid select pattern"));
static METADATA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:tablo|kolon|sütun|sutun|şema|schema|alan|column|table|field|metadata)")
        .expect("invalid metadata keyword pattern")
});
static TIME_WINDOW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:son|last|past)\s+(\d{1,4})\s*(?:gün|gun|day)")
        .expect("invalid time window pattern")
});

/// Number of days in phrases like "son 7 gün" or "last 30 days".
pub fn time_window_days(message: &str) -> Option<u32> {
    TIME_WINDOW_RE
        .captures(message)
        .and_then(|cap| cap[1].parse().ok())
        .filter(|days| *days > 0)
}

pub fn classify(message: &str, provided_sql: Option<&str>) -> Classification {
    let msg = message.trim();
    let provided = provided_sql.map(str::trim).unwrap_or_default();

    if !provided.is_empty() {
        return sql_verdict(provided);
    }

    if SELECT_START_RE.is_match(msg) {
        return sql_verdict(msg);
    }

    if contains_mutating_keyword(msg) {
        return result(Intent::Refuse, 0.95, BTreeMap::new());
    }

    let mut entities = BTreeMap::new();
    if let Some(days) = time_window_days(msg) {
        entities.insert(ENTITY_TIME_WINDOW_DAYS.to_string(), days.to_string());
    }

    if METADATA_RE.is_match(msg) {
        return result(Intent::AskMetadata, 0.8, entities);
    }

    if msg.chars().count() < MIN_MESSAGE_CHARS || BARE_TOKENS.contains(&msg) {
        return Classification {
            intent: Intent::Clarify,
            confidence: 0.4,
            needs_clarification: true,
            clarify_question: CLARIFY_PROMPT.to_string(),
            entities,
        };
    }

    result(Intent::GenerateSql, 0.7, entities)
}

fn sql_verdict(sql: &str) -> Classification {
    let mut entities = BTreeMap::new();
    entities.insert(ENTITY_SQL.to_string(), sql.to_string());
    if contains_mutating_keyword(sql) {
        result(Intent::Refuse, 0.99, entities)
    } else {
        result(Intent::ExecuteSql, 1.0, entities)
    }
}

fn result(intent: Intent, confidence: f64, entities: BTreeMap<String, String>) -> Classification {
    Classification {
        intent,
        confidence,
        needs_clarification: false,
        clarify_question: String::new(),
        entities,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provided_sql_takes_priority() {
        let c = classify("Hangi tablolar var?", Some("SELECT * FROM satislar"));
        assert_eq!(c.intent, Intent::ExecuteSql);
        assert_eq!(c.confidence, 1.0);
        assert_eq!(c.entities[ENTITY_SQL], "SELECT * FROM satislar");

        let c = classify("rapor", Some("  DELETE FROM satislar "));
        assert_eq!(c.intent, Intent::Refuse);
        assert_eq!(c.confidence, 0.99);
    }

    #[test]
    fn blank_provided_sql_is_ignored() {
        let c = classify("Hangi tablolar var?", Some("   "));
        assert_eq!(c.intent, Intent::AskMetadata);
    }

    #[test]
    fn select_in_message_is_carried_forward() {
        let c = classify("  select tarih from satislar", None);
        assert_eq!(c.intent, Intent::ExecuteSql);
        assert_eq!(c.entities[ENTITY_SQL], "select tarih from satislar");

        let c = classify("SELECT 1; DROP TABLE satislar", None);
        assert_eq!(c.intent, Intent::Refuse);
        assert_eq!(c.confidence, 0.99);
    }

    #[test]
    fn stated_mutation_is_refused_before_metadata() {
        let c = classify("DROP TABLE satislar", None);
        assert_eq!(c.intent, Intent::Refuse);
        assert_eq!(c.confidence, 0.95);

        let c = classify("müşteri tablosunu truncate et", None);
        assert_eq!(c.intent, Intent::Refuse);
    }

    #[test]
    fn metadata_questions() {
        for msg in [
            "Hangi tablolar var?",
            "satislar kolonları neler",
            "show me the schema",
            "Şema nedir",
            "which fields exist",
        ] {
            let c = classify(msg, None);
            assert_eq!(c.intent, Intent::AskMetadata, "{msg}");
            assert_eq!(c.confidence, 0.8);
        }
    }

    #[test]
    fn short_messages_need_clarification() {
        for msg in ["", "?", "ab", " x ", "…", "؟؟"] {
            let c = classify(msg, None);
            assert_eq!(c.intent, Intent::Clarify, "{msg:?}");
            assert!(c.needs_clarification);
            assert_eq!(c.confidence, 0.4);
            assert_eq!(c.clarify_question, CLARIFY_PROMPT);
        }
    }

    #[test]
    fn everything_else_generates_sql() {
        let c = classify("Son 7 günde satışları getir", None);
        assert_eq!(c.intent, Intent::GenerateSql);
        assert_eq!(c.confidence, 0.7);
        assert!(!c.needs_clarification);
        assert_eq!(c.entities[ENTITY_TIME_WINDOW_DAYS], "7");
    }

    #[test]
    fn classification_is_deterministic() {
        let a = classify("Son 30 gün müşteri sayısı", None);
        let b = classify("Son 30 gün müşteri sayısı", None);
        assert_eq!(a, b);
    }

    #[test]
    fn time_window_parsing() {
        assert_eq!(time_window_days("last 30 days of sales"), Some(30));
        assert_eq!(time_window_days("son 7 günde"), Some(7));
        assert_eq!(time_window_days("son 0 gün"), None);
        assert_eq!(time_window_days("geçen ay"), None);
    }
}
