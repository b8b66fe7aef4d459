use sqlgate_contracts::Intent;

use crate::machine::{RequestState, Stage};

pub const SECURITY_REFUSAL: &str = "Bu isteği güvenlik nedeniyle yerine getiremiyorum.";
pub const GENERIC_CLARIFY: &str = "Daha net yazar mısın?";
pub const NOT_UNDERSTOOD: &str = "Tam anlayamadım; biraz daha detay verir misin?";

/// Builds the user-visible reply from whatever the request gathered.
///
/// Total by construction: every branch yields a non-empty string.
pub fn compose(state: &RequestState) -> String {
    let body = compose_body(state);
    if state.notes.is_empty() {
        body
    } else {
        format!("{body} {}", state.notes.join(" "))
    }
}

fn compose_body(state: &RequestState) -> String {
    if let Some(verdict) = state.verdict.as_ref().filter(|v| !v.allowed) {
        return format!("İstek reddedildi: {}", verdict.reason);
    }

    let Some(classification) = &state.classification else {
        return NOT_UNDERSTOOD.to_string();
    };

    if state.visited(Stage::ClarifyNeeded) {
        let question = classification.clarify_question.trim();
        return if question.is_empty() {
            GENERIC_CLARIFY.to_string()
        } else {
            question.to_string()
        };
    }

    match classification.intent {
        Intent::Refuse => SECURITY_REFUSAL.to_string(),
        Intent::AskMetadata => format!(
            "Mevcut tablolar: {}. Örnek kolonlar: {}.",
            list_or_dash(&state.metadata.tables),
            list_or_dash(&state.metadata.columns)
        ),
        Intent::ExecuteSql | Intent::GenerateSql => sql_outcome(state),
        Intent::Clarify => GENERIC_CLARIFY.to_string(),
    }
}

fn sql_outcome(state: &RequestState) -> String {
    let Some(candidate) = &state.validation else {
        return NOT_UNDERSTOOD.to_string();
    };
    if !candidate.ok {
        return format!("SQL doğrulanamadı: {}", candidate.issues.join("; "));
    }
    if let Some(err) = &state.execution_error {
        return format!("SQL çalıştırılamadı: {err}");
    }
    match &state.execution {
        Some(summary) if summary.dry_run => {
            format!("SQL doğrulandı (dry run, çalıştırılmadı): {}", candidate.sql)
        }
        Some(summary) => {
            let mut out = format!("SQL çalıştırıldı. Sonuç özeti: {} satır", summary.row_count);
            if !summary.columns.is_empty() {
                out.push_str(&format!(" (kolonlar: {})", summary.columns.join(", ")));
            }
            out.push('.');
            out
        }
        None => format!("SQL doğrulandı: {}", candidate.sql),
    }
}

fn list_or_dash(items: &[String]) -> String {
    if items.is_empty() {
        "-".to_string()
    } else {
        items.join(", ")
    }
}
