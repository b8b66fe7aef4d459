//! Safety gate for model- or operator-supplied SQL.
//!
//! Structural checks (statement shape, source relations, `LIMIT`) run over
//! the token stream from [`crate::lexer`], so comments and string literals
//! can neither hide a relation nor fake a clause. The mutating-keyword scan
//! runs on the raw text and therefore also rejects keywords inside literals.
//! All hard checks run on every input so that the caller sees the full list
//! of problems, and the only rewrite ever applied is appending a `LIMIT`
//! clause to an otherwise acceptable statement.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use sqlgate_contracts::SqlCandidate;

use crate::lexer::{tokenize, Token};

/// Keywords that can change data, schema or privileges.
pub const MUTATING_KEYWORDS: [&str; 13] = [
    "DROP", "DELETE", "UPDATE", "INSERT", "ALTER", "TRUNCATE", "CREATE", "RENAME", "GRANT",
    "REVOKE", "REPLACE", "EXEC", "CALL",
];

pub const ISSUE_SQL_MISSING: &str = "SQL missing";
pub const ISSUE_NOT_READ_ONLY: &str = "only SELECT/WITH allowed";
pub const ISSUE_FORBIDDEN_KEYWORD: &str = "forbidden keyword";
pub const ISSUE_MULTIPLE_STATEMENTS: &str = "multiple statements not allowed";
pub const ISSUE_UNTERMINATED: &str = "unterminated comment, literal or identifier";
pub const ISSUE_NO_ALLOWED_RELATION: &str = "does not reference an allowed relation";
pub const ISSUE_RELATION_NOT_ALLOWED: &str = "relation not allowed";
pub const ISSUE_LIMIT_NOT_NUMERIC: &str = "LIMIT must be a non-negative integer";
pub const ISSUE_LIMIT_ABOVE_CEILING: &str = "LIMIT exceeds ceiling";

/// Words that end a `FROM` list at its own nesting level.
const FROM_LIST_END: [&str; 18] = [
    "WHERE", "GROUP", "ORDER", "HAVING", "LIMIT", "OFFSET", "UNION", "EXCEPT", "INTERSECT",
    "WINDOW", "JOIN", "INNER", "LEFT", "RIGHT", "FULL", "CROSS", "NATURAL", "ON",
];

static MUTATING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)\b({})\b", MUTATING_KEYWORDS.join("|")))
        .expect("invalid mutating keyword pattern")
});

/// Returns the distinct mutating keywords found in `text`, upper-cased, in first-seen order.
pub fn mutating_keywords(text: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for m in MUTATING_RE.find_iter(text) {
        let kw = m.as_str().to_ascii_uppercase();
        if !seen.contains(&kw) {
            seen.push(kw);
        }
    }
    seen
}

pub fn contains_mutating_keyword(text: &str) -> bool {
    MUTATING_RE.is_match(text)
}

/// One `LIMIT` keyword and what follows it.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LimitClause {
    /// `LIMIT n`, `LIMIT offset, n` or `LIMIT n OFFSET m`; holds the row-count digits.
    Rows(String),
    /// `LIMIT ALL`, `LIMIT -1`, `LIMIT (n)` and anything else that is not a plain integer.
    Unbounded(String),
}

/// Every `LIMIT` clause in `tokens`, in order.
fn clauses_in(tokens: &[Token]) -> Vec<LimitClause> {
    let mut out = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        if !token.is_keyword("LIMIT") {
            continue;
        }
        let Some(first) = tokens.get(i + 1).and_then(digits) else {
            out.push(LimitClause::Unbounded(shown_at(tokens, i + 1)));
            continue;
        };
        if !tokens.get(i + 2).is_some_and(|t| t.is_punct(',')) {
            out.push(LimitClause::Rows(first.to_string()));
            continue;
        }
        match tokens.get(i + 3).and_then(digits) {
            Some(rows) => out.push(LimitClause::Rows(rows.to_string())),
            None => out.push(LimitClause::Unbounded(shown_at(tokens, i + 3))),
        }
    }
    out
}

fn digits(token: &Token) -> Option<&str> {
    match token {
        Token::Word { text, quoted: false }
            if !text.is_empty() && text.chars().all(|c| c.is_ascii_digit()) =>
        {
            Some(text.as_str())
        }
        _ => None,
    }
}

/// Text of the token at `at` for issue messages, keeping a sign with its number.
fn shown_at(tokens: &[Token], at: usize) -> String {
    match tokens.get(at) {
        None => String::new(),
        Some(Token::Word { text, .. }) => text.clone(),
        Some(Token::Literal) => "'...'".to_string(),
        Some(Token::Punct(c)) => match tokens.get(at + 1).and_then(Token::word) {
            Some(next) if matches!(*c, '-' | '+') => format!("{c}{next}"),
            _ => c.to_string(),
        },
    }
}

/// How a missing or oversized `LIMIT` is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitPolicy {
    /// Append `LIMIT default_limit` when absent; explicit limits are left alone.
    Inject { default_limit: u64 },
    /// Append `LIMIT default_limit` when absent; reject any explicit limit above `max_limit`.
    Ceiling { default_limit: u64, max_limit: u64 },
}

impl LimitPolicy {
    pub fn default_limit(&self) -> u64 {
        match self {
            LimitPolicy::Inject { default_limit } => *default_limit,
            LimitPolicy::Ceiling { default_limit, .. } => *default_limit,
        }
    }

    pub fn max_limit(&self) -> Option<u64> {
        match self {
            LimitPolicy::Inject { .. } => None,
            LimitPolicy::Ceiling { max_limit, .. } => Some(*max_limit),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LimitPolicy::Inject { .. } => "inject",
            LimitPolicy::Ceiling { .. } => "ceiling",
        }
    }
}

impl Default for LimitPolicy {
    fn default() -> Self {
        LimitPolicy::Inject { default_limit: 200 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidatorConfig {
    pub limit_policy: LimitPolicy,
}

#[derive(Debug, Clone, Default)]
pub struct SqlValidator {
    config: ValidatorConfig,
}

impl SqlValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    pub fn default_limit(&self) -> u64 {
        self.config.limit_policy.default_limit()
    }

    /// Checks `sql` and, when it is acceptable but unbounded, appends a `LIMIT`.
    ///
    /// With an allow-list every `FROM`/`JOIN` source must be on it and at
    /// least one must be present. `None` skips the relation checks;
    /// `Some(&[])` allows nothing.
    pub fn validate(&self, sql: &str, allowed_relations: Option<&[String]>) -> SqlCandidate {
        let trimmed = sql.trim();
        if trimmed.is_empty() {
            return SqlCandidate {
                sql: String::new(),
                ok: false,
                issues: vec![ISSUE_SQL_MISSING.to_string()],
            };
        }

        let lexed = tokenize(trimmed);
        let tokens = &lexed.tokens;
        let mut issues = Vec::new();
        let read_only = tokens
            .first()
            .is_some_and(|t| t.is_keyword("SELECT") || t.is_keyword("WITH"));
        if !read_only {
            issues.push(ISSUE_NOT_READ_ONLY.to_string());
        }
        let keywords = mutating_keywords(trimmed);
        if !keywords.is_empty() {
            issues.push(format!("{ISSUE_FORBIDDEN_KEYWORD}: {}", keywords.join(", ")));
        }
        if tokens
            .iter()
            .position(|t| t.is_punct(';'))
            .is_some_and(|at| at + 1 < tokens.len())
        {
            issues.push(ISSUE_MULTIPLE_STATEMENTS.to_string());
        }
        if lexed.unterminated {
            issues.push(ISSUE_UNTERMINATED.to_string());
        }
        if let Some(allowed) = allowed_relations {
            let sources = sources_in(tokens);
            let (permitted, rejected): (Vec<_>, Vec<_>) =
                sources.into_iter().partition(|name| is_allowed(name, allowed));
            if permitted.is_empty() {
                issues.push(ISSUE_NO_ALLOWED_RELATION.to_string());
            }
            for relation in rejected {
                issues.push(format!("{ISSUE_RELATION_NOT_ALLOWED}: {relation}"));
            }
        }

        let limits = clauses_in(tokens);
        for clause in &limits {
            match clause {
                LimitClause::Unbounded(shown) if shown.is_empty() => {
                    issues.push(ISSUE_LIMIT_NOT_NUMERIC.to_string());
                }
                LimitClause::Unbounded(shown) => {
                    issues.push(format!("{ISSUE_LIMIT_NOT_NUMERIC}: {shown}"));
                }
                LimitClause::Rows(rows) => {
                    if let Some(max_limit) = self.config.limit_policy.max_limit() {
                        // Digit strings too long for u64 are certainly above the ceiling.
                        let over = rows.parse::<u64>().map(|v| v > max_limit).unwrap_or(true);
                        if over {
                            issues.push(format!("{ISSUE_LIMIT_ABOVE_CEILING}: {rows} > {max_limit}"));
                        }
                    }
                }
            }
        }

        if !issues.is_empty() {
            return SqlCandidate {
                sql: trimmed.to_string(),
                ok: false,
                issues,
            };
        }

        if !limits.is_empty() {
            return SqlCandidate {
                sql: trimmed.to_string(),
                ok: true,
                issues: Vec::new(),
            };
        }

        let limit = self.default_limit();
        // Only comments can follow the terminator here; they go with it.
        let body = match lexed.terminator {
            Some(at) => trimmed[..at].trim_end(),
            None => trimmed,
        };
        // A trailing line comment would swallow a same-line LIMIT.
        let separator = if body.contains("--") { "\n" } else { " " };
        SqlCandidate {
            sql: format!("{body}{separator}LIMIT {limit}"),
            ok: true,
            issues: vec![format!("LIMIT {limit} added")],
        }
    }
}

fn is_allowed(name: &str, allowed: &[String]) -> bool {
    allowed.iter().any(|a| a.trim().eq_ignore_ascii_case(name))
}

/// Relation names read from `FROM` lists, `JOIN` and `TABLE` targets, excluding CTE
/// names defined in the same statement.
fn sources_in(tokens: &[Token]) -> Vec<String> {
    let ctes = cte_names(tokens);
    // One entry per open parenthesis: does it hold a query? The bottom entry is the statement.
    let mut frames = vec![true];
    let mut found: Vec<String> = Vec::new();

    for (i, token) in tokens.iter().enumerate() {
        if token.is_punct('(') {
            frames.push(opens_query(tokens, i + 1));
        } else if token.is_punct(')') {
            if frames.len() > 1 {
                frames.pop();
            }
        } else if token.is_keyword("FROM") && frames.last().copied().unwrap_or(true) {
            // FROM inside EXTRACT(... FROM x) and friends is not a table reference.
            for name in from_list(tokens, i + 1) {
                push_unique(&mut found, name);
            }
        } else if token.is_keyword("JOIN") || token.is_keyword("TABLE") {
            if let Some(name) = relation_at(tokens, i + 1) {
                push_unique(&mut found, name);
            }
        }
    }

    found
        .into_iter()
        .filter(|name| !ctes.contains(&name.to_lowercase()))
        .collect()
}

fn push_unique(found: &mut Vec<String>, name: String) {
    if !found.iter().any(|n| n.eq_ignore_ascii_case(&name)) {
        found.push(name);
    }
}

fn opens_query(tokens: &[Token], at: usize) -> bool {
    tokens
        .get(at)
        .is_some_and(|t| t.is_keyword("SELECT") || t.is_keyword("WITH") || t.is_keyword("VALUES"))
}

/// The relation named at `at`, unwrapping `(name)`; `None` for a subquery.
fn relation_at(tokens: &[Token], at: usize) -> Option<String> {
    match tokens.get(at)? {
        Token::Word { text, .. } => Some(text.clone()),
        t if t.is_punct('(') && !opens_query(tokens, at + 1) => relation_at(tokens, at + 1),
        _ => None,
    }
}

/// Every item of the comma-separated list that starts at `at`.
fn from_list(tokens: &[Token], at: usize) -> Vec<String> {
    let mut out: Vec<String> = relation_at(tokens, at).into_iter().collect();
    let mut depth = 0usize;
    let mut k = at;
    while let Some(token) = tokens.get(k) {
        if token.is_punct('(') {
            depth += 1;
        } else if token.is_punct(')') {
            if depth == 0 {
                break;
            }
            depth -= 1;
        } else if depth == 0 {
            if token.is_punct(';') || FROM_LIST_END.iter().any(|kw| token.is_keyword(kw)) {
                break;
            }
            if token.is_punct(',') {
                out.extend(relation_at(tokens, k + 1));
            }
        }
        k += 1;
    }
    out
}

/// Lower-cased names bound by `WITH name [(cols)] AS [NOT] [MATERIALIZED] (...)`.
fn cte_names(tokens: &[Token]) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    for (i, token) in tokens.iter().enumerate() {
        if !token.is_keyword("WITH") {
            continue;
        }
        let mut k = i + 1;
        if tokens.get(k).is_some_and(|t| t.is_keyword("RECURSIVE")) {
            k += 1;
        }
        loop {
            let Some(name) = tokens.get(k).and_then(Token::word) else {
                break;
            };
            names.insert(name.to_lowercase());
            k += 1;
            if tokens.get(k).is_some_and(|t| t.is_punct('(')) {
                k = skip_group(tokens, k);
            }
            if !tokens.get(k).is_some_and(|t| t.is_keyword("AS")) {
                break;
            }
            k += 1;
            while tokens
                .get(k)
                .is_some_and(|t| t.is_keyword("NOT") || t.is_keyword("MATERIALIZED"))
            {
                k += 1;
            }
            if !tokens.get(k).is_some_and(|t| t.is_punct('(')) {
                break;
            }
            k = skip_group(tokens, k);
            if !tokens.get(k).is_some_and(|t| t.is_punct(',')) {
                break;
            }
            k += 1;
        }
    }
    names
}

/// Index just past the parenthesis that closes the one at `open`.
fn skip_group(tokens: &[Token], open: usize) -> usize {
    let mut depth = 0usize;
    for (k, token) in tokens.iter().enumerate().skip(open) {
        if token.is_punct('(') {
            depth += 1;
        } else if token.is_punct(')') {
            depth = depth.saturating_sub(1);
            if depth == 0 {
                return k + 1;
            }
        }
    }
    tokens.len()
}
