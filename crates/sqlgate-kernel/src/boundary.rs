//! Contracts for the collaborators that propose and run SQL, plus the
//! in-process implementations that need no external service.

use sqlgate_contracts::ExecutionSummary;

use crate::error::BoundaryError;

const TEMPLATE_MAX_COLUMNS: usize = 2;
const FALLBACK_MAX_COLUMNS: usize = 7;

/// Everything a synthesizer may look at. Its output is untrusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisRequest {
    pub correlation_id: String,
    pub message: String,
    pub role: String,
    pub tables: Vec<String>,
    pub columns: Vec<String>,
    pub default_limit: u64,
    pub time_window_days: Option<u32>,
}

pub trait Synthesizer {
    fn synthesize(&self, request: &SynthesisRequest) -> Result<String, BoundaryError>;
}

pub trait Executor {
    fn execute(&self, sql: &str) -> Result<ExecutionSummary, BoundaryError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SqlDialect {
    #[default]
    Ansi,
    Sqlite,
}

impl SqlDialect {
    fn days_ago(&self, days: u32) -> String {
        match self {
            SqlDialect::Ansi => format!("CURRENT_DATE - INTERVAL '{days} days'"),
            SqlDialect::Sqlite => format!("date('now', '-{days} days')"),
        }
    }
}

/// Deterministic single-relation query built from the candidates alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateSynthesizer {
    dialect: SqlDialect,
}

impl TemplateSynthesizer {
    pub fn new(dialect: SqlDialect) -> Self {
        Self { dialect }
    }
}

impl Synthesizer for TemplateSynthesizer {
    fn synthesize(&self, request: &SynthesisRequest) -> Result<String, BoundaryError> {
        let table = request
            .tables
            .first()
            .ok_or_else(|| BoundaryError::Unavailable("no candidate relation".to_string()))?;
        let columns = columns_of(table, &request.columns);
        let date_column = columns.iter().find(|c| is_date_like(c));

        let mut picked: Vec<&str> = Vec::new();
        if let Some(date) = date_column {
            picked.push(date);
        }
        for column in columns.iter().filter(|c| !is_date_like(c) && !is_id_like(c)) {
            if picked.len() == TEMPLATE_MAX_COLUMNS {
                break;
            }
            picked.push(column);
        }
        if picked.is_empty() {
            picked.extend(columns.iter().take(TEMPLATE_MAX_COLUMNS).copied());
        }

        let projection = if picked.is_empty() {
            "*".to_string()
        } else {
            picked.join(", ")
        };
        let filter = match (request.time_window_days, date_column) {
            (Some(days), Some(date)) => format!(" WHERE {date} >= {}", self.dialect.days_ago(days)),
            _ => String::new(),
        };
        Ok(format!(
            "SELECT {projection} FROM {table}{filter} LIMIT {}",
            request.default_limit
        ))
    }
}

/// Reports success without touching any database.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunExecutor;

impl Executor for DryRunExecutor {
    fn execute(&self, _sql: &str) -> Result<ExecutionSummary, BoundaryError> {
        Ok(ExecutionSummary {
            row_count: 0,
            columns: Vec::new(),
            preview: Vec::new(),
            dry_run: true,
        })
    }
}

/// Safe query substituted when the synthesizer fails. `None` without a relation.
pub fn fallback_sql(tables: &[String], columns: &[String], limit: u64) -> Option<String> {
    let table = tables.first()?;
    let columns: Vec<&str> = columns_of(table, columns)
        .into_iter()
        .take(FALLBACK_MAX_COLUMNS)
        .collect();
    let projection = if columns.is_empty() {
        "*".to_string()
    } else {
        columns.join(", ")
    };
    Some(format!("SELECT {projection} FROM {table} LIMIT {limit}"))
}

/// Candidate columns usable against `table`: bare names plus `table.col`
/// names stripped of their prefix. Columns qualified with another table are skipped.
fn columns_of<'a>(table: &str, columns: &'a [String]) -> Vec<&'a str> {
    columns
        .iter()
        .filter_map(|c| match c.split_once('.') {
            Some((owner, name)) if owner.eq_ignore_ascii_case(table) => Some(name),
            Some(_) => None,
            None => Some(c.as_str()),
        })
        .collect()
}

fn is_date_like(column: &str) -> bool {
    let c = column.to_ascii_lowercase();
    c == "tarih" || c == "date" || c.starts_with("tarih_") || c.ends_with("_date") || c.ends_with("_at")
}

fn is_id_like(column: &str) -> bool {
    let c = column.to_ascii_lowercase();
    c == "id" || c.ends_with("_id")
}
