use std::time::Duration;

use reqwest::Client;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::{json, Map, Value};
use sqlgate_contracts::ExecutionSummary;
use sqlgate_kernel::{
    BoundaryError, DryRunExecutor, Executor, SynthesisRequest, Synthesizer, TemplateSynthesizer,
};
use tokio::time::sleep;

pub enum SynthesizerBackend {
    Template(TemplateSynthesizer),
    Http(HttpSynthesizer),
}

impl SynthesizerBackend {
    pub async fn synthesize(&self, request: &SynthesisRequest) -> Result<String, BoundaryError> {
        match self {
            SynthesizerBackend::Template(t) => t.synthesize(request),
            SynthesizerBackend::Http(h) => h.synthesize(request).await,
        }
    }
}

pub enum ExecutorBackend {
    DryRun(DryRunExecutor),
    Sqlite(SqliteExecutor),
}

impl ExecutorBackend {
    pub async fn execute(&self, sql: String) -> Result<ExecutionSummary, BoundaryError> {
        match self {
            ExecutorBackend::DryRun(d) => d.execute(&sql),
            ExecutorBackend::Sqlite(s) => {
                let executor = s.clone();
                tokio::task::spawn_blocking(move || executor.execute(&sql))
                    .await
                    .map_err(|e| {
                        if e.is_cancelled() {
                            BoundaryError::Cancelled
                        } else {
                            BoundaryError::Failed(e.to_string())
                        }
                    })?
            }
        }
    }
}

/// OpenAI-compatible chat-completions client that asks for `{"sql", "answer"}`.
pub struct HttpSynthesizer {
    endpoint: String,
    model: String,
    api_key: Option<String>,
    retry_max_attempts: usize,
    retry_backoff: Duration,
    client: Client,
}

impl HttpSynthesizer {
    pub fn new(cfg: &sqlgate_config::Synthesizer) -> Result<Self, String> {
        let endpoint = cfg
            .endpoint
            .clone()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| "synthesizer.endpoint is required for http mode".to_string())?;
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| e.to_string())?;
        let api_key = std::env::var(&cfg.api_key_env)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        if api_key.is_none() {
            tracing::warn!(env = %cfg.api_key_env, "no API key set; synthesizer requests go unauthenticated");
        }
        Ok(Self {
            endpoint,
            model: cfg.model.clone(),
            api_key,
            retry_max_attempts: cfg.retry_max_attempts.max(1),
            retry_backoff: Duration::from_millis(cfg.retry_backoff_ms),
            client,
        })
    }

    pub async fn synthesize(&self, request: &SynthesisRequest) -> Result<String, BoundaryError> {
        let body = self.request_body(request);
        let mut last_failure = BoundaryError::Unavailable("no attempt made".to_string());

        for attempt in 0..self.retry_max_attempts {
            if attempt > 0 && self.retry_backoff > Duration::ZERO {
                sleep(self.retry_backoff).await;
            }

            let mut call = self.client.post(&self.endpoint).json(&body);
            if let Some(key) = &self.api_key {
                call = call.bearer_auth(key);
            }
            let response = match call.send().await {
                Ok(v) => v,
                Err(err) => {
                    last_failure = if err.is_timeout() {
                        BoundaryError::Timeout
                    } else {
                        BoundaryError::Unavailable(err.to_string())
                    };
                    tracing::warn!(
                        correlation_id = %request.correlation_id,
                        attempt = attempt + 1,
                        "synthesizer transport error: {err}"
                    );
                    continue;
                }
            };
            if !response.status().is_success() {
                last_failure = BoundaryError::Failed(format!("http status {}", response.status()));
                continue;
            }

            let payload: Value = match response.json().await {
                Ok(v) => v,
                Err(err) if err.is_timeout() => {
                    last_failure = BoundaryError::Timeout;
                    continue;
                }
                Err(err) => {
                    last_failure = BoundaryError::Failed(format!("response parse failed: {err}"));
                    continue;
                }
            };
            // A well-formed but unusable reply will not improve on retry.
            return extract_sql(&payload);
        }

        Err(last_failure)
    }

    fn request_body(&self, request: &SynthesisRequest) -> Value {
        let system = format!(
            "You translate questions into SQL.\n\
             Generate a single READ-ONLY query (SELECT/WITH only).\n\
             Query ONLY these relations: {tables}\n\
             Use ONLY these columns: {columns}\n\
             Prefer explicit column lists over SELECT *.\n\
             Always include LIMIT {limit} or lower.\n\
             Return STRICT JSON: {{\"sql\": \"string\", \"answer\": \"string\"}}",
            tables = request.tables.join(", "),
            columns = request.columns.join(", "),
            limit = request.default_limit,
        );
        let user = format!("Role={}. Question: {}", request.role, request.message);
        json!({
            "model": self.model,
            "temperature": 0.2,
            "max_tokens": 350,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user}
            ],
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": "text2sql_result",
                    "strict": true,
                    "schema": {
                        "type": "object",
                        "properties": {
                            "sql": {"type": "string"},
                            "answer": {"type": "string"}
                        },
                        "required": ["sql", "answer"],
                        "additionalProperties": false
                    }
                }
            }
        })
    }
}

fn extract_sql(payload: &Value) -> Result<String, BoundaryError> {
    let content = payload
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| BoundaryError::Failed("reply has no message content".to_string()))?;
    let obj = parse_json_loose(content).map_err(BoundaryError::Failed)?;
    obj.get("sql")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| BoundaryError::Failed("reply has no sql".to_string()))
}

/// Parses a model reply that should be a JSON object but may carry
/// surrounding prose: a direct parse first, then the first balanced `{...}`.
pub fn parse_json_loose(content: &str) -> Result<Value, String> {
    let text = content.trim();
    if let Ok(v @ Value::Object(_)) = serde_json::from_str::<Value>(text) {
        return Ok(v);
    }

    let start = text
        .find('{')
        .ok_or_else(|| format!("no JSON object in reply: {}", preview(text)))?;
    let mut depth = 0usize;
    let mut in_str = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_str {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_str = false;
            }
            continue;
        }
        match ch {
            '"' => in_str = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let blob = &text[start..start + offset + 1];
                    return serde_json::from_str(blob).map_err(|e| e.to_string());
                }
            }
            _ => {}
        }
    }
    Err(format!("unterminated JSON object in reply: {}", preview(text)))
}

fn preview(text: &str) -> String {
    text.chars().take(200).collect()
}

/// Runs validated statements against a SQLite file opened read-only.
#[derive(Debug, Clone)]
pub struct SqliteExecutor {
    path: String,
    max_preview_rows: usize,
}

impl SqliteExecutor {
    pub fn new(path: impl Into<String>, max_preview_rows: usize) -> Self {
        Self {
            path: path.into(),
            max_preview_rows,
        }
    }
}

impl Executor for SqliteExecutor {
    fn execute(&self, sql: &str) -> Result<ExecutionSummary, BoundaryError> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| BoundaryError::Unavailable(e.to_string()))?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| BoundaryError::Failed(e.to_string()))?;
        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();

        let mut rows = stmt
            .query([])
            .map_err(|e| BoundaryError::Failed(e.to_string()))?;
        let mut row_count = 0usize;
        let mut preview = Vec::new();
        while let Some(row) = rows.next().map_err(|e| BoundaryError::Failed(e.to_string()))? {
            row_count += 1;
            if preview.len() >= self.max_preview_rows {
                continue;
            }
            let mut obj = Map::new();
            for (idx, name) in columns.iter().enumerate() {
                let value = match row
                    .get_ref(idx)
                    .map_err(|e| BoundaryError::Failed(e.to_string()))?
                {
                    ValueRef::Null => Value::Null,
                    ValueRef::Integer(n) => json!(n),
                    ValueRef::Real(f) => json!(f),
                    ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
                    ValueRef::Blob(b) => Value::String(format!("<{} bytes>", b.len())),
                };
                obj.insert(name.clone(), value);
            }
            preview.push(Value::Object(obj));
        }

        Ok(ExecutionSummary {
            row_count,
            columns,
            preview,
            dry_run: false,
        })
    }
}
