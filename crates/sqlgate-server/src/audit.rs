use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlgate_contracts::{AccessDecision, AskResponse, Intent};
use sqlgate_kernel::{jcs_sha256_hex, sql_fingerprint};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// One line of the hash-chained audit log.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuditRecord {
    pub audit_id: String,
    pub correlation_id: String,
    pub action: String,
    pub result: String,
    pub reason_code: String,
    pub ts: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql_fingerprint: Option<String>,
    #[serde(default)]
    pub trail: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    pub record_hash: String,
}

impl AuditRecord {
    fn new(correlation_id: &str, action: &str, result: &str, reason_code: &str) -> Self {
        Self {
            audit_id: format!("audit_{}", uuid::Uuid::new_v4().as_simple()),
            correlation_id: correlation_id.to_string(),
            action: action.to_string(),
            result: result.to_string(),
            reason_code: reason_code.to_string(),
            ts: Utc::now().to_rfc3339(),
            intent: None,
            sql_fingerprint: None,
            trail: Vec::new(),
            prev_hash: None,
            record_hash: String::new(),
        }
    }

    pub fn for_ask(response: &AskResponse) -> Self {
        let (result, reason_code) = ask_outcome(response);
        let mut rec = Self::new(&response.correlation_id, "ask", result, reason_code);
        rec.intent = Some(response.intent);
        rec.sql_fingerprint = response.sql.as_deref().map(sql_fingerprint);
        rec.trail = response.log_trail.clone();
        rec
    }

    pub fn for_access(correlation_id: &str, decision: &AccessDecision) -> Self {
        let (result, reason_code) = match (decision.allowed, &decision.role) {
            (true, _) => ("allow", "access_granted"),
            (false, Some(_)) => ("deny", "access_denied"),
            (false, None) => ("deny", "security_alert"),
        };
        let mut rec = Self::new(correlation_id, "access", result, reason_code);
        rec.trail = decision.log_trail.clone();
        rec
    }
}

fn ask_outcome(response: &AskResponse) -> (&'static str, &'static str) {
    if response.allowed == Some(false) {
        return ("refused", "policy_deny");
    }
    match response.intent {
        Intent::Refuse => ("refused", "refuse_intent"),
        Intent::Clarify => ("clarify", "clarify_needed"),
        Intent::AskMetadata => ("answered", "metadata_answer"),
        Intent::ExecuteSql | Intent::GenerateSql => match (response.sql_ok, &response.execution) {
            (Some(false), _) => ("rejected", "sql_deny"),
            (Some(true), Some(_)) => ("executed", "execute_ok"),
            (Some(true), None) => ("failed", "execute_fail"),
            // Low-confidence requests leave before validation.
            (None, _) => ("clarify", "clarify_needed"),
        },
    }
}

struct AuditWriter {
    file: tokio::fs::File,
    immutable_mirror: Option<tokio::fs::File>,
    last_hash: Option<String>,
}

/// Append-only JSONL audit log. Each record carries the hash of the previous one.
pub struct AuditJsonl {
    writer: Mutex<AuditWriter>,
}

impl AuditJsonl {
    pub async fn new(path: &str, immutable_mirror_path: Option<&str>) -> Result<Self, String> {
        let last_hash = std::fs::read_to_string(path).ok().and_then(|text| {
            text.lines().rev().find_map(|line| {
                serde_json::from_str::<Value>(line).ok().and_then(|v| {
                    v.get("record_hash")
                        .and_then(|hash| hash.as_str())
                        .map(|s| s.to_string())
                })
            })
        });

        let file = open_append(path).await?;
        let immutable_mirror = match immutable_mirror_path {
            Some(path) if !path.is_empty() => Some(open_append(path).await?),
            _ => None,
        };

        Ok(Self {
            writer: Mutex::new(AuditWriter {
                file,
                immutable_mirror,
                last_hash,
            }),
        })
    }

    pub async fn append(&self, mut rec: AuditRecord) {
        let mut writer = self.writer.lock().await;
        rec.prev_hash = writer.last_hash.clone();
        rec.record_hash.clear();

        let hash = serde_json::to_value(&rec)
            .map_err(|e| e.to_string())
            .and_then(|v| jcs_sha256_hex(&v));
        rec.record_hash = match hash {
            Ok(h) => h,
            Err(err) => {
                tracing::warn!(correlation_id = %rec.correlation_id, "audit hash failed: {err}");
                return;
            }
        };
        let line = match serde_json::to_string(&rec) {
            Ok(v) => v + "\n",
            Err(err) => {
                tracing::warn!(correlation_id = %rec.correlation_id, "audit encode failed: {err}");
                return;
            }
        };

        if let Err(err) = write_line(&mut writer.file, &line).await {
            tracing::warn!(correlation_id = %rec.correlation_id, "audit write failed: {err}");
            return;
        }
        if let Some(mirror) = writer.immutable_mirror.as_mut() {
            if let Err(err) = write_line(mirror, &line).await {
                tracing::warn!(correlation_id = %rec.correlation_id, "audit mirror write failed: {err}");
            }
        }
        writer.last_hash = Some(rec.record_hash);
    }
}

// tokio hands writes to a blocking thread; flush waits for them to land.
async fn write_line(file: &mut tokio::fs::File, line: &str) -> std::io::Result<()> {
    file.write_all(line.as_bytes()).await?;
    file.flush().await
}

async fn open_append(path: &str) -> Result<tokio::fs::File, String> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| format!("open audit log {path} failed: {e}"))
}

pub fn verify_audit_chain(path: &str) -> Result<String, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let mut prev: Option<String> = None;
    let mut count = 0usize;

    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let mut value: Value = serde_json::from_str(line)
            .map_err(|e| format!("line {} parse failed: {e}", idx + 1))?;
        let record_hash = value
            .get("record_hash")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| format!("line {} has no record_hash", idx + 1))?;
        let prev_hash = value
            .get("prev_hash")
            .and_then(Value::as_str)
            .map(str::to_string);
        if count > 0 && prev_hash != prev {
            return Err(format!(
                "line {} prev_hash mismatch: expected {:?}, got {:?}",
                idx + 1,
                prev,
                prev_hash
            ));
        }

        value["record_hash"] = Value::String(String::new());
        let expected_hash = jcs_sha256_hex(&value)
            .map_err(|e| format!("line {} hash seed failed: {e}", idx + 1))?;
        if record_hash != expected_hash {
            return Err(format!(
                "line {} record_hash mismatch: expected {}, got {}",
                idx + 1,
                expected_hash,
                record_hash
            ));
        }
        prev = Some(record_hash);
        count += 1;
    }

    Ok(format!("audit chain verified: {count} records"))
}

/// Verifies the primary log and, when given, that the mirror holds the same chain.
pub fn verify_audit_chain_with_mirror(path: &str, mirror: Option<&str>) -> Result<String, String> {
    let summary = verify_audit_chain(path)?;
    let Some(mirror) = mirror else {
        return Ok(summary);
    };
    verify_audit_chain(mirror).map_err(|e| format!("mirror: {e}"))?;

    let primary = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let copy = std::fs::read_to_string(mirror).map_err(|e| e.to_string())?;
    let primary: Vec<&str> = primary.lines().filter(|l| !l.trim().is_empty()).collect();
    let copy: Vec<&str> = copy.lines().filter(|l| !l.trim().is_empty()).collect();
    if let Some(idx) = primary.iter().zip(&copy).position(|(a, b)| a != b) {
        return Err(format!("mirror diverges at line {}", idx + 1));
    }
    if primary.len() != copy.len() {
        return Err(format!(
            "mirror has {} records, primary has {}",
            copy.len(),
            primary.len()
        ));
    }
    Ok(format!("{summary}; mirror matches"))
}
