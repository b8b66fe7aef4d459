use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

pub const API_VERSION: &str = "0.1.0";

#[derive(Debug, Clone)]
pub struct ContractSchemaManifest {
    pub name: &'static str,
    pub sha256: &'static str,
    pub body: &'static str,
}

#[derive(Debug, Clone)]
pub struct ContractsManifest {
    pub contracts_set_sha256: &'static str,
    pub generated_at: &'static str,
    pub schemas: Vec<ContractSchemaManifest>,
}

include!(concat!(env!("OUT_DIR"), "/generated_contracts.rs"));

pub fn contracts_manifest_v1() -> ContractsManifest {
    ContractsManifest {
        contracts_set_sha256: GENERATED_CONTRACTS_SET_SHA256,
        generated_at: GENERATED_AT_RFC3339,
        schemas: GENERATED_CONTRACT_SCHEMAS
            .iter()
            .map(|(name, sha256, body)| ContractSchemaManifest { name, sha256, body })
            .collect(),
    }
}

/// Looks up an embedded contract schema body by file name, e.g. `ask_response.schema.json`.
pub fn contract_schema(file_name: &str) -> Option<&'static str> {
    GENERATED_CONTRACT_SCHEMAS
        .iter()
        .find(|(name, _, _)| name.rsplit('/').next() == Some(file_name))
        .map(|(_, _, body)| *body)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    AskMetadata,
    GenerateSql,
    ExecuteSql,
    Clarify,
    Refuse,
}

impl Intent {
    pub const ALL: [Intent; 5] = [
        Intent::AskMetadata,
        Intent::GenerateSql,
        Intent::ExecuteSql,
        Intent::Clarify,
        Intent::Refuse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::AskMetadata => "ASK_METADATA",
            Intent::GenerateSql => "GENERATE_SQL",
            Intent::ExecuteSql => "EXECUTE_SQL",
            Intent::Clarify => "CLARIFY",
            Intent::Refuse => "REFUSE",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Classification {
    pub intent: Intent,
    pub confidence: f64,
    pub needs_clarification: bool,
    #[serde(default)]
    pub clarify_question: String,
    #[serde(default)]
    pub entities: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyVerdict {
    pub allowed: bool,
    pub reason: String,
}

impl PolicyVerdict {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: String::new(),
        }
    }

    /// A denial always carries a reason; an empty one is replaced.
    pub fn deny(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            allowed: false,
            reason: if reason.trim().is_empty() {
                "request denied by policy".to_string()
            } else {
                reason
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SqlCandidate {
    pub sql: String,
    pub ok: bool,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ExecutionSummary {
    pub row_count: usize,
    pub columns: Vec<String>,
    pub preview: Vec<Value>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AskRequest {
    pub message: String,
    pub role: String,
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AskResponse {
    pub correlation_id: String,
    pub intent: Intent,
    pub confidence: f64,
    #[serde(default)]
    pub allowed: Option<bool>,
    #[serde(default)]
    pub policy_reason: Option<String>,
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub sql_ok: Option<bool>,
    pub sql_issues: Vec<String>,
    pub tables: Vec<String>,
    pub columns: Vec<String>,
    #[serde(default)]
    pub execution: Option<ExecutionSummary>,
    pub final_answer: String,
    pub log_trail: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidateRequest {
    pub sql: String,
    #[serde(default)]
    pub relations: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccessRequest {
    pub user_id: String,
    pub resource: String,
    pub action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AccessDecision {
    pub allowed: bool,
    #[serde(default)]
    pub role: Option<String>,
    pub reason: String,
    #[serde(default)]
    pub log_trail: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

impl ErrorResponse {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                code: code.to_string(),
                message: message.into(),
                details: None,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitView {
    pub policy: String,
    pub default_limit: u64,
    #[serde(default)]
    pub max_limit: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContractsMetadata {
    pub api_version: String,
    pub contracts_set_sha256: String,
    pub generated_at: String,
    pub schemas: BTreeMap<String, String>,
    pub intents: Vec<Intent>,
    pub limits: LimitView,
}
