pub mod access;
pub mod answer;
pub mod boundary;
pub mod classifier;
pub mod error;
pub mod lexer;
pub mod machine;
pub mod metadata;
pub mod policy;
pub mod registry;
pub mod trail;
pub mod validator;

use serde_json::Value;
use sha2::{Digest, Sha256};

pub use access::{AccessMatrix, Grants, UserRecord};
pub use boundary::{
    fallback_sql, DryRunExecutor, Executor, SqlDialect, SynthesisRequest, Synthesizer,
    TemplateSynthesizer,
};
pub use classifier::classify;
pub use error::{BoundaryError, RegistryError};
pub use machine::{next_stage, Pending, Pipeline, RequestContext, RequestState, Stage};
pub use metadata::{MetadataCandidates, MetadataResolver};
pub use policy::PolicyGate;
pub use registry::{AllowlistEntry, AllowlistRegistry};
pub use trail::Trail;
pub use validator::{LimitPolicy, SqlValidator, ValidatorConfig};

pub fn jcs_sha256_hex(value: &Value) -> Result<String, String> {
    let canonical = serde_jcs::to_string(value)
        .map_err(|err| format!("failed to canonicalize JSON via JCS: {err}"))?;
    Ok(sha256_hex(canonical.as_bytes()))
}

/// Short stable id of a statement, e.g. `sql_3f2a9c0d1b4e5f67`.
///
/// Whitespace runs are collapsed first so reformatting does not change the id.
pub fn sql_fingerprint(sql: &str) -> String {
    let normalized = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    hash_id("sql", &[&normalized])
}

fn hash_id(prefix: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0]);
    }
    let digest = hasher.finalize();
    let short: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("{prefix}_{short}")
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
