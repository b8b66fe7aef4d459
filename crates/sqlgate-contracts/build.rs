//! Embeds `contracts/v1/*.schema.json` together with a digest per schema and
//! one over the whole set, so `/v1/contracts` reports exactly what was built.

use std::env;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use sha2::{Digest, Sha256};

/// Schemas the server and its tests validate payloads against.
const REQUIRED: [&str; 5] = [
    "access_decision.schema.json",
    "allowlist.schema.json",
    "ask_request.schema.json",
    "ask_response.schema.json",
    "sql_candidate.schema.json",
];

struct SchemaRow {
    id: String,
    sha256: String,
    body: String,
}

fn main() {
    let crate_dir =
        PathBuf::from(env::var_os("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR is set by cargo"));
    let contracts = crate_dir.join("../../contracts/v1");
    println!("cargo:rerun-if-changed={}", contracts.display());

    let rows = load_rows(&contracts);
    for required in REQUIRED {
        assert!(
            rows.iter().any(|row| row.id.ends_with(required)),
            "contracts/v1/{required} is missing"
        );
    }

    let generated_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let source = render(&rows, &set_digest(&rows), &generated_at);
    let out = PathBuf::from(env::var_os("OUT_DIR").expect("OUT_DIR is set by cargo"))
        .join("generated_contracts.rs");
    fs::write(&out, source).unwrap_or_else(|e| panic!("cannot write {}: {e}", out.display()));
}

fn load_rows(dir: &Path) -> Vec<SchemaRow> {
    let entries = fs::read_dir(dir).unwrap_or_else(|e| panic!("cannot list {}: {e}", dir.display()));
    let mut files: Vec<String> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.ends_with(".schema.json"))
        .collect();
    files.sort();

    files
        .into_iter()
        .map(|file| {
            let path = dir.join(&file);
            println!("cargo:rerun-if-changed={}", path.display());
            let body = fs::read_to_string(&path)
                .unwrap_or_else(|e| panic!("cannot read {}: {e}", path.display()));
            let id = format!("contracts/v1/{file}");
            // Payloads are checked by `$id`; it has to name the file it lives in.
            assert!(
                body.contains(&format!("\"$id\": \"{id}\"")),
                "{id}: $id does not match the file path"
            );
            SchemaRow {
                sha256: hex(Sha256::digest(body.as_bytes())),
                id,
                body,
            }
        })
        .collect()
}

/// SHA-256 over `<id> NUL <body> NUL` for every schema, in file-name order.
fn set_digest(rows: &[SchemaRow]) -> String {
    let mut hasher = Sha256::new();
    for row in rows {
        hasher.update(row.id.as_bytes());
        hasher.update([0]);
        hasher.update(row.body.as_bytes());
        hasher.update([0]);
    }
    hex(hasher.finalize())
}

fn hex(digest: impl AsRef<[u8]>) -> String {
    digest.as_ref().iter().fold(String::new(), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

fn render(rows: &[SchemaRow], set_sha256: &str, generated_at: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "pub const GENERATED_CONTRACTS_SET_SHA256: &str = {set_sha256:?};");
    let _ = writeln!(out, "pub const GENERATED_AT_RFC3339: &str = {generated_at:?};");
    out.push_str("pub const GENERATED_CONTRACT_SCHEMAS: &[(&str, &str, &str)] = &[\n");
    for row in rows {
        let _ = writeln!(out, "    ({:?}, {:?}, {:?}),", row.id, row.sha256, row.body);
    }
    out.push_str("];\n");
    out
}
