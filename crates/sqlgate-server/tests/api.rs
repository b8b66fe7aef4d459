use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use sqlgate_config::{
    Access, AccessUser, Allowlist, Audit, Config, Executor, Logging, Policy, Server, Synthesizer,
    Validator,
};
use sqlgate_contracts::{contract_schema, AskRequest, API_VERSION};
use sqlgate_server::{ask_once, build_app, verify_audit_chain, verify_audit_chain_with_mirror};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tower::util::ServiceExt;

fn temp_path(stem: &str, ext: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before unix epoch")
        .as_nanos();
    std::env::temp_dir()
        .join(format!("sqlgate-{stem}-{nanos}.{ext}"))
        .to_string_lossy()
        .to_string()
}

fn test_config() -> Config {
    let allowlist_path = temp_path("allowlist", "json");
    std::fs::write(
        &allowlist_path,
        json!({
            "schema": "main",
            "tables": {
                "satislar": ["id", "tarih", "tutar", "musteri_id", "sube"],
                "musteriler": ["musteri_id", "ad", "sehir", "segment"]
            }
        })
        .to_string(),
    )
    .unwrap();

    let mut users = BTreeMap::new();
    users.insert(
        "u_001".to_string(),
        AccessUser {
            name: "Alice".to_string(),
            role: "GENERAL_MANAGER".to_string(),
        },
    );
    users.insert(
        "u_002".to_string(),
        AccessUser {
            name: "Bob".to_string(),
            role: "DATA_ANALYST".to_string(),
        },
    );
    let mut matrix = BTreeMap::new();
    matrix.insert(
        "DATA_ANALYST".to_string(),
        BTreeMap::from([(
            "financial_reports".to_string(),
            vec!["view_raw_data".to_string(), "run_analytics".to_string()],
        )]),
    );
    matrix.insert(
        "GENERAL_MANAGER".to_string(),
        BTreeMap::from([(
            "audit_logs".to_string(),
            vec!["view_system_logs".to_string()],
        )]),
    );

    Config {
        server: Server {
            listen_addr: "127.0.0.1:0".to_string(),
        },
        allowlist: Allowlist {
            path: allowlist_path,
            canonical_relation: None,
        },
        validator: Validator::default(),
        policy: Policy::default(),
        access: Access { users, matrix },
        synthesizer: Synthesizer::default(),
        executor: Executor::default(),
        audit: Audit {
            jsonl_path: temp_path("audit", "jsonl"),
            immutable_mirror_path: None,
        },
        logging: Logging::default(),
    }
}

async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn assert_ask_contract(payload: &Value) {
    assert_contract("ask_response.schema.json", payload);
}

fn assert_contract(schema_file: &str, payload: &Value) {
    let schema: Value = serde_json::from_str(contract_schema(schema_file).unwrap()).unwrap();
    let validator = jsonschema::validator_for(&schema).unwrap();
    let errors: Vec<String> = validator.iter_errors(payload).map(|e| e.to_string()).collect();
    assert!(errors.is_empty(), "{errors:?}\n{payload}");
}

#[tokio::test]
async fn healthz_ok() {
    let app = build_app(test_config()).await.unwrap();
    let response = app
        .oneshot(
            Request::builder()
                .uri("/v1/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn metadata_question_lists_relations() {
    let app = build_app(test_config()).await.unwrap();
    let (status, payload) = post_json(
        &app,
        "/v1/ask",
        json!({"message": "Hangi tablolar var?", "role": "manager"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_ask_contract(&payload);
    assert_eq!(payload["intent"], "ASK_METADATA");
    assert_eq!(payload["allowed"], true);
    assert_eq!(payload["tables"], json!(["musteriler", "satislar"]));
    assert!(payload["columns"]
        .as_array()
        .unwrap()
        .contains(&json!("satislar.tutar")));
    assert!(payload["final_answer"]
        .as_str()
        .unwrap()
        .starts_with("Mevcut tablolar: musteriler, satislar."));
    assert!(payload["sql"].is_null());
    assert!(payload["correlation_id"]
        .as_str()
        .unwrap()
        .starts_with("req_"));
}

#[tokio::test]
async fn generated_query_is_bounded_and_dry_run() {
    let app = build_app(test_config()).await.unwrap();
    let (status, payload) = post_json(
        &app,
        "/v1/ask",
        json!({
            "message": "Son 7 günde satışları getir",
            "role": "manager",
            "correlation_id": "corr-gen-1"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_ask_contract(&payload);
    assert_eq!(payload["correlation_id"], "corr-gen-1");
    assert_eq!(payload["intent"], "GENERATE_SQL");
    assert_eq!(payload["sql_ok"], true);
    assert_eq!(
        payload["sql"],
        "SELECT tarih, tutar FROM satislar WHERE tarih >= CURRENT_DATE - INTERVAL '7 days' LIMIT 200"
    );
    assert_eq!(payload["execution"]["dry_run"], true);
    assert_eq!(payload["tables"][0], "satislar");

    let trail: Vec<&str> = payload["log_trail"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    let codes: Vec<&str> = trail
        .iter()
        .map(|line| line.split("] ").nth(1).unwrap().split(':').next().unwrap())
        .collect();
    assert_eq!(
        codes,
        vec!["CLASSIFY", "POLICY_ALLOW", "METADATA", "SYNTHESIZE", "SQL_OK", "EXECUTE_OK", "ANSWER"]
    );
}

#[tokio::test]
async fn short_message_asks_for_clarification() {
    let app = build_app(test_config()).await.unwrap();
    let (status, payload) =
        post_json(&app, "/v1/ask", json!({"message": "?", "role": "manager"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_ask_contract(&payload);
    assert_eq!(payload["intent"], "CLARIFY");
    assert!(payload["allowed"].is_null());
    assert!(payload["sql_ok"].is_null());
    assert!(payload["final_answer"]
        .as_str()
        .unwrap()
        .starts_with("Ne sorgulamak istiyorsun?"));
}

#[tokio::test]
async fn mutation_request_is_refused() {
    let app = build_app(test_config()).await.unwrap();
    let (status, payload) = post_json(
        &app,
        "/v1/ask",
        json!({"message": "DROP TABLE satislar", "role": "manager"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_ask_contract(&payload);
    assert_eq!(payload["intent"], "REFUSE");
    assert!(payload["sql"].is_null());
    assert!(payload["execution"].is_null());
    assert_eq!(
        payload["final_answer"],
        "Bu isteği güvenlik nedeniyle yerine getiremiyorum."
    );
}

#[tokio::test]
async fn teller_cannot_ask_for_iban() {
    let app = build_app(test_config()).await.unwrap();
    let (status, payload) = post_json(
        &app,
        "/v1/ask",
        json!({"message": "müşterinin IBAN bilgisini getir", "role": "teller"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_ask_contract(&payload);
    assert_eq!(payload["allowed"], false);
    assert_eq!(
        payload["policy_reason"],
        "Teller rolü PII içeren alanlara erişemez."
    );
    assert!(payload["sql"].is_null());
    assert!(payload["final_answer"]
        .as_str()
        .unwrap()
        .starts_with("İstek reddedildi:"));
}

#[tokio::test]
async fn provided_sql_gets_default_limit() {
    let app = build_app(test_config()).await.unwrap();
    let (status, payload) = post_json(
        &app,
        "/v1/ask",
        json!({
            "message": "şube bazında tutarlar",
            "role": "analyst",
            "sql": "SELECT sube, tutar FROM satislar"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_ask_contract(&payload);
    assert_eq!(payload["intent"], "EXECUTE_SQL");
    assert_eq!(payload["confidence"], 1.0);
    assert_eq!(payload["sql"], "SELECT sube, tutar FROM satislar LIMIT 200");
    assert_eq!(payload["sql_issues"], json!(["LIMIT 200 added"]));
}

#[tokio::test]
async fn provided_sql_outside_allow_list_is_rejected() {
    let app = build_app(test_config()).await.unwrap();
    let (_, payload) = post_json(
        &app,
        "/v1/ask",
        json!({
            "message": "rapor",
            "role": "analyst",
            "sql": "SELECT * FROM personel"
        }),
    )
    .await;
    assert_ask_contract(&payload);
    assert_eq!(payload["sql_ok"], false);
    assert!(payload["execution"].is_null());
    assert!(payload["final_answer"]
        .as_str()
        .unwrap()
        .starts_with("SQL doğrulanamadı:"));
}

#[tokio::test]
async fn ask_requires_role() {
    let app = build_app(test_config()).await.unwrap();
    let (status, payload) =
        post_json(&app, "/v1/ask", json!({"message": "satışlar", "role": " "})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(payload["error"]["code"], "validation_error");
}

#[tokio::test]
async fn validate_endpoint_applies_ceiling() {
    let mut cfg = test_config();
    cfg.validator.limit_policy = "ceiling".to_string();
    cfg.validator.max_limit = 500;
    let app = build_app(cfg).await.unwrap();

    let (status, payload) = post_json(
        &app,
        "/v1/validate",
        json!({"sql": "SELECT * FROM satislar LIMIT 1000"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_contract("sql_candidate.schema.json", &payload);
    assert_eq!(payload["ok"], false);
    assert!(payload["issues"][0]
        .as_str()
        .unwrap()
        .starts_with("LIMIT exceeds ceiling"));

    let (_, payload) = post_json(
        &app,
        "/v1/validate",
        json!({"sql": "SELECT * FROM satislar LIMIT 100"}),
    )
    .await;
    assert_eq!(payload["ok"], true);
    assert_eq!(payload["sql"], "SELECT * FROM satislar LIMIT 100");
}

#[tokio::test]
async fn validate_endpoint_honors_explicit_relations() {
    let app = build_app(test_config()).await.unwrap();
    let (_, payload) = post_json(
        &app,
        "/v1/validate",
        json!({"sql": "SELECT * FROM satislar", "relations": ["musteriler"]}),
    )
    .await;
    assert_eq!(payload["ok"], false);
    assert_eq!(
        payload["issues"],
        json!([
            "does not reference an allowed relation",
            "relation not allowed: satislar"
        ])
    );
}

#[tokio::test]
async fn validate_endpoint_reads_sources_not_comments() {
    let app = build_app(test_config()).await.unwrap();
    let (status, payload) = post_json(
        &app,
        "/v1/validate",
        json!({"sql": "SELECT * FROM musteriler m JOIN kartlar k ON m.musteri_id = k.musteri_id -- satislar"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_contract("sql_candidate.schema.json", &payload);
    assert_eq!(payload["ok"], false);
    assert_eq!(payload["issues"], json!(["relation not allowed: kartlar"]));

    let (_, payload) = post_json(
        &app,
        "/v1/validate",
        json!({"sql": "SELECT * FROM satislar LIMIT ALL"}),
    )
    .await;
    assert_eq!(payload["ok"], false);
    assert_eq!(
        payload["issues"],
        json!(["LIMIT must be a non-negative integer: ALL"])
    );
}

#[tokio::test]
async fn metadata_endpoints() {
    let app = build_app(test_config()).await.unwrap();

    let (status, payload) = get_json(&app, "/v1/metadata").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["schema"], "main");
    assert_eq!(
        payload["relations"]["musteriler"],
        json!(["musteri_id", "ad", "sehir", "segment"])
    );

    let (status, payload) = get_json(&app, "/v1/metadata/satislar").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["columns"][2], "tutar");

    let (status, payload) = get_json(&app, "/v1/metadata/personel").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(payload["error"]["code"], "unknown_relation");
}

#[tokio::test]
async fn access_matrix_decisions() {
    let app = build_app(test_config()).await.unwrap();

    let (status, payload) = post_json(
        &app,
        "/v1/access",
        json!({"user_id": "u_002", "resource": "financial_reports", "action": "run_analytics"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_contract("access_decision.schema.json", &payload);
    assert_eq!(payload["allowed"], true);
    assert_eq!(payload["role"], "DATA_ANALYST");

    let (_, payload) = post_json(
        &app,
        "/v1/access",
        json!({"user_id": "u_002", "resource": "audit_logs", "action": "view_system_logs"}),
    )
    .await;
    assert_eq!(payload["allowed"], false);
    assert_eq!(payload["role"], "DATA_ANALYST");

    let (_, payload) = post_json(
        &app,
        "/v1/access",
        json!({"user_id": "u_999", "resource": "audit_logs", "action": "view_system_logs"}),
    )
    .await;
    assert_eq!(payload["allowed"], false);
    assert!(payload["role"].is_null());
    assert_contract("access_decision.schema.json", &payload);

    let (status, _) = post_json(
        &app,
        "/v1/access",
        json!({"user_id": "", "resource": "audit_logs", "action": "view_system_logs"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn contracts_endpoint_reports_limits() {
    let app = build_app(test_config()).await.unwrap();
    let (status, payload) = get_json(&app, "/v1/contracts").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["api_version"], API_VERSION);
    assert_eq!(payload["contracts_set_sha256"].as_str().unwrap().len(), 64);
    assert_eq!(payload["limits"]["policy"], "inject");
    assert_eq!(payload["limits"]["default_limit"], 200);
    assert!(payload["limits"]["max_limit"].is_null());
    assert_eq!(payload["intents"].as_array().unwrap().len(), 5);
    assert!(payload["schemas"]
        .as_object()
        .unwrap()
        .contains_key("contracts/v1/ask_response.schema.json"));
}

#[tokio::test]
async fn unknown_canonical_relation_fails_startup() {
    let mut cfg = test_config();
    cfg.allowlist.canonical_relation = Some("personel".to_string());
    assert!(build_app(cfg).await.is_err());
}

#[tokio::test]
async fn audit_chain_detects_tampering() {
    let cfg = test_config();
    let audit_path = cfg.audit.jsonl_path.clone();
    let app = build_app(cfg).await.unwrap();

    for message in ["Hangi tablolar var?", "DROP TABLE satislar", "satış özeti"] {
        let (status, _) =
            post_json(&app, "/v1/ask", json!({"message": message, "role": "manager"})).await;
        assert_eq!(status, StatusCode::OK);
    }
    post_json(
        &app,
        "/v1/access",
        json!({"user_id": "u_001", "resource": "audit_logs", "action": "view_system_logs"}),
    )
    .await;

    let summary = verify_audit_chain(&audit_path).unwrap();
    assert!(summary.contains("4 records"), "{summary}");

    let text = std::fs::read_to_string(&audit_path).unwrap();
    let mut lines: Vec<Value> = text
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines[0]["action"], "ask");
    assert_eq!(lines[1]["reason_code"], "refuse_intent");
    assert_eq!(lines[3]["action"], "access");
    assert_eq!(lines[1]["prev_hash"], lines[0]["record_hash"]);

    lines[1]["reason_code"] = json!("metadata_answer");
    let tampered: String = lines.iter().map(|v| format!("{v}\n")).collect();
    std::fs::write(&audit_path, tampered).unwrap();
    let err = verify_audit_chain(&audit_path).unwrap_err();
    assert!(err.contains("line 2"), "{err}");
}

#[tokio::test]
async fn audit_mirror_matches_primary() {
    let mut cfg = test_config();
    let mirror_path = temp_path("audit-mirror", "jsonl");
    cfg.audit.immutable_mirror_path = Some(mirror_path.clone());
    let audit_path = cfg.audit.jsonl_path.clone();
    let app = build_app(cfg).await.unwrap();

    post_json(
        &app,
        "/v1/ask",
        json!({"message": "Hangi tablolar var?", "role": "manager"}),
    )
    .await;
    post_json(&app, "/v1/ask", json!({"message": "?", "role": "manager"})).await;

    let summary = verify_audit_chain_with_mirror(&audit_path, Some(&mirror_path)).unwrap();
    assert!(summary.contains("mirror matches"), "{summary}");

    let primary = std::fs::read_to_string(&audit_path).unwrap();
    let first = primary.lines().next().unwrap();
    std::fs::write(&mirror_path, format!("{first}\n")).unwrap();
    assert!(verify_audit_chain_with_mirror(&audit_path, Some(&mirror_path)).is_err());
}

#[tokio::test]
async fn audit_chain_continues_across_restarts() {
    let cfg = test_config();
    let audit_path = cfg.audit.jsonl_path.clone();

    let app = build_app(cfg.clone()).await.unwrap();
    post_json(&app, "/v1/ask", json!({"message": "?", "role": "manager"})).await;
    drop(app);

    let app = build_app(cfg).await.unwrap();
    post_json(&app, "/v1/ask", json!({"message": "?", "role": "manager"})).await;

    let summary = verify_audit_chain(&audit_path).unwrap();
    assert!(summary.contains("2 records"), "{summary}");
}

#[tokio::test]
async fn sqlite_executor_runs_validated_query() {
    let db_path = temp_path("db", "sqlite");
    {
        let conn = rusqlite::Connection::open(&db_path).unwrap();
        conn.execute_batch(
            "CREATE TABLE satislar (id INTEGER, tarih TEXT, tutar REAL, musteri_id INTEGER, sube TEXT);
             INSERT INTO satislar VALUES (1, '2026-01-01', 10.5, 7, 'Kadıköy');
             INSERT INTO satislar VALUES (2, '2026-01-02', 20.0, 8, 'Beşiktaş');",
        )
        .unwrap();
    }

    let mut cfg = test_config();
    cfg.executor.kind = "sqlite".to_string();
    cfg.executor.sqlite_path = Some(db_path);

    let response = ask_once(
        cfg,
        AskRequest {
            message: "tutarlar".to_string(),
            role: "analyst".to_string(),
            sql: Some("SELECT id, sube FROM satislar ORDER BY id".to_string()),
            correlation_id: None,
        },
    )
    .await
    .unwrap();

    assert_eq!(response.sql_ok, Some(true));
    let execution = response.execution.unwrap();
    assert!(!execution.dry_run);
    assert_eq!(execution.row_count, 2);
    assert_eq!(execution.columns, vec!["id", "sube"]);
    assert_eq!(execution.preview[1], json!({"id": 2, "sube": "Beşiktaş"}));
    assert!(response
        .final_answer
        .starts_with("SQL çalıştırıldı. Sonuç özeti: 2 satır"));
}

#[tokio::test]
async fn sqlite_generated_query_uses_sqlite_date_syntax() {
    let db_path = temp_path("db-gen", "sqlite");
    {
        let conn = rusqlite::Connection::open(&db_path).unwrap();
        conn.execute_batch(
            "CREATE TABLE satislar (id INTEGER, tarih TEXT, tutar REAL, musteri_id INTEGER, sube TEXT);
             CREATE TABLE musteriler (musteri_id INTEGER, ad TEXT, sehir TEXT, segment TEXT);",
        )
        .unwrap();
    }

    let mut cfg = test_config();
    cfg.executor.kind = "sqlite".to_string();
    cfg.executor.sqlite_path = Some(db_path);

    let response = ask_once(
        cfg,
        AskRequest {
            message: "Son 30 gün satışlar".to_string(),
            role: "manager".to_string(),
            sql: None,
            correlation_id: Some("corr-sqlite-gen".to_string()),
        },
    )
    .await
    .unwrap();

    assert_eq!(response.correlation_id, "corr-sqlite-gen");
    let sql = response.sql.unwrap();
    assert!(sql.contains("date('now', '-30 days')"), "{sql}");
    assert_eq!(response.execution.unwrap().row_count, 0);
}
