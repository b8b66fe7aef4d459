mod audit;
mod boundary;

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use sqlgate_config::Config;
use sqlgate_contracts::{
    contracts_manifest_v1, AccessDecision, AccessRequest, AskRequest, AskResponse,
    ContractsMetadata, ErrorResponse, Intent, LimitView, SqlCandidate, ValidateRequest,
    API_VERSION,
};
use sqlgate_kernel::{
    AccessMatrix, AllowlistRegistry, DryRunExecutor, Grants, LimitPolicy, MetadataResolver,
    Pending, Pipeline, PolicyGate, RequestContext, SqlDialect, SqlValidator, TemplateSynthesizer,
    UserRecord, ValidatorConfig,
};

pub use audit::{verify_audit_chain, verify_audit_chain_with_mirror, AuditRecord};
pub use boundary::{parse_json_loose, HttpSynthesizer, SqliteExecutor};

use audit::AuditJsonl;
use boundary::{ExecutorBackend, SynthesizerBackend};

const MAX_MESSAGE_BYTES: usize = 8 * 1024;

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(cfg).await?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("ctrl-c handler unavailable: {err}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    let state = AppState::new(cfg).await?;
    Ok(Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/ask", post(ask))
        .route("/v1/validate", post(validate))
        .route("/v1/metadata", get(metadata))
        .route("/v1/metadata/{relation}", get(metadata_relation))
        .route("/v1/access", post(access))
        .route("/v1/contracts", get(contracts))
        .with_state(state))
}

/// Answers a single request without starting the HTTP listener.
pub async fn ask_once(cfg: Config, request: AskRequest) -> Result<AskResponse, String> {
    let state = AppState::new(cfg).await?;
    validate_ask(&request)?;
    Ok(state.process_ask(request).await)
}

#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
    access: Arc<AccessMatrix>,
    synthesizer: Arc<SynthesizerBackend>,
    executor: Arc<ExecutorBackend>,
    audit: Arc<AuditJsonl>,
}

impl AppState {
    async fn new(cfg: Config) -> Result<Self, String> {
        let registry = AllowlistRegistry::load(&cfg.allowlist.path).map_err(|e| e.to_string())?;
        if let Some(canonical) = &cfg.allowlist.canonical_relation {
            if !registry.contains(canonical) {
                return Err(format!(
                    "allowlist.canonical_relation {canonical} is not in {}",
                    cfg.allowlist.path
                ));
            }
        }
        tracing::info!(
            relations = registry.len(),
            path = %cfg.allowlist.path,
            "allow-list loaded"
        );

        let policy = PolicyGate::new(&cfg.policy.restricted_roles, cfg.policy.pii_terms.as_deref())
            .map_err(|e| format!("invalid policy.pii_terms: {e}"))?;
        let limit_policy = match cfg.validator.limit_policy.as_str() {
            "ceiling" => LimitPolicy::Ceiling {
                default_limit: cfg.validator.default_limit,
                max_limit: cfg.validator.max_limit,
            },
            _ => LimitPolicy::Inject {
                default_limit: cfg.validator.default_limit,
            },
        };
        let validator = SqlValidator::new(ValidatorConfig { limit_policy });
        let pipeline = Pipeline::new(
            Arc::new(registry),
            policy,
            MetadataResolver::new(cfg.allowlist.canonical_relation.clone()),
            validator,
            cfg.synthesizer.fallback_limit,
        );

        let (executor, dialect) = match cfg.executor.kind.as_str() {
            "sqlite" => {
                let path = cfg
                    .executor
                    .sqlite_path
                    .clone()
                    .ok_or_else(|| "executor.sqlite_path is required for sqlite executor".to_string())?;
                (
                    ExecutorBackend::Sqlite(SqliteExecutor::new(path, cfg.executor.max_preview_rows)),
                    SqlDialect::Sqlite,
                )
            }
            _ => (ExecutorBackend::DryRun(DryRunExecutor), SqlDialect::Ansi),
        };
        let synthesizer = match cfg.synthesizer.mode.as_str() {
            "http" => SynthesizerBackend::Http(HttpSynthesizer::new(&cfg.synthesizer)?),
            _ => SynthesizerBackend::Template(TemplateSynthesizer::new(dialect)),
        };

        Ok(Self {
            pipeline: Arc::new(pipeline),
            access: Arc::new(access_matrix(&cfg)),
            synthesizer: Arc::new(synthesizer),
            executor: Arc::new(executor),
            audit: Arc::new(
                AuditJsonl::new(
                    &cfg.audit.jsonl_path,
                    cfg.audit.immutable_mirror_path.as_deref(),
                )
                .await?,
            ),
        })
    }

    async fn process_ask(&self, request: AskRequest) -> AskResponse {
        let correlation_id = request
            .correlation_id
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(new_correlation_id);
        let context = RequestContext::new(correlation_id, request.message, request.role, request.sql);

        let mut run = self.pipeline.begin(context);
        loop {
            match self.pipeline.advance(&mut run) {
                Pending::Synthesize(req) => {
                    let reply = self.synthesizer.synthesize(&req).await;
                    run.supply_synthesis(reply);
                }
                Pending::Execute(sql) => {
                    let reply = self.executor.execute(sql).await;
                    run.supply_execution(reply);
                }
                Pending::Done => break,
            }
        }

        let response = run.into_response();
        tracing::info!(
            correlation_id = %response.correlation_id,
            intent = %response.intent,
            allowed = ?response.allowed,
            sql_ok = ?response.sql_ok,
            "ask handled"
        );
        self.audit.append(AuditRecord::for_ask(&response)).await;
        response
    }

    fn metadata_view(&self) -> Value {
        let registry = self.pipeline.registry();
        let relations: BTreeMap<&str, &[String]> = registry
            .entries()
            .iter()
            .map(|e| (e.relation.as_str(), e.columns.as_slice()))
            .collect();
        json!({
            "schema": registry.schema(),
            "relations": relations,
        })
    }
}

fn access_matrix(cfg: &Config) -> AccessMatrix {
    let users = cfg
        .access
        .users
        .iter()
        .map(|(id, u)| {
            (
                id.clone(),
                UserRecord {
                    name: u.name.clone(),
                    role: u.role.clone(),
                },
            )
        })
        .collect();
    let grants: Grants = cfg
        .access
        .matrix
        .iter()
        .map(|(role, resources)| {
            let resources = resources
                .iter()
                .map(|(resource, actions)| {
                    (resource.clone(), actions.iter().cloned().collect::<BTreeSet<_>>())
                })
                .collect();
            (role.clone(), resources)
        })
        .collect();
    AccessMatrix::new(users, grants)
}

fn new_correlation_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

fn validation_error(message: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse::new("validation_error", message)),
    )
}

fn validate_ask(request: &AskRequest) -> Result<(), String> {
    if request.role.trim().is_empty() {
        return Err("role is required".to_string());
    }
    if request.message.len() > MAX_MESSAGE_BYTES {
        return Err(format!("message exceeds {MAX_MESSAGE_BYTES} bytes"));
    }
    if request.sql.as_ref().is_some_and(|s| s.len() > MAX_MESSAGE_BYTES) {
        return Err(format!("sql exceeds {MAX_MESSAGE_BYTES} bytes"));
    }
    Ok(())
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn ask(
    State(state): State<AppState>,
    Json(request): Json<AskRequest>,
) -> Result<Json<AskResponse>, (StatusCode, Json<ErrorResponse>)> {
    validate_ask(&request).map_err(validation_error)?;
    Ok(Json(state.process_ask(request).await))
}

async fn validate(
    State(state): State<AppState>,
    Json(request): Json<ValidateRequest>,
) -> Json<SqlCandidate> {
    let relations = request
        .relations
        .unwrap_or_else(|| state.pipeline.registry().relations());
    Json(
        state
            .pipeline
            .validator()
            .validate(&request.sql, Some(relations.as_slice())),
    )
}

async fn metadata(State(state): State<AppState>) -> Json<Value> {
    Json(state.metadata_view())
}

async fn metadata_relation(
    State(state): State<AppState>,
    Path(relation): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<ErrorResponse>)> {
    state
        .pipeline
        .registry()
        .columns_of(&relation)
        .map(|columns| Json(json!({"relation": relation, "columns": columns})))
        .map_err(|e| {
            (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse::new("unknown_relation", e.to_string())),
            )
        })
}

async fn access(
    State(state): State<AppState>,
    Json(request): Json<AccessRequest>,
) -> Result<Json<AccessDecision>, (StatusCode, Json<ErrorResponse>)> {
    if request.user_id.trim().is_empty()
        || request.resource.trim().is_empty()
        || request.action.trim().is_empty()
    {
        return Err(validation_error("user_id, resource and action are required"));
    }
    let correlation_id = new_correlation_id();
    let decision = state.access.authorize(&correlation_id, &request);
    state
        .audit
        .append(AuditRecord::for_access(&correlation_id, &decision))
        .await;
    Ok(Json(decision))
}

async fn contracts(State(state): State<AppState>) -> Json<ContractsMetadata> {
    let manifest = contracts_manifest_v1();
    let validator = state.pipeline.validator().config();
    Json(ContractsMetadata {
        api_version: API_VERSION.to_string(),
        contracts_set_sha256: manifest.contracts_set_sha256.to_string(),
        generated_at: manifest.generated_at.to_string(),
        schemas: manifest
            .schemas
            .iter()
            .map(|s| (s.name.to_string(), s.sha256.to_string()))
            .collect(),
        intents: Intent::ALL.to_vec(),
        limits: LimitView {
            policy: validator.limit_policy.name().to_string(),
            default_limit: validator.limit_policy.default_limit(),
            max_limit: validator.limit_policy.max_limit(),
        },
    })
}
