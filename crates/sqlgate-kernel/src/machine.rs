//! Request orchestration as an explicit finite-state machine.
//!
//! A request moves through
//! `START → CLASSIFY → POLICY → [METADATA] → [SYNTHESIZE] → VALIDATE → [EXECUTE] → ANSWER → END`,
//! with `REFUSED` and `CLARIFY_NEEDED` as detours into `ANSWER`. Each edge is
//! chosen by one of the pure `route_*` functions below.
//!
//! The two boundary steps do not call out themselves. [`Pipeline::advance`]
//! stops and returns a [`Pending`] describing the call to make; the caller
//! performs it however it likes (sync, async, with retries) and hands the
//! result back through [`RequestState::supply_synthesis`] or
//! [`RequestState::supply_execution`] before advancing again.

use std::sync::Arc;

use sqlgate_contracts::{
    AskResponse, Classification, ExecutionSummary, Intent, PolicyVerdict, SqlCandidate,
};

use crate::answer;
use crate::boundary::{fallback_sql, Executor, SynthesisRequest, Synthesizer};
use crate::classifier::{self, ENTITY_SQL, ENTITY_TIME_WINDOW_DAYS};
use crate::error::BoundaryError;
use crate::metadata::{MetadataCandidates, MetadataResolver};
use crate::policy::PolicyGate;
use crate::registry::AllowlistRegistry;
use crate::trail::Trail;
use crate::validator::SqlValidator;

/// Classifications below this confidence are sent back for clarification.
pub const CONFIDENCE_FLOOR: f64 = 0.6;
pub const DEFAULT_FALLBACK_LIMIT: u64 = 20;

pub const CODE_CLASSIFY: &str = "CLASSIFY";
pub const CODE_POLICY_ALLOW: &str = "POLICY_ALLOW";
pub const CODE_POLICY_DENY: &str = "POLICY_DENY";
pub const CODE_METADATA: &str = "METADATA";
pub const CODE_SYNTHESIZE: &str = "SYNTHESIZE";
pub const CODE_SYNTHESIZE_FALLBACK: &str = "SYNTHESIZE_FALLBACK";
pub const CODE_SQL_OK: &str = "SQL_OK";
pub const CODE_SQL_DENY: &str = "SQL_DENY";
pub const CODE_EXECUTE_OK: &str = "EXECUTE_OK";
pub const CODE_EXECUTE_FAIL: &str = "EXECUTE_FAIL";
pub const CODE_REFUSED: &str = "REFUSED";
pub const CODE_CLARIFY_NEEDED: &str = "CLARIFY_NEEDED";
pub const CODE_ANSWER: &str = "ANSWER";

/// Immutable input of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub correlation_id: String,
    pub message: String,
    pub role: String,
    pub provided_sql: Option<String>,
}

impl RequestContext {
    pub fn new(
        correlation_id: impl Into<String>,
        message: impl Into<String>,
        role: impl Into<String>,
        provided_sql: Option<String>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            message: message.into(),
            role: role.into(),
            provided_sql,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Start,
    Classify,
    Policy,
    Metadata,
    Synthesize,
    Validate,
    Execute,
    Refused,
    ClarifyNeeded,
    Answer,
    End,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Start => "START",
            Stage::Classify => "CLASSIFY",
            Stage::Policy => "POLICY",
            Stage::Metadata => "METADATA",
            Stage::Synthesize => "SYNTHESIZE",
            Stage::Validate => "VALIDATE",
            Stage::Execute => "EXECUTE",
            Stage::Refused => "REFUSED",
            Stage::ClarifyNeeded => "CLARIFY_NEEDED",
            Stage::Answer => "ANSWER",
            Stage::End => "END",
        }
    }
}

/// What the driver must do before the request can move on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pending {
    Synthesize(SynthesisRequest),
    Execute(String),
    Done,
}

pub fn route_after_classify(classification: &Classification) -> Stage {
    if classification.intent == Intent::Refuse {
        return Stage::Refused;
    }
    if classification.needs_clarification
        || classification.confidence < CONFIDENCE_FLOOR
        || classification.intent == Intent::Clarify
    {
        return Stage::ClarifyNeeded;
    }
    Stage::Policy
}

pub fn route_after_policy(verdict: &PolicyVerdict, intent: Intent) -> Stage {
    if !verdict.allowed {
        return Stage::Refused;
    }
    match intent {
        Intent::AskMetadata | Intent::GenerateSql => Stage::Metadata,
        Intent::ExecuteSql => Stage::Validate,
        Intent::Clarify | Intent::Refuse => Stage::Answer,
    }
}

pub fn route_after_metadata(intent: Intent) -> Stage {
    if intent == Intent::AskMetadata {
        Stage::Answer
    } else {
        Stage::Synthesize
    }
}

pub fn route_after_validate(candidate: &SqlCandidate) -> Stage {
    if candidate.ok {
        Stage::Execute
    } else {
        Stage::Answer
    }
}

/// The stage that follows the current one, given what has been recorded so far.
pub fn next_stage(state: &RequestState) -> Stage {
    let intent = state
        .classification
        .as_ref()
        .map(|c| c.intent)
        .unwrap_or(Intent::Clarify);
    match state.stage {
        Stage::Start => Stage::Classify,
        Stage::Classify => state
            .classification
            .as_ref()
            .map(route_after_classify)
            .unwrap_or(Stage::ClarifyNeeded),
        Stage::Policy => state
            .verdict
            .as_ref()
            .map(|v| route_after_policy(v, intent))
            .unwrap_or(Stage::Answer),
        Stage::Metadata => route_after_metadata(intent),
        Stage::Synthesize => Stage::Validate,
        Stage::Validate => state
            .validation
            .as_ref()
            .map(route_after_validate)
            .unwrap_or(Stage::Answer),
        Stage::Execute | Stage::Refused | Stage::ClarifyNeeded => Stage::Answer,
        Stage::Answer | Stage::End => Stage::End,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Awaiting {
    Synthesis,
    Execution,
}

/// Everything one request accumulates on its way through the pipeline.
#[derive(Debug, Clone)]
pub struct RequestState {
    pub(crate) context: RequestContext,
    pub(crate) stage: Stage,
    pub(crate) path: Vec<Stage>,
    pub(crate) classification: Option<Classification>,
    pub(crate) verdict: Option<PolicyVerdict>,
    pub(crate) metadata: MetadataCandidates,
    pub(crate) candidate_sql: Option<String>,
    pub(crate) validation: Option<SqlCandidate>,
    pub(crate) execution: Option<ExecutionSummary>,
    pub(crate) execution_error: Option<String>,
    pub(crate) notes: Vec<String>,
    pub(crate) final_answer: Option<String>,
    trail: Trail,
    awaiting: Option<Awaiting>,
    synthesis_reply: Option<Result<String, BoundaryError>>,
    execution_reply: Option<Result<ExecutionSummary, BoundaryError>>,
}

impl RequestState {
    fn new(context: RequestContext) -> Self {
        Self {
            trail: Trail::new(context.correlation_id.clone()),
            context,
            stage: Stage::Start,
            path: vec![Stage::Start],
            classification: None,
            verdict: None,
            metadata: MetadataCandidates::default(),
            candidate_sql: None,
            validation: None,
            execution: None,
            execution_error: None,
            notes: Vec::new(),
            final_answer: None,
            awaiting: None,
            synthesis_reply: None,
            execution_reply: None,
        }
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Stages entered so far, in order.
    pub fn path(&self) -> &[Stage] {
        &self.path
    }

    pub fn visited(&self, stage: Stage) -> bool {
        self.path.contains(&stage)
    }

    pub fn classification(&self) -> Option<&Classification> {
        self.classification.as_ref()
    }

    pub fn verdict(&self) -> Option<&PolicyVerdict> {
        self.verdict.as_ref()
    }

    pub fn metadata(&self) -> &MetadataCandidates {
        &self.metadata
    }

    pub fn validation(&self) -> Option<&SqlCandidate> {
        self.validation.as_ref()
    }

    pub fn execution(&self) -> Option<&ExecutionSummary> {
        self.execution.as_ref()
    }

    pub fn final_answer(&self) -> Option<&str> {
        self.final_answer.as_deref()
    }

    pub fn trail(&self) -> &[String] {
        self.trail.entries()
    }

    pub fn is_done(&self) -> bool {
        self.stage == Stage::End
    }

    pub fn supply_synthesis(&mut self, result: Result<String, BoundaryError>) {
        if self.awaiting == Some(Awaiting::Synthesis) {
            self.synthesis_reply = Some(result);
        }
    }

    pub fn supply_execution(&mut self, result: Result<ExecutionSummary, BoundaryError>) {
        if self.awaiting == Some(Awaiting::Execution) {
            self.execution_reply = Some(result);
        }
    }

    fn enter(&mut self, stage: Stage) {
        self.stage = stage;
        self.path.push(stage);
    }

    fn intent(&self) -> Intent {
        self.classification
            .as_ref()
            .map(|c| c.intent)
            .unwrap_or(Intent::Clarify)
    }

    pub fn into_response(self) -> AskResponse {
        let (confidence, intent) = self
            .classification
            .as_ref()
            .map(|c| (c.confidence, c.intent))
            .unwrap_or((0.0, Intent::Clarify));
        let final_answer = self
            .final_answer
            .clone()
            .unwrap_or_else(|| answer::compose(&self));
        let sql = self
            .validation
            .as_ref()
            .map(|v| v.sql.clone())
            .filter(|s| !s.is_empty())
            .or(self.candidate_sql.clone());
        AskResponse {
            correlation_id: self.context.correlation_id,
            intent,
            confidence,
            allowed: self.verdict.as_ref().map(|v| v.allowed),
            policy_reason: self
                .verdict
                .as_ref()
                .filter(|v| !v.allowed)
                .map(|v| v.reason.clone()),
            sql,
            sql_ok: self.validation.as_ref().map(|v| v.ok),
            sql_issues: self
                .validation
                .as_ref()
                .map(|v| v.issues.clone())
                .unwrap_or_default(),
            tables: self.metadata.tables,
            columns: self.metadata.columns,
            execution: self.execution,
            final_answer,
            log_trail: self.trail.into_entries(),
        }
    }
}

/// Shared, immutable request pipeline. One instance serves every request.
#[derive(Debug, Clone)]
pub struct Pipeline {
    registry: Arc<AllowlistRegistry>,
    policy: PolicyGate,
    resolver: MetadataResolver,
    validator: SqlValidator,
    fallback_limit: u64,
}

impl Pipeline {
    pub fn new(
        registry: Arc<AllowlistRegistry>,
        policy: PolicyGate,
        resolver: MetadataResolver,
        validator: SqlValidator,
        fallback_limit: u64,
    ) -> Self {
        Self {
            registry,
            policy,
            resolver,
            validator,
            fallback_limit,
        }
    }

    pub fn with_defaults(registry: Arc<AllowlistRegistry>) -> Self {
        Self::new(
            registry,
            PolicyGate::default(),
            MetadataResolver::default(),
            SqlValidator::default(),
            DEFAULT_FALLBACK_LIMIT,
        )
    }

    pub fn registry(&self) -> &AllowlistRegistry {
        &self.registry
    }

    pub fn validator(&self) -> &SqlValidator {
        &self.validator
    }

    pub fn begin(&self, context: RequestContext) -> RequestState {
        RequestState::new(context)
    }

    /// Runs stages until a boundary call is needed or the request is answered.
    ///
    /// Advancing past a boundary stage without supplying its result counts as
    /// a cancelled call.
    pub fn advance(&self, state: &mut RequestState) -> Pending {
        loop {
            match state.stage {
                Stage::Start => {}
                Stage::Classify => self.classify(state),
                Stage::Policy => self.check_policy(state),
                Stage::Metadata => self.resolve_metadata(state),
                Stage::Synthesize => {
                    if state.awaiting != Some(Awaiting::Synthesis) {
                        state.awaiting = Some(Awaiting::Synthesis);
                        return Pending::Synthesize(self.synthesis_request(state));
                    }
                    state.awaiting = None;
                    let reply = state
                        .synthesis_reply
                        .take()
                        .unwrap_or(Err(BoundaryError::Cancelled));
                    self.apply_synthesis(state, reply);
                }
                Stage::Validate => self.validate(state),
                Stage::Execute => {
                    if state.awaiting != Some(Awaiting::Execution) {
                        let Some(sql) = state.validation.as_ref().map(|v| v.sql.clone()) else {
                            state.enter(Stage::Answer);
                            continue;
                        };
                        state.awaiting = Some(Awaiting::Execution);
                        return Pending::Execute(sql);
                    }
                    state.awaiting = None;
                    let reply = state
                        .execution_reply
                        .take()
                        .unwrap_or(Err(BoundaryError::Cancelled));
                    apply_execution(state, reply);
                }
                Stage::Refused => {
                    let reason = state
                        .verdict
                        .as_ref()
                        .filter(|v| !v.allowed)
                        .map(|v| v.reason.clone())
                        .unwrap_or_else(|| format!("intent={}", state.intent()));
                    state.trail.record(CODE_REFUSED, reason);
                }
                Stage::ClarifyNeeded => {
                    let confidence = state
                        .classification
                        .as_ref()
                        .map(|c| c.confidence)
                        .unwrap_or_default();
                    state
                        .trail
                        .record(CODE_CLARIFY_NEEDED, format!("confidence={confidence:.2}"));
                }
                Stage::Answer => {
                    let reply = answer::compose(state);
                    state.trail.record(CODE_ANSWER, "final answer composed");
                    state.final_answer = Some(reply);
                }
                Stage::End => return Pending::Done,
            }
            let next = next_stage(state);
            state.enter(next);
        }
    }

    /// Drives a request to completion with synchronous collaborators.
    pub fn handle(
        &self,
        context: RequestContext,
        synthesizer: &dyn Synthesizer,
        executor: &dyn Executor,
    ) -> AskResponse {
        let mut state = self.begin(context);
        loop {
            match self.advance(&mut state) {
                Pending::Synthesize(request) => {
                    state.supply_synthesis(synthesizer.synthesize(&request));
                }
                Pending::Execute(sql) => {
                    state.supply_execution(executor.execute(&sql));
                }
                Pending::Done => break,
            }
        }
        state.into_response()
    }

    fn classify(&self, state: &mut RequestState) {
        let c = classifier::classify(&state.context.message, state.context.provided_sql.as_deref());
        state.trail.record(
            CODE_CLASSIFY,
            format!("intent={} confidence={:.2}", c.intent, c.confidence),
        );
        state.candidate_sql = c.entities.get(ENTITY_SQL).cloned();
        state.classification = Some(c);
    }

    fn check_policy(&self, state: &mut RequestState) {
        let verdict = self
            .policy
            .evaluate(&state.context.role, &state.context.message, state.intent());
        if verdict.allowed {
            state
                .trail
                .record(CODE_POLICY_ALLOW, format!("role={}", state.context.role));
        } else {
            state.trail.record(
                CODE_POLICY_DENY,
                format!("role={} reason={}", state.context.role, verdict.reason),
            );
        }
        state.verdict = Some(verdict);
    }

    fn resolve_metadata(&self, state: &mut RequestState) {
        let candidates =
            self.resolver
                .resolve(&self.registry, state.intent(), &state.context.message);
        state.trail.record(
            CODE_METADATA,
            format!(
                "tables=[{}] columns={}",
                candidates.tables.join(", "),
                candidates.columns.len()
            ),
        );
        state.metadata = candidates;
    }

    fn synthesis_request(&self, state: &RequestState) -> SynthesisRequest {
        let time_window_days = state
            .classification
            .as_ref()
            .and_then(|c| c.entities.get(ENTITY_TIME_WINDOW_DAYS))
            .and_then(|v| v.parse().ok());
        SynthesisRequest {
            correlation_id: state.context.correlation_id.clone(),
            message: state.context.message.clone(),
            role: state.context.role.clone(),
            tables: state.metadata.tables.clone(),
            columns: state.metadata.columns.clone(),
            default_limit: self.validator.default_limit(),
            time_window_days,
        }
    }

    fn apply_synthesis(&self, state: &mut RequestState, reply: Result<String, BoundaryError>) {
        match reply {
            Ok(sql) => {
                state.trail.record(CODE_SYNTHESIZE, "candidate SQL proposed");
                state.candidate_sql = Some(sql);
            }
            Err(err) => {
                let fallback = fallback_sql(
                    &state.metadata.tables,
                    &state.metadata.columns,
                    self.fallback_limit,
                );
                match &fallback {
                    Some(_) => state
                        .trail
                        .record(CODE_SYNTHESIZE_FALLBACK, format!("{err}; using safe default query")),
                    None => state
                        .trail
                        .record(CODE_SYNTHESIZE_FALLBACK, format!("{err}; no relation for a default query")),
                }
                state.notes.push(format!(
                    "Not: sorgu üretilemedi ({err}); güvenli varsayılan sorgu kullanıldı."
                ));
                state.candidate_sql = fallback;
            }
        }
    }

    fn validate(&self, state: &mut RequestState) {
        let sql = state.candidate_sql.as_deref().unwrap_or_default();
        let candidate = if state.intent() == Intent::ExecuteSql {
            let relations = self.registry.relations();
            self.validator.validate(sql, Some(relations.as_slice()))
        } else {
            self.validator
                .validate(sql, Some(state.metadata.tables.as_slice()))
        };
        if candidate.ok {
            let detail = if candidate.issues.is_empty() {
                "validated".to_string()
            } else {
                candidate.issues.join("; ")
            };
            state.trail.record(CODE_SQL_OK, detail);
        } else {
            state
                .trail
                .record(CODE_SQL_DENY, candidate.issues.join("; "));
        }
        state.validation = Some(candidate);
    }
}

fn apply_execution(state: &mut RequestState, reply: Result<ExecutionSummary, BoundaryError>) {
    match reply {
        Ok(summary) => {
            state.trail.record(
                CODE_EXECUTE_OK,
                format!("rows={} dry_run={}", summary.row_count, summary.dry_run),
            );
            state.execution = Some(summary);
        }
        Err(err) => {
            state.trail.record(CODE_EXECUTE_FAIL, err.to_string());
            state.execution_error = Some(err.to_string());
        }
    }
}
