use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::batch::{BatchDocument, BatchJob, CheckpointStore};
use crate::diff::{DiffContext, DiffEngine, DiffResult};
use crate::fingerprint::{DocumentFingerprint, FingerprintEngine, SimilarityResult};
use crate::orchestrator::ForensicOrchestrator;
use crate::patterns::{CorpusSnapshot, PatternDetectionResult, PatternDetector};
use crate::policy::ForensicPolicy;
use crate::providers::{DocumentSnapshot, InMemoryCollaborators};
use crate::signer::{ReportSigner, SignedReport};
use crate::timeline::{ForensicTimeline, RawEvent, TimelineBuilder};

// ==========================================
// 1. 应用状态 (Shared State)
// ==========================================
// 引擎都是无状态的纯函数，只需共享策略、签名器和检查点存储。
pub struct AppState {
    pub policy: ForensicPolicy,
    pub signer: ReportSigner,
    pub checkpoints: Arc<dyn CheckpointStore>,
}

type ApiError = (StatusCode, String);

// ==========================================
// 2. 数据传输对象 (DTOs)
// ==========================================

#[derive(Deserialize)]
pub struct FingerprintRequest {
    pub document_id: String,
    pub document: Value,
}

#[derive(Deserialize)]
pub struct CompareRequest {
    pub a: FingerprintRequest,
    pub b: FingerprintRequest,
}

#[derive(Deserialize)]
pub struct DiffRequest {
    pub document_a: String,
    pub old: Value,
    pub document_b: String,
    pub new: Value,
    #[serde(default)]
    pub changed_by: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct TimelineRequest {
    pub artifact_id: String,
    #[serde(default)]
    pub events: Vec<RawEvent>,
}

#[derive(Deserialize)]
pub struct InvestigateRequest {
    pub artifact_id: String,
    pub expected_hash: String,
    pub actual_hash: String,
    /// 该工件的历史快照，最后一个视为当前版本
    pub versions: Vec<DocumentSnapshot>,
    #[serde(default)]
    pub events: Vec<RawEvent>,
    #[serde(default)]
    pub corpus: Option<CorpusSnapshot>,
}

#[derive(Deserialize)]
pub struct BatchRequest {
    pub job_id: String,
    pub documents: Vec<BatchDocument>,
}

#[derive(Serialize)]
pub struct BatchReceipt {
    pub job_id: String,
    pub processed: usize,
    pub resumed: usize,
    pub failed: Vec<String>,
    pub cancelled: bool,
    pub fingerprints: Vec<DocumentFingerprint>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub policy_version: String,
    pub public_key: String,
}

// ==========================================
// 3. API 路由构建
// ==========================================
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/fingerprint", post(fingerprint))
        .route("/compare", post(compare))
        .route("/diff", post(diff))
        .route("/timeline", post(timeline))
        .route("/patterns", post(patterns))
        .route("/investigate", post(investigate))
        .route("/batch", post(batch))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ==========================================
// 4. 处理函数 (Handlers)
// ==========================================

/// CPU 密集型分析统一放到 blocking 线程池
async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("task join error: {e}")))?
}

fn unprocessable(e: impl std::fmt::Display) -> ApiError {
    (StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        policy_version: state.policy.version.clone(),
        public_key: state.signer.public_key_hex(),
    })
}

async fn fingerprint(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FingerprintRequest>,
) -> Result<Json<DocumentFingerprint>, ApiError> {
    info!(document_id = %req.document_id, "fingerprint request");
    let fp = blocking(move || {
        FingerprintEngine::new(&state.policy)
            .fingerprint(&req.document_id, &req.document)
            .map_err(unprocessable)
    })
    .await?;
    Ok(Json(fp))
}

async fn compare(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CompareRequest>,
) -> Result<Json<SimilarityResult>, ApiError> {
    info!(a = %req.a.document_id, b = %req.b.document_id, "compare request");
    let result = blocking(move || {
        let engine = FingerprintEngine::new(&state.policy);
        let a = engine
            .fingerprint(&req.a.document_id, &req.a.document)
            .map_err(unprocessable)?;
        let b = engine
            .fingerprint(&req.b.document_id, &req.b.document)
            .map_err(unprocessable)?;
        Ok(engine.compare(&a, &b))
    })
    .await?;
    Ok(Json(result))
}

async fn diff(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DiffRequest>,
) -> Result<Json<DiffResult>, ApiError> {
    info!(document_a = %req.document_a, document_b = %req.document_b, "diff request");
    let result = blocking(move || {
        let ctx = DiffContext {
            changed_by: req.changed_by.as_deref(),
            timestamp: req.timestamp,
            history: None,
        };
        DiffEngine::new(&state.policy)
            .diff_with(&req.document_a, &req.old, &req.document_b, &req.new, ctx)
            .map_err(unprocessable)
    })
    .await?;
    Ok(Json(result))
}

async fn timeline(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TimelineRequest>,
) -> Result<Json<ForensicTimeline>, ApiError> {
    info!(artifact_id = %req.artifact_id, events = req.events.len(), "timeline request");
    let result = blocking(move || {
        Ok(TimelineBuilder::new(&state.policy).build(&req.artifact_id, req.events))
    })
    .await?;
    Ok(Json(result))
}

async fn patterns(
    State(state): State<Arc<AppState>>,
    Json(snapshot): Json<CorpusSnapshot>,
) -> Result<Json<PatternDetectionResult>, ApiError> {
    let result = blocking(move || Ok(PatternDetector::new(&state.policy).detect(&snapshot))).await?;
    Ok(Json(result))
}

/// 接口：调查哈希不一致，返回签名报告
async fn investigate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InvestigateRequest>,
) -> Result<Json<SignedReport>, ApiError> {
    info!(artifact_id = %req.artifact_id, versions = req.versions.len(), "investigation request");
    if req.versions.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "at least one version is required".to_string()));
    }

    let signed = blocking(move || {
        let mut collaborators = InMemoryCollaborators::new();
        for version in req.versions {
            collaborators.add_version(&req.artifact_id, version);
        }
        collaborators.add_events(&req.artifact_id, req.events);
        if let Some(corpus) = req.corpus {
            collaborators.set_corpus(corpus);
        }

        let orchestrator =
            ForensicOrchestrator::new(&state.policy, &collaborators, &collaborators, &collaborators)
                .with_edit_history(&collaborators);
        let report = orchestrator
            .investigate_mismatch(&req.artifact_id, &req.expected_hash, &req.actual_hash)
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")))?;
        state
            .signer
            .sign_report(&report)
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
    })
    .await?;

    info!(report_id = %signed.report.report_id, outcome = ?signed.report.outcome, "report signed");
    Ok(Json(signed))
}

/// 接口：可断点续跑的批量指纹
async fn batch(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BatchRequest>,
) -> Result<Json<BatchReceipt>, ApiError> {
    let receipt = blocking(move || {
        let engine = FingerprintEngine::new(&state.policy);
        let outcome = BatchJob::new(&req.job_id, &engine, state.checkpoints.as_ref())
            .run(&req.documents)
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
        Ok(BatchReceipt {
            job_id: outcome.job_id,
            processed: outcome.processed,
            resumed: outcome.resumed,
            failed: outcome.failures.iter().map(|e| e.to_string()).collect(),
            cancelled: outcome.cancelled,
            fingerprints: outcome.fingerprints,
        })
    })
    .await?;
    if !receipt.failed.is_empty() {
        warn!(job = %receipt.job_id, failed = receipt.failed.len(), "batch finished with failures");
    }
    Ok(Json(receipt))
}
