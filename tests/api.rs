mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::util::ServiceExt;
use yuanjing_forensics::api::{app, AppState};
use yuanjing_forensics::batch::MemoryCheckpointStore;
use yuanjing_forensics::signer::{ReportSigner, SignedReport};
use yuanjing_forensics::ForensicPolicy;

fn test_app() -> axum::Router {
    app(Arc::new(AppState {
        policy: ForensicPolicy::default(),
        signer: ReportSigner::generate(),
        checkpoints: Arc::new(MemoryCheckpointStore::new()),
    }))
}

async fn post(app: axum::Router, uri: &str, body: Value) -> (StatusCode, Vec<u8>) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, bytes.to_vec())
}

fn json_body(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).unwrap()
}

#[tokio::test]
async fn fingerprint_endpoint_returns_all_layers() {
    let (status, body) = post(
        test_app(),
        "/fingerprint",
        json!({"document_id": "loan-1", "document": common::loan(120_000)}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let fp = json_body(&body);
    assert_eq!(fp["document_id"], "loan-1");
    for layer in ["structural_hash", "content_hash", "style_hash", "semantic_hash", "combined_hash"] {
        assert_eq!(fp[layer].as_str().map(str::len), Some(64), "{layer}");
    }
}

#[tokio::test]
async fn scalar_document_is_unprocessable() {
    let (status, body) = post(
        test_app(),
        "/fingerprint",
        json!({"document_id": "x", "document": [1, 2, 3]}),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(String::from_utf8_lossy(&body).contains("must be an object"));
}

#[tokio::test]
async fn diff_endpoint_scores_changes() {
    let (status, body) = post(
        test_app(),
        "/diff",
        json!({
            "document_a": "v1",
            "old": common::loan(100_000),
            "document_b": "v2",
            "new": common::loan(900_000),
            "changed_by": "mallory"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let diff = json_body(&body);
    assert_eq!(diff["total_changes"], 1);
    assert_eq!(diff["changes"][0]["changed_by"], "mallory");
}

#[tokio::test]
async fn timeline_endpoint_accepts_mixed_timestamps() {
    let (status, body) = post(
        test_app(),
        "/timeline",
        json!({
            "artifact_id": "doc-1",
            "events": [
                {"event_type": "document_modified", "user_id": "u1", "timestamp": "2026-05-05T10:05:00Z"},
                {"event_type": "document_uploaded", "user_id": "u1", "timestamp": 1778061600},
                {"event_type": "mystery_event", "user_id": "u2"}
            ]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let timeline = json_body(&body);
    assert_eq!(timeline["events"].as_array().map(Vec::len), Some(2));
    assert_eq!(timeline["warnings"].as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn patterns_endpoint_runs_on_snapshot() {
    let snapshot = serde_json::to_value(common::template_corpus(20)).unwrap();
    let (status, body) = post(test_app(), "/patterns", snapshot).await;
    assert_eq!(status, StatusCode::OK);
    let result = json_body(&body);
    assert_eq!(result["total_patterns"], 1);
    assert_eq!(result["patterns"][0]["pattern_type"], "template_fraud");
}

#[tokio::test]
async fn investigate_returns_verifiable_report() {
    let (status, body) = post(
        test_app(),
        "/investigate",
        json!({
            "artifact_id": "loan-9",
            "expected_hash": "aaa",
            "actual_hash": "bbb",
            "versions": [
                {"version": "v1", "captured_at": "2026-05-05T10:00:00Z", "document": common::loan(100_000)},
                {"version": "v2", "captured_at": "2026-05-05T10:30:00Z", "changed_by": "mallory", "document": common::loan(900_000)}
            ]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let signed: SignedReport = serde_json::from_slice(&body).unwrap();
    assert_eq!(signed.report.artifact_id, "loan-9");
    assert!(signed.report.hash_mismatch);
    assert_eq!(signed.signature.len(), 128);
}

#[tokio::test]
async fn investigate_without_versions_is_rejected() {
    let (status, _) = post(
        test_app(),
        "/investigate",
        json!({"artifact_id": "x", "expected_hash": "a", "actual_hash": "b", "versions": []}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn batch_endpoint_resumes_job() {
    let app = test_app();
    let documents: Vec<Value> = (0..3)
        .map(|i| json!({"document_id": format!("w2-{i}"), "document": common::tax_form(i)}))
        .collect();

    let (status, body) = post(
        app.clone(),
        "/batch",
        json!({"job_id": "job-a", "documents": documents[..2]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body)["processed"], 2);

    let (_, body) = post(app, "/batch", json!({"job_id": "job-a", "documents": documents})).await;
    let receipt = json_body(&body);
    assert_eq!(receipt["resumed"], 2);
    assert_eq!(receipt["processed"], 1);
}
