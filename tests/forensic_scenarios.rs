mod common;

use chrono::Duration;
use serde_json::{json, Map, Value};
use yuanjing_forensics::batch::{BatchDocument, BatchJob, CancellationFlag, CheckpointStore, SledCheckpointStore};
use yuanjing_forensics::diff::DiffContext;
use yuanjing_forensics::orchestrator::ForensicOrchestrator;
use yuanjing_forensics::patterns::{DocumentMeta, PatternType};
use yuanjing_forensics::providers::{DocumentSnapshot, InMemoryCollaborators};
use yuanjing_forensics::signer::ReportSigner;
use yuanjing_forensics::timeline::RawEvent;
use yuanjing_forensics::{
    CorpusSnapshot, DiffEngine, FingerprintEngine, FingerprintError, ForensicPolicy, PatternDetector,
    RiskLevel, Severity, TimelineBuilder,
};

// ==========================================
// 差异
// ==========================================

#[test]
fn inflated_loan_amount_is_flagged() {
    let engine = DiffEngine::new(&ForensicPolicy::default());
    let result = engine
        .diff("loan@v1", &common::loan(100_000), "loan", &common::loan(900_000))
        .unwrap();

    assert_eq!(result.total_changes, 1);
    let change = &result.changes[0];
    assert_eq!(change.field_path, "loan_amount");
    assert!(change.risk_level >= RiskLevel::High);
    assert!(result
        .suspicious_patterns
        .iter()
        .any(|p| p.contains("800%")));
}

// ==========================================
// 指纹
// ==========================================

#[test]
fn pathological_nesting_is_rejected_without_overflow() {
    let mut doc = json!({"leaf": 1});
    for _ in 0..1_000 {
        let mut wrapper = Map::new();
        wrapper.insert("child".to_string(), doc);
        doc = Value::Object(wrapper);
    }
    let engine = FingerprintEngine::new(&ForensicPolicy::default());
    let err = engine.fingerprint("deep", &doc).unwrap_err();
    assert!(matches!(err, FingerprintError::DepthExceeded { max_depth: 64, .. }));
}

#[test]
fn identical_copy_is_duplicate_and_unrelated_form_is_not() {
    let engine = FingerprintEngine::new(&ForensicPolicy::default());
    let original = engine.fingerprint("a", &common::loan(250_000)).unwrap();
    let copy = engine.fingerprint("b", &common::loan(250_000)).unwrap();
    let other = engine.fingerprint("c", &common::tax_form(1)).unwrap();

    assert!(engine.compare(&original, &copy).is_duplicate);
    let unrelated = engine.compare(&original, &other);
    assert!(!unrelated.is_duplicate);
    assert!(unrelated.overall_similarity < 0.5);
}

// ==========================================
// 模式
// ==========================================

#[test]
fn template_fraud_needs_twenty_documents() {
    let detector = PatternDetector::new(&ForensicPolicy::default());

    let small = detector.detect(&common::template_corpus(3));
    assert!(small
        .patterns
        .iter()
        .all(|p| p.pattern_type != PatternType::TemplateFraud));

    let large = detector.detect(&common::template_corpus(20));
    let template: Vec<_> = large
        .patterns
        .iter()
        .filter(|p| p.pattern_type == PatternType::TemplateFraud)
        .collect();
    assert_eq!(template.len(), 1);
    assert_eq!(template[0].affected_documents.len(), 20);
    assert_eq!(template[0].severity, Severity::High);
}

#[test]
fn detection_is_idempotent() {
    let detector = PatternDetector::new(&ForensicPolicy::default());
    let mut snapshot = common::template_corpus(25);
    for i in 0..4 {
        snapshot.documents.push(DocumentMeta {
            document_id: format!("w2-{i:03}"),
            applicant_id: Some(format!("applicant-{i}")),
            signature_hash: Some("feedfacecafebeef0011".to_string()),
            created_at: Some(common::at(i)),
            ..Default::default()
        });
    }

    let first = detector.detect(&snapshot);
    let second = detector.detect(&snapshot);
    assert_eq!(first.pattern_ids(), second.pattern_ids());
    assert_eq!(first, second);
    assert_eq!(first.total_patterns, 2);
}

#[test]
fn failing_rule_keeps_other_patterns() {
    let mut policy = ForensicPolicy::default();
    policy.patterns.ssn_reuse_min_applicants = 0;
    let result = PatternDetector::new(&policy).detect(&common::template_corpus(20));

    assert_eq!(result.total_patterns, 1);
    assert_eq!(result.patterns[0].pattern_type, PatternType::TemplateFraud);
    assert!(result
        .warnings
        .iter()
        .any(|w| w.rule == PatternType::IdentityReuseSsn));
}

#[test]
fn actor_touching_many_documents_quickly_is_coordinated() {
    let builder = TimelineBuilder::new(&ForensicPolicy::default());
    let detector = PatternDetector::new(&ForensicPolicy::default());

    let burst = |spacing_minutes: i64| {
        let mut snapshot = CorpusSnapshot::new(common::at(24 * 60));
        for i in 0..10 {
            let id = format!("doc-{i}");
            let events = vec![RawEvent::new("document_modified", "mallory", common::at(i * spacing_minutes))];
            snapshot.timelines.push(builder.build(&id, events));
        }
        detector.detect(&snapshot)
    };

    let fast = burst(1);
    assert_eq!(fast.total_patterns, 1);
    let pattern = &fast.patterns[0];
    assert_eq!(pattern.pattern_type, PatternType::CoordinatedTampering);
    assert_eq!(pattern.affected_users, vec!["mallory"]);
    assert_eq!(pattern.affected_documents.len(), 10);

    let slow = burst(10);
    assert_eq!(slow.total_patterns, 0);
}

#[test]
fn separate_tampering_sprees_are_separate_patterns() {
    let builder = TimelineBuilder::new(&ForensicPolicy::default());
    let mut snapshot = CorpusSnapshot::new(common::at(24 * 60));
    for i in 0..20 {
        let minute = if i < 10 { i } else { 300 + i };
        let events = vec![RawEvent::new("document_modified", "mallory", common::at(minute))];
        snapshot.timelines.push(builder.build(&format!("doc-{i:02}"), events));
    }

    let result = PatternDetector::new(&ForensicPolicy::default()).detect(&snapshot);
    let mut sprees: Vec<Vec<String>> = result
        .patterns
        .iter()
        .filter(|p| p.pattern_type == PatternType::CoordinatedTampering)
        .map(|p| p.affected_documents.clone())
        .collect();
    sprees.sort();
    assert_eq!(sprees.len(), 2);
    assert_eq!(sprees[0].len(), 10);
    assert_eq!(sprees[0][0], "doc-00");
    assert_eq!(sprees[1][0], "doc-10");
}

#[test]
fn repeated_round_amount_edits_are_manipulation() {
    let engine = DiffEngine::new(&ForensicPolicy::default());
    let mut snapshot = CorpusSnapshot::new(common::at(24 * 60));
    for i in 0..5 {
        let ctx = DiffContext {
            changed_by: Some("officer-9"),
            timestamp: Some(common::at(i * 45)),
            history: None,
        };
        let id = format!("loan-{i}");
        let diff = engine
            .diff_with(
                &format!("{id}@v1"),
                &common::loan(100_000),
                &id,
                &common::loan(110_000),
                ctx,
            )
            .unwrap();
        snapshot.diffs.push(diff);
    }

    let result = PatternDetector::new(&ForensicPolicy::default()).detect(&snapshot);
    let manipulation: Vec<_> = result
        .patterns
        .iter()
        .filter(|p| p.pattern_type == PatternType::AmountManipulation)
        .collect();
    assert_eq!(manipulation.len(), 1);
    assert_eq!(manipulation[0].affected_documents.len(), 5);
    assert_eq!(manipulation[0].severity, Severity::Critical);
    assert!(manipulation[0].confidence > 0.7);
}

// ==========================================
// 批处理与检查点
// ==========================================

#[test]
fn sled_checkpoints_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoints");
    let engine = FingerprintEngine::new(&ForensicPolicy::default());
    let documents: Vec<BatchDocument> = (0..6)
        .map(|i| BatchDocument {
            document_id: format!("w2-{i}"),
            document: common::tax_form(i),
        })
        .collect();

    {
        let store = SledCheckpointStore::open(&path).unwrap();
        let outcome = BatchJob::new("nightly", &engine, &store)
            .run(&documents[..4])
            .unwrap();
        assert_eq!(outcome.processed, 4);
    }

    let store = SledCheckpointStore::open(&path).unwrap();
    let cancel = CancellationFlag::new();
    let outcome = BatchJob::new("nightly", &engine, &store)
        .with_cancellation(cancel)
        .run(&documents)
        .unwrap();
    assert_eq!(outcome.resumed, 4);
    assert_eq!(outcome.processed, 2);
    assert!(!outcome.cancelled);
    assert_eq!(store.completed("nightly").unwrap().len(), 6);

    store.clear("nightly").unwrap();
    assert!(store.completed("nightly").unwrap().is_empty());
}

// ==========================================
// 调查与签名
// ==========================================

fn investigated_report() -> yuanjing_forensics::ForensicReport {
    let mut c = InMemoryCollaborators::new();
    for (version, minute, amount, actor) in [("v1", 0, 100_000, "alice"), ("v2", 20, 900_000, "mallory")] {
        c.add_version(
            "loan-42",
            DocumentSnapshot {
                version: version.to_string(),
                captured_at: common::at(minute),
                changed_by: Some(actor.to_string()),
                document: common::loan(amount),
            },
        );
    }
    c.add_events(
        "loan-42",
        vec![
            RawEvent::new("document_uploaded", "alice", common::at(0)),
            RawEvent::new("document_modified", "mallory", common::at(20)),
            RawEvent::new("verification_failed", "system", common::at(21)),
        ],
    );
    let orchestrator = ForensicOrchestrator::new(&ForensicPolicy::default(), &c, &c, &c).with_edit_history(&c);
    orchestrator
        .investigate_mismatch("loan-42", "abc123", "def456")
        .unwrap()
}

#[test]
fn investigation_combines_every_engine() {
    let report = investigated_report();
    assert_eq!(
        report.outcome,
        yuanjing_forensics::InvestigationOutcome::SuspiciousFindings
    );
    assert_eq!(report.timeline.events.len(), 3);
    assert!(report.diff.as_ref().map(|d| d.total_changes) == Some(1));
    assert!(report.findings.iter().any(|f| f.contains("800%")));
    assert!(report.generated_at >= common::at(0) - Duration::days(1));
}

#[test]
fn signed_report_detects_tampering() {
    let signer = ReportSigner::generate();
    let mut signed = signer.sign_report(&investigated_report()).unwrap();
    assert!(ReportSigner::verify(&signed).unwrap());

    signed.report.findings.clear();
    assert!(!ReportSigner::verify(&signed).unwrap());
}
