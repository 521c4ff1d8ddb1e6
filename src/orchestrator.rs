use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::diff::{DiffContext, DiffEngine, DiffResult};
use crate::fingerprint::{DocumentFingerprint, FingerprintEngine, FingerprintIndex, SimilarMatch};
use crate::patterns::{DetectedPattern, PatternDetector};
use crate::policy::ForensicPolicy;
use crate::providers::{AuditLogProvider, CorpusSnapshotProvider, DocumentSnapshotProvider, EditHistory};
use crate::risk::RiskLevel;
use crate::timeline::{ForensicTimeline, TimelineBuilder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvestigationOutcome {
    NothingSuspicious,
    SuspiciousFindings,
}

/// 一次哈希不一致调查的完整报告
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForensicReport {
    pub report_id: String,
    pub artifact_id: String,
    pub expected_hash: String,
    pub actual_hash: String,
    pub hash_mismatch: bool,
    pub policy_version: String,
    pub generated_at: DateTime<Utc>,
    pub fingerprint: DocumentFingerprint,
    /// 没有历史版本时为空
    pub diff: Option<DiffResult>,
    pub timeline: ForensicTimeline,
    pub related_patterns: Vec<DetectedPattern>,
    pub similar_documents: Vec<SimilarMatch>,
    pub overall_risk: RiskLevel,
    pub findings: Vec<String>,
    pub outcome: InvestigationOutcome,
}

/// 调查编排器 (Forensic Orchestrator)
///
/// **职责**: 从协作方拉取快照与日志，依次调用指纹、差异、时间线、模式四个引擎，
/// 汇总成一份报告。任何一步的失败都以错误返回，绝不伪装成"没有发现"。
pub struct ForensicOrchestrator<'c> {
    policy: ForensicPolicy,
    fingerprints: FingerprintEngine,
    diffs: DiffEngine,
    timelines: TimelineBuilder,
    patterns: PatternDetector,
    documents: &'c dyn DocumentSnapshotProvider,
    audit_log: &'c dyn AuditLogProvider,
    corpus: &'c dyn CorpusSnapshotProvider,
    history: Option<&'c dyn EditHistory>,
}

impl<'c> ForensicOrchestrator<'c> {
    pub fn new(
        policy: &ForensicPolicy,
        documents: &'c dyn DocumentSnapshotProvider,
        audit_log: &'c dyn AuditLogProvider,
        corpus: &'c dyn CorpusSnapshotProvider,
    ) -> Self {
        Self {
            policy: policy.clone(),
            fingerprints: FingerprintEngine::new(policy),
            diffs: DiffEngine::new(policy),
            timelines: TimelineBuilder::new(policy),
            patterns: PatternDetector::new(policy),
            documents,
            audit_log,
            corpus,
            history: None,
        }
    }

    pub fn with_edit_history(mut self, history: &'c dyn EditHistory) -> Self {
        self.history = Some(history);
        self
    }

    pub fn investigate_mismatch(
        &self,
        artifact_id: &str,
        expected_hash: &str,
        actual_hash: &str,
    ) -> anyhow::Result<ForensicReport> {
        let hash_mismatch = !expected_hash.eq_ignore_ascii_case(actual_hash);
        info!(artifact_id, hash_mismatch, "investigation started");

        // 1. 快照
        let current = self
            .documents
            .current(artifact_id)
            .with_context(|| format!("no snapshot available for artifact {artifact_id}"))?;
        let history = self.documents.history(artifact_id);
        let previous = history
            .iter()
            .rev()
            .find(|s| s.captured_at < current.captured_at || s.version != current.version);

        // 2. 指纹
        let fingerprint = self
            .fingerprints
            .fingerprint(artifact_id, &current.document)
            .with_context(|| format!("fingerprinting artifact {artifact_id} failed"))?;

        // 3. 差异
        let diff = match previous {
            Some(prev) => {
                let ctx = DiffContext {
                    changed_by: current.changed_by.as_deref(),
                    timestamp: Some(current.captured_at),
                    history: self.history,
                };
                let result = self
                    .diffs
                    .diff_with(
                        &format!("{artifact_id}@{}", prev.version),
                        &prev.document,
                        artifact_id,
                        &current.document,
                        ctx,
                    )
                    .with_context(|| format!("diffing artifact {artifact_id} against {}", prev.version))?;
                Some(result)
            }
            None => {
                warn!(artifact_id, "no previous snapshot, skipping diff");
                None
            }
        };

        // 4. 时间线
        let timeline = self
            .timelines
            .build(artifact_id, self.audit_log.events_for(artifact_id));

        // 5. 语料级模式
        let snapshot = self.corpus.snapshot();
        let detection = self.patterns.detect(&snapshot);
        let related_patterns: Vec<DetectedPattern> = detection.involving(artifact_id).cloned().collect();

        // 6. 相似文档
        let index: FingerprintIndex = snapshot.fingerprints.iter().cloned().collect();
        let similar_documents = index.find_similar(
            &self.fingerprints,
            &fingerprint,
            self.policy.similarity.derivative_threshold,
        );

        let findings = collect_findings(
            hash_mismatch,
            diff.as_ref(),
            &timeline,
            &related_patterns,
            &similar_documents,
        );
        let overall_risk = overall_risk(diff.as_ref(), &timeline, &related_patterns);
        let outcome = if findings.is_empty() {
            InvestigationOutcome::NothingSuspicious
        } else {
            InvestigationOutcome::SuspiciousFindings
        };

        let generated_at = Utc::now();
        let report_id = {
            let mut hasher = blake3::Hasher::new();
            hasher.update(artifact_id.as_bytes());
            hasher.update(expected_hash.as_bytes());
            hasher.update(actual_hash.as_bytes());
            hasher.update(generated_at.to_rfc3339().as_bytes());
            format!("rpt_{}", &hasher.finalize().to_hex()[..24])
        };

        info!(
            artifact_id,
            report_id = %report_id,
            outcome = ?outcome,
            overall_risk = overall_risk.as_str(),
            findings = findings.len(),
            "investigation complete"
        );

        Ok(ForensicReport {
            report_id,
            artifact_id: artifact_id.to_string(),
            expected_hash: expected_hash.to_string(),
            actual_hash: actual_hash.to_string(),
            hash_mismatch,
            policy_version: self.policy.version.clone(),
            generated_at,
            fingerprint,
            diff,
            timeline,
            related_patterns,
            similar_documents,
            overall_risk,
            findings,
            outcome,
        })
    }
}

fn collect_findings(
    hash_mismatch: bool,
    diff: Option<&DiffResult>,
    timeline: &ForensicTimeline,
    patterns: &[DetectedPattern],
    similar: &[SimilarMatch],
) -> Vec<String> {
    let mut findings = Vec::new();
    if let Some(diff) = diff {
        if diff.risk_level >= RiskLevel::Medium {
            findings.push(format!(
                "{} field change(s) with {} risk",
                diff.total_changes,
                diff.risk_level.as_str()
            ));
        }
        findings.extend(diff.suspicious_patterns.iter().cloned());
    } else if hash_mismatch {
        findings.push("hash mismatch with no prior snapshot to compare".to_string());
    }
    findings.extend(timeline.suspicious_patterns.iter().map(|p| p.description.clone()));
    findings.extend(
        patterns
            .iter()
            .map(|p| format!("{} ({})", p.pattern_type.as_str(), p.pattern_id)),
    );
    findings.extend(
        similar
            .iter()
            .filter(|m| m.similarity.is_duplicate)
            .map(|m| format!("near-duplicate of {}", m.document_id)),
    );
    findings
}

fn overall_risk(
    diff: Option<&DiffResult>,
    timeline: &ForensicTimeline,
    patterns: &[DetectedPattern],
) -> RiskLevel {
    let from_diff = diff.map(|d| d.risk_level).unwrap_or(RiskLevel::Minimal);
    let from_timeline = RiskLevel::from(timeline.risk_assessment.risk_level);
    let from_patterns = patterns
        .iter()
        .map(|p| RiskLevel::from(p.severity))
        .max()
        .unwrap_or(RiskLevel::Minimal);
    from_diff.max(from_timeline).max(from_patterns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{DocumentSnapshot, InMemoryCollaborators};
    use crate::timeline::RawEvent;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn t(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 7, 10, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn collaborators(new_amount: u64) -> InMemoryCollaborators {
        let mut c = InMemoryCollaborators::new();
        c.add_version(
            "loan-7",
            DocumentSnapshot {
                version: "v1".to_string(),
                captured_at: t(0),
                changed_by: Some("alice".to_string()),
                document: json!({"loan_amount": 100000, "borrower": {"name": "Jane"}}),
            },
        );
        c.add_version(
            "loan-7",
            DocumentSnapshot {
                version: "v2".to_string(),
                captured_at: t(30),
                changed_by: Some("mallory".to_string()),
                document: json!({"loan_amount": new_amount, "borrower": {"name": "Jane"}}),
            },
        );
        c.add_events(
            "loan-7",
            vec![
                RawEvent::new("document_uploaded", "alice", t(0)),
                RawEvent::new("document_viewed", "bob", t(10)),
            ],
        );
        c
    }

    #[test]
    fn inflated_amount_is_suspicious() {
        let c = collaborators(900_000);
        let orchestrator = ForensicOrchestrator::new(&ForensicPolicy::default(), &c, &c, &c);
        let report = orchestrator.investigate_mismatch("loan-7", "aa", "bb").unwrap();
        assert!(report.hash_mismatch);
        assert_eq!(report.outcome, InvestigationOutcome::SuspiciousFindings);
        assert!(report.overall_risk >= RiskLevel::High);
        let diff = report.diff.unwrap();
        assert_eq!(diff.document_b, "loan-7");
        assert_eq!(diff.total_changes, 1);
    }

    #[test]
    fn unchanged_document_reports_nothing() {
        let c = collaborators(100_000);
        let orchestrator = ForensicOrchestrator::new(&ForensicPolicy::default(), &c, &c, &c);
        let report = orchestrator.investigate_mismatch("loan-7", "aa", "AA").unwrap();
        assert!(!report.hash_mismatch);
        assert_eq!(report.outcome, InvestigationOutcome::NothingSuspicious);
        assert!(report.findings.is_empty());
    }

    #[test]
    fn missing_artifact_is_an_error() {
        let c = InMemoryCollaborators::new();
        let orchestrator = ForensicOrchestrator::new(&ForensicPolicy::default(), &c, &c, &c);
        assert!(orchestrator.investigate_mismatch("ghost", "a", "b").is_err());
    }
}
