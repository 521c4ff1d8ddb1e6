use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::diff::{ChangeType, DiffResult, FieldType};
use crate::errors::PatternRuleError;
use crate::fingerprint::DocumentFingerprint;
use crate::policy::{ForensicPolicy, PatternPolicy};
use crate::risk::Severity;
use crate::timeline::{EventCategory, ForensicTimeline};
use crate::window;

// ==========================================
// 1. 语料快照 (Corpus Snapshot)
// ==========================================

/// 单个文档的轻量元数据
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub document_id: String,
    #[serde(default)]
    pub applicant_id: Option<String>,
    /// 上传 / 经办人
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub signature_hash: Option<String>,
    /// 明文 SSN、后四位或协作方预先算好的哈希均可
    #[serde(default)]
    pub ssn: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// 语料快照
///
/// 由协作方一次性、读一致地提供，并作为参数显式传入检测器。
/// 检测器不持有任何全局缓存，同一快照重复检测结果完全一致。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorpusSnapshot {
    pub taken_at: DateTime<Utc>,
    #[serde(default)]
    pub documents: Vec<DocumentMeta>,
    #[serde(default)]
    pub fingerprints: Vec<DocumentFingerprint>,
    #[serde(default)]
    pub diffs: Vec<DiffResult>,
    #[serde(default)]
    pub timelines: Vec<ForensicTimeline>,
}

impl CorpusSnapshot {
    pub fn new(taken_at: DateTime<Utc>) -> Self {
        Self {
            taken_at,
            documents: Vec::new(),
            fingerprints: Vec::new(),
            diffs: Vec::new(),
            timelines: Vec::new(),
        }
    }

    /// 快照中出现过的全部文档 id
    pub fn document_ids(&self) -> BTreeSet<&str> {
        let mut ids: BTreeSet<&str> = self.documents.iter().map(|d| d.document_id.as_str()).collect();
        ids.extend(self.fingerprints.iter().map(|f| f.document_id.as_str()));
        ids.extend(self.diffs.iter().map(|d| d.document_b.as_str()));
        ids.extend(self.timelines.iter().map(|t| t.artifact_id.as_str()));
        ids
    }

    fn meta_index(&self) -> HashMap<&str, &DocumentMeta> {
        self.documents
            .iter()
            .map(|d| (d.document_id.as_str(), d))
            .collect()
    }
}

// ==========================================
// 2. 检测结果
// ==========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    DuplicateSignature,
    AmountManipulation,
    IdentityReuseSsn,
    IdentityReuseAddress,
    CoordinatedTampering,
    TemplateFraud,
}

impl PatternType {
    pub const ALL: [PatternType; 6] = [
        PatternType::DuplicateSignature,
        PatternType::AmountManipulation,
        PatternType::IdentityReuseSsn,
        PatternType::IdentityReuseAddress,
        PatternType::CoordinatedTampering,
        PatternType::TemplateFraud,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::DuplicateSignature => "duplicate_signature",
            PatternType::AmountManipulation => "amount_manipulation",
            PatternType::IdentityReuseSsn => "identity_reuse_ssn",
            PatternType::IdentityReuseAddress => "identity_reuse_address",
            PatternType::CoordinatedTampering => "coordinated_tampering",
            PatternType::TemplateFraud => "template_fraud",
        }
    }

    fn severity(&self) -> Severity {
        match self {
            PatternType::AmountManipulation
            | PatternType::IdentityReuseSsn
            | PatternType::CoordinatedTampering => Severity::Critical,
            PatternType::DuplicateSignature
            | PatternType::IdentityReuseAddress
            | PatternType::TemplateFraud => Severity::High,
        }
    }

    fn recommendation(&self) -> &'static str {
        match self {
            PatternType::DuplicateSignature => {
                "Compare signature images manually and contact the listed signers"
            }
            PatternType::AmountManipulation => {
                "Suspend the actor's edit rights and audit every amount change in the window"
            }
            PatternType::IdentityReuseSsn => {
                "Verify applicant identities with the credit bureau before funding"
            }
            PatternType::IdentityReuseAddress => {
                "Confirm occupancy and relationship between applicants at this address"
            }
            PatternType::CoordinatedTampering => {
                "Revoke the actor's session and restore affected documents from sealed snapshots"
            }
            PatternType::TemplateFraud => {
                "Trace the submission channel of the template batch and sample documents for review"
            }
        }
    }
}

/// 跨文档欺诈模式
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedPattern {
    pub pattern_id: String,
    pub pattern_type: PatternType,
    pub severity: Severity,
    pub confidence: f64,
    pub risk_score: f64,
    pub affected_documents: Vec<String>,
    pub affected_users: Vec<String>,
    pub evidence: Map<String, Value>,
    pub recommendation: String,
    pub detected_at: DateTime<Utc>,
}

impl DetectedPattern {
    pub fn involves(&self, document_id: &str) -> bool {
        self.affected_documents.iter().any(|d| d == document_id)
    }
}

/// pattern_id = BLAKE3(模式类型 ‖ 排序后的文档 id)，绝不使用随机数
pub fn pattern_id(pattern_type: PatternType, affected_documents: &BTreeSet<String>) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(pattern_type.as_str().as_bytes());
    for id in affected_documents {
        hasher.update(&[0u8]);
        hasher.update(id.as_bytes());
    }
    format!("pat_{}", &hasher.finalize().to_hex()[..32])
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleWarning {
    pub rule: PatternType,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternDetectionResult {
    pub analyzed_documents: usize,
    pub total_patterns: usize,
    pub patterns: Vec<DetectedPattern>,
    pub by_severity: BTreeMap<Severity, usize>,
    pub critical_patterns: Vec<String>,
    /// 单条规则失败或跳过的输入，不影响其他规则的结果
    pub warnings: Vec<RuleWarning>,
}

impl PatternDetectionResult {
    pub fn pattern_ids(&self) -> BTreeSet<&str> {
        self.patterns.iter().map(|p| p.pattern_id.as_str()).collect()
    }

    pub fn involving<'r>(&'r self, document_id: &'r str) -> impl Iterator<Item = &'r DetectedPattern> {
        self.patterns.iter().filter(move |p| p.involves(document_id))
    }
}

// ==========================================
// 3. 归一化
// ==========================================

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit())
}

fn normalize_signature_hash(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim().trim_start_matches("0x").to_lowercase();
    if trimmed.len() < 16 || !is_hex(&trimmed) {
        return Err(format!("malformed signature hash `{}`", raw.trim()));
    }
    Ok(trimmed)
}

/// 预哈希值原样使用；否则取数字的后四位
pub fn normalize_ssn(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    if trimmed.len() == 64 && is_hex(trimmed) {
        return Ok(format!("h:{}", trimmed.to_lowercase()));
    }
    let digits: Vec<char> = trimmed.chars().filter(char::is_ascii_digit).collect();
    if digits.len() < 4 {
        return Err("SSN has fewer than four digits".to_string());
    }
    Ok(digits[digits.len() - 4..].iter().collect())
}

const ADDRESS_ABBREVIATIONS: &[(&str, &str)] = &[
    ("street", "st"),
    ("avenue", "ave"),
    ("road", "rd"),
    ("boulevard", "blvd"),
    ("drive", "dr"),
    ("lane", "ln"),
    ("court", "ct"),
    ("apartment", "apt"),
    ("suite", "ste"),
    ("unit", "apt"),
    ("north", "n"),
    ("south", "s"),
    ("east", "e"),
    ("west", "w"),
];

pub fn normalize_address(raw: &str) -> Option<String> {
    let lowered = raw.to_lowercase();
    let tokens: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| {
            ADDRESS_ABBREVIATIONS
                .iter()
                .find(|(long, _)| *long == t)
                .map(|(_, short)| *short)
                .unwrap_or(t)
        })
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" "))
    }
}

// ==========================================
// 4. 检测器
// ==========================================

#[derive(Default)]
struct RuleOutput {
    patterns: Vec<DetectedPattern>,
    warnings: Vec<String>,
}

type Rule = fn(&PatternDetector, &CorpusSnapshot) -> Result<RuleOutput, PatternRuleError>;

/// 一组待判定的文档
struct Group {
    documents: BTreeSet<String>,
    users: BTreeSet<String>,
    timestamps: Vec<DateTime<Utc>>,
}

impl Group {
    fn new() -> Self {
        Self {
            documents: BTreeSet::new(),
            users: BTreeSet::new(),
            timestamps: Vec::new(),
        }
    }
}

/// 一次金额修改
struct AmountEdit<'a> {
    actor: &'a str,
    document_id: &'a str,
    field_path: &'a str,
    at: DateTime<Utc>,
    delta: f64,
    pct: f64,
}

/// 一次"触碰"文档的操作（修改或删除）
struct Touch<'a> {
    actor: &'a str,
    document_id: &'a str,
    at: DateTime<Utc>,
}

/// 模式检测器 (Pattern Detector)
///
/// **职责**: 在整个语料快照上挖掘跨文档欺诈模式。
///
/// 六条规则彼此独立：每条规则先按廉价的键分桶（签名哈希、经办人、结构哈希……），
/// 不做 O(n²) 的两两比较。任何一条规则失败只会变成一条警告，其余规则照常产出。
#[derive(Debug, Clone)]
pub struct PatternDetector {
    policy: PatternPolicy,
    round_number_unit: f64,
}

impl PatternDetector {
    pub fn new(policy: &ForensicPolicy) -> Self {
        Self {
            policy: policy.patterns.clone(),
            round_number_unit: policy.diff.round_number_unit,
        }
    }

    fn rules() -> [(PatternType, Rule); 6] {
        [
            (PatternType::DuplicateSignature, Self::duplicate_signature),
            (PatternType::AmountManipulation, Self::amount_manipulation),
            (PatternType::IdentityReuseSsn, Self::identity_reuse_ssn),
            (PatternType::IdentityReuseAddress, Self::identity_reuse_address),
            (PatternType::CoordinatedTampering, Self::coordinated_tampering),
            (PatternType::TemplateFraud, Self::template_fraud),
        ]
    }

    pub fn detect(&self, snapshot: &CorpusSnapshot) -> PatternDetectionResult {
        let analyzed_documents = snapshot.document_ids().len();
        info!(
            documents = analyzed_documents,
            taken_at = %snapshot.taken_at,
            "running pattern detection"
        );

        let mut patterns: Vec<DetectedPattern> = Vec::new();
        let mut warnings = Vec::new();

        for (rule_type, rule) in Self::rules() {
            match rule(self, snapshot) {
                Ok(output) => {
                    debug!(
                        rule = rule_type.as_str(),
                        patterns = output.patterns.len(),
                        skipped = output.warnings.len(),
                        "rule finished"
                    );
                    patterns.extend(output.patterns);
                    warnings.extend(output.warnings.into_iter().map(|message| RuleWarning {
                        rule: rule_type,
                        message,
                    }));
                }
                Err(e) => {
                    warn!(rule = rule_type.as_str(), error = %e, "rule failed, continuing with other rules");
                    warnings.push(RuleWarning {
                        rule: rule_type,
                        message: format!("rule failed: {e}"),
                    });
                }
            }
        }

        // 相同 id 只保留一次，保证重复检测幂等
        let mut seen = BTreeSet::new();
        patterns.retain(|p| seen.insert(p.pattern_id.clone()));
        patterns.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.pattern_id.cmp(&b.pattern_id))
        });

        let mut by_severity = BTreeMap::new();
        for p in &patterns {
            *by_severity.entry(p.severity).or_insert(0) += 1;
        }
        let critical_patterns = patterns
            .iter()
            .filter(|p| p.severity == Severity::Critical)
            .map(|p| p.pattern_id.clone())
            .collect();

        info!(
            patterns = patterns.len(),
            warnings = warnings.len(),
            "pattern detection complete"
        );

        PatternDetectionResult {
            analyzed_documents,
            total_patterns: patterns.len(),
            patterns,
            by_severity,
            critical_patterns,
            warnings,
        }
    }

    fn require_threshold(rule: PatternType, value: usize) -> Result<usize, PatternRuleError> {
        if value == 0 {
            return Err(PatternRuleError::InvalidThreshold {
                rule: rule.as_str(),
                value,
            });
        }
        Ok(value)
    }

    /// confidence = 规模因子 × size_weight + 佐证信号 × corroboration_weight
    fn confidence(&self, group_size: usize, threshold: usize, corroboration: f64) -> f64 {
        let excess = group_size.saturating_sub(threshold) as f64 / threshold.max(1) as f64;
        let size_factor = (0.6 + 0.4 * excess).min(1.0);
        (self.policy.size_weight * size_factor
            + self.policy.corroboration_weight * corroboration.clamp(0.0, 1.0))
        .clamp(0.0, 1.0)
    }

    fn timing_corroboration(&self, timestamps: &[DateTime<Utc>]) -> f64 {
        window::densest_window_fraction(timestamps, window::span(self.policy.timing_cluster_hours, 3600))
            .unwrap_or(0.5)
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        &self,
        snapshot: &CorpusSnapshot,
        pattern_type: PatternType,
        group: Group,
        size: usize,
        threshold: usize,
        corroboration: f64,
        evidence: Value,
    ) -> DetectedPattern {
        let severity = pattern_type.severity();
        let confidence = self.confidence(size, threshold, corroboration);
        let risk_score = (severity.weight() * (0.5 + 0.5 * confidence)).min(1.0);
        let evidence = match evidence {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        DetectedPattern {
            pattern_id: pattern_id(pattern_type, &group.documents),
            pattern_type,
            severity,
            confidence,
            risk_score,
            affected_documents: group.documents.into_iter().collect(),
            affected_users: group.users.into_iter().collect(),
            evidence,
            recommendation: pattern_type.recommendation().to_string(),
            detected_at: snapshot.taken_at,
        }
    }

    // ------------------------------------------
    // 规则 1: 签名图像哈希重复
    // ------------------------------------------
    fn duplicate_signature(&self, snapshot: &CorpusSnapshot) -> Result<RuleOutput, PatternRuleError> {
        let threshold = Self::require_threshold(
            PatternType::DuplicateSignature,
            self.policy.duplicate_signature_min_documents,
        )?;
        let mut output = RuleOutput::default();
        let mut groups: BTreeMap<String, Group> = BTreeMap::new();

        for meta in &snapshot.documents {
            let Some(raw) = meta.signature_hash.as_deref() else {
                continue;
            };
            let hash = match normalize_signature_hash(raw) {
                Ok(h) => h,
                Err(reason) => {
                    output
                        .warnings
                        .push(format!("document {} skipped: {reason}", meta.document_id));
                    continue;
                }
            };
            let group = groups.entry(hash).or_insert_with(Group::new);
            group.documents.insert(meta.document_id.clone());
            if let Some(user) = meta.actor.as_ref().or(meta.applicant_id.as_ref()) {
                group.users.insert(user.clone());
            }
            group.timestamps.extend(meta.created_at);
        }

        for (hash, group) in groups {
            if group.documents.len() < threshold {
                continue;
            }
            let corroboration = self.timing_corroboration(&group.timestamps);
            let evidence = json!({
                "signature_hash": hash,
                "document_count": group.documents.len(),
                "timing_clustering": corroboration,
            });
            let size = group.documents.len();
            output.patterns.push(self.build(
                snapshot,
                PatternType::DuplicateSignature,
                group,
                size,
                threshold,
                corroboration,
                evidence,
            ));
        }
        Ok(output)
    }

    // ------------------------------------------
    // 规则 2: 金额操纵（同一经办人、时间窗内、一致的整数/百分比改动）
    // ------------------------------------------
    fn amount_manipulation(&self, snapshot: &CorpusSnapshot) -> Result<RuleOutput, PatternRuleError> {
        let threshold = Self::require_threshold(
            PatternType::AmountManipulation,
            self.policy.amount_manipulation_min_changes,
        )?;
        let mut output = RuleOutput::default();

        let mut by_actor: BTreeMap<&str, Vec<AmountEdit<'_>>> = BTreeMap::new();
        for diff in &snapshot.diffs {
            for change in &diff.changes {
                if change.change_type != ChangeType::Modified
                    || FieldType::classify(&change.field_path) != FieldType::Financial
                {
                    continue;
                }
                let (Some(actor), Some(at), Some(delta), Some(pct)) = (
                    change.changed_by.as_deref(),
                    change.timestamp,
                    change.numeric_delta(),
                    change.pct_change(),
                ) else {
                    continue;
                };
                by_actor.entry(actor).or_default().push(AmountEdit {
                    actor,
                    document_id: &diff.document_b,
                    field_path: &change.field_path,
                    at,
                    delta,
                    pct,
                });
            }
        }

        let span = window::span(self.policy.amount_manipulation_window_hours, 3600);
        for edits in by_actor.values_mut() {
            edits.sort_by(|a, b| {
                a.at.cmp(&b.at)
                    .then_with(|| a.document_id.cmp(b.document_id))
                    .then_with(|| a.field_path.cmp(b.field_path))
            });
            for cluster in window::clusters(edits.as_slice(), threshold, span, |e| e.at) {
                let consistency = self.delta_consistency(&cluster);
                if consistency < self.policy.amount_consistency_ratio {
                    continue;
                }
                let mut group = Group::new();
                for edit in &cluster {
                    group.documents.insert(edit.document_id.to_string());
                    group.users.insert(edit.actor.to_string());
                    group.timestamps.push(edit.at);
                }
                let total_delta: f64 = cluster.iter().map(|e| e.delta).sum();
                let evidence = json!({
                    "actor": cluster[0].actor,
                    "modification_count": cluster.len(),
                    "window_start": cluster[0].at,
                    "window_end": cluster[cluster.len() - 1].at,
                    "total_delta": total_delta,
                    "delta_consistency": consistency,
                });
                let size = cluster.len();
                output.patterns.push(self.build(
                    snapshot,
                    PatternType::AmountManipulation,
                    group,
                    size,
                    threshold,
                    consistency,
                    evidence,
                ));
            }
        }
        Ok(output)
    }

    /// 一致性 = max(整数改动占比, 众数百分比占比)
    fn delta_consistency(&self, edits: &[&AmountEdit<'_>]) -> f64 {
        if edits.is_empty() {
            return 0.0;
        }
        let unit = self.round_number_unit;
        let round = edits
            .iter()
            .filter(|e| {
                let d = e.delta.abs();
                unit > 0.0 && d >= unit && (d % unit).abs() < 1e-9
            })
            .count();
        let mut pct_counts: BTreeMap<i64, usize> = BTreeMap::new();
        for e in edits.iter().filter(|e| e.pct.is_finite()) {
            let signed = if e.delta < 0.0 { -e.pct } else { e.pct };
            *pct_counts.entry(signed.round() as i64).or_default() += 1;
        }
        let modal = pct_counts.values().copied().max().unwrap_or(0);
        round.max(modal) as f64 / edits.len() as f64
    }

    // ------------------------------------------
    // 规则 3 / 4: 身份信息复用
    // ------------------------------------------
    fn identity_reuse_ssn(&self, snapshot: &CorpusSnapshot) -> Result<RuleOutput, PatternRuleError> {
        let threshold = Self::require_threshold(
            PatternType::IdentityReuseSsn,
            self.policy.ssn_reuse_min_applicants,
        )?;
        self.identity_reuse(snapshot, PatternType::IdentityReuseSsn, threshold, |meta| {
            meta.ssn.as_deref().map(normalize_ssn)
        })
    }

    fn identity_reuse_address(&self, snapshot: &CorpusSnapshot) -> Result<RuleOutput, PatternRuleError> {
        let threshold = Self::require_threshold(
            PatternType::IdentityReuseAddress,
            self.policy.address_reuse_min_applicants,
        )?;
        self.identity_reuse(snapshot, PatternType::IdentityReuseAddress, threshold, |meta| {
            meta.address
                .as_deref()
                .map(|a| normalize_address(a).ok_or_else(|| "address is empty".to_string()))
        })
    }

    fn identity_reuse<F>(
        &self,
        snapshot: &CorpusSnapshot,
        pattern_type: PatternType,
        threshold: usize,
        key_of: F,
    ) -> Result<RuleOutput, PatternRuleError>
    where
        F: Fn(&DocumentMeta) -> Option<Result<String, String>>,
    {
        let mut output = RuleOutput::default();
        let mut groups: BTreeMap<String, (Group, BTreeSet<String>)> = BTreeMap::new();

        for meta in &snapshot.documents {
            let key = match key_of(meta) {
                None => continue,
                Some(Ok(key)) => key,
                Some(Err(reason)) => {
                    output
                        .warnings
                        .push(format!("document {} skipped: {reason}", meta.document_id));
                    continue;
                }
            };
            let applicant = meta
                .applicant_id
                .clone()
                .or_else(|| meta.actor.clone())
                .unwrap_or_else(|| meta.document_id.clone());
            let (group, applicants) = groups
                .entry(key)
                .or_insert_with(|| (Group::new(), BTreeSet::new()));
            group.documents.insert(meta.document_id.clone());
            if let Some(actor) = &meta.actor {
                group.users.insert(actor.clone());
            }
            group.timestamps.extend(meta.created_at);
            applicants.insert(applicant);
        }

        for (key, (group, applicants)) in groups {
            if applicants.len() < threshold {
                continue;
            }
            let corroboration = self.timing_corroboration(&group.timestamps);
            let shown_key = match pattern_type {
                PatternType::IdentityReuseSsn => match key.strip_prefix("h:") {
                    Some(hash) => format!("hash:{}", &hash[..12.min(hash.len())]),
                    None => format!("***-**-{key}"),
                },
                _ => key,
            };
            let evidence = json!({
                "shared_identifier": shown_key,
                "distinct_applicants": applicants.len(),
                "applicants": applicants,
                "timing_clustering": corroboration,
            });
            // 规模按"不同申请人"计
            output.patterns.push(self.build(
                snapshot,
                pattern_type,
                group,
                applicants.len(),
                threshold,
                corroboration,
                evidence,
            ));
        }
        Ok(output)
    }

    // ------------------------------------------
    // 规则 5: 协同篡改（同一经办人在滚动窗口内触碰大量文档）
    // ------------------------------------------
    fn coordinated_tampering(&self, snapshot: &CorpusSnapshot) -> Result<RuleOutput, PatternRuleError> {
        let threshold = Self::require_threshold(
            PatternType::CoordinatedTampering,
            self.policy.coordinated_min_documents,
        )?;
        let mut output = RuleOutput::default();

        let mut touches: BTreeMap<&str, Vec<Touch<'_>>> = BTreeMap::new();
        for timeline in &snapshot.timelines {
            for event in &timeline.events {
                if !matches!(event.category, EventCategory::Modification | EventCategory::Deletion) {
                    continue;
                }
                let Some(actor) = event.user_id.as_deref() else {
                    continue;
                };
                touches.entry(actor).or_default().push(Touch {
                    actor,
                    document_id: &timeline.artifact_id,
                    at: event.timestamp,
                });
            }
        }
        for diff in &snapshot.diffs {
            for change in &diff.changes {
                if let (Some(actor), Some(at)) = (change.changed_by.as_deref(), change.timestamp) {
                    touches.entry(actor).or_default().push(Touch {
                        actor,
                        document_id: &diff.document_b,
                        at,
                    });
                }
            }
        }

        let span = window::span(self.policy.coordinated_window_secs, 1);
        for list in touches.values_mut() {
            list.sort_by(|a, b| a.at.cmp(&b.at).then_with(|| a.document_id.cmp(b.document_id)));
            list.dedup_by(|a, b| a.at == b.at && a.document_id == b.document_id);

            // 严格小于窗口；窗口内按文档计数
            let mut spans = Vec::new();
            let mut counts: HashMap<&str, usize> = HashMap::new();
            let mut left = 0;
            for right in 0..list.len() {
                *counts.entry(list[right].document_id).or_default() += 1;
                while left <= right && list[right].at - list[left].at >= span {
                    let doc = list[left].document_id;
                    if let Some(c) = counts.get_mut(doc) {
                        *c -= 1;
                        if *c == 0 {
                            counts.remove(doc);
                        }
                    }
                    left += 1;
                }
                if counts.len() >= threshold {
                    window::push_span(&mut spans, left, right);
                }
            }

            for burst in window::collect_spans(list.as_slice(), &spans) {
                let mut group = Group::new();
                for touch in &burst {
                    group.documents.insert(touch.document_id.to_string());
                    group.users.insert(touch.actor.to_string());
                    group.timestamps.push(touch.at);
                }
                let evidence = json!({
                    "actor": burst[0].actor,
                    "documents_touched": group.documents.len(),
                    "operations": burst.len(),
                    "window_start": burst[0].at,
                    "window_end": burst[burst.len() - 1].at,
                });
                let corroboration = self.timing_corroboration(&group.timestamps);
                let size = group.documents.len();
                output.patterns.push(self.build(
                    snapshot,
                    PatternType::CoordinatedTampering,
                    group,
                    size,
                    threshold,
                    corroboration,
                    evidence,
                ));
            }
        }
        Ok(output)
    }

    // ------------------------------------------
    // 规则 6: 模板欺诈（结构相同、内容不同）
    // ------------------------------------------
    fn template_fraud(&self, snapshot: &CorpusSnapshot) -> Result<RuleOutput, PatternRuleError> {
        let threshold =
            Self::require_threshold(PatternType::TemplateFraud, self.policy.template_min_documents)?;
        let mut output = RuleOutput::default();
        let metas = snapshot.meta_index();

        let mut by_structure: BTreeMap<&str, (Group, BTreeSet<&str>)> = BTreeMap::new();
        for fp in &snapshot.fingerprints {
            if fp.structural_hash.is_empty() {
                output
                    .warnings
                    .push(format!("document {} skipped: empty structural hash", fp.document_id));
                continue;
            }
            let (group, contents) = by_structure
                .entry(fp.structural_hash.as_str())
                .or_insert_with(|| (Group::new(), BTreeSet::new()));
            group.documents.insert(fp.document_id.clone());
            contents.insert(fp.content_hash.as_str());
            if let Some(meta) = metas.get(fp.document_id.as_str()) {
                if let Some(actor) = &meta.actor {
                    group.users.insert(actor.clone());
                }
                group.timestamps.extend(meta.created_at);
            }
        }

        for (structural_hash, (group, contents)) in by_structure {
            if group.documents.len() < threshold || contents.len() < 2 {
                continue;
            }
            let corroboration = self.timing_corroboration(&group.timestamps);
            let evidence = json!({
                "structural_hash": structural_hash,
                "document_count": group.documents.len(),
                "distinct_content": contents.len(),
                "timing_clustering": corroboration,
            });
            let size = group.documents.len();
            output.patterns.push(self.build(
                snapshot,
                PatternType::TemplateFraud,
                group,
                size,
                threshold,
                corroboration,
                evidence,
            ));
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn taken_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap()
    }

    fn meta(id: &str, applicant: &str) -> DocumentMeta {
        DocumentMeta {
            document_id: id.to_string(),
            applicant_id: Some(applicant.to_string()),
            actor: Some("uploader".to_string()),
            created_at: Some(taken_at() - Duration::hours(2)),
            ..Default::default()
        }
    }

    fn detector() -> PatternDetector {
        PatternDetector::new(&ForensicPolicy::default())
    }

    #[test]
    fn duplicate_signatures_group_by_hash() {
        let mut snapshot = CorpusSnapshot::new(taken_at());
        for i in 0..3 {
            let mut m = meta(&format!("doc-{i}"), &format!("app-{i}"));
            m.signature_hash = Some("ABCDEF0123456789abcdef".to_string());
            snapshot.documents.push(m);
        }
        let mut broken = meta("doc-x", "app-x");
        broken.signature_hash = Some("not-a-hash".to_string());
        snapshot.documents.push(broken);

        let result = detector().detect(&snapshot);
        assert_eq!(result.total_patterns, 1);
        let p = &result.patterns[0];
        assert_eq!(p.pattern_type, PatternType::DuplicateSignature);
        assert_eq!(p.affected_documents, vec!["doc-0", "doc-1", "doc-2"]);
        assert_eq!(p.detected_at, taken_at());
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].rule, PatternType::DuplicateSignature);
    }

    #[test]
    fn ssn_reuse_needs_distinct_applicants() {
        let mut snapshot = CorpusSnapshot::new(taken_at());
        for (doc, applicant, ssn) in [
            ("d1", "alice", "123-45-6789"),
            ("d2", "alice", "999-99-6789"),
            ("d3", "bob", "6789"),
        ] {
            let mut m = meta(doc, applicant);
            m.ssn = Some(ssn.to_string());
            snapshot.documents.push(m);
        }
        assert_eq!(detector().detect(&snapshot).total_patterns, 0);

        let mut carol = meta("d4", "carol");
        carol.ssn = Some("000-00-6789".to_string());
        snapshot.documents.push(carol);
        let result = detector().detect(&snapshot);
        assert_eq!(result.total_patterns, 1);
        let p = &result.patterns[0];
        assert_eq!(p.pattern_type, PatternType::IdentityReuseSsn);
        assert_eq!(p.severity, Severity::Critical);
        assert_eq!(p.evidence["shared_identifier"], json!("***-**-6789"));
        assert_eq!(result.critical_patterns, vec![p.pattern_id.clone()]);
    }

    #[test]
    fn address_normalization_merges_spellings() {
        assert_eq!(
            normalize_address("12 North Main Street, Apartment 4"),
            Some("12 n main st apt 4".to_string())
        );
        let mut snapshot = CorpusSnapshot::new(taken_at());
        for (doc, applicant, address) in [
            ("d1", "a", "12 North Main Street Apt 4"),
            ("d2", "b", "12 N. Main St., Apt 4"),
            ("d3", "c", "12 n main st apartment 4"),
        ] {
            let mut m = meta(doc, applicant);
            m.address = Some(address.to_string());
            snapshot.documents.push(m);
        }
        let result = detector().detect(&snapshot);
        assert_eq!(result.total_patterns, 1);
        assert_eq!(result.patterns[0].pattern_type, PatternType::IdentityReuseAddress);
    }

    #[test]
    fn failing_rule_is_isolated() {
        let mut policy = ForensicPolicy::default();
        policy.patterns.template_min_documents = 0;
        let detector = PatternDetector::new(&policy);

        let mut snapshot = CorpusSnapshot::new(taken_at());
        for i in 0..3 {
            let mut m = meta(&format!("doc-{i}"), &format!("app-{i}"));
            m.signature_hash = Some("00112233445566778899aabbccddeeff".to_string());
            snapshot.documents.push(m);
        }
        let result = detector.detect(&snapshot);
        assert_eq!(result.total_patterns, 1);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.rule == PatternType::TemplateFraud && w.message.contains("invalid threshold")));
    }

    #[test]
    fn pattern_id_depends_only_on_type_and_documents() {
        let docs: BTreeSet<String> = ["b", "a"].iter().map(|s| s.to_string()).collect();
        let again: BTreeSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        assert_eq!(
            pattern_id(PatternType::TemplateFraud, &docs),
            pattern_id(PatternType::TemplateFraud, &again)
        );
        assert_ne!(
            pattern_id(PatternType::TemplateFraud, &docs),
            pattern_id(PatternType::DuplicateSignature, &docs)
        );
    }

    #[test]
    fn confidence_grows_with_group_size() {
        let d = detector();
        let small = d.confidence(3, 3, 1.0);
        let large = d.confidence(6, 3, 1.0);
        assert!((small - (0.7 * 0.6 + 0.3)).abs() < 1e-9);
        assert!((large - 1.0).abs() < 1e-9);
    }

    #[test]
    fn ssn_normalization() {
        assert_eq!(normalize_ssn("123-45-6789"), Ok("6789".to_string()));
        assert!(normalize_ssn("12").is_err());
        let hashed = "a".repeat(64);
        assert_eq!(normalize_ssn(&hashed), Ok(format!("h:{hashed}")));
    }
}
