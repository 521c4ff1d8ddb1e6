use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::errors::DiffError;
use crate::policy::{DiffPolicy, ForensicPolicy, RiskCutPoints};
use crate::providers::EditHistory;
use crate::risk::RiskLevel;
use crate::traverse::{self, kind_name, TraversalLimits};
use crate::window;

/// 根级替换记录使用的路径
pub const ROOT_PATH: &str = "$";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
}

/// 字段类型，决定基础风险
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Financial,
    Signature,
    Identity,
    Date,
    Status,
    Other,
}

const FINANCIAL_MARKERS: &[&str] = &[
    "amount", "loan", "principal", "rate", "interest", "balance", "payment", "income", "salary",
    "price", "value", "fee", "apr",
];
const SIGNATURE_MARKERS: &[&str] = &["signature", "signed_by", "signer"];
const IDENTITY_MARKERS: &[&str] = &[
    "ssn", "tax_id", "tin", "dob", "birth", "name", "address", "account", "routing", "phone",
    "email",
];
const DATE_MARKERS: &[&str] = &["date", "maturity", "term", "deadline"];
const STATUS_MARKERS: &[&str] = &["status", "approved", "decision", "state"];

impl FieldType {
    /// 按路径最后一段（去掉数组下标，小写）做子串匹配
    pub fn classify(field_path: &str) -> Self {
        let last = field_path
            .rsplit('.')
            .next()
            .unwrap_or(field_path)
            .split('[')
            .next()
            .unwrap_or_default()
            .to_lowercase();
        let has = |markers: &[&str]| markers.iter().any(|m| last.contains(m));
        // 顺序有意义：signature 里的 "name" 之类不应被当成身份字段
        if has(SIGNATURE_MARKERS) {
            FieldType::Signature
        } else if has(FINANCIAL_MARKERS) {
            FieldType::Financial
        } else if has(IDENTITY_MARKERS) {
            FieldType::Identity
        } else if has(DATE_MARKERS) {
            FieldType::Date
        } else if has(STATUS_MARKERS) {
            FieldType::Status
        } else {
            FieldType::Other
        }
    }

    pub fn base_risk(&self, policy: &DiffPolicy) -> f64 {
        let table = &policy.base_risk;
        match self {
            FieldType::Financial => table.financial,
            FieldType::Signature => table.signature,
            FieldType::Identity => table.identity,
            FieldType::Date => table.date,
            FieldType::Status => table.status,
            FieldType::Other => table.other,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            FieldType::Financial => "financial",
            FieldType::Signature => "signature",
            FieldType::Identity => "identity",
            FieldType::Date => "date",
            FieldType::Status => "status",
            FieldType::Other => "general",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChange {
    pub field_path: String,
    pub change_type: ChangeType,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub reason: String,
    pub changed_by: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl DocumentChange {
    /// 数值型修改的百分比变化（旧值为 0 时为无穷大）
    pub fn pct_change(&self) -> Option<f64> {
        let old = self.old_value.as_ref().and_then(numeric_value)?;
        let new = self.new_value.as_ref().and_then(numeric_value)?;
        Some(pct_change(old, new))
    }

    pub fn numeric_delta(&self) -> Option<f64> {
        let old = self.old_value.as_ref().and_then(numeric_value)?;
        let new = self.new_value.as_ref().and_then(numeric_value)?;
        Some(new - old)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffResult {
    pub document_a: String,
    pub document_b: String,
    pub changes: Vec<DocumentChange>,
    pub total_changes: usize,
    pub fields_compared: usize,
    pub overall_similarity: f64,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub suspicious_patterns: Vec<String>,
    pub recommendation: String,
}

/// 本次比较的附加上下文：谁改的、什么时候改的、以及可选的编辑历史
#[derive(Default, Clone, Copy)]
pub struct DiffContext<'h> {
    pub changed_by: Option<&'h str>,
    pub timestamp: Option<DateTime<Utc>>,
    pub history: Option<&'h dyn EditHistory>,
}

/// 数值或形如数值的字符串（"$1,250.00"、"12%"）
pub fn numeric_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned: String = s
                .trim()
                .trim_start_matches(['$', '€', '£', '¥'])
                .trim_end_matches('%')
                .chars()
                .filter(|c| *c != ',' && !c.is_whitespace())
                .collect();
            if cleaned.is_empty() {
                return None;
            }
            cleaned.parse::<f64>().ok()
        }
        _ => None,
    }
}

pub fn pct_change(old: f64, new: f64) -> f64 {
    if old == 0.0 {
        if new == 0.0 {
            0.0
        } else {
            f64::INFINITY
        }
    } else {
        (new - old).abs() / old.abs() * 100.0
    }
}

/// 差异引擎 (Diff Engine)
///
/// **职责**: 比较同一工件的两个快照，逐字段给出风险分。
///
/// 风险公式: `min(1, base_risk(字段类型) × 幅度倍数(变化百分比) + 模式加分)`
#[derive(Debug, Clone)]
pub struct DiffEngine {
    policy: DiffPolicy,
    cuts: RiskCutPoints,
    limits: TraversalLimits,
}

impl DiffEngine {
    pub fn new(policy: &ForensicPolicy) -> Self {
        Self {
            policy: policy.diff.clone(),
            cuts: policy.risk_levels.clone(),
            limits: TraversalLimits {
                max_depth: policy.fingerprint.max_depth,
                max_nodes: policy.fingerprint.max_nodes,
            },
        }
    }

    pub fn diff(
        &self,
        document_a: &str,
        old: &Value,
        document_b: &str,
        new: &Value,
    ) -> Result<DiffResult, DiffError> {
        self.diff_with(document_a, old, document_b, new, DiffContext::default())
    }

    pub fn diff_with(
        &self,
        document_a: &str,
        old: &Value,
        document_b: &str,
        new: &Value,
        ctx: DiffContext<'_>,
    ) -> Result<DiffResult, DiffError> {
        let (changes, fields_compared) = match (old.is_object(), new.is_object()) {
            (true, true) => self.diff_objects(document_b, old, new, ctx)?,
            (false, false) => (self.diff_roots(old, new, ctx), 1),
            _ => {
                return Err(DiffError::IncomparableRoots {
                    left: kind_name(old),
                    right: kind_name(new),
                })
            }
        };

        let result = self.summarize(document_a, document_b, changes, fields_compared, ctx);
        debug!(
            document_a,
            document_b,
            total_changes = result.total_changes,
            risk = result.risk_level.as_str(),
            "diff computed"
        );
        Ok(result)
    }

    fn diff_objects(
        &self,
        artifact_id: &str,
        old: &Value,
        new: &Value,
        ctx: DiffContext<'_>,
    ) -> Result<(Vec<DocumentChange>, usize), DiffError> {
        let old_flat = traverse::flatten(old, self.limits)?;
        let new_flat = traverse::flatten(new, self.limits)?;

        let old_paths: BTreeSet<&String> = old_flat.keys().collect();
        let new_paths: BTreeSet<&String> = new_flat.keys().collect();
        let fields_compared = old_paths.union(&new_paths).count();

        let mut changes = Vec::new();
        for path in old_paths.union(&new_paths) {
            match (old_flat.get(*path), new_flat.get(*path)) {
                (Some(o), Some(n)) if o != n => {
                    changes.push(self.modified(artifact_id, path, o, n, ctx));
                }
                (Some(o), None) => changes.push(self.added_or_removed(path, ChangeType::Removed, o, ctx)),
                (None, Some(n)) => changes.push(self.added_or_removed(path, ChangeType::Added, n, ctx)),
                _ => {}
            }
        }
        Ok((changes, fields_compared))
    }

    /// 两个根都不是对象：退化为一条根级替换记录
    fn diff_roots(&self, old: &Value, new: &Value, ctx: DiffContext<'_>) -> Vec<DocumentChange> {
        if old == new {
            return Vec::new();
        }
        let risk_score = self.cuts.high;
        vec![DocumentChange {
            field_path: ROOT_PATH.to_string(),
            change_type: ChangeType::Modified,
            old_value: Some(old.clone()),
            new_value: Some(new.clone()),
            risk_score,
            risk_level: RiskLevel::from_score(risk_score, &self.cuts),
            reason: format!(
                "Root-level replacement ({} -> {})",
                kind_name(old),
                kind_name(new)
            ),
            changed_by: ctx.changed_by.map(str::to_string),
            timestamp: ctx.timestamp,
        }]
    }

    fn magnitude_multiplier(&self, pct: f64) -> f64 {
        self.policy
            .magnitude_steps
            .iter()
            .find(|step| pct > step.above_pct)
            .map(|step| step.multiplier)
            .unwrap_or(1.0)
            .min(self.policy.max_multiplier)
    }

    fn is_round_delta(&self, delta: f64) -> bool {
        let unit = self.policy.round_number_unit;
        let delta = delta.abs();
        unit > 0.0 && delta >= unit && (delta % unit).abs() < 1e-9
    }

    fn repeated_edits(&self, artifact_id: &str, ctx: DiffContext<'_>) -> Option<usize> {
        let history = ctx.history?;
        let actor = ctx.changed_by?;
        let at = ctx.timestamp?;
        let window = window::span(self.policy.repeated_edit_window_minutes, 60);
        history
            .edits_by(artifact_id, actor, at.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC), at)
            .filter(|count| *count >= self.policy.repeated_edit_count)
    }

    fn modified(
        &self,
        artifact_id: &str,
        path: &str,
        old: &Value,
        new: &Value,
        ctx: DiffContext<'_>,
    ) -> DocumentChange {
        let field_type = FieldType::classify(path);
        let base = field_type.base_risk(&self.policy);

        let mut multiplier = 1.0;
        let mut bonus = 0.0;
        let mut reason = format!("{} field modified", field_type.as_str());

        if let (Some(o), Some(n)) = (numeric_value(old), numeric_value(new)) {
            let pct = pct_change(o, n);
            multiplier = self.magnitude_multiplier(pct);
            let direction = if n >= o { "increased" } else { "decreased" };
            reason = if pct.is_finite() {
                format!("{} field {direction} by {pct:.1}%", field_type.as_str())
            } else {
                format!("{} field {direction} from zero", field_type.as_str())
            };
            if self.is_round_delta(n - o) {
                bonus += self.policy.round_number_bonus;
                reason.push_str("; round-number delta");
            }
        }
        if let Some(count) = self.repeated_edits(artifact_id, ctx) {
            bonus += self.policy.repeated_edit_bonus;
            reason.push_str(&format!("; {count} edits by same actor in window"));
        }

        let risk_score = (base * multiplier + bonus).min(1.0);
        DocumentChange {
            field_path: path.to_string(),
            change_type: ChangeType::Modified,
            old_value: Some(old.clone()),
            new_value: Some(new.clone()),
            risk_score,
            risk_level: RiskLevel::from_score(risk_score, &self.cuts),
            reason,
            changed_by: ctx.changed_by.map(str::to_string),
            timestamp: ctx.timestamp,
        }
    }

    fn added_or_removed(
        &self,
        path: &str,
        change_type: ChangeType,
        value: &Value,
        ctx: DiffContext<'_>,
    ) -> DocumentChange {
        let field_type = FieldType::classify(path);
        let base = field_type.base_risk(&self.policy);
        let (factor, verb, old_value, new_value) = match change_type {
            ChangeType::Removed => (self.policy.removed_factor, "removed", Some(value.clone()), None),
            _ => (self.policy.added_factor, "added", None, Some(value.clone())),
        };
        let risk_score = (base * factor).min(1.0);
        DocumentChange {
            field_path: path.to_string(),
            change_type,
            old_value,
            new_value,
            risk_score,
            risk_level: RiskLevel::from_score(risk_score, &self.cuts),
            reason: format!("{} field {verb}", field_type.as_str()),
            changed_by: ctx.changed_by.map(str::to_string),
            timestamp: ctx.timestamp,
        }
    }

    fn summarize(
        &self,
        document_a: &str,
        document_b: &str,
        changes: Vec<DocumentChange>,
        fields_compared: usize,
        ctx: DiffContext<'_>,
    ) -> DiffResult {
        let total_changes = changes.len();
        let overall_similarity = if fields_compared == 0 {
            1.0
        } else {
            1.0 - total_changes as f64 / fields_compared as f64
        };

        let risk_score = changes.iter().map(|c| c.risk_score).fold(0.0, f64::max);
        let high_count = changes
            .iter()
            .filter(|c| c.risk_level >= RiskLevel::High)
            .count();
        let mut risk_level = RiskLevel::from_score(risk_score, &self.cuts);
        if high_count >= self.policy.escalation_field_count {
            risk_level = risk_level.bump();
        }

        let suspicious_patterns = self.suspicious_patterns(&changes, high_count, ctx);
        let recommendation = recommendation_for(risk_level).to_string();

        DiffResult {
            document_a: document_a.to_string(),
            document_b: document_b.to_string(),
            changes,
            total_changes,
            fields_compared,
            overall_similarity,
            risk_score,
            risk_level,
            suspicious_patterns,
            recommendation,
        }
    }

    fn suspicious_patterns(
        &self,
        changes: &[DocumentChange],
        high_count: usize,
        ctx: DiffContext<'_>,
    ) -> Vec<String> {
        let mut patterns: Vec<String> = Vec::new();
        let mut push = |p: String| {
            if !patterns.contains(&p) {
                patterns.push(p);
            }
        };

        for change in changes {
            let field_type = FieldType::classify(&change.field_path);
            match change.change_type {
                ChangeType::Modified => {
                    if field_type == FieldType::Financial {
                        if let (Some(pct), Some(delta)) = (change.pct_change(), change.numeric_delta()) {
                            let direction = if delta >= 0.0 { "increased" } else { "decreased" };
                            if pct.is_finite() {
                                push(format!("Amount {direction} by {pct:.0}%"));
                            } else {
                                push(format!("Amount {direction} from zero on {}", change.field_path));
                            }
                        }
                    }
                    if change.numeric_delta().is_some_and(|d| self.is_round_delta(d)) {
                        push(format!("Round number modification on {}", change.field_path));
                    }
                    match field_type {
                        FieldType::Identity => {
                            push(format!("Identity field changed: {}", change.field_path))
                        }
                        FieldType::Signature => {
                            push(format!("Signature field changed: {}", change.field_path))
                        }
                        _ => {}
                    }
                }
                ChangeType::Removed => {
                    if matches!(
                        field_type,
                        FieldType::Financial | FieldType::Identity | FieldType::Signature
                    ) {
                        push(format!("Field removed: {}", change.field_path));
                    }
                }
                ChangeType::Added => {}
            }
        }

        if let (Some(actor), true) = (
            ctx.changed_by,
            changes.iter().any(|c| c.reason.contains("edits by same actor")),
        ) {
            push(format!(
                "Repeated edits by {actor} within {} minutes",
                self.policy.repeated_edit_window_minutes
            ));
        }
        if high_count >= self.policy.escalation_field_count {
            push(format!("Multiple high-risk changes ({high_count} fields)"));
        }
        patterns
    }
}

fn recommendation_for(level: RiskLevel) -> &'static str {
    match level {
        RiskLevel::Critical => "Freeze artifact and escalate to fraud investigation",
        RiskLevel::High => "Manual review required before processing",
        RiskLevel::Medium => "Review changes with document owner",
        RiskLevel::Low => "Log and monitor",
        RiskLevel::Minimal => "No action required",
    }
}
