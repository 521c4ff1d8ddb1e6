use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::errors::PolicyError;
use crate::risk::Severity;

/// 当前策略版本。任何阈值调整都应该提升版本号，报告里会记录它。
pub const POLICY_VERSION: &str = "2026.1";

/// 任何时间窗口的上限：一年
const MAX_WINDOW_SECS: i64 = 365 * 24 * 3600;

/// 法证策略 (Forensic Policy)
///
/// **职责**: 把所有启发式常量（相似度权重、风险分档、时间窗口、团伙阈值）
/// 收拢到一个带版本号的对象里，算法只读它，不再散落魔法数字。
///
/// 默认值即历史行为；可以从 JSON 文件加载覆盖，加载后会做一次校验。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForensicPolicy {
    pub version: String,
    pub fingerprint: FingerprintPolicy,
    pub similarity: SimilarityPolicy,
    pub diff: DiffPolicy,
    pub risk_levels: RiskCutPoints,
    pub timeline: TimelinePolicy,
    pub patterns: PatternPolicy,
}

impl Default for ForensicPolicy {
    fn default() -> Self {
        Self {
            version: POLICY_VERSION.to_string(),
            fingerprint: FingerprintPolicy::default(),
            similarity: SimilarityPolicy::default(),
            diff: DiffPolicy::default(),
            risk_levels: RiskCutPoints::default(),
            timeline: TimelinePolicy::default(),
            patterns: PatternPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintPolicy {
    /// 遍历的最大嵌套深度（根为 0）
    pub max_depth: usize,
    /// 单个文档允许的最大节点数
    pub max_nodes: usize,
    /// 语义层保留的高频词数量
    pub semantic_top_n: usize,
    pub min_token_len: usize,
}

impl Default for FingerprintPolicy {
    fn default() -> Self {
        Self {
            max_depth: 64,
            max_nodes: 200_000,
            semantic_top_n: 20,
            min_token_len: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityPolicy {
    pub structural_weight: f64,
    pub content_weight: f64,
    pub style_weight: f64,
    pub semantic_weight: f64,
    pub duplicate_threshold: f64,
    pub derivative_threshold: f64,
    /// 判定"衍生文档"时，结构相似度至少要比内容相似度高出这么多
    pub derivative_structural_margin: f64,
    /// 预筛选：两份文档字段数之比低于此值直接跳过
    pub prefilter_min_field_ratio: f64,
    /// 单层相似度达到此值记为"匹配"
    pub layer_match_threshold: f64,
    /// 单层相似度低于此值记为"分歧"
    pub layer_diverge_threshold: f64,
}

impl Default for SimilarityPolicy {
    fn default() -> Self {
        Self {
            structural_weight: 0.3,
            content_weight: 0.3,
            style_weight: 0.1,
            semantic_weight: 0.3,
            duplicate_threshold: 0.95,
            derivative_threshold: 0.70,
            derivative_structural_margin: 0.10,
            prefilter_min_field_ratio: 0.5,
            layer_match_threshold: 0.9,
            layer_diverge_threshold: 0.5,
        }
    }
}

/// 按字段类型划分的基础风险
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldRiskTable {
    pub financial: f64,
    pub signature: f64,
    pub identity: f64,
    pub date: f64,
    pub status: f64,
    pub other: f64,
}

impl Default for FieldRiskTable {
    fn default() -> Self {
        Self {
            financial: 0.8,
            signature: 0.75,
            identity: 0.7,
            date: 0.5,
            status: 0.45,
            other: 0.25,
        }
    }
}

/// 变化幅度阶梯：百分比变化超过 `above_pct` 时使用 `multiplier`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MagnitudeStep {
    pub above_pct: f64,
    pub multiplier: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffPolicy {
    pub base_risk: FieldRiskTable,
    /// 按 `above_pct` 从高到低排列
    pub magnitude_steps: Vec<MagnitudeStep>,
    pub max_multiplier: f64,
    pub round_number_unit: f64,
    pub round_number_bonus: f64,
    pub repeated_edit_bonus: f64,
    pub repeated_edit_count: usize,
    pub repeated_edit_window_minutes: i64,
    pub added_factor: f64,
    pub removed_factor: f64,
    /// 至少这么多字段独立达到 high，整体风险升一档
    pub escalation_field_count: usize,
}

impl Default for DiffPolicy {
    fn default() -> Self {
        Self {
            base_risk: FieldRiskTable::default(),
            magnitude_steps: vec![
                MagnitudeStep { above_pct: 500.0, multiplier: 2.0 },
                MagnitudeStep { above_pct: 100.0, multiplier: 1.5 },
                MagnitudeStep { above_pct: 50.0, multiplier: 1.25 },
            ],
            max_multiplier: 2.0,
            round_number_unit: 1000.0,
            round_number_bonus: 0.10,
            repeated_edit_bonus: 0.15,
            repeated_edit_count: 3,
            repeated_edit_window_minutes: 60,
            added_factor: 0.5,
            removed_factor: 0.6,
            escalation_field_count: 3,
        }
    }
}

/// 风险分档切点: `< low` 为 minimal, `< medium` 为 low, 依此类推
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskCutPoints {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for RiskCutPoints {
    fn default() -> Self {
        Self {
            low: 0.15,
            medium: 0.35,
            high: 0.6,
            critical: 0.85,
        }
    }
}

/// 时间线模式命中时给出的严重度和风险分
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PatternScore {
    pub severity: Severity,
    pub risk_score: f64,
}

impl PatternScore {
    const fn new(severity: Severity, risk_score: f64) -> Self {
        Self { severity, risk_score }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelinePolicy {
    pub rapid_modification_count: usize,
    pub rapid_modification_window_secs: i64,
    pub business_start_hour: u32,
    pub business_end_hour: u32,
    /// 计算"本地时间"时使用的 UTC 偏移（分钟）
    pub utc_offset_minutes: i32,
    pub weekend_is_off_hours: bool,
    pub failure_threshold: usize,
    pub failure_window_secs: i64,
    pub rapid_modification_score: PatternScore,
    pub off_hours_score: PatternScore,
    pub failure_score: PatternScore,
    /// 失败次数达到阈值两倍时改用
    pub failure_escalated_score: PatternScore,
    pub unsealed_modification_score: PatternScore,
}

impl Default for TimelinePolicy {
    fn default() -> Self {
        Self {
            rapid_modification_count: 3,
            rapid_modification_window_secs: 300,
            business_start_hour: 6,
            business_end_hour: 22,
            utc_offset_minutes: 0,
            weekend_is_off_hours: true,
            failure_threshold: 3,
            failure_window_secs: 900,
            rapid_modification_score: PatternScore::new(Severity::High, 0.75),
            off_hours_score: PatternScore::new(Severity::Medium, 0.5),
            failure_score: PatternScore::new(Severity::High, 0.8),
            failure_escalated_score: PatternScore::new(Severity::Critical, 0.95),
            unsealed_modification_score: PatternScore::new(Severity::High, 0.7),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternPolicy {
    pub duplicate_signature_min_documents: usize,
    pub amount_manipulation_min_changes: usize,
    pub amount_manipulation_window_hours: i64,
    pub amount_consistency_ratio: f64,
    pub ssn_reuse_min_applicants: usize,
    pub address_reuse_min_applicants: usize,
    pub coordinated_min_documents: usize,
    pub coordinated_window_secs: i64,
    pub template_min_documents: usize,
    pub timing_cluster_hours: i64,
    pub size_weight: f64,
    pub corroboration_weight: f64,
}

impl Default for PatternPolicy {
    fn default() -> Self {
        Self {
            duplicate_signature_min_documents: 3,
            amount_manipulation_min_changes: 5,
            amount_manipulation_window_hours: 24,
            amount_consistency_ratio: 0.6,
            ssn_reuse_min_applicants: 3,
            address_reuse_min_applicants: 3,
            coordinated_min_documents: 10,
            coordinated_window_secs: 600,
            template_min_documents: 20,
            timing_cluster_hours: 24,
            size_weight: 0.7,
            corroboration_weight: 0.3,
        }
    }
}

impl ForensicPolicy {
    /// 从 JSON 文件加载策略，缺省字段使用默认值
    pub fn load_from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("读取策略文件失败: {}", path.display()))?;
        let policy: ForensicPolicy = serde_json::from_str(&raw)
            .with_context(|| format!("策略文件不是合法 JSON: {}", path.display()))?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        let s = &self.similarity;
        let weights = [
            s.structural_weight,
            s.content_weight,
            s.style_weight,
            s.semantic_weight,
        ];
        let sum: f64 = weights.iter().sum();
        if weights.iter().any(|w| *w < 0.0) || (sum - 1.0).abs() > 1e-6 {
            return Err(PolicyError::InvalidWeights(sum));
        }
        if !(0.0..=1.0).contains(&s.duplicate_threshold)
            || s.derivative_threshold > s.duplicate_threshold
        {
            return Err(PolicyError::InvalidValue {
                field: "similarity.derivative_threshold",
                reason: "must not exceed duplicate_threshold".to_string(),
            });
        }

        if s.layer_diverge_threshold > s.layer_match_threshold {
            return Err(PolicyError::InvalidValue {
                field: "similarity.layer_diverge_threshold",
                reason: "must not exceed layer_match_threshold".to_string(),
            });
        }

        let r = &self.risk_levels;
        let cuts = [0.0, r.low, r.medium, r.high, r.critical, 1.0];
        if cuts.windows(2).any(|w| w[0] >= w[1]) {
            return Err(PolicyError::InvalidCutPoints);
        }

        if self.fingerprint.max_depth == 0 {
            return Err(PolicyError::InvalidValue {
                field: "fingerprint.max_depth",
                reason: "must be at least 1".to_string(),
            });
        }
        if self
            .diff
            .magnitude_steps
            .windows(2)
            .any(|w| w[0].above_pct <= w[1].above_pct)
        {
            return Err(PolicyError::InvalidValue {
                field: "diff.magnitude_steps",
                reason: "steps must be ordered by descending above_pct".to_string(),
            });
        }

        let t = &self.timeline;
        if t.business_start_hour >= t.business_end_hour || t.business_end_hour > 24 {
            return Err(PolicyError::InvalidValue {
                field: "timeline.business_end_hour",
                reason: format!(
                    "business window {}..{} is empty or out of range",
                    t.business_start_hour, t.business_end_hour
                ),
            });
        }

        let scores = [
            t.rapid_modification_score,
            t.off_hours_score,
            t.failure_score,
            t.failure_escalated_score,
            t.unsealed_modification_score,
        ];
        if scores.iter().any(|s| !(0.0..=1.0).contains(&s.risk_score)) {
            return Err(PolicyError::InvalidValue {
                field: "timeline",
                reason: "pattern risk scores must lie in 0..=1".to_string(),
            });
        }

        let p = &self.patterns;
        let windows = [
            ("timeline.rapid_modification_window_secs", t.rapid_modification_window_secs, MAX_WINDOW_SECS),
            ("timeline.failure_window_secs", t.failure_window_secs, MAX_WINDOW_SECS),
            ("patterns.coordinated_window_secs", p.coordinated_window_secs, MAX_WINDOW_SECS),
            ("patterns.amount_manipulation_window_hours", p.amount_manipulation_window_hours, MAX_WINDOW_SECS / 3600),
            ("patterns.timing_cluster_hours", p.timing_cluster_hours, MAX_WINDOW_SECS / 3600),
            ("diff.repeated_edit_window_minutes", self.diff.repeated_edit_window_minutes, MAX_WINDOW_SECS / 60),
        ];
        for (field, value, max) in windows {
            if value <= 0 || value > max {
                return Err(PolicyError::InvalidValue {
                    field,
                    reason: format!("window {value} must be in 1..={max}"),
                });
            }
        }

        if (p.size_weight + p.corroboration_weight - 1.0).abs() > 1e-6 {
            return Err(PolicyError::InvalidValue {
                field: "patterns.size_weight",
                reason: "size_weight + corroboration_weight must equal 1.0".to_string(),
            });
        }
        Ok(())
    }
}
