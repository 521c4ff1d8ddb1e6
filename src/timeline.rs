use std::collections::{BTreeMap, BTreeSet};

use chrono::{
    DateTime, Datelike, FixedOffset, NaiveDateTime, Offset, TimeZone, Timelike, Utc,
    Weekday,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::policy::{ForensicPolicy, TimelinePolicy};
use crate::risk::Severity;
use crate::window;

// ==========================================
// 1. 原始事件 (审计日志协作方提供)
// ==========================================

/// 原始时间戳：RFC 3339 / `YYYY-MM-DD HH:MM:SS` 字符串，或 unix 秒
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Unix(i64),
    Text(String),
}

impl RawTimestamp {
    pub fn parse(&self) -> Option<DateTime<Utc>> {
        match self {
            RawTimestamp::Unix(secs) => from_unix(*secs),
            RawTimestamp::Text(text) => {
                let text = text.trim();
                if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
                    return Some(dt.with_timezone(&Utc));
                }
                if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
                    return Some(naive.and_utc());
                }
                text.parse::<i64>().ok().and_then(from_unix)
            }
        }
    }
}

impl From<DateTime<Utc>> for RawTimestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        RawTimestamp::Text(dt.to_rfc3339())
    }
}

fn from_unix(value: i64) -> Option<DateTime<Utc>> {
    // 超过 1e11 视为毫秒
    if value.abs() > 100_000_000_000 {
        Utc.timestamp_millis_opt(value).single()
    } else {
        Utc.timestamp_opt(value, 0).single()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(default)]
    pub event_id: Option<String>,
    pub event_type: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub timestamp: Option<RawTimestamp>,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl RawEvent {
    pub fn new(event_type: &str, user_id: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            event_id: None,
            event_type: event_type.to_string(),
            user_id: Some(user_id.to_string()),
            ip_address: None,
            timestamp: Some(timestamp.into()),
            payload: Map::new(),
        }
    }
}

// ==========================================
// 2. 分类表
// ==========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Creation,
    Modification,
    Access,
    Verification,
    Blockchain,
    Signature,
    Deletion,
    Security,
    Anomaly,
    Unknown,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Creation => "creation",
            EventCategory::Modification => "modification",
            EventCategory::Access => "access",
            EventCategory::Verification => "verification",
            EventCategory::Blockchain => "blockchain",
            EventCategory::Signature => "signature",
            EventCategory::Deletion => "deletion",
            EventCategory::Security => "security",
            EventCategory::Anomaly => "anomaly",
            EventCategory::Unknown => "unknown",
        }
    }

    /// 人为操作类事件，参与非工作时间检查
    fn is_human_action(&self) -> bool {
        matches!(
            self,
            EventCategory::Modification
                | EventCategory::Access
                | EventCategory::Deletion
                | EventCategory::Signature
                | EventCategory::Security
        )
    }
}

/// 一条分类规则
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub category: EventCategory,
    pub severity: Severity,
    pub risk_score: f64,
    pub failure: bool,
}

const fn rule(category: EventCategory, severity: Severity, risk_score: f64, failure: bool) -> Classification {
    Classification {
        category,
        severity,
        risk_score,
        failure,
    }
}

/// 事件类型 -> 分类。未知类型一律 unknown/info，永不失败。
const CLASSIFICATION_TABLE: &[(&[&str], Classification)] = &[
    (
        &["document_uploaded", "document_created", "created", "uploaded"],
        rule(EventCategory::Creation, Severity::Info, 0.10, false),
    ),
    (
        &["document_modified", "document_updated", "field_changed", "modified", "updated"],
        rule(EventCategory::Modification, Severity::Medium, 0.50, false),
    ),
    (
        &["document_viewed", "viewed", "accessed", "document_accessed"],
        rule(EventCategory::Access, Severity::Info, 0.10, false),
    ),
    (
        &["document_downloaded", "downloaded", "exported"],
        rule(EventCategory::Access, Severity::Low, 0.30, false),
    ),
    (
        &["verification_passed", "verified"],
        rule(EventCategory::Verification, Severity::Info, 0.05, false),
    ),
    (
        &["verification_failed", "hash_mismatch"],
        rule(EventCategory::Verification, Severity::High, 0.85, true),
    ),
    (
        &["blockchain_sealed", "ledger_sealed", "sealed", "blockchain_anchored"],
        rule(EventCategory::Blockchain, Severity::Info, 0.05, false),
    ),
    (
        &["signature_added", "signed"],
        rule(EventCategory::Signature, Severity::Low, 0.20, false),
    ),
    (
        &["signature_invalid"],
        rule(EventCategory::Signature, Severity::High, 0.80, true),
    ),
    (
        &["signature_removed"],
        rule(EventCategory::Signature, Severity::High, 0.80, false),
    ),
    (
        &["document_deleted", "deleted"],
        rule(EventCategory::Deletion, Severity::High, 0.75, false),
    ),
    (
        &["login_failed", "access_denied"],
        rule(EventCategory::Security, Severity::Medium, 0.55, true),
    ),
    (
        &["permission_changed", "role_changed"],
        rule(EventCategory::Security, Severity::High, 0.70, false),
    ),
    (
        &["anomaly_detected", "fraud_flagged"],
        rule(EventCategory::Anomaly, Severity::Critical, 0.95, false),
    ),
];

const UNKNOWN: Classification = rule(EventCategory::Unknown, Severity::Info, 0.10, false);

pub fn normalize_event_type(event_type: &str) -> String {
    event_type
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == '-' || c.is_whitespace() { '_' } else { c })
        .collect()
}

pub fn classify(event_type: &str) -> Classification {
    let normalized = normalize_event_type(event_type);
    CLASSIFICATION_TABLE
        .iter()
        .find(|(names, _)| names.contains(&normalized.as_str()))
        .map(|(_, c)| *c)
        .unwrap_or(UNKNOWN)
}

// ==========================================
// 3. 时间线输出
// ==========================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub event_id: String,
    pub artifact_id: String,
    pub event_type: String,
    pub category: EventCategory,
    pub severity: Severity,
    pub risk_score: f64,
    pub user_id: Option<String>,
    pub ip_address: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub details: Map<String, Value>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelinePatternKind {
    RapidModifications,
    OffHoursAccess,
    RepeatedFailures,
    ModificationBeforeSeal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspiciousPattern {
    pub kind: TimelinePatternKind,
    pub description: String,
    pub severity: Severity,
    pub risk_score: f64,
    pub affected_events: Vec<String>,
    pub recommendation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimelineStatistics {
    pub total_events: usize,
    pub unique_users: usize,
    pub unique_ips: usize,
    pub high_risk_events: usize,
    pub by_category: BTreeMap<EventCategory, usize>,
    pub date_range: Option<DateRange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    /// 事件与模式中出现的最高严重度
    pub risk_level: Severity,
    pub pattern_count: usize,
    pub requires_investigation: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForensicTimeline {
    pub artifact_id: String,
    pub events: Vec<TimelineEvent>,
    pub suspicious_patterns: Vec<SuspiciousPattern>,
    pub statistics: TimelineStatistics,
    pub risk_assessment: RiskAssessment,
    /// 被丢弃或降级处理的原始记录说明
    pub warnings: Vec<String>,
}

impl ForensicTimeline {
    pub fn events_in_category(&self, category: EventCategory) -> impl Iterator<Item = &TimelineEvent> {
        self.events.iter().filter(move |e| e.category == category)
    }

    /// 闭区间 [start, end]
    pub fn events_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> impl Iterator<Item = &TimelineEvent> {
        self.events
            .iter()
            .filter(move |e| e.timestamp >= start && e.timestamp <= end)
    }
}

// ==========================================
// 4. 构建器
// ==========================================

/// 时间线构建器 (Timeline Builder)
///
/// **职责**: 把单个工件的无序审计事件整理成按时间排序、已分类的时间线，
/// 并在有序序列上跑本地异常规则。
///
/// 残缺的遥测数据也要产出可用（偏保守）的时间线：未知类型归为 unknown/info，
/// 无法解析时间戳的记录丢弃并写入 `warnings`，不会整体失败。
#[derive(Debug, Clone)]
pub struct TimelineBuilder {
    policy: TimelinePolicy,
}

impl TimelineBuilder {
    pub fn new(policy: &ForensicPolicy) -> Self {
        Self {
            policy: policy.timeline.clone(),
        }
    }

    pub fn build(&self, artifact_id: &str, raw_events: Vec<RawEvent>) -> ForensicTimeline {
        let mut warnings = Vec::new();
        let mut events = Vec::with_capacity(raw_events.len());

        for (index, raw) in raw_events.into_iter().enumerate() {
            let Some(timestamp) = raw.timestamp.as_ref().and_then(RawTimestamp::parse) else {
                warnings.push(format!(
                    "event #{index} ({}) dropped: missing or unparseable timestamp",
                    raw.event_type
                ));
                continue;
            };
            events.push(self.classify_event(artifact_id, index, raw, timestamp));
        }

        // 稳定排序：同一时刻的事件保持输入顺序
        events.sort_by_key(|e| e.timestamp);

        let mut patterns = Vec::new();
        patterns.extend(self.rapid_modifications(&events));
        patterns.extend(self.off_hours_access(&mut events));
        patterns.extend(self.repeated_failures(&events));
        patterns.extend(self.modification_before_seal(&mut events));

        let statistics = statistics(&events);
        let risk_level = events
            .iter()
            .map(|e| e.severity)
            .chain(patterns.iter().map(|p| p.severity))
            .max()
            .unwrap_or(Severity::Info);
        let requires_investigation = patterns.iter().any(|p| p.severity == Severity::Critical)
            || risk_level >= Severity::High;

        if !warnings.is_empty() {
            warn!(
                artifact_id,
                dropped = warnings.len(),
                "timeline built from partial telemetry"
            );
        }
        debug!(
            artifact_id,
            events = events.len(),
            patterns = patterns.len(),
            risk = risk_level.as_str(),
            "timeline built"
        );

        ForensicTimeline {
            artifact_id: artifact_id.to_string(),
            risk_assessment: RiskAssessment {
                risk_level,
                pattern_count: patterns.len(),
                requires_investigation,
            },
            events,
            suspicious_patterns: patterns,
            statistics,
            warnings,
        }
    }

    fn classify_event(
        &self,
        artifact_id: &str,
        index: usize,
        raw: RawEvent,
        timestamp: DateTime<Utc>,
    ) -> TimelineEvent {
        let event_type = normalize_event_type(&raw.event_type);
        let class = classify(&event_type);

        let mut tags = vec![class.category.as_str().to_string()];
        if class.failure {
            tags.push("failure".to_string());
        }
        if class.category == EventCategory::Unknown {
            tags.push("unclassified".to_string());
        }

        let actor = raw.user_id.as_deref().unwrap_or("unknown actor");
        let description = match raw.payload.get("field").and_then(Value::as_str) {
            Some(field) => format!("{event_type} by {actor} on field {field}"),
            None => format!("{event_type} by {actor}"),
        };

        TimelineEvent {
            event_id: raw
                .event_id
                .unwrap_or_else(|| format!("{artifact_id}-{index}")),
            artifact_id: artifact_id.to_string(),
            event_type,
            category: class.category,
            severity: class.severity,
            risk_score: class.risk_score,
            user_id: raw.user_id,
            ip_address: raw.ip_address,
            timestamp,
            description,
            details: raw.payload,
            tags,
        }
    }

    fn rapid_modifications(&self, events: &[TimelineEvent]) -> Vec<SuspiciousPattern> {
        let mods: Vec<&TimelineEvent> = events
            .iter()
            .filter(|e| e.category == EventCategory::Modification)
            .collect();
        let span = window::span(self.policy.rapid_modification_window_secs, 1);
        window::clusters(&mods, self.policy.rapid_modification_count, span, |e| e.timestamp)
            .into_iter()
            .map(|burst| SuspiciousPattern {
                kind: TimelinePatternKind::RapidModifications,
                description: format!(
                    "{} modifications within {} minutes",
                    burst.len(),
                    self.policy.rapid_modification_window_secs / 60
                ),
                severity: self.policy.rapid_modification_score.severity,
                risk_score: self.policy.rapid_modification_score.risk_score,
                affected_events: burst.iter().map(|e| e.event_id.clone()).collect(),
                recommendation: "Verify each modification against the approved change log".to_string(),
            })
            .collect()
    }

    fn is_off_hours(&self, timestamp: DateTime<Utc>) -> bool {
        let offset = FixedOffset::east_opt(self.policy.utc_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix());
        let local = timestamp.with_timezone(&offset);
        let hour = local.hour();
        let weekend = matches!(local.weekday(), Weekday::Sat | Weekday::Sun);
        hour < self.policy.business_start_hour
            || hour >= self.policy.business_end_hour
            || (self.policy.weekend_is_off_hours && weekend)
    }

    fn off_hours_access(&self, events: &mut [TimelineEvent]) -> Option<SuspiciousPattern> {
        let mut affected = Vec::new();
        for event in events.iter_mut() {
            if event.category.is_human_action() && self.is_off_hours(event.timestamp) {
                event.tags.push("off_hours".to_string());
                affected.push(event.event_id.clone());
            }
        }
        if affected.is_empty() {
            return None;
        }
        Some(SuspiciousPattern {
            kind: TimelinePatternKind::OffHoursAccess,
            description: format!(
                "{} events outside business hours ({:02}:00-{:02}:00{})",
                affected.len(),
                self.policy.business_start_hour,
                self.policy.business_end_hour,
                if self.policy.weekend_is_off_hours { ", weekdays" } else { "" }
            ),
            severity: self.policy.off_hours_score.severity,
            risk_score: self.policy.off_hours_score.risk_score,
            affected_events: affected,
            recommendation: "Confirm the actors were authorized to work outside business hours"
                .to_string(),
        })
    }

    fn repeated_failures(&self, events: &[TimelineEvent]) -> Vec<SuspiciousPattern> {
        let failures: Vec<&TimelineEvent> = events
            .iter()
            .filter(|e| e.tags.iter().any(|t| t == "failure"))
            .collect();
        let threshold = self.policy.failure_threshold;
        let span = window::span(self.policy.failure_window_secs, 1);
        window::clusters(&failures, threshold, span, |e| e.timestamp)
            .into_iter()
            .map(|burst| {
                let score = if burst.len() >= threshold.saturating_mul(2) {
                    self.policy.failure_escalated_score
                } else {
                    self.policy.failure_score
                };
                SuspiciousPattern {
                    kind: TimelinePatternKind::RepeatedFailures,
                    description: format!(
                        "{} failed verification/access attempts within {} minutes",
                        burst.len(),
                        self.policy.failure_window_secs / 60
                    ),
                    severity: score.severity,
                    risk_score: score.risk_score,
                    affected_events: burst.iter().map(|e| e.event_id.clone()).collect(),
                    recommendation: "Lock the artifact and review the failing actors' credentials"
                        .to_string(),
                }
            })
            .collect()
    }

    fn modification_before_seal(&self, events: &mut [TimelineEvent]) -> Option<SuspiciousPattern> {
        let mut sealed = false;
        let mut affected = Vec::new();
        for event in events.iter_mut() {
            match event.category {
                EventCategory::Blockchain => sealed = true,
                EventCategory::Modification if !sealed => {
                    event.tags.push("unsealed_modification".to_string());
                    affected.push(event.event_id.clone());
                }
                _ => {}
            }
        }
        if affected.is_empty() {
            return None;
        }
        Some(SuspiciousPattern {
            kind: TimelinePatternKind::ModificationBeforeSeal,
            description: format!(
                "{} modifications recorded before any ledger seal",
                affected.len()
            ),
            severity: self.policy.unsealed_modification_score.severity,
            risk_score: self.policy.unsealed_modification_score.risk_score,
            affected_events: affected,
            recommendation: "Re-seal the artifact and reconcile pre-seal edits with the original upload"
                .to_string(),
        })
    }
}

fn statistics(events: &[TimelineEvent]) -> TimelineStatistics {
    let unique_users: BTreeSet<&str> = events.iter().filter_map(|e| e.user_id.as_deref()).collect();
    let unique_ips: BTreeSet<&str> = events
        .iter()
        .filter_map(|e| e.ip_address.as_deref())
        .collect();
    let mut by_category = BTreeMap::new();
    for event in events {
        *by_category.entry(event.category).or_insert(0) += 1;
    }
    let date_range = match (events.first(), events.last()) {
        (Some(first), Some(last)) => Some(DateRange {
            start: first.timestamp,
            end: last.timestamp,
        }),
        _ => None,
    };
    TimelineStatistics {
        total_events: events.len(),
        unique_users: unique_users.len(),
        unique_ips: unique_ips.len(),
        high_risk_events: events
            .iter()
            .filter(|e| e.severity >= Severity::High || e.risk_score >= 0.7)
            .count(),
        by_category,
        date_range,
    }
}
