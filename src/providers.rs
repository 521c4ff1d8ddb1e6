use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::patterns::CorpusSnapshot;
use crate::timeline::{classify, EventCategory, RawEvent};

// ==========================================
// 协作方契约 (Collaborator Contracts)
// ==========================================
// 分析核心只消费这些 trait，不关心数据来自数据库、消息队列还是内存。

/// 文档的某一历史版本
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub version: String,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub changed_by: Option<String>,
    pub document: Value,
}

/// 当前及历史文档内容
pub trait DocumentSnapshotProvider: Send + Sync {
    fn current(&self, document_id: &str) -> Option<DocumentSnapshot>;

    /// 按 `captured_at` 升序返回
    fn history(&self, document_id: &str) -> Vec<DocumentSnapshot>;
}

/// 原始审计日志
pub trait AuditLogProvider: Send + Sync {
    fn events_for(&self, artifact_id: &str) -> Vec<RawEvent>;
}

/// 一次读一致的语料快照
pub trait CorpusSnapshotProvider: Send + Sync {
    fn snapshot(&self) -> CorpusSnapshot;
}

/// 编辑历史查询，用于"短时间内反复修改"加分
///
/// 返回 `None` 表示历史不可用，调用方不得加分。
pub trait EditHistory {
    fn edits_by(
        &self,
        document_id: &str,
        actor: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Option<usize>;
}

// ==========================================
// 内存实现
// ==========================================

/// 全部协作方的内存实现，用于服务端请求内聚合与测试
#[derive(Debug, Clone, Default)]
pub struct InMemoryCollaborators {
    documents: HashMap<String, Vec<DocumentSnapshot>>,
    events: HashMap<String, Vec<RawEvent>>,
    corpus: Option<CorpusSnapshot>,
}

impl InMemoryCollaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_version(&mut self, document_id: &str, snapshot: DocumentSnapshot) {
        let versions = self.documents.entry(document_id.to_string()).or_default();
        versions.push(snapshot);
        versions.sort_by(|a, b| a.captured_at.cmp(&b.captured_at));
    }

    pub fn add_events(&mut self, artifact_id: &str, events: impl IntoIterator<Item = RawEvent>) {
        self.events
            .entry(artifact_id.to_string())
            .or_default()
            .extend(events);
    }

    pub fn set_corpus(&mut self, corpus: CorpusSnapshot) {
        self.corpus = Some(corpus);
    }
}

impl DocumentSnapshotProvider for InMemoryCollaborators {
    fn current(&self, document_id: &str) -> Option<DocumentSnapshot> {
        self.documents.get(document_id)?.last().cloned()
    }

    fn history(&self, document_id: &str) -> Vec<DocumentSnapshot> {
        self.documents.get(document_id).cloned().unwrap_or_default()
    }
}

impl AuditLogProvider for InMemoryCollaborators {
    fn events_for(&self, artifact_id: &str) -> Vec<RawEvent> {
        self.events.get(artifact_id).cloned().unwrap_or_default()
    }
}

impl CorpusSnapshotProvider for InMemoryCollaborators {
    fn snapshot(&self) -> CorpusSnapshot {
        self.corpus
            .clone()
            .unwrap_or_else(|| CorpusSnapshot::new(Utc::now()))
    }
}

impl EditHistory for InMemoryCollaborators {
    /// 统计审计日志中该用户在区间内的修改类事件；没有任何日志时视为历史不可用
    fn edits_by(
        &self,
        document_id: &str,
        actor: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Option<usize> {
        let events = self.events.get(document_id)?;
        let count = events
            .iter()
            .filter(|e| e.user_id.as_deref() == Some(actor))
            .filter(|e| classify(&e.event_type).category == EventCategory::Modification)
            .filter_map(|e| e.timestamp.as_ref().and_then(|t| t.parse()))
            .filter(|at| *at >= from && *at <= to)
            .count();
        Some(count)
    }
}
