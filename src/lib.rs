//! 原镜 (Yuanjing) 文档取证分析核心
//!
//! 四个引擎互不依赖，都是输入的纯函数：
//! - [`fingerprint`]: 多层文档指纹与相似度
//! - [`diff`]: 字段级差异与风险评分
//! - [`timeline`]: 审计日志时间线重建
//! - [`patterns`]: 语料级跨文档欺诈模式
//!
//! [`orchestrator`] 把它们串成一次完整调查，[`api`] 暴露 HTTP 接口。

pub mod api;
pub mod batch;
pub mod config;
pub mod diff;
pub mod errors;
pub mod fingerprint;
pub mod orchestrator;
pub mod patterns;
pub mod policy;
pub mod providers;
pub mod risk;
pub mod signer;
pub mod timeline;
pub mod traverse;
mod window;

pub use diff::{DiffEngine, DiffResult};
pub use errors::{BatchError, DiffError, FingerprintError, PatternRuleError, PolicyError};
pub use fingerprint::{DocumentFingerprint, FingerprintEngine, SimilarityResult};
pub use orchestrator::{ForensicOrchestrator, ForensicReport, InvestigationOutcome};
pub use patterns::{CorpusSnapshot, PatternDetectionResult, PatternDetector};
pub use policy::ForensicPolicy;
pub use risk::{RiskLevel, Severity};
pub use timeline::{ForensicTimeline, TimelineBuilder};
