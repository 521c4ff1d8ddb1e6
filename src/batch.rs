use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::errors::BatchError;
use crate::fingerprint::{DocumentFingerprint, FingerprintEngine};

// ==========================================
// 1. 检查点存储 (Checkpoint Store)
// ==========================================

/// 一个已完成文档的检查点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub document_id: String,
    /// 输入文档的 BLAKE3 摘要；文档变了就不能复用旧结果
    pub input_digest: String,
    pub fingerprint: DocumentFingerprint,
}

pub fn input_digest(document: &Value) -> String {
    // serde_json::Value 的对象键默认有序，序列化结果稳定
    blake3::hash(document.to_string().as_bytes()).to_hex().to_string()
}

pub trait CheckpointStore: Send + Sync {
    fn load(&self, job_id: &str, document_id: &str) -> Result<Option<CheckpointRecord>, BatchError>;

    /// 返回前必须已持久化
    fn record(&self, job_id: &str, record: &CheckpointRecord) -> Result<(), BatchError>;

    fn completed(&self, job_id: &str) -> Result<Vec<CheckpointRecord>, BatchError>;

    fn clear(&self, job_id: &str) -> Result<(), BatchError>;
}

#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    jobs: Mutex<HashMap<String, BTreeMap<String, CheckpointRecord>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, BTreeMap<String, CheckpointRecord>>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self, job_id: &str, document_id: &str) -> Result<Option<CheckpointRecord>, BatchError> {
        Ok(self
            .jobs()
            .get(job_id)
            .and_then(|records| records.get(document_id))
            .cloned())
    }

    fn record(&self, job_id: &str, record: &CheckpointRecord) -> Result<(), BatchError> {
        self.jobs()
            .entry(job_id.to_string())
            .or_default()
            .insert(record.document_id.clone(), record.clone());
        Ok(())
    }

    fn completed(&self, job_id: &str) -> Result<Vec<CheckpointRecord>, BatchError> {
        Ok(self
            .jobs()
            .get(job_id)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default())
    }

    fn clear(&self, job_id: &str) -> Result<(), BatchError> {
        self.jobs().remove(job_id);
        Ok(())
    }
}

/// 基于 sled 的持久化检查点：每个任务一棵树，值为 JSON
pub struct SledCheckpointStore {
    db: sled::Db,
}

impl SledCheckpointStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, BatchError> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }

    fn tree(&self, job_id: &str) -> Result<sled::Tree, BatchError> {
        Ok(self.db.open_tree(format!("batch:{job_id}"))?)
    }
}

impl CheckpointStore for SledCheckpointStore {
    fn load(&self, job_id: &str, document_id: &str) -> Result<Option<CheckpointRecord>, BatchError> {
        match self.tree(job_id)?.get(document_id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn record(&self, job_id: &str, record: &CheckpointRecord) -> Result<(), BatchError> {
        let tree = self.tree(job_id)?;
        tree.insert(record.document_id.as_bytes(), serde_json::to_vec(record)?)?;
        tree.flush()?;
        Ok(())
    }

    fn completed(&self, job_id: &str) -> Result<Vec<CheckpointRecord>, BatchError> {
        self.tree(job_id)?
            .iter()
            .values()
            .map(|value| Ok(serde_json::from_slice(&value?)?))
            .collect()
    }

    fn clear(&self, job_id: &str) -> Result<(), BatchError> {
        self.db.drop_tree(format!("batch:{job_id}"))?;
        Ok(())
    }
}

// ==========================================
// 2. 取消标志
// ==========================================

/// 只在两个文档之间检查，单个文档永远不会被中途打断
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ==========================================
// 3. 批处理任务 (Batch Job)
// ==========================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchDocument {
    pub document_id: String,
    pub document: Value,
}

#[derive(Debug)]
pub struct BatchOutcome {
    pub job_id: String,
    /// 按输入顺序，包含从检查点恢复的结果
    pub fingerprints: Vec<DocumentFingerprint>,
    pub processed: usize,
    pub resumed: usize,
    pub failures: Vec<BatchError>,
    pub cancelled: bool,
}

/// 可断点续跑的批量指纹任务
///
/// 每完成一个文档就写一次检查点，再开始下一个。
/// 被取消或进程退出后，用同一个 `job_id` 重跑会跳过已记录的文档。
pub struct BatchJob<'a, S: CheckpointStore + ?Sized> {
    job_id: String,
    engine: &'a FingerprintEngine,
    store: &'a S,
    cancel: CancellationFlag,
}

impl<'a, S: CheckpointStore + ?Sized> BatchJob<'a, S> {
    pub fn new(job_id: &str, engine: &'a FingerprintEngine, store: &'a S) -> Self {
        Self {
            job_id: job_id.to_string(),
            engine,
            store,
            cancel: CancellationFlag::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> CancellationFlag {
        self.cancel.clone()
    }

    /// 存储层错误直接中止任务；单个文档的指纹失败只记入 `failures`
    pub fn run(&self, documents: &[BatchDocument]) -> Result<BatchOutcome, BatchError> {
        info!(job = %self.job_id, documents = documents.len(), "batch job started");
        let mut outcome = BatchOutcome {
            job_id: self.job_id.clone(),
            fingerprints: Vec::with_capacity(documents.len()),
            processed: 0,
            resumed: 0,
            failures: Vec::new(),
            cancelled: false,
        };

        for doc in documents {
            if self.cancel.is_cancelled() {
                warn!(job = %self.job_id, processed = outcome.processed, "batch job cancelled");
                outcome.cancelled = true;
                break;
            }

            let digest = input_digest(&doc.document);
            if let Some(record) = self.store.load(&self.job_id, &doc.document_id)? {
                if record.input_digest == digest {
                    debug!(job = %self.job_id, document = %doc.document_id, "resumed from checkpoint");
                    outcome.resumed += 1;
                    outcome.fingerprints.push(record.fingerprint);
                    continue;
                }
            }

            match self.engine.fingerprint(&doc.document_id, &doc.document) {
                Ok(fingerprint) => {
                    self.store.record(
                        &self.job_id,
                        &CheckpointRecord {
                            document_id: doc.document_id.clone(),
                            input_digest: digest,
                            fingerprint: fingerprint.clone(),
                        },
                    )?;
                    outcome.processed += 1;
                    outcome.fingerprints.push(fingerprint);
                }
                Err(source) => {
                    warn!(job = %self.job_id, document = %doc.document_id, error = %source, "fingerprint failed");
                    outcome.failures.push(BatchError::Fingerprint {
                        document_id: doc.document_id.clone(),
                        source,
                    });
                }
            }
        }

        info!(
            job = %self.job_id,
            processed = outcome.processed,
            resumed = outcome.resumed,
            failed = outcome.failures.len(),
            cancelled = outcome.cancelled,
            "batch job finished"
        );
        Ok(outcome)
    }
}

/// 无检查点的并行指纹计算，结果保持输入顺序
pub fn fingerprint_parallel(
    engine: &FingerprintEngine,
    documents: &[BatchDocument],
) -> Vec<Result<DocumentFingerprint, BatchError>> {
    documents
        .par_iter()
        .map(|doc| {
            engine
                .fingerprint(&doc.document_id, &doc.document)
                .map_err(|source| BatchError::Fingerprint {
                    document_id: doc.document_id.clone(),
                    source,
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ForensicPolicy;
    use serde_json::json;

    fn docs(n: usize) -> Vec<BatchDocument> {
        (0..n)
            .map(|i| BatchDocument {
                document_id: format!("doc-{i}"),
                document: json!({"loan_amount": 1000 * (i + 1), "borrower": {"name": format!("B{i}")}}),
            })
            .collect()
    }

    #[test]
    fn resume_skips_recorded_documents() {
        let engine = FingerprintEngine::new(&ForensicPolicy::default());
        let store = MemoryCheckpointStore::new();
        let input = docs(4);

        let first = BatchJob::new("job-1", &engine, &store).run(&input[..2]).unwrap();
        assert_eq!(first.processed, 2);

        let second = BatchJob::new("job-1", &engine, &store).run(&input).unwrap();
        assert_eq!(second.resumed, 2);
        assert_eq!(second.processed, 2);
        assert_eq!(second.fingerprints.len(), 4);
        assert_eq!(store.completed("job-1").unwrap().len(), 4);
    }

    #[test]
    fn changed_document_is_recomputed() {
        let engine = FingerprintEngine::new(&ForensicPolicy::default());
        let store = MemoryCheckpointStore::new();
        let mut input = docs(1);
        BatchJob::new("job", &engine, &store).run(&input).unwrap();

        input[0].document = json!({"loan_amount": 1});
        let again = BatchJob::new("job", &engine, &store).run(&input).unwrap();
        assert_eq!(again.resumed, 0);
        assert_eq!(again.processed, 1);
    }

    #[test]
    fn cancelled_before_start_processes_nothing() {
        let engine = FingerprintEngine::new(&ForensicPolicy::default());
        let store = MemoryCheckpointStore::new();
        let job = BatchJob::new("job", &engine, &store);
        job.cancellation().cancel();
        let outcome = job.run(&docs(3)).unwrap();
        assert!(outcome.cancelled);
        assert_eq!(outcome.processed, 0);
        assert!(store.completed("job").unwrap().is_empty());
    }

    #[test]
    fn bad_document_does_not_stop_the_batch() {
        let engine = FingerprintEngine::new(&ForensicPolicy::default());
        let store = MemoryCheckpointStore::new();
        let mut input = docs(2);
        input.insert(
            1,
            BatchDocument {
                document_id: "scalar".to_string(),
                document: json!(42),
            },
        );
        let outcome = BatchJob::new("job", &engine, &store).run(&input).unwrap();
        assert_eq!(outcome.processed, 2);
        assert_eq!(outcome.failures.len(), 1);
    }

    #[test]
    fn parallel_matches_sequential() {
        let engine = FingerprintEngine::new(&ForensicPolicy::default());
        let input = docs(16);
        let parallel: Vec<_> = fingerprint_parallel(&engine, &input)
            .into_iter()
            .map(|r| r.unwrap().combined_hash)
            .collect();
        let sequential: Vec<_> = input
            .iter()
            .map(|d| engine.fingerprint(&d.document_id, &d.document).unwrap().combined_hash)
            .collect();
        assert_eq!(parallel, sequential);
    }
}
