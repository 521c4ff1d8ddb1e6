use thiserror::Error;

/// 指纹引擎错误
///
/// 只有三种情况会让指纹计算失败：根节点不是对象、嵌套过深、节点过多。
/// 其余任何"奇怪"的文档都必须能算出指纹。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FingerprintError {
    #[error("document root must be an object, found {found}")]
    NotAnObject { found: &'static str },

    #[error("document nesting exceeds max depth {max_depth} at `{path}`")]
    DepthExceeded { max_depth: usize, path: String },

    #[error("document exceeds node budget of {max_nodes}")]
    TooManyNodes { max_nodes: usize },
}

/// 差异引擎错误
///
/// 只保留给"真正无法比较"的输入；两个非对象的根会退化为一条根级替换记录。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiffError {
    #[error("cannot diff a {left} against a {right}")]
    IncomparableRoots {
        left: &'static str,
        right: &'static str,
    },

    #[error("traversal failed: {0}")]
    Traversal(#[from] FingerprintError),
}

/// 单条模式规则的失败。由检测器隔离，转为警告，不影响其他规则。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternRuleError {
    #[error("rule {rule} has invalid threshold {value}")]
    InvalidThreshold { rule: &'static str, value: usize },

    #[error("malformed input: {0}")]
    MalformedInput(String),
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("checkpoint store error: {0}")]
    Store(#[from] sled::Error),

    #[error("checkpoint encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("fingerprint failed for {document_id}: {source}")]
    Fingerprint {
        document_id: String,
        #[source]
        source: FingerprintError,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyError {
    #[error("similarity weights must be non-negative and sum to 1.0, got {0}")]
    InvalidWeights(f64),

    #[error("risk cut points must be strictly increasing inside (0, 1)")]
    InvalidCutPoints,

    #[error("invalid policy value `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}
