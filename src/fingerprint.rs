use std::collections::{BTreeMap, BTreeSet, HashMap};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::errors::FingerprintError;
use crate::policy::{FingerprintPolicy, ForensicPolicy, SimilarityPolicy};
use crate::traverse::{self, kind_name, TraversalLimits};

// ==========================================
// 1. 指纹数据结构
// ==========================================

/// 文档多层指纹 (Document Fingerprint)
///
/// 四层哈希各自回答一个问题：
/// - structural: 字段形状变了吗？（只看路径和类型，不看值）
/// - content: 叶子值变了吗？（排序后哈希，字段换顺序不影响）
/// - style: 书写习惯变了吗？（键名风格、日期/数字格式）
/// - semantic: 讲的事情变了吗？（高频关键词 + 识别出的实体）
///
/// 哈希是单向的，没法拿来算相似度，所以 `features` 里保留了原始特征集合。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentFingerprint {
    pub document_id: String,
    pub structural_hash: String,
    pub content_hash: String,
    pub style_hash: String,
    pub semantic_hash: String,
    pub combined_hash: String,
    pub features: FingerprintFeatures,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FingerprintFeatures {
    /// 叶子字段数
    pub field_count: usize,
    pub nested_depth: usize,
    /// `形状路径:类型`
    pub structural_paths: BTreeSet<String>,
    /// 所有叶子值的字符串形式，已排序，保留重复
    pub content_tokens: Vec<String>,
    /// `信号=取值`
    pub style_signals: BTreeSet<String>,
    pub keywords: BTreeSet<String>,
    pub entities: BTreeMap<EntityKind, BTreeSet<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Email,
    Phone,
    Ssn,
    Amount,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Email => "email",
            EntityKind::Phone => "phone",
            EntityKind::Ssn => "ssn",
            EntityKind::Amount => "amount",
        }
    }
}

/// 指纹层 (Layer)
///
/// 每一层是一种"特征抽取策略"，所有层共用同一条哈希流水线
/// (`layer_hash`) 和同一个相似度函数 (`jaccard`)。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Structural,
    Content,
    Style,
    Semantic,
}

impl Layer {
    /// 组合哈希的固定顺序
    pub const ALL: [Layer; 4] = [
        Layer::Structural,
        Layer::Content,
        Layer::Style,
        Layer::Semantic,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Layer::Structural => "structural",
            Layer::Content => "content",
            Layer::Style => "style",
            Layer::Semantic => "semantic",
        }
    }

    /// 参与哈希的有序特征序列
    fn hash_input(&self, features: &FingerprintFeatures) -> Vec<String> {
        match self {
            Layer::Structural => features.structural_paths.iter().cloned().collect(),
            Layer::Content => features.content_tokens.clone(),
            Layer::Style => features.style_signals.iter().cloned().collect(),
            Layer::Semantic => semantic_set(features).into_iter().collect(),
        }
    }

    /// 参与相似度计算的特征集合
    fn feature_set(&self, features: &FingerprintFeatures) -> BTreeSet<String> {
        match self {
            Layer::Structural => features.structural_paths.clone(),
            Layer::Content => features.content_tokens.iter().cloned().collect(),
            Layer::Style => features.style_signals.clone(),
            Layer::Semantic => semantic_set(features),
        }
    }

    fn weight(&self, policy: &SimilarityPolicy) -> f64 {
        match self {
            Layer::Structural => policy.structural_weight,
            Layer::Content => policy.content_weight,
            Layer::Style => policy.style_weight,
            Layer::Semantic => policy.semantic_weight,
        }
    }
}

fn semantic_set(features: &FingerprintFeatures) -> BTreeSet<String> {
    let mut set = features.keywords.clone();
    for (kind, values) in &features.entities {
        for value in values {
            set.insert(format!("{}:{}", kind.as_str(), value));
        }
    }
    set
}

/// 统一哈希流水线：层名作为域分隔，条目以换行分隔
fn layer_hash(layer: Layer, items: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(layer.name().as_bytes());
    hasher.update([0u8]);
    for item in items {
        hasher.update(item.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

fn combine_hashes(layers: &[String; 4]) -> String {
    let mut hasher = Sha256::new();
    for h in layers {
        hasher.update(h.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

// ==========================================
// 2. 相似度结果
// ==========================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityResult {
    pub structural: f64,
    pub content: f64,
    pub style: f64,
    pub semantic: f64,
    pub overall_similarity: f64,
    pub matching_patterns: Vec<String>,
    pub diverging_patterns: Vec<String>,
    pub is_duplicate: bool,
    pub is_derivative: bool,
    pub confidence: f64,
}

impl SimilarityResult {
    pub fn layer(&self, layer: Layer) -> f64 {
        match layer {
            Layer::Structural => self.structural,
            Layer::Content => self.content,
            Layer::Style => self.style,
            Layer::Semantic => self.semantic,
        }
    }
}

// ==========================================
// 3. 文本识别规则
// ==========================================

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b").expect("email regex is valid"));
static SSN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("ssn regex is valid"));
static PHONE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\+?1[\s.-]?)?\(?\b\d{3}\)?[\s.-]\d{3}[\s.-]\d{4}\b").expect("phone regex is valid")
});
static AMOUNT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\s?\d{1,3}(?:,?\d{3})*(?:\.\d{2})?").expect("amount regex is valid"));

static ISO_DATE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("iso date regex is valid"));
static ISO_DATETIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}").expect("iso datetime regex is valid"));
static US_DATE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{1,2}/\d{1,2}/\d{4}$").expect("us date regex is valid"));
static EU_DATE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{1,2}\.\d{1,2}\.\d{4}$").expect("eu date regex is valid"));
static CURRENCY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[$€£¥]\s?[\d,]+(?:\.\d+)?$").expect("currency regex is valid"));
static THOUSANDS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^-?\d{1,3}(?:,\d{3})+(?:\.\d+)?$").expect("thousands regex is valid"));
static PERCENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^-?\d+(?:\.\d+)?\s?%$").expect("percent regex is valid"));
static NUMERIC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^-?\d+(?:\.\d+)?$").expect("numeric regex is valid"));

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "had", "her", "was",
    "one", "our", "out", "has", "his", "how", "its", "may", "new", "now", "old", "see", "two",
    "who", "did", "get", "let", "say", "she", "too", "use", "that", "with", "have", "this",
    "will", "your", "from", "they", "been", "were", "said", "each", "which", "their", "there",
    "what", "about", "would", "these", "other", "into", "than", "then", "them", "some", "such",
    "only", "over", "also", "after", "before", "shall", "must", "upon", "per", "null", "true",
    "false",
];

/// 金额类键名，数值叶子会被识别成金额实体
const AMOUNT_KEYS: &[&str] = &["amount", "principal", "balance", "payment", "income", "price"];

fn key_case(key: &str) -> &'static str {
    let has_lower = key.chars().any(|c| c.is_ascii_lowercase());
    let has_upper = key.chars().any(|c| c.is_ascii_uppercase());
    if key.contains('-') {
        "kebab"
    } else if has_upper && !has_lower {
        "upper"
    } else if key.contains('_') && !has_upper {
        "snake"
    } else if key.starts_with(|c: char| c.is_ascii_lowercase()) && has_upper && !key.contains('_') {
        "camel"
    } else if key.starts_with(|c: char| c.is_ascii_uppercase()) && has_lower && !key.contains('_') {
        "pascal"
    } else if has_lower && !has_upper {
        "lower"
    } else {
        "mixed"
    }
}

fn string_format(value: &str) -> Option<(&'static str, &'static str)> {
    let v = value.trim();
    if ISO_DATETIME_RE.is_match(v) {
        Some(("date_format", "iso_datetime"))
    } else if ISO_DATE_RE.is_match(v) {
        Some(("date_format", "iso_date"))
    } else if US_DATE_RE.is_match(v) {
        Some(("date_format", "us_slash"))
    } else if EU_DATE_RE.is_match(v) {
        Some(("date_format", "eu_dot"))
    } else if CURRENCY_RE.is_match(v) {
        Some(("number_format", "currency_prefixed"))
    } else if THOUSANDS_RE.is_match(v) {
        Some(("number_format", "thousands_comma"))
    } else if PERCENT_RE.is_match(v) {
        Some(("number_format", "percent"))
    } else if NUMERIC_RE.is_match(v) {
        Some(("number_format", "numeric_string"))
    } else {
        None
    }
}

fn stringify_leaf(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(_) => "[]".to_string(),
        Value::Object(_) => "{}".to_string(),
        other => other.to_string(),
    }
}

fn tokenize<'t>(text: &'t str, min_len: usize) -> impl Iterator<Item = String> + 't {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(move |t| t.chars().count() >= min_len && t.chars().all(char::is_alphabetic))
        .map(str::to_lowercase)
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
}

fn split_key_words(key: &str) -> String {
    // camelCase -> camel Case，便于分词
    let mut out = String::with_capacity(key.len() + 4);
    let mut prev_lower = false;
    for c in key.chars() {
        if c.is_ascii_uppercase() && prev_lower {
            out.push(' ');
        }
        prev_lower = c.is_ascii_lowercase();
        out.push(c);
    }
    out
}

fn extract_entities(text: &str, entities: &mut BTreeMap<EntityKind, BTreeSet<String>>) {
    for m in EMAIL_RE.find_iter(text) {
        entities
            .entry(EntityKind::Email)
            .or_default()
            .insert(m.as_str().to_lowercase());
    }
    for m in SSN_RE.find_iter(text) {
        // 只保留后四位，指纹里不落明文证件号
        let last4 = &m.as_str()[m.as_str().len() - 4..];
        entities
            .entry(EntityKind::Ssn)
            .or_default()
            .insert(format!("***-**-{last4}"));
    }
    let without_ssn = SSN_RE.replace_all(text, " ");
    for m in PHONE_RE.find_iter(&without_ssn) {
        let digits: String = m.as_str().chars().filter(char::is_ascii_digit).collect();
        let digits = digits.strip_prefix('1').filter(|d| d.len() == 10).map(str::to_string).unwrap_or(digits);
        entities.entry(EntityKind::Phone).or_default().insert(digits);
    }
    for m in AMOUNT_RE.find_iter(text) {
        let normalized: String = m
            .as_str()
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        entities
            .entry(EntityKind::Amount)
            .or_default()
            .insert(normalized);
    }
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let inter = a.intersection(b).count();
    let union = a.len() + b.len() - inter;
    inter as f64 / union as f64
}

// ==========================================
// 4. 指纹引擎
// ==========================================

/// 指纹引擎 (Fingerprint Engine)
///
/// **职责**: 对单个文档做一次显式栈遍历，同时为四层收集特征，再走统一哈希流水线。
/// 同一文档多次计算得到完全一致的指纹。
#[derive(Debug, Clone)]
pub struct FingerprintEngine {
    fingerprint: FingerprintPolicy,
    similarity: SimilarityPolicy,
}

impl FingerprintEngine {
    pub fn new(policy: &ForensicPolicy) -> Self {
        Self {
            fingerprint: policy.fingerprint.clone(),
            similarity: policy.similarity.clone(),
        }
    }

    pub fn limits(&self) -> TraversalLimits {
        TraversalLimits {
            max_depth: self.fingerprint.max_depth,
            max_nodes: self.fingerprint.max_nodes,
        }
    }

    pub fn fingerprint(
        &self,
        document_id: &str,
        document: &Value,
    ) -> Result<DocumentFingerprint, FingerprintError> {
        if !document.is_object() {
            return Err(FingerprintError::NotAnObject {
                found: kind_name(document),
            });
        }

        let features = self.extract_features(document)?;
        let layer_hashes = Layer::ALL.map(|layer| layer_hash(layer, &layer.hash_input(&features)));
        let combined_hash = combine_hashes(&layer_hashes);
        let [structural_hash, content_hash, style_hash, semantic_hash] = layer_hashes;

        debug!(
            document_id,
            field_count = features.field_count,
            nested_depth = features.nested_depth,
            combined = %combined_hash,
            "fingerprint computed"
        );

        Ok(DocumentFingerprint {
            document_id: document_id.to_string(),
            structural_hash,
            content_hash,
            style_hash,
            semantic_hash,
            combined_hash,
            features,
        })
    }

    /// 一次遍历抽取所有层的特征
    pub fn extract_features(&self, document: &Value) -> Result<FingerprintFeatures, FingerprintError> {
        let mut features = FingerprintFeatures::default();
        let mut token_counts: HashMap<String, usize> = HashMap::new();
        let min_len = self.fingerprint.min_token_len;

        let summary = traverse::walk(document, self.limits(), |node| {
            if !node.path.is_empty() {
                features
                    .structural_paths
                    .insert(format!("{}:{}", node.shape, kind_name(node.value)));
            }
            if let (Some(key), false) = (node.key, node.in_array) {
                features
                    .style_signals
                    .insert(format!("key_case={}", key_case(key)));
                for token in tokenize(&split_key_words(key).replace('_', " "), min_len) {
                    *token_counts.entry(token).or_default() += 1;
                }
            }
            match node.value {
                Value::Array(items) => {
                    if items.iter().any(Value::is_array) {
                        features.style_signals.insert("nested_arrays=true".to_string());
                    }
                    if items.iter().any(Value::is_object) {
                        features.style_signals.insert("array_of_objects=true".to_string());
                    }
                }
                Value::String(s) => {
                    if let Some((signal, format)) = string_format(s) {
                        features.style_signals.insert(format!("{signal}={format}"));
                    }
                    for token in tokenize(s, min_len) {
                        *token_counts.entry(token).or_default() += 1;
                    }
                    extract_entities(s, &mut features.entities);
                }
                Value::Number(n) => {
                    let repr = if n.is_f64() { "float" } else { "integer" };
                    features.style_signals.insert(format!("number_repr={repr}"));
                    let is_amount_key = node
                        .key
                        .map(|k| k.to_lowercase())
                        .is_some_and(|k| AMOUNT_KEYS.iter().any(|a| k.contains(a)));
                    if is_amount_key {
                        features
                            .entities
                            .entry(EntityKind::Amount)
                            .or_default()
                            .insert(n.to_string());
                    }
                }
                _ => {}
            }
            if !node.path.is_empty() && traverse::is_leaf(node.value) {
                features.field_count += 1;
                features.content_tokens.push(stringify_leaf(node.value));
            }
        })?;

        features.nested_depth = summary.max_depth;
        let band = match summary.max_depth {
            0..=2 => "shallow",
            3..=5 => "medium",
            _ => "deep",
        };
        features.style_signals.insert(format!("depth_band={band}"));
        features.content_tokens.sort();

        let mut ranked: Vec<(String, usize)> = token_counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        features.keywords = ranked
            .into_iter()
            .take(self.fingerprint.semantic_top_n)
            .map(|(token, _)| token)
            .collect();

        Ok(features)
    }

    /// 比较两个指纹 (Compare)
    ///
    /// 每层相似度都从保留的特征集合计算（Jaccard），从不比较哈希字节。
    /// 结果自反（自己比自己为 1.0）且对称。
    pub fn compare(&self, a: &DocumentFingerprint, b: &DocumentFingerprint) -> SimilarityResult {
        let policy = &self.similarity;
        let scores = Layer::ALL.map(|layer| {
            jaccard(
                &layer.feature_set(&a.features),
                &layer.feature_set(&b.features),
            )
        });

        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        for (layer, score) in Layer::ALL.iter().zip(scores.iter()) {
            weighted += layer.weight(policy) * score;
            total_weight += layer.weight(policy);
        }
        let overall = if total_weight > 0.0 {
            (weighted / total_weight).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let [structural, content, style, semantic] = scores;
        let mut matching_patterns = Vec::new();
        let mut diverging_patterns = Vec::new();
        for (layer, score) in Layer::ALL.iter().zip(scores.iter()) {
            if *score >= policy.layer_match_threshold {
                matching_patterns.push(format!("{} layer matches ({:.0}%)", layer.name(), score * 100.0));
            } else if *score < policy.layer_diverge_threshold {
                diverging_patterns.push(format!("{} layer diverges ({:.0}%)", layer.name(), score * 100.0));
            }
        }
        if a.combined_hash == b.combined_hash {
            matching_patterns.push("identical combined hash".to_string());
        }

        let is_duplicate = overall >= policy.duplicate_threshold;
        let is_derivative = !is_duplicate
            && overall >= policy.derivative_threshold
            && structural - content >= policy.derivative_structural_margin;

        let mean = scores.iter().sum::<f64>() / 4.0;
        let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / 4.0;
        let confidence = (1.0 - variance.sqrt()).clamp(0.0, 1.0);

        SimilarityResult {
            structural,
            content,
            style,
            semantic,
            overall_similarity: overall,
            matching_patterns,
            diverging_patterns,
            is_duplicate,
            is_derivative,
            confidence,
        }
    }

    /// 廉价预筛选：字段数比例 + 关键词是否有交集
    pub fn prefilter(&self, a: &FingerprintFeatures, b: &FingerprintFeatures) -> bool {
        let (lo, hi) = if a.field_count <= b.field_count {
            (a.field_count, b.field_count)
        } else {
            (b.field_count, a.field_count)
        };
        if hi > 0 && (lo as f64 / hi as f64) < self.similarity.prefilter_min_field_ratio {
            return false;
        }
        if a.keywords.is_empty() || b.keywords.is_empty() {
            return true;
        }
        !a.keywords.is_disjoint(&b.keywords)
    }
}

// ==========================================
// 5. 相似文档检索
// ==========================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarMatch {
    pub document_id: String,
    pub similarity: SimilarityResult,
}

/// 预计算指纹索引
///
/// 单个查询对全库是 O(n)，但先过 `prefilter` 再算四层相似度。
#[derive(Debug, Clone, Default)]
pub struct FingerprintIndex {
    entries: Vec<DocumentFingerprint>,
}

impl FingerprintIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, fingerprint: DocumentFingerprint) {
        match self
            .entries
            .iter_mut()
            .find(|e| e.document_id == fingerprint.document_id)
        {
            Some(existing) => *existing = fingerprint,
            None => self.entries.push(fingerprint),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find_similar(
        &self,
        engine: &FingerprintEngine,
        query: &DocumentFingerprint,
        min_similarity: f64,
    ) -> Vec<SimilarMatch> {
        let mut matches: Vec<SimilarMatch> = self
            .entries
            .iter()
            .filter(|candidate| candidate.document_id != query.document_id)
            .filter(|candidate| engine.prefilter(&query.features, &candidate.features))
            .map(|candidate| SimilarMatch {
                document_id: candidate.document_id.clone(),
                similarity: engine.compare(query, candidate),
            })
            .filter(|m| m.similarity.overall_similarity >= min_similarity)
            .collect();
        matches.sort_by(|a, b| {
            b.similarity
                .overall_similarity
                .total_cmp(&a.similarity.overall_similarity)
                .then_with(|| a.document_id.cmp(&b.document_id))
        });
        matches
    }
}

impl FromIterator<DocumentFingerprint> for FingerprintIndex {
    fn from_iter<T: IntoIterator<Item = DocumentFingerprint>>(iter: T) -> Self {
        let mut index = FingerprintIndex::new();
        for fp in iter {
            index.insert(fp);
        }
        index
    }
}
