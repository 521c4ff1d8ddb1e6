use std::collections::BTreeMap;

use serde_json::Value;

use crate::errors::FingerprintError;

/// 遍历限制：最大深度与最大节点数
#[derive(Debug, Clone, Copy)]
pub struct TraversalLimits {
    pub max_depth: usize,
    pub max_nodes: usize,
}

/// 遍历过程中访问到的一个节点
///
/// - `path`: 点分路径，数组下标写作 `[i]`，例如 `borrower.addresses[0].city`
/// - `shape`: 同一路径但数组下标折叠为 `[]`，只描述"形状"
pub struct Node<'n, 'a> {
    pub path: &'n str,
    pub shape: &'n str,
    pub key: Option<&'a str>,
    pub value: &'a Value,
    pub depth: usize,
    pub in_array: bool,
}

/// 遍历完成后的统计
#[derive(Debug, Clone, Copy, Default)]
pub struct WalkSummary {
    pub nodes: usize,
    pub max_depth: usize,
}

struct Frame<'a> {
    path: String,
    shape: String,
    key: Option<&'a str>,
    value: &'a Value,
    depth: usize,
    in_array: bool,
}

pub fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// 叶子节点：标量，或者空对象/空数组
pub fn is_leaf(value: &Value) -> bool {
    match value {
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => true,
    }
}

fn join_key(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

/// 显式栈遍历 (Iterative Walk)
///
/// 不使用函数递归：深度由 `limits.max_depth` 约束，超限直接返回
/// `FingerprintError::DepthExceeded`，不会耗尽调用栈。
/// 对象的键按字典序访问（`serde_json::Map` 默认有序），结果稳定可复现。
pub fn walk<'a, F>(
    root: &'a Value,
    limits: TraversalLimits,
    mut visit: F,
) -> Result<WalkSummary, FingerprintError>
where
    F: FnMut(&Node<'_, 'a>),
{
    let mut summary = WalkSummary::default();
    let mut stack = vec![Frame {
        path: String::new(),
        shape: String::new(),
        key: None,
        value: root,
        depth: 0,
        in_array: false,
    }];

    while let Some(frame) = stack.pop() {
        summary.nodes += 1;
        if summary.nodes > limits.max_nodes {
            return Err(FingerprintError::TooManyNodes {
                max_nodes: limits.max_nodes,
            });
        }
        if frame.depth > limits.max_depth {
            return Err(FingerprintError::DepthExceeded {
                max_depth: limits.max_depth,
                path: frame.path,
            });
        }
        summary.max_depth = summary.max_depth.max(frame.depth);

        visit(&Node {
            path: &frame.path,
            shape: &frame.shape,
            key: frame.key,
            value: frame.value,
            depth: frame.depth,
            in_array: frame.in_array,
        });

        // 逆序压栈，出栈顺序即自然顺序
        match frame.value {
            Value::Object(map) => {
                for (key, child) in map.iter().rev() {
                    stack.push(Frame {
                        path: join_key(&frame.path, key),
                        shape: join_key(&frame.shape, key),
                        key: Some(key.as_str()),
                        value: child,
                        depth: frame.depth + 1,
                        in_array: false,
                    });
                }
            }
            Value::Array(items) => {
                for (idx, child) in items.iter().enumerate().rev() {
                    stack.push(Frame {
                        path: format!("{}[{idx}]", frame.path),
                        shape: format!("{}[]", frame.shape),
                        key: frame.key,
                        value: child,
                        depth: frame.depth + 1,
                        in_array: true,
                    });
                }
            }
            _ => {}
        }
    }

    Ok(summary)
}

/// 把文档拍平成 `路径 -> 叶子值`，与指纹引擎使用同一套路径约定
pub fn flatten(
    root: &Value,
    limits: TraversalLimits,
) -> Result<BTreeMap<String, &Value>, FingerprintError> {
    let mut leaves = BTreeMap::new();
    walk(root, limits, |node| {
        if !node.path.is_empty() && is_leaf(node.value) {
            leaves.insert(node.path.to_string(), node.value);
        }
    })?;
    Ok(leaves)
}
