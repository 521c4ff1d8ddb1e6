use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::orchestrator::ForensicReport;

/// 键排序后的 JSON，签名与验签都基于它
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut ordered = Map::new();
            for key in keys {
                if let Some(v) = map.get(key) {
                    ordered.insert(key.clone(), canonicalize(v));
                }
            }
            Value::Object(ordered)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        _ => value.clone(),
    }
}

pub fn canonical_bytes<T: Serialize>(payload: &T) -> anyhow::Result<Vec<u8>> {
    let value = serde_json::to_value(payload).context("report serialization failed")?;
    Ok(serde_json::to_vec(&canonicalize(&value))?)
}

/// 带签名的报告，公钥与签名均为 hex
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedReport {
    pub report: ForensicReport,
    pub public_key: String,
    pub signature: String,
}

/// 报告签名器
///
/// **职责**: 用 Ed25519 对调查报告做确证，审计方拿公钥即可离线验签。
pub struct ReportSigner {
    keypair: SigningKey,
}

impl ReportSigner {
    /// 临时密钥，仅用于测试或一次性任务
    pub fn generate() -> Self {
        Self {
            keypair: SigningKey::generate(&mut OsRng),
        }
    }

    /// 密钥文件存在则读取 32 字节私钥，否则生成并写入
    pub fn load_or_generate(key_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let key_path = key_path.as_ref();
        if key_path.exists() {
            let bytes = fs::read(key_path)
                .with_context(|| format!("reading signing key {}", key_path.display()))?;
            let secret: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                anyhow!(
                    "signing key {} must be 32 bytes, found {}",
                    key_path.display(),
                    bytes.len()
                )
            })?;
            info!(path = %key_path.display(), "signing key loaded");
            return Ok(Self {
                keypair: SigningKey::from_bytes(&secret),
            });
        }

        let signer = Self::generate();
        if let Some(parent) = key_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating key directory {}", parent.display()))?;
        }
        fs::write(key_path, signer.keypair.to_bytes())
            .with_context(|| format!("writing signing key {}", key_path.display()))?;
        info!(path = %key_path.display(), "new signing key generated");
        Ok(signer)
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.keypair.verifying_key()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key().to_bytes())
    }

    pub fn sign_report(&self, report: &ForensicReport) -> anyhow::Result<SignedReport> {
        let payload = canonical_bytes(report)?;
        let signature = self.keypair.sign(&payload);
        Ok(SignedReport {
            report: report.clone(),
            public_key: self.public_key_hex(),
            signature: hex::encode(signature.to_bytes()),
        })
    }

    /// 签名不匹配返回 `Ok(false)`；只有格式错误才返回 `Err`
    pub fn verify(signed: &SignedReport) -> anyhow::Result<bool> {
        let key_bytes: [u8; 32] = hex::decode(&signed.public_key)
            .context("public key is not hex")?
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("public key must be 32 bytes"))?;
        let verifying_key = VerifyingKey::from_bytes(&key_bytes).context("invalid public key")?;
        let sig_bytes: [u8; 64] = hex::decode(&signed.signature)
            .context("signature is not hex")?
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("signature must be 64 bytes"))?;
        let signature = Signature::from_bytes(&sig_bytes);
        let payload = canonical_bytes(&signed.report)?;
        Ok(verifying_key.verify(&payload, &signature).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_form_sorts_nested_keys() {
        let value = json!({"b": 1, "a": {"d": [ {"z": 1, "y": 2} ], "c": null}});
        let text = serde_json::to_string(&canonicalize(&value)).unwrap();
        assert_eq!(text, r#"{"a":{"c":null,"d":[{"y":2,"z":1}]},"b":1}"#);
    }

    #[test]
    fn key_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("report.key");
        let first = ReportSigner::load_or_generate(&path).unwrap();
        let second = ReportSigner::load_or_generate(&path).unwrap();
        assert_eq!(first.public_key_hex(), second.public_key_hex());
    }

    #[test]
    fn truncated_key_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.key");
        fs::write(&path, [7u8; 10]).unwrap();
        assert!(ReportSigner::load_or_generate(&path).is_err());
    }
}
