use std::env;

use anyhow::Context;

use crate::policy::ForensicPolicy;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// 断点续跑用的 sled 数据库目录
    pub db_path: String,
    pub key_path: String,
    pub policy_path: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let port = match lookup("PORT") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("PORT must be a number, got `{raw}`"))?,
            None => 3000,
        };
        Ok(Self {
            host: lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port,
            db_path: lookup("DB_PATH").unwrap_or_else(|| "data/db/checkpoints".to_string()),
            key_path: lookup("KEY_PATH").unwrap_or_else(|| "yuanjing.key".to_string()),
            policy_path: lookup("POLICY_PATH").filter(|p| !p.trim().is_empty()),
        })
    }

    /// 未配置 POLICY_PATH 时使用内置默认策略
    pub fn load_policy(&self) -> anyhow::Result<ForensicPolicy> {
        match &self.policy_path {
            Some(path) => ForensicPolicy::load_from_path(path),
            None => Ok(ForensicPolicy::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.host, "0.0.0.0");
        assert!(config.policy_path.is_none());
        assert_eq!(config.load_policy().unwrap(), ForensicPolicy::default());
    }

    #[test]
    fn bad_port_is_an_error() {
        assert!(Config::from_lookup(lookup(&[("PORT", "eighty")])).is_err());
        let config = Config::from_lookup(lookup(&[("PORT", "8088"), ("POLICY_PATH", " ")])).unwrap();
        assert_eq!(config.port, 8088);
        assert!(config.policy_path.is_none());
    }
}
