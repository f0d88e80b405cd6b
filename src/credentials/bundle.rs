//! AuthBundle：不透明的凭据快照（Cookie、会话标识、令牌）+ 采集时间

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::CredentialError;

/// Cookie 在 bundle 中的键前缀
pub const COOKIE_PREFIX: &str = "cookie.";

/// 采集到的凭据；采集后不可变，刷新时整体替换
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthBundle {
    values: BTreeMap<String, String>,
    /// 采集时间（Unix 秒）
    captured_at: i64,
}

impl AuthBundle {
    pub fn new(values: BTreeMap<String, String>, captured_at: i64) -> Self {
        Self {
            values,
            captured_at,
        }
    }

    /// 以当前时间作为采集时间
    pub fn captured_now(values: BTreeMap<String, String>) -> Self {
        Self::new(values, chrono::Utc::now().timestamp())
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn with_cookie(self, name: &str, value: impl Into<String>) -> Self {
        self.with(format!("{COOKIE_PREFIX}{name}"), value)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    pub fn captured_at(&self) -> i64 {
        self.captured_at
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// (name, value) 形式的 Cookie
    pub fn cookies(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(COOKIE_PREFIX).map(|name| (name, v.as_str())))
    }

    /// 拼成 `Cookie` 请求头；无 Cookie 时返回 None
    pub fn cookie_header(&self) -> Option<String> {
        let header = self
            .cookies()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");
        (!header.is_empty()).then_some(header)
    }

    /// 读取浏览器导出的 Cookie 文件（JSON 数组，元素含 name / value / domain）
    ///
    /// 只保留 `domain` 及其子域的 Cookie。
    pub fn from_cookie_export(path: &Path, domain: &str) -> Result<Self, CredentialError> {
        #[derive(Deserialize)]
        struct ExportedCookie {
            name: String,
            value: String,
            #[serde(default)]
            domain: String,
        }

        let raw = std::fs::read_to_string(path)?;
        let exported: Vec<ExportedCookie> = serde_json::from_str(&raw)?;
        let domain = domain.trim_start_matches('.').to_lowercase();

        let values = exported
            .into_iter()
            .filter(|c| {
                let cookie_domain = c.domain.trim_start_matches('.').to_lowercase();
                cookie_domain == domain || cookie_domain.ends_with(&format!(".{domain}"))
            })
            .filter(|c| !c.name.is_empty() && !c.value.is_empty())
            .map(|c| (format!("{COOKIE_PREFIX}{}", c.name), c.value))
            .collect::<BTreeMap<_, _>>();

        tracing::info!(path = %path.display(), cookies = values.len(), "Loaded cookie export");
        Ok(Self::captured_now(values))
    }
}
