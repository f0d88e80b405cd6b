//! 加密凭据存储：user_id → AuthBundle
//!
//! 整个映射在构造时一次性读入内存；每次变更都把完整映射序列化、加密后
//! 经临时文件 + rename 原子覆盖。写入只在进程内串行化，多进程并发访问不受支持。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::bundle::AuthBundle;
use super::cipher::StoreCipher;
use crate::core::CredentialError;

/// 磁盘上的单条记录
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    data: AuthBundle,
    stored_at: i64,
}

/// 加密凭据存储
pub struct CredentialStore {
    path: PathBuf,
    cipher: StoreCipher,
    entries: Mutex<HashMap<String, StoredEntry>>,
}

impl CredentialStore {
    /// 打开（或新建）凭据文件；无法解密的文件记录错误后按空存储处理
    pub fn open(path: impl Into<PathBuf>, secret: Option<&str>) -> Result<Self, CredentialError> {
        let path = path.into();
        let cipher = StoreCipher::from_secret(secret)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let entries = match load_entries(&path, &cipher) {
            Ok(entries) => {
                tracing::info!(path = %path.display(), users = entries.len(), "Loaded credential store");
                entries
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Failed to load credential store, starting empty");
                HashMap::new()
            }
        };

        Ok(Self {
            path,
            cipher,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StoredEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 保存（整体替换）用户凭据，存储时间取 bundle 的采集时间
    ///
    /// 写盘成功后才更新内存，失败时两者保持一致
    pub fn store(&self, user_id: &str, bundle: AuthBundle) -> Result<(), CredentialError> {
        let mut entries = self.lock();
        let stored_at = bundle.captured_at();
        let mut next = entries.clone();
        next.insert(
            user_id.to_string(),
            StoredEntry {
                data: bundle,
                stored_at,
            },
        );
        self.persist(&next)?;
        *entries = next;
        tracing::info!(user_id, "Stored credentials");
        Ok(())
    }

    pub fn get(&self, user_id: &str) -> Option<AuthBundle> {
        let bundle = self.lock().get(user_id).map(|e| e.data.clone());
        if bundle.is_none() {
            tracing::debug!(user_id, "No credentials stored");
        }
        bundle
    }

    /// `now - captured_at < max_age`
    pub fn is_valid(&self, user_id: &str, max_age: Duration) -> bool {
        self.is_valid_at(user_id, max_age, chrono::Utc::now().timestamp())
    }

    /// 以给定时间（Unix 秒）判断有效性
    pub fn is_valid_at(&self, user_id: &str, max_age: Duration, now: i64) -> bool {
        let max_age = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
        self.lock()
            .get(user_id)
            .is_some_and(|e| now.saturating_sub(e.stored_at) < max_age)
    }

    /// 删除用户凭据；不存在时返回 false
    pub fn delete(&self, user_id: &str) -> Result<bool, CredentialError> {
        let mut entries = self.lock();
        if !entries.contains_key(user_id) {
            return Ok(false);
        }
        let mut next = entries.clone();
        next.remove(user_id);
        self.persist(&next)?;
        *entries = next;
        tracing::info!(user_id, "Deleted credentials");
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn persist(&self, entries: &HashMap<String, StoredEntry>) -> Result<(), CredentialError> {
        let json = serde_json::to_vec(entries)?;
        let blob = self.cipher.encrypt(&json)?;

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, blob)?;
        std::fs::rename(&tmp, &self.path)?;
        tracing::debug!(path = %self.path.display(), users = entries.len(), "Persisted credential store");
        Ok(())
    }
}

fn load_entries(
    path: &Path,
    cipher: &StoreCipher,
) -> Result<HashMap<String, StoredEntry>, CredentialError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let blob = std::fs::read(path)?;
    let json = cipher.decrypt(&blob)?;
    Ok(serde_json::from_slice(&json)?)
}
