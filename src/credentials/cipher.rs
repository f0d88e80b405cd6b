//! 凭据文件加密
//!
//! - **加密**：ChaCha20-Poly1305（认证加密），文件格式 `nonce(12) || ciphertext+tag`
//! - **密钥**：32 字节 URL-safe base64 密钥直接使用；其他口令经 Argon2id（固定盐）派生；
//!   未提供口令时随机生成并记录一次日志（进程重启后旧文件无法解密，属已知限制）

use argon2::Argon2;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::core::CredentialError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

/// 固定盐：同一口令在不同进程派生出同一密钥
const KDF_SALT: &[u8] = b"agent-relay/credential-store/v1";

/// 密钥来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// 口令本身就是 32 字节密钥
    Raw,
    /// 由口令经 Argon2id 派生
    Derived,
    /// 随机生成，仅本进程有效
    Ephemeral,
}

/// 凭据文件的对称加密器
pub struct StoreCipher {
    cipher: ChaCha20Poly1305,
    source: KeySource,
}

impl StoreCipher {
    pub fn from_secret(secret: Option<&str>) -> Result<Self, CredentialError> {
        match secret.map(str::trim).filter(|s| !s.is_empty()) {
            Some(secret) => match decode_raw_key(secret) {
                Some(key) => Ok(Self::from_key(&key, KeySource::Raw)),
                None => Ok(Self::from_key(&derive_key(secret)?, KeySource::Derived)),
            },
            None => {
                let mut key = [0u8; KEY_LEN];
                OsRng.fill_bytes(&mut key);
                tracing::warn!(
                    key = %URL_SAFE.encode(key),
                    "No credential secret configured, generated an ephemeral key; \
                     set RELAY__CREDENTIALS__SECRET to this value to keep stored credentials readable"
                );
                Ok(Self::from_key(&key, KeySource::Ephemeral))
            }
        }
    }

    fn from_key(key: &[u8; KEY_LEN], source: KeySource) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            source,
        }
    }

    pub fn source(&self) -> KeySource {
        self.source
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CredentialError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| CredentialError::Encrypt(e.to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, CredentialError> {
        if blob.len() < NONCE_LEN {
            return Err(CredentialError::Decrypt(format!(
                "blob too short: {} bytes",
                blob.len()
            )));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CredentialError::Decrypt("wrong key or tampered file".to_string()))
    }
}

fn decode_raw_key(secret: &str) -> Option<[u8; KEY_LEN]> {
    let bytes = URL_SAFE.decode(secret).ok()?;
    bytes.try_into().ok()
}

/// Argon2id 派生 256 位密钥
pub fn derive_key(secret: &str) -> Result<[u8; KEY_LEN], CredentialError> {
    let mut key = [0u8; KEY_LEN];
    Argon2::default()
        .hash_password_into(secret.as_bytes(), KDF_SALT, &mut key)
        .map_err(|e| CredentialError::KeyDerivation(e.to_string()))?;
    Ok(key)
}
