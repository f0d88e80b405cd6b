//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `RELAY__*` 覆盖（双下划线表示嵌套，如
//! `RELAY__STRATEGIES__PRIMARY__FAILURE_THRESHOLD=5`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::core::Strategy;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub router: RouterSection,
    pub strategies: StrategiesSection,
    pub socket: SocketSection,
    pub reconnect: ReconnectSection,
    pub credentials: CredentialsSection,
    pub browser: BrowserSection,
    pub registry: RegistrySection,
}

/// [router] 段：策略固定与粘性
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterSection {
    /// auto / primary / token / browser
    pub pinned_strategy: String,
    /// 成功记录的粘性有效期（秒）；0 表示永不衰减
    pub stickiness_ttl_secs: u64,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            pinned_strategy: "auto".to_string(),
            stickiness_ttl_secs: 0,
        }
    }
}

impl RouterSection {
    pub fn pinned(&self) -> Option<Strategy> {
        match Strategy::parse_pinned(&self.pinned_strategy) {
            Ok(pinned) => pinned,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring invalid pinned_strategy, using auto");
                None
            }
        }
    }

    pub fn stickiness_ttl(&self) -> Option<Duration> {
        (self.stickiness_ttl_secs > 0).then(|| Duration::from_secs(self.stickiness_ttl_secs))
    }
}

/// [strategies.*] 段：每个策略的失败阈值与响应超时
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategySettings {
    pub failure_threshold: u32,
    pub response_timeout_secs: u64,
}

const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
const SOCKET_RESPONSE_TIMEOUT_SECS: u64 = 60;
const BROWSER_RESPONSE_TIMEOUT_SECS: u64 = 120;

impl StrategySettings {
    fn with_timeout(response_timeout_secs: u64) -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            response_timeout_secs,
        }
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}

/// 只写了部分字段的策略段，缺省字段按所属策略补齐
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PartialStrategySettings {
    failure_threshold: Option<u32>,
    response_timeout_secs: Option<u64>,
}

impl PartialStrategySettings {
    fn resolve(self, default_timeout_secs: u64) -> StrategySettings {
        StrategySettings {
            failure_threshold: self.failure_threshold.unwrap_or(DEFAULT_FAILURE_THRESHOLD),
            response_timeout_secs: self.response_timeout_secs.unwrap_or(default_timeout_secs),
        }
    }
}

fn socket_strategy<'de, D: Deserializer<'de>>(d: D) -> Result<StrategySettings, D::Error> {
    PartialStrategySettings::deserialize(d).map(|p| p.resolve(SOCKET_RESPONSE_TIMEOUT_SECS))
}

fn browser_strategy<'de, D: Deserializer<'de>>(d: D) -> Result<StrategySettings, D::Error> {
    PartialStrategySettings::deserialize(d).map(|p| p.resolve(BROWSER_RESPONSE_TIMEOUT_SECS))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StrategiesSection {
    #[serde(deserialize_with = "socket_strategy")]
    pub primary: StrategySettings,
    #[serde(deserialize_with = "socket_strategy")]
    pub token: StrategySettings,
    #[serde(deserialize_with = "browser_strategy")]
    pub browser: StrategySettings,
}

impl Default for StrategiesSection {
    fn default() -> Self {
        Self {
            primary: StrategySettings::with_timeout(SOCKET_RESPONSE_TIMEOUT_SECS),
            token: StrategySettings::with_timeout(SOCKET_RESPONSE_TIMEOUT_SECS),
            browser: StrategySettings::with_timeout(BROWSER_RESPONSE_TIMEOUT_SECS),
        }
    }
}

impl StrategiesSection {
    pub fn get(&self, strategy: Strategy) -> &StrategySettings {
        match strategy {
            Strategy::Primary => &self.primary,
            Strategy::Token => &self.token,
            Strategy::Browser => &self.browser,
        }
    }
}

/// [socket] 段：两个 WebSocket 端点与握手参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SocketSection {
    pub primary_url: String,
    pub token_url: String,
    pub origin: String,
    pub user_agent: String,
    pub handshake_timeout_secs: u64,
    /// bundle 中缺少 tokenCluster 时使用
    pub token_cluster: String,
}

impl Default for SocketSection {
    fn default() -> Self {
        Self {
            primary_url: "wss://agent.example.com/river/wsv2".to_string(),
            token_url: "wss://agent.example.com/river/wsv2".to_string(),
            origin: "https://agent.example.com".to_string(),
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
            handshake_timeout_secs: 15,
            token_cluster: "picard".to_string(),
        }
    }
}

impl SocketSection {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// [reconnect] 段：socket 传输的指数退避
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectSection {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 5,
        }
    }
}

/// [credentials] 段：加密凭据文件
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CredentialsSection {
    pub path: PathBuf,
    /// 凭据最大有效期（秒），默认 12 小时
    pub max_age_secs: u64,
    /// 口令或 32 字节 base64 密钥；未设置时使用临时密钥
    pub secret: Option<String>,
    /// 浏览器导出的 Cookie 文件（primary 策略无凭据时兜底）
    pub cookies_file: Option<PathBuf>,
    pub cookie_domain: String,
}

impl Default for CredentialsSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./storage/tokens.enc"),
            max_age_secs: 43_200,
            secret: None,
            cookies_file: None,
            cookie_domain: "agent.example.com".to_string(),
        }
    }
}

impl CredentialsSection {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

/// [browser] 段：浏览器自动化
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserSection {
    pub url: String,
    pub headless: bool,
    /// 持久化浏览器配置目录（保存登录态）
    pub profile_dir: Option<PathBuf>,
    pub input_selector: String,
    pub reply_selector: String,
    pub startup_timeout_secs: u64,
}

impl Default for BrowserSection {
    fn default() -> Self {
        Self {
            url: "https://agent.example.com/ai".to_string(),
            headless: true,
            profile_dir: None,
            input_selector: "textarea, input[type='text']".to_string(),
            reply_selector: "[data-role='assistant-message']".to_string(),
            startup_timeout_secs: 60,
        }
    }
}

/// [registry] 段：按用户的 Router 会话
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 3_600,
            sweep_interval_secs: 60,
        }
    }
}

/// 从 config 目录加载配置，环境变量 RELAY__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 RELAY__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("RELAY")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
