//! Headless Chrome 页面驱动
//!
//! 需启用 feature "browser" 且系统已安装 Chrome/Chromium。
//! 登录态保存在 `profile_dir`（Chrome 用户数据目录）中；首次使用时以 `headless = false`
//! 启动并手动登录一次即可。headless_chrome 为同步 API，所有页面操作都在
//! `spawn_blocking` 中执行。

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::browser::PageDriver;
use crate::config::BrowserSection;
use crate::core::ConnectError;
use crate::credentials::{AuthBundle, COOKIE_PREFIX};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// 回复文本连续多少次轮询不变视为生成结束
const STABLE_POLLS: u32 = 3;

/// 从 localStorage 中查找含 clientId / sessionId 的 JSON 项
const SESSION_IDS_JS: &str = r#"(() => {
  const out = {};
  for (let i = 0; i < localStorage.length; i++) {
    try {
      const data = JSON.parse(localStorage.getItem(localStorage.key(i)));
      if (data && data.clientId && data.sessionId) {
        out.clientId = String(data.clientId);
        out.sessionId = String(data.sessionId);
        if (data.tokenCluster) out.tokenCluster = String(data.tokenCluster);
      }
    } catch (e) {}
  }
  return JSON.stringify(out);
})()"#;

struct Page {
    // 持有 Browser 以保持进程存活
    _browser: Browser,
    tab: Arc<Tab>,
}

/// Headless Chrome 页面驱动
pub struct ChromeDriver {
    settings: BrowserSection,
    reply_timeout: Duration,
    page: Arc<Mutex<Option<Page>>>,
}

impl ChromeDriver {
    pub fn new(settings: BrowserSection, reply_timeout: Duration) -> Self {
        Self {
            settings,
            reply_timeout,
            page: Arc::new(Mutex::new(None)),
        }
    }

    fn reply_count_js(&self) -> String {
        format!(
            "document.querySelectorAll({}).length",
            js_string(&self.settings.reply_selector)
        )
    }

    fn last_reply_js(&self) -> String {
        format!(
            "(() => {{ const all = document.querySelectorAll({}); return all.length ? all[all.length - 1].innerText : ''; }})()",
            js_string(&self.settings.reply_selector)
        )
    }
}

fn js_string(raw: &str) -> String {
    Value::String(raw.to_string()).to_string()
}

fn evaluate(tab: &Tab, js: &str) -> Result<Value, String> {
    tab.evaluate(js, false)
        .map_err(|e| format!("Evaluate failed: {}", e))
        .map(|remote| remote.value.unwrap_or(Value::Null))
}

fn with_tab<T>(
    page: &Mutex<Option<Page>>,
    f: impl FnOnce(&Arc<Tab>) -> Result<T, String>,
) -> Result<T, String> {
    let guard = page.lock().map_err(|e| e.to_string())?;
    let page = guard
        .as_ref()
        .ok_or_else(|| "No active browser session".to_string())?;
    f(&page.tab)
}

#[async_trait]
impl PageDriver for ChromeDriver {
    async fn launch(&self) -> Result<(), ConnectError> {
        let settings = self.settings.clone();
        let page = Arc::clone(&self.page);

        tracing::info!(url = %settings.url, headless = settings.headless, "Launching Chrome");
        tokio::task::spawn_blocking(move || {
            let options = LaunchOptions {
                headless: settings.headless,
                user_data_dir: settings.profile_dir.clone(),
                idle_browser_timeout: Duration::from_secs(settings.startup_timeout_secs.max(1) * 10),
                ..LaunchOptions::default()
            };
            let browser = Browser::new(options)
                .map_err(|e| format!("Chrome launch failed: {}. Install Chrome/Chromium.", e))?;
            let tab = browser
                .new_tab()
                .map_err(|e| format!("Browser tab failed: {}", e))?;
            tab.set_default_timeout(Duration::from_secs(settings.startup_timeout_secs));
            tab.navigate_to(&settings.url)
                .map_err(|e| format!("Navigate failed: {}", e))?;
            tab.wait_for_element(&settings.input_selector)
                .map_err(|e| format!("Prompt input not found (not logged in?): {}", e))?;

            let mut guard = page.lock().map_err(|e| e.to_string())?;
            *guard = Some(Page {
                _browser: browser,
                tab,
            });
            Ok::<_, String>(())
        })
        .await
        .map_err(|e| ConnectError::Unavailable(format!("Task join: {}", e)))?
        .map_err(ConnectError::Unavailable)
    }

    async fn submit(&self, prompt: &str, cancel: &CancellationToken) -> Result<String, String> {
        let cancel = cancel.clone();
        let page = Arc::clone(&self.page);
        let input_selector = self.settings.input_selector.clone();
        let count_js = self.reply_count_js();
        let last_js = self.last_reply_js();
        let reply_timeout = self.reply_timeout;
        let prompt = prompt.to_string();

        tokio::task::spawn_blocking(move || {
            with_tab(&page, |tab| {
                if cancel.is_cancelled() {
                    return Err("Submission abandoned".to_string());
                }
                let before = evaluate(tab, &count_js)?.as_u64().unwrap_or(0);

                let input = tab
                    .wait_for_element(&input_selector)
                    .map_err(|e| format!("Prompt input not found: {}", e))?;
                input.click().map_err(|e| format!("Focus input failed: {}", e))?;
                tab.type_str(&prompt)
                    .map_err(|e| format!("Typing failed: {}", e))?;
                tab.press_key("Enter")
                    .map_err(|e| format!("Submit failed: {}", e))?;

                let deadline = Instant::now() + reply_timeout;
                let mut last = String::new();
                let mut stable = 0;
                while Instant::now() < deadline {
                    std::thread::sleep(POLL_INTERVAL);
                    if cancel.is_cancelled() {
                        return Err("Submission abandoned".to_string());
                    }
                    if evaluate(tab, &count_js)?.as_u64().unwrap_or(0) <= before {
                        continue;
                    }
                    let text = evaluate(tab, &last_js)?
                        .as_str()
                        .unwrap_or_default()
                        .trim()
                        .to_string();
                    if !text.is_empty() && text == last {
                        stable += 1;
                        if stable >= STABLE_POLLS {
                            return Ok(text);
                        }
                    } else {
                        stable = 0;
                        last = text;
                    }
                }
                Err(format!("No reply within {:?}", reply_timeout))
            })
        })
        .await
        .map_err(|e| format!("Task join: {}", e))?
    }

    async fn capture_auth(&self) -> Option<AuthBundle> {
        let page = Arc::clone(&self.page);
        let captured = tokio::task::spawn_blocking(move || {
            with_tab(&page, |tab| {
                let mut values = BTreeMap::new();
                let cookies = tab
                    .get_cookies()
                    .map_err(|e| format!("Get cookies failed: {}", e))?;
                for cookie in cookies {
                    values.insert(format!("{COOKIE_PREFIX}{}", cookie.name), cookie.value);
                }

                let ids = evaluate(tab, SESSION_IDS_JS)?;
                if let Some(raw) = ids.as_str() {
                    let ids: BTreeMap<String, String> =
                        serde_json::from_str(raw).map_err(|e| e.to_string())?;
                    values.extend(ids);
                }
                Ok(AuthBundle::captured_now(values))
            })
        })
        .await;

        match captured {
            Ok(Ok(bundle)) => Some(bundle),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Failed to capture browser auth data");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "Auth capture task failed");
                None
            }
        }
    }

    async fn shutdown(&self) {
        let page = Arc::clone(&self.page);
        let _ = tokio::task::spawn_blocking(move || {
            if let Ok(mut guard) = page.lock() {
                if let Some(page) = guard.take() {
                    if let Err(e) = page.tab.close(true) {
                        tracing::debug!(error = %e, "Closing tab failed");
                    }
                }
            }
        })
        .await;
    }
}
