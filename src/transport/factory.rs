//! 传输工厂：Router 在需要时按策略与凭据构造传输
//!
//! 构造失败（缺少凭据、浏览器功能未编译）按一次连接失败处理。

use std::sync::Arc;

use async_trait::async_trait;

use super::session::SessionDialect;
use super::socket::{ReconnectPolicy, SocketTransport};
use super::token::TokenDialect;
use super::Transport;
use crate::config::AppConfig;
use crate::core::{ConnectError, Strategy};
use crate::credentials::AuthBundle;

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn build(
        &self,
        strategy: Strategy,
        auth: Option<&AuthBundle>,
    ) -> Result<Box<dyn Transport>, ConnectError>;
}

/// 按配置构造真实传输
pub struct DefaultTransportFactory {
    config: Arc<AppConfig>,
}

impl DefaultTransportFactory {
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self { config }
    }

    /// primary 的 Cookie：优先使用存储的凭据，其次读取导出的 Cookie 文件
    fn session_auth(&self, auth: Option<&AuthBundle>) -> Result<AuthBundle, ConnectError> {
        if let Some(bundle) = auth.filter(|b| b.cookie_header().is_some()) {
            return Ok(bundle.clone());
        }

        let credentials = &self.config.credentials;
        let path = credentials.cookies_file.as_ref().ok_or_else(|| {
            ConnectError::MissingCredentials("no stored cookies and no cookies_file configured".to_string())
        })?;
        AuthBundle::from_cookie_export(path, &credentials.cookie_domain)
            .map_err(|e| ConnectError::MissingCredentials(format!("{}: {}", path.display(), e)))
    }

    fn build_browser(&self) -> Result<Box<dyn Transport>, ConnectError> {
        #[cfg(feature = "browser")]
        {
            let driver = super::chrome::ChromeDriver::new(
                self.config.browser.clone(),
                self.config.strategies.browser.response_timeout(),
            );
            Ok(Box::new(super::browser::BrowserTransport::new(Arc::new(driver))))
        }

        #[cfg(not(feature = "browser"))]
        {
            Err(ConnectError::Unavailable(
                "browser automation not compiled in (enable feature \"browser\")".to_string(),
            ))
        }
    }
}

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn build(
        &self,
        strategy: Strategy,
        auth: Option<&AuthBundle>,
    ) -> Result<Box<dyn Transport>, ConnectError> {
        let socket = &self.config.socket;
        let policy = ReconnectPolicy::from(&self.config.reconnect);

        match strategy {
            Strategy::Primary => {
                let auth = self.session_auth(auth)?;
                let dialect = SessionDialect::new(
                    socket.primary_url.as_str(),
                    &auth,
                    socket.origin.as_str(),
                    socket.user_agent.as_str(),
                    socket.token_cluster.as_str(),
                )?;
                Ok(Box::new(SocketTransport::new(dialect, policy, socket.handshake_timeout())))
            }
            Strategy::Token => {
                let auth = auth.ok_or_else(|| {
                    ConnectError::MissingCredentials("no stored token credentials".to_string())
                })?;
                let dialect = TokenDialect::new(
                    socket.token_url.as_str(),
                    auth,
                    &socket.token_cluster,
                    socket.origin.as_str(),
                    socket.user_agent.as_str(),
                )?;
                Ok(Box::new(SocketTransport::new(dialect, policy, socket.handshake_timeout())))
            }
            Strategy::Browser => self.build_browser(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn factory(config: AppConfig) -> DefaultTransportFactory {
        DefaultTransportFactory::new(Arc::new(config))
    }

    #[tokio::test]
    async fn test_token_requires_credentials() {
        let err = factory(AppConfig::default())
            .build(Strategy::Token, None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConnectError::MissingCredentials(_)));
    }

    #[tokio::test]
    async fn test_builds_socket_transports_with_credentials() {
        let auth = AuthBundle::new(BTreeMap::new(), 0)
            .with_cookie("sid", "abc")
            .with("clientId", "c")
            .with("sessionId", "s");
        let factory = factory(AppConfig::default());

        let primary = factory.build(Strategy::Primary, Some(&auth)).await.unwrap();
        assert_eq!(primary.strategy(), Strategy::Primary);
        assert!(!primary.is_connected());

        let token = factory.build(Strategy::Token, Some(&auth)).await.unwrap();
        assert_eq!(token.strategy(), Strategy::Token);
    }

    #[tokio::test]
    async fn test_primary_falls_back_to_cookie_export() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.json");
        std::fs::write(
            &path,
            r#"[{"name":"sid","value":"exported","domain":".agent.example.com"}]"#,
        )
        .unwrap();

        let mut config = AppConfig::default();
        config.credentials.cookies_file = Some(path);
        let transport = factory(config).build(Strategy::Primary, None).await.unwrap();
        assert_eq!(transport.strategy(), Strategy::Primary);

        let err = factory(AppConfig::default())
            .build(Strategy::Primary, None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConnectError::MissingCredentials(_)));
    }

    #[cfg(not(feature = "browser"))]
    #[tokio::test]
    async fn test_browser_unavailable_without_feature() {
        let err = factory(AppConfig::default())
            .build(Strategy::Browser, None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConnectError::Unavailable(_)));
    }
}
