//! 持久会话方言（primary）
//!
//! Cookie 认证；连接参数（client_id / session_id）由本端生成并放在 URL 查询串中，
//! 连接后等待服务端的 `connection:established` 帧。
//!
//! 帧格式：
//! - 发送 `{"type": "agent:query", "messageId", "query", "clientId", "sessionId", "tokenCluster"}`
//! - 接收 `agent:stream`（增量）、`agent:response`（终止，content 为最后一段载荷）、`agent:error`

use serde_json::json;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::uri::PathAndQuery;
use tokio_tungstenite::tungstenite::http::{header, Uri};

use super::socket::{insert_header, parse_frame, str_field, Dialect, Inbound};
use super::RequestId;
use crate::core::{ConnectError, Strategy};
use crate::credentials::AuthBundle;

/// 持久会话方言
#[derive(Debug, Clone)]
pub struct SessionDialect {
    url: String,
    origin: String,
    user_agent: String,
    cookie_header: String,
    client_id: String,
    session_id: String,
    token_cluster: String,
}

impl SessionDialect {
    /// bundle 中至少需要一个 Cookie
    pub fn new(
        url: impl Into<String>,
        auth: &AuthBundle,
        origin: impl Into<String>,
        user_agent: impl Into<String>,
        token_cluster: impl Into<String>,
    ) -> Result<Self, ConnectError> {
        let cookie_header = auth.cookie_header().ok_or_else(|| {
            ConnectError::MissingCredentials("no session cookies in auth bundle".to_string())
        })?;
        let nonce = uuid::Uuid::new_v4().simple().to_string();

        Ok(Self {
            url: url.into(),
            origin: origin.into(),
            user_agent: user_agent.into(),
            cookie_header,
            client_id: format!("relay-{}", &nonce[..8]),
            session_id: format!("session-{}", &nonce[8..20]),
            token_cluster: token_cluster.into(),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// 在配置的地址上追加连接参数；无路径时补 `/`，已有查询串时用 `&` 拼接
    fn connect_url(&self) -> Result<Uri, ConnectError> {
        let invalid = |e: &dyn std::fmt::Display| {
            ConnectError::Unreachable(format!("invalid endpoint {}: {e}", self.url))
        };
        let base = self.url.parse::<Uri>().map_err(|e| invalid(&e))?;
        let params = format!(
            "user_agent=relay&client_id={}&session_id={}&token_cluster={}&timestamp={}",
            self.client_id,
            self.session_id,
            self.token_cluster,
            chrono::Utc::now().timestamp()
        );

        let path = match base.path() {
            "" => "/",
            path => path,
        };
        let path_and_query = match base.query() {
            Some(query) if !query.is_empty() => format!("{path}?{query}&{params}"),
            _ => format!("{path}?{params}"),
        };

        let mut parts = base.into_parts();
        parts.path_and_query = Some(path_and_query.parse::<PathAndQuery>().map_err(|e| invalid(&e))?);
        Uri::from_parts(parts).map_err(|e| invalid(&e))
    }
}

impl Dialect for SessionDialect {
    fn strategy(&self) -> Strategy {
        Strategy::Primary
    }

    fn request(&self) -> Result<Request, ConnectError> {
        let mut request = self
            .connect_url()?
            .into_client_request()
            .map_err(|e| ConnectError::Unreachable(e.to_string()))?;

        insert_header(&mut request, header::USER_AGENT, &self.user_agent)?;
        insert_header(&mut request, header::ORIGIN, &self.origin)?;
        insert_header(&mut request, header::PRAGMA, "no-cache")?;
        insert_header(&mut request, header::CACHE_CONTROL, "no-cache")?;
        insert_header(&mut request, header::COOKIE, &self.cookie_header)?;
        Ok(request)
    }

    fn awaits_ready(&self) -> bool {
        true
    }

    fn encode_prompt(&self, id: &RequestId, text: &str) -> String {
        json!({
            "type": "agent:query",
            "messageId": id.as_str(),
            "query": text,
            "clientId": self.client_id,
            "sessionId": self.session_id,
            "tokenCluster": self.token_cluster,
        })
        .to_string()
    }

    fn decode(&self, raw: &str) -> Inbound {
        let frame = match parse_frame(raw) {
            Ok(frame) => frame,
            Err(malformed) => return malformed,
        };
        let id = str_field(&frame, "messageId").map(RequestId::from);
        let content = str_field(&frame, "content");

        match (str_field(&frame, "type"), id) {
            (Some("connection:established"), _) => Inbound::Ready,
            (Some("agent:stream"), Some(id)) => Inbound::Chunk {
                id,
                text: content.unwrap_or_default().to_string(),
            },
            (Some("agent:response"), Some(id)) => Inbound::Final {
                id,
                text: content.map(str::to_string),
            },
            (Some("agent:error"), Some(id)) => Inbound::Error {
                id,
                reason: str_field(&frame, "error")
                    .unwrap_or("unspecified remote error")
                    .to_string(),
            },
            _ => Inbound::Ignored,
        }
    }
}
