//! 令牌会话方言（token）
//!
//! 连接参数全部来自凭据包：`clientId`、`sessionId`、`tokenCluster`（缺省用配置值）。
//! 连接建立后立即发送握手帧，无需等待就绪帧。
//!
//! 帧格式：
//! - 握手 `{"clientId", "sessionId", "tokenCluster"}`
//! - 发送 `{"type": "prompt", "prompt", "id", "clientId", "sessionId"}`
//! - 接收 `agentResponse`（增量）、`agentResponseComplete`（终止，无载荷）、`state`（仅记录）

use serde_json::json;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header;

use super::socket::{insert_header, parse_frame, str_field, Dialect, Inbound};
use super::RequestId;
use crate::core::{ConnectError, Strategy};
use crate::credentials::AuthBundle;

/// 令牌会话方言
#[derive(Debug, Clone)]
pub struct TokenDialect {
    url: String,
    origin: String,
    user_agent: String,
    cookie_header: Option<String>,
    client_id: String,
    session_id: String,
    token_cluster: String,
}

impl TokenDialect {
    pub fn new(
        url: impl Into<String>,
        auth: &AuthBundle,
        default_cluster: &str,
        origin: impl Into<String>,
        user_agent: impl Into<String>,
    ) -> Result<Self, ConnectError> {
        let required = |key: &str| {
            auth.get(key).map(str::to_string).ok_or_else(|| {
                ConnectError::MissingCredentials(format!("{key} missing from auth bundle"))
            })
        };
        let client_id = required("clientId")?;
        let session_id = required("sessionId")?;

        Ok(Self {
            url: url.into(),
            origin: origin.into(),
            user_agent: user_agent.into(),
            cookie_header: auth.cookie_header(),
            client_id,
            session_id,
            token_cluster: auth
                .get("tokenCluster")
                .unwrap_or(default_cluster)
                .to_string(),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn token_cluster(&self) -> &str {
        &self.token_cluster
    }
}

impl Dialect for TokenDialect {
    fn strategy(&self) -> Strategy {
        Strategy::Token
    }

    fn request(&self) -> Result<Request, ConnectError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectError::Unreachable(e.to_string()))?;

        insert_header(&mut request, header::ORIGIN, &self.origin)?;
        insert_header(&mut request, header::REFERER, &format!("{}/", self.origin))?;
        insert_header(&mut request, header::USER_AGENT, &self.user_agent)?;
        if let Some(cookie) = &self.cookie_header {
            insert_header(&mut request, header::COOKIE, cookie)?;
        }
        Ok(request)
    }

    fn handshake(&self) -> Option<String> {
        Some(
            json!({
                "clientId": self.client_id,
                "sessionId": self.session_id,
                "tokenCluster": self.token_cluster,
            })
            .to_string(),
        )
    }

    fn encode_prompt(&self, id: &RequestId, text: &str) -> String {
        json!({
            "type": "prompt",
            "prompt": text,
            "id": id.as_str(),
            "clientId": self.client_id,
            "sessionId": self.session_id,
        })
        .to_string()
    }

    fn decode(&self, raw: &str) -> Inbound {
        let frame = match parse_frame(raw) {
            Ok(frame) => frame,
            Err(malformed) => return malformed,
        };
        let id = str_field(&frame, "id").map(RequestId::from);

        match (str_field(&frame, "type"), id) {
            (Some("agentResponse"), Some(id)) => Inbound::Chunk {
                id,
                text: str_field(&frame, "content").unwrap_or_default().to_string(),
            },
            (Some("agentResponseComplete"), Some(id)) => Inbound::Final { id, text: None },
            (Some("state"), _) => Inbound::State {
                detail: format!(
                    "{}: {} -> {}",
                    str_field(&frame, "connId").unwrap_or("?"),
                    str_field(&frame, "prevState").unwrap_or("?"),
                    str_field(&frame, "state").unwrap_or("?"),
                ),
            },
            _ => Inbound::Ignored,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::Value;

    use super::*;

    fn bundle() -> AuthBundle {
        AuthBundle::new(BTreeMap::new(), 0)
            .with("clientId", "c-1")
            .with("sessionId", "s-1")
    }

    fn dialect(auth: &AuthBundle) -> TokenDialect {
        TokenDialect::new("wss://agent.test/ws", auth, "picard", "https://agent.test", "ua").unwrap()
    }

    #[test]
    fn test_missing_ids_rejected() {
        let auth = AuthBundle::new(BTreeMap::new(), 0).with("clientId", "c-1");
        let err = TokenDialect::new("wss://x", &auth, "picard", "o", "ua").unwrap_err();
        assert_eq!(
            err,
            ConnectError::MissingCredentials("sessionId missing from auth bundle".to_string())
        );
    }

    #[test]
    fn test_cluster_defaults_and_overrides() {
        assert_eq!(dialect(&bundle()).token_cluster(), "picard");
        let custom = bundle().with("tokenCluster", "riker");
        assert_eq!(dialect(&custom).token_cluster(), "riker");
    }

    #[test]
    fn test_request_headers() {
        let request = dialect(&bundle().with_cookie("sid", "abc")).request().unwrap();
        assert_eq!(request.headers()[header::REFERER], "https://agent.test/");
        assert_eq!(request.headers()[header::COOKIE], "sid=abc");

        let request = dialect(&bundle()).request().unwrap();
        assert!(request.headers().get(header::COOKIE).is_none());
    }

    #[test]
    fn test_handshake_and_prompt_frames() {
        let d = dialect(&bundle());
        let handshake: Value = serde_json::from_str(&d.handshake().unwrap()).unwrap();
        assert_eq!(handshake["clientId"], "c-1");
        assert_eq!(handshake["sessionId"], "s-1");
        assert_eq!(handshake["tokenCluster"], "picard");

        let prompt: Value = serde_json::from_str(&d.encode_prompt(&RequestId::from("r9"), "hello")).unwrap();
        assert_eq!(prompt["type"], "prompt");
        assert_eq!(prompt["prompt"], "hello");
        assert_eq!(prompt["id"], "r9");
    }

    #[test]
    fn test_decode_frames() {
        let d = dialect(&bundle());
        assert_eq!(
            d.decode(r#"{"type":"agentResponse","id":"r1","content":"chunk"}"#),
            Inbound::Chunk { id: "r1".into(), text: "chunk".into() }
        );
        assert_eq!(
            d.decode(r#"{"type":"agentResponseComplete","id":"r1"}"#),
            Inbound::Final { id: "r1".into(), text: None }
        );
        assert_eq!(
            d.decode(r#"{"type":"state","connId":"k","prevState":"idle","state":"busy"}"#),
            Inbound::State { detail: "k: idle -> busy".into() }
        );
        assert_eq!(d.decode(r#"{"type":"heartbeat"}"#), Inbound::Ignored);
        assert!(matches!(d.decode("{"), Inbound::Malformed(_)));
    }
}
