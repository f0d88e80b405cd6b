//! Socket 传输集成测试：本地 WebSocket 服务端模拟两种方言

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::future::Future;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use agent_relay::core::WaitError;
    use agent_relay::credentials::AuthBundle;
    use agent_relay::streaming::StreamHandlers;
    use agent_relay::transport::{
        ConnectionState, ReconnectPolicy, SessionDialect, SocketTransport, TokenDialect, Transport,
    };
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{accept_async, WebSocketStream};

    type ServerSocket = WebSocketStream<TcpStream>;

    /// 接受一个连接并交给 handler；handler 结束后监听端口随之关闭
    async fn serve_once<F, Fut>(handler: F) -> SocketAddr
    where
        F: FnOnce(ServerSocket) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = accept_async(stream).await.unwrap();
            handler(ws).await;
        });
        addr
    }

    async fn next_json(ws: &mut ServerSocket) -> Value {
        while let Some(message) = ws.next().await {
            if let Message::Text(raw) = message.unwrap() {
                return serde_json::from_str(&raw).unwrap();
            }
        }
        panic!("client disconnected");
    }

    async fn send_json(ws: &mut ServerSocket, value: Value) {
        ws.send(Message::Text(value.to_string())).await.unwrap();
    }

    /// 保持连接直到客户端关闭
    async fn drain(ws: &mut ServerSocket) {
        while let Some(Ok(_)) = ws.next().await {}
    }

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            max_attempts,
        }
    }

    fn token_bundle() -> AuthBundle {
        AuthBundle::new(BTreeMap::new(), 0)
            .with("clientId", "client-7")
            .with("sessionId", "session-7")
    }

    fn token_transport(addr: SocketAddr, max_attempts: u32) -> SocketTransport<TokenDialect> {
        let dialect = TokenDialect::new(
            format!("ws://{addr}"),
            &token_bundle(),
            "picard",
            "http://localhost",
            "relay-test",
        )
        .unwrap();
        SocketTransport::new(dialect, policy(max_attempts), Duration::from_secs(2))
    }

    fn recording() -> (StreamHandlers, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let updates = Arc::clone(&log);
        let completes = Arc::clone(&log);
        let handlers = StreamHandlers::new()
            .on_update(move |c| updates.lock().unwrap().push(format!("u:{c}")))
            .on_complete(move |full| completes.lock().unwrap().push(format!("c:{full}")));
        (handlers, log)
    }

    #[tokio::test]
    async fn test_token_dialect_round_trip() {
        let addr = serve_once(|mut ws| async move {
            let handshake = next_json(&mut ws).await;
            assert_eq!(handshake["clientId"], "client-7");
            assert_eq!(handshake["sessionId"], "session-7");
            assert_eq!(handshake["tokenCluster"], "picard");

            let prompt = next_json(&mut ws).await;
            assert_eq!(prompt["type"], "prompt");
            assert_eq!(prompt["prompt"], "hello");
            let id = prompt["id"].clone();

            send_json(&mut ws, json!({"type": "state", "connId": "c", "prevState": "idle", "state": "busy"})).await;
            send_json(&mut ws, json!({"type": "agentResponse", "id": id, "content": "hel"})).await;
            send_json(&mut ws, json!({"type": "agentResponse", "id": "someone-else", "content": "x"})).await;
            send_json(&mut ws, json!({"type": "agentResponse", "id": id, "content": "lo"})).await;
            send_json(&mut ws, json!({"type": "agentResponseComplete", "id": id})).await;
            drain(&mut ws).await;
        })
        .await;

        let transport = token_transport(addr, 1);
        transport.connect().await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Connected);
        // 已连接时再次 connect 无副作用
        transport.connect().await.unwrap();

        let (handlers, log) = recording();
        let id = transport.send_message("hello", handlers).await.unwrap();
        let text = transport
            .wait_for_response(&id, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(text, "hello");
        assert_eq!(log.lock().unwrap().as_slice(), ["u:hel", "u:lo", "c:hello"]);
        assert!(transport.pending().is_empty());

        transport.close().await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_session_dialect_waits_for_ready_and_appends_final_payload() {
        let addr = serve_once(|mut ws| async move {
            send_json(&mut ws, json!({"type": "connection:established"})).await;

            let query = next_json(&mut ws).await;
            assert_eq!(query["type"], "agent:query");
            assert_eq!(query["query"], "status?");
            let id = query["messageId"].clone();

            send_json(&mut ws, json!({"type": "agent:stream", "messageId": id, "content": "all "})).await;
            send_json(&mut ws, json!({"type": "agent:response", "messageId": id, "content": "good"})).await;
            drain(&mut ws).await;
        })
        .await;

        let auth = AuthBundle::new(BTreeMap::new(), 0).with_cookie("sid", "abc");
        let dialect = SessionDialect::new(
            format!("ws://{addr}/ws"),
            &auth,
            "http://localhost",
            "relay-test",
            "picard",
        )
        .unwrap();
        let transport = SocketTransport::new(dialect, policy(1), Duration::from_secs(2));

        // 隐式连接
        let (handlers, log) = recording();
        let id = transport.send_message("status?", handlers).await.unwrap();
        let text = transport
            .wait_for_response(&id, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(text, "all good");
        assert_eq!(log.lock().unwrap().as_slice(), ["u:all ", "c:all good"]);
        let _ = transport.close().await;
    }

    #[tokio::test]
    async fn test_remote_error_fails_request() {
        let addr = serve_once(|mut ws| async move {
            send_json(&mut ws, json!({"type": "connection:established"})).await;
            let query = next_json(&mut ws).await;
            send_json(
                &mut ws,
                json!({"type": "agent:error", "messageId": query["messageId"], "error": "quota exceeded"}),
            )
            .await;
            drain(&mut ws).await;
        })
        .await;

        let auth = AuthBundle::new(BTreeMap::new(), 0).with_cookie("sid", "abc");
        let dialect =
            SessionDialect::new(format!("ws://{addr}"), &auth, "http://localhost", "ua", "picard").unwrap();
        let transport = SocketTransport::new(dialect, policy(1), Duration::from_secs(2));

        let id = transport.send_message("q", StreamHandlers::new()).await.unwrap();
        let err = transport
            .wait_for_response(&id, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err, WaitError::Failed("quota exceeded".to_string()));
        let _ = transport.close().await;
    }

    #[tokio::test]
    async fn test_repeated_timeouts_leave_no_pending_entries() {
        let addr = serve_once(|mut ws| async move {
            let _handshake = next_json(&mut ws).await;
            drain(&mut ws).await;
        })
        .await;

        let transport = token_transport(addr, 1);
        for _ in 0..5 {
            let id = transport.send_message("anyone?", StreamHandlers::new()).await.unwrap();
            let err = transport
                .wait_for_response(&id, Duration::from_millis(50))
                .await
                .unwrap_err();
            assert_eq!(err, WaitError::Timeout(Duration::from_millis(50)));
            assert!(transport.pending().is_empty());
        }
        let _ = transport.close().await;
    }

    #[tokio::test]
    async fn test_lost_connection_without_recovery_fails_pending() {
        let addr = serve_once(|mut ws| async move {
            let _handshake = next_json(&mut ws).await;
            let _prompt = next_json(&mut ws).await;
            let _ = ws.close(None).await;
        })
        .await;

        let transport = token_transport(addr, 1);
        let id = transport.send_message("bye", StreamHandlers::new()).await.unwrap();
        let err = transport
            .wait_for_response(&id, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err, WaitError::Failed("connection lost".to_string()));
        assert_eq!(transport.state(), ConnectionState::Error);
        let _ = transport.close().await;
    }

    #[tokio::test]
    async fn test_reconnects_after_connection_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // 第一个连接握手后立即断开
            let (stream, _) = listener.accept().await.unwrap();
            let mut first = accept_async(stream).await.unwrap();
            let _handshake = next_json(&mut first).await;
            let _ = first.close(None).await;
            drop(first);

            // 第二个连接正常服务
            let (stream, _) = listener.accept().await.unwrap();
            let mut second = accept_async(stream).await.unwrap();
            let _handshake = next_json(&mut second).await;
            let prompt = next_json(&mut second).await;
            send_json(&mut second, json!({"type": "agentResponse", "id": prompt["id"], "content": "ok"})).await;
            send_json(&mut second, json!({"type": "agentResponseComplete", "id": prompt["id"]})).await;
            drain(&mut second).await;
        });

        let transport = token_transport(addr, 3);
        transport.connect().await.unwrap();

        let mut saw_backoff = false;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            match transport.state() {
                ConnectionState::BackingOff => saw_backoff = true,
                ConnectionState::Connected if saw_backoff => break,
                ConnectionState::Error => panic!("reconnection gave up"),
                _ => {}
            }
            assert!(tokio::time::Instant::now() < deadline, "never reconnected");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let id = transport.send_message("again", StreamHandlers::new()).await.unwrap();
        let text = transport
            .wait_for_response(&id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(text, "ok");
        assert_eq!(transport.state(), ConnectionState::Connected);
        let _ = transport.close().await;
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = token_transport(addr, 1);
        assert!(transport.connect().await.is_err());
        assert_eq!(transport.state(), ConnectionState::Error);
    }
}
