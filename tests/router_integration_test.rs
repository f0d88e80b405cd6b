//! Router 集成测试：降级、断路器自愈、浏览器凭据回写

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use agent_relay::core::{
        Router, RouterSettings, SessionRegistry, Strategy, TransportError,
    };
    use agent_relay::credentials::{AuthBundle, CredentialStore};
    use agent_relay::streaming::StreamHandlers;
    use agent_relay::transport::mock::{MockBehavior, MockTransportFactory};
    use agent_relay::transport::TransportFactory;

    fn open_store(dir: &tempfile::TempDir) -> Arc<CredentialStore> {
        Arc::new(CredentialStore::open(dir.path().join("tokens.enc"), Some("integration")).unwrap())
    }

    fn settings() -> RouterSettings {
        RouterSettings {
            thresholds: [3, 3, 3],
            response_timeouts: [Duration::from_secs(2); 3],
            ..RouterSettings::default()
        }
    }

    fn router(factory: &Arc<MockTransportFactory>, store: Arc<CredentialStore>) -> Router {
        Router::new(
            "user-1",
            settings(),
            store,
            Arc::clone(factory) as Arc<dyn TransportFactory>,
        )
    }

    fn failures(router: &Router) -> [u32; 3] {
        let stats = router.stats();
        Strategy::ORDER.map(|s| stats.failures(s))
    }

    #[tokio::test]
    async fn test_primary_connect_failure_escalates_to_token() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(
            MockTransportFactory::new()
                .with(Strategy::Primary, MockBehavior::FailConnect)
                .with(Strategy::Token, MockBehavior::echo("-response")),
        );
        let mut router = router(&factory, open_store(&dir));

        let reply = router.send_message("hello", StreamHandlers::new()).await.unwrap();
        assert_eq!(reply, "hello-response");

        let stats = router.stats();
        assert_eq!(stats.failures(Strategy::Primary), 1);
        assert_eq!(stats.failures(Strategy::Token), 0);
        assert_eq!(stats.last_strategy, Some(Strategy::Token));
        assert_eq!(stats.total_calls, 1);
        assert_eq!(stats.successful_calls, 1);
        assert_eq!(factory.builds(Strategy::Browser), 0);
    }

    #[tokio::test]
    async fn test_breaker_resets_after_threshold_on_every_strategy() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(
            MockTransportFactory::new()
                .with(Strategy::Primary, MockBehavior::FailConnect)
                .with(Strategy::Token, MockBehavior::FailSend)
                .with(Strategy::Browser, MockBehavior::Empty),
        );
        let mut router = router(&factory, open_store(&dir));

        for expected in 1..=3 {
            let err = router.send_message("ping", StreamHandlers::new()).await.unwrap_err();
            assert_eq!(err.attempts().len(), 3);
            assert_eq!(failures(&router), [expected; 3]);
        }

        // 第 4 次调用：全部达到阈值，先整体清零再从 primary 开始
        let err = router.send_message("ping", StreamHandlers::new()).await.unwrap_err();
        assert_eq!(err.attempts()[0].strategy, Strategy::Primary);
        assert_eq!(failures(&router), [1, 1, 1]);
        assert_eq!(factory.builds(Strategy::Primary), 4);

        // Router 仍可用
        factory.set(Strategy::Primary, MockBehavior::echo("!"));
        assert_eq!(
            router.send_message("ping", StreamHandlers::new()).await.unwrap(),
            "ping!"
        );
        assert_eq!(failures(&router), [0, 1, 1]);
        assert_eq!(router.stats().total_calls, 5);
        assert_eq!(router.stats().successful_calls, 1);
    }

    #[tokio::test]
    async fn test_failures_are_reported_per_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(
            MockTransportFactory::new()
                .with(Strategy::Token, MockBehavior::FailSend)
                .with(Strategy::Browser, MockBehavior::Empty),
        );
        let mut router = router(&factory, open_store(&dir));

        let err = router.send_message("x", StreamHandlers::new()).await.unwrap_err();
        let kinds: Vec<_> = err
            .attempts()
            .iter()
            .map(|a| match a.error {
                TransportError::Connect(_) => "connect",
                TransportError::Send(_) => "send",
                TransportError::EmptyResponse => "empty",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, ["connect", "send", "empty"]);
    }

    #[tokio::test]
    async fn test_browser_success_persists_auth() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let captured = AuthBundle::captured_now(BTreeMap::new())
            .with_cookie("sid", "browser-cookie")
            .with("clientId", "c-9")
            .with("sessionId", "s-9");
        let factory = Arc::new(
            MockTransportFactory::new()
                .with(Strategy::Browser, MockBehavior::echo(" (via browser)"))
                .with_browser_auth(captured.clone()),
        );
        let mut router = router(&factory, Arc::clone(&store));
        assert!(!router.stats().has_auth);

        let reply = router.send_message("hi", StreamHandlers::new()).await.unwrap();
        assert_eq!(reply, "hi (via browser)");
        assert_eq!(store.get("user-1"), Some(captured.clone()));
        assert!(store.is_valid("user-1", Duration::from_secs(60)));
        assert!(router.stats().has_auth);

        // 新 Router 从存储加载凭据并交给 socket 传输
        router.close().await;
        factory.set(Strategy::Primary, MockBehavior::echo(""));
        let mut fresh = Router::new(
            "user-1",
            settings(),
            Arc::clone(&store),
            Arc::clone(&factory) as Arc<dyn TransportFactory>,
        );
        assert_eq!(fresh.send_message("again", StreamHandlers::new()).await.unwrap(), "again");
        assert_eq!(factory.seen_auth(Strategy::Primary), Some(captured));
    }

    #[tokio::test]
    async fn test_streaming_updates_precede_completion() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(
            MockTransportFactory::new()
                .with(Strategy::Primary, MockBehavior::reply(&["one ", "two ", "three"], None)),
        );
        let mut router = router(&factory, open_store(&dir));

        let events = Arc::new(Mutex::new(Vec::new()));
        let updates = Arc::clone(&events);
        let completes = Arc::clone(&events);
        let handlers = StreamHandlers::new()
            .on_update(move |c| updates.lock().unwrap().push(format!("u:{c}")))
            .on_complete(move |full| completes.lock().unwrap().push(format!("c:{full}")));

        let reply = router.send_message("count", handlers).await.unwrap();
        assert_eq!(reply, "one two three");
        assert_eq!(
            events.lock().unwrap().as_slice(),
            ["u:one ", "u:two ", "u:three", "c:one two three"]
        );
    }

    #[tokio::test]
    async fn test_registry_serves_users_independently() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(
            MockTransportFactory::new().with(Strategy::Token, MockBehavior::echo("-response")),
        );
        let registry = Arc::new(SessionRegistry::new(
            settings(),
            open_store(&dir),
            Arc::clone(&factory) as Arc<dyn TransportFactory>,
            Duration::from_secs(600),
        ));

        let (a, b) = tokio::join!(
            registry.send("alice", "a", StreamHandlers::new()),
            registry.send("bob", "b", StreamHandlers::new()),
        );
        assert_eq!(a.unwrap(), "a-response");
        assert_eq!(b.unwrap(), "b-response");
        assert_eq!(registry.stats("alice").await.unwrap().failures(Strategy::Primary), 1);
        assert_eq!(registry.stats("bob").await.unwrap().failures(Strategy::Primary), 1);

        registry.shutdown().await;
        assert!(registry.is_empty().await);
    }
}
