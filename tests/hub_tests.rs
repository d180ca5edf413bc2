//! Hub 集成测试

#[cfg(all(feature = "server", feature = "client"))]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use snitch_hub::{
        Action, ClientConfig, ConnectionRequest, Hub, HubClient, HubConfig, ListenAddr,
        NotificationAction, Order, QueryType, Rule, RuleDuration, SqliteStorage, Statistics,
        Storage,
    };
    use tempfile::TempDir;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;
    use tokio::time::{sleep, timeout, Instant};

    /// 在临时目录的 Unix Socket 上启动 Hub
    async fn start_hub(config: HubConfig) -> (Arc<Hub>, ListenAddr, TempDir) {
        let tmp = TempDir::new().unwrap();
        let config = HubConfig {
            data_dir: tmp.path().to_path_buf(),
            ..config
        }
        .with_listen(ListenAddr::Unix(tmp.path().join("hub.sock")));

        let hub = Arc::new(Hub::new(config).unwrap());
        let listener = hub.bind().await.unwrap();
        let listen = listener.local_addr().unwrap();
        {
            let hub = hub.clone();
            tokio::spawn(async move { hub.serve(listener).await.unwrap() });
        }
        (hub, listen, tmp)
    }

    fn node_config() -> ClientConfig {
        ClientConfig {
            name: "host1".to_string(),
            version: "1.0.1".to_string(),
            is_firewall_running: true,
            ..Default::default()
        }
    }

    fn curl() -> ConnectionRequest {
        ConnectionRequest {
            protocol: "tcp".to_string(),
            src_ip: "10.0.0.5".to_string(),
            src_port: 40022,
            dst_ip: "93.184.216.34".to_string(),
            dst_port: 443,
            user_id: 1000,
            process_id: 4242,
            process_path: "/usr/bin/curl".to_string(),
            ..Default::default()
        }
    }

    /// 轮询直到条件成立
    async fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not met in time");
            sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_subscribe_ping_disconnect() {
        let (hub, listen, _tmp) = start_hub(HubConfig::default().headless(true)).await;

        let mut node = HubClient::connect_to(listen.clone()).await.unwrap();
        let reply = node.subscribe(node_config()).await.unwrap();
        assert_eq!(reply, ClientConfig::default());
        assert_eq!(hub.registry().total(), 1);

        let stats = Statistics {
            connections: 5,
            dropped: 2,
            ..Default::default()
        };
        assert_eq!(node.ping(1, Some(stats)).await.unwrap(), 1);

        let mut operator = HubClient::connect_to(listen.clone()).await.unwrap();
        let summary = operator.query(QueryType::Summary).await.unwrap();
        assert_eq!(summary["fleet"]["nodes"], 1);
        assert_eq!(summary["fleet"]["connections"], 5);
        assert_eq!(summary["last_stats"]["dropped"], 2);

        // 通知流结束即下线
        let stream = HubClient::connect_to(listen).await.unwrap();
        let stream = stream.open_notifications().await.unwrap();
        drop(stream);

        let registry = hub.registry().clone();
        wait_until(|| registry.total() == 0).await;
        assert!(registry.get("unix:localhost").is_none());
    }

    #[tokio::test]
    async fn test_headless_curl_returns_immediately() {
        let (_hub, listen, _tmp) = start_hub(HubConfig::default().headless(true)).await;

        let mut node = HubClient::connect_to(listen).await.unwrap();
        node.subscribe(node_config()).await.unwrap();

        let rule = timeout(Duration::from_secs(1), node.ask_rule(curl()))
            .await
            .expect("headless AskRule must not wait")
            .unwrap();
        assert_eq!(rule.action, Action::Deny);
        assert_eq!(rule.duration, RuleDuration::Once);
        assert_eq!(rule.name, "curl-tcp-sport40022-dport443-deny");
        assert_eq!(rule.operator.data, "/usr/bin/curl");
    }

    #[tokio::test]
    async fn test_operator_decides() {
        let (_hub, listen, _tmp) = start_hub(HubConfig::default()).await;

        let asker = {
            let listen = listen.clone();
            tokio::spawn(async move {
                let mut node = HubClient::connect_to(listen).await.unwrap();
                node.subscribe(node_config()).await.unwrap();
                node.ask_rule(curl()).await.unwrap()
            })
        };

        let mut operator = HubClient::connect_to(listen.clone()).await.unwrap();
        let prompt = operator.next_connection().await.unwrap();
        assert_eq!(prompt.node, "unix:localhost");
        assert_eq!(prompt.connection.process_path, "/usr/bin/curl");

        let status = operator.query(QueryType::Status).await.unwrap();
        assert_eq!(status["pending"]["id"], prompt.id);
        assert_eq!(status["pending"]["state"], "AwaitingDecision");

        let decision = Rule::for_connection(&prompt.connection, Action::Allow, RuleDuration::Always);
        operator
            .resolve_connection(prompt.id, decision.clone())
            .await
            .unwrap();

        let rule = asker.await.unwrap();
        assert_eq!(rule, decision);

        // 同一裁决再次提交被拒绝
        let err = operator
            .resolve_connection(prompt.id, decision)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("410"));
    }

    #[tokio::test]
    async fn test_operator_disconnect_frees_consumer() {
        let (_hub, listen, _tmp) = start_hub(HubConfig::default()).await;
        let path = listen.socket_path().unwrap().clone();

        // 第一个操作员发出 NextConnection 后直接断开
        {
            let mut stream = UnixStream::connect(&path).await.unwrap();
            stream
                .write_all(b"{\"type\":\"NextConnection\"}\n")
                .await
                .unwrap();
            sleep(Duration::from_millis(50)).await;
        }

        let operator = {
            let listen = listen.clone();
            tokio::spawn(async move {
                let mut operator = HubClient::connect_to(listen).await.unwrap();
                let deadline = Instant::now() + Duration::from_secs(5);
                loop {
                    match operator.next_connection().await {
                        Ok(prompt) => return (operator, prompt),
                        Err(e) => {
                            assert!(e.to_string().contains("409"), "{}", e);
                            assert!(Instant::now() < deadline, "consumer never released");
                            sleep(Duration::from_millis(20)).await;
                        }
                    }
                }
            })
        };

        let mut node = HubClient::connect_to(listen).await.unwrap();
        node.subscribe(node_config()).await.unwrap();
        let asker = tokio::spawn(async move { node.ask_rule(curl()).await.unwrap() });

        let (mut operator, prompt) = timeout(Duration::from_secs(5), operator)
            .await
            .expect("second operator must receive the prompt")
            .unwrap();
        assert_eq!(prompt.connection.process_path, "/usr/bin/curl");

        let decision = Rule::for_connection(&prompt.connection, Action::Allow, RuleDuration::Once);
        operator
            .resolve_connection(prompt.id, decision.clone())
            .await
            .unwrap();
        assert_eq!(asker.await.unwrap(), decision);
    }

    #[tokio::test]
    async fn test_ask_rule_timeout_falls_back() {
        let config = HubConfig {
            ask_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let (_hub, listen, _tmp) = start_hub(config).await;

        let mut node = HubClient::connect_to(listen).await.unwrap();
        let start = Instant::now();
        let rule = node.ask_rule(curl()).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(rule.action, Action::Deny);
    }

    #[tokio::test]
    async fn test_firewall_broadcast_reaches_stream() {
        let (hub, listen, _tmp) = start_hub(HubConfig::default().headless(true)).await;

        let mut node = HubClient::connect_to(listen.clone()).await.unwrap();
        node.subscribe(node_config()).await.unwrap();
        let mut stream = HubClient::connect_to(listen.clone())
            .await
            .unwrap()
            .open_notifications()
            .await
            .unwrap();

        let registry = hub.registry().clone();
        wait_until(|| registry.get("unix:localhost").is_some_and(|s| s.has_stream())).await;

        let mut operator = HubClient::connect_to(listen).await.unwrap();
        let (delivered, failed) = operator
            .firewall(NotificationAction::LoadFirewall)
            .await
            .unwrap();
        assert_eq!((delivered, failed), (1, 0));

        let notification = stream.recv_push().await.unwrap().unwrap();
        assert_eq!(notification.action, NotificationAction::LoadFirewall);
        stream.reply(notification.id, 0, "ok").await.unwrap();

        let nodes = operator.query(QueryType::Nodes).await.unwrap();
        assert_eq!(nodes[0]["has_stream"], true);
    }

    #[tokio::test]
    async fn test_notifications_without_subscribe() {
        let (_hub, listen, _tmp) = start_hub(HubConfig::default().headless(true)).await;

        let mut stream = HubClient::connect_to(listen)
            .await
            .unwrap()
            .open_notifications()
            .await
            .unwrap();
        let err = stream.recv_push().await.unwrap_err();
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn test_invalid_json_keeps_connection() {
        let (_hub, listen, _tmp) = start_hub(HubConfig::default().headless(true)).await;
        let path = listen.socket_path().unwrap().clone();

        let stream = UnixStream::connect(path).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        writer.write_all(b"{not json}\n").await.unwrap();
        let line = lines.next_line().await.unwrap().unwrap();
        assert!(line.contains("\"code\":400"));

        writer.write_all(b"{\"type\":\"Heartbeat\"}\n").await.unwrap();
        let line = lines.next_line().await.unwrap().unwrap();
        assert_eq!(line, r#"{"type":"Ok"}"#);
    }

    #[tokio::test]
    async fn test_persistence_is_written() {
        let db_dir = TempDir::new().unwrap();
        let db_path = db_dir.path().join("hub.db");
        let (_hub, listen, _tmp) =
            start_hub(HubConfig::default().headless(true).with_db(db_path.clone())).await;

        let mut node = HubClient::connect_to(listen).await.unwrap();
        node.subscribe(node_config()).await.unwrap();
        node.ask_rule(curl()).await.unwrap();
        node.ping(
            1,
            Some(Statistics {
                connections: 3,
                ..Default::default()
            }),
        )
        .await
        .unwrap();

        // 写库按提交顺序执行，统计可见时此前的写入都已完成
        let storage = SqliteStorage::open(&db_path).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let nodes = storage.get_node_stats().unwrap();
            let rules = storage.get_rules(Order::Asc, 10).unwrap();
            let stats_written = nodes
                .first()
                .and_then(|n| n.statistics.as_ref())
                .is_some_and(|s| s.connections == 3);
            if stats_written {
                assert_eq!(nodes[0].name, "host1");
                // 无人值守的兜底规则不落库
                assert!(rules.is_empty());
                break;
            }
            assert!(Instant::now() < deadline, "persistence not observed");
            sleep(Duration::from_millis(20)).await;
        }
    }
}
