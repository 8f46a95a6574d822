//! End-to-end tests: a real proxy on a loopback port, real provider
//! processes (the `demo-provider` binary), and a line-based TCP client.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use tool_proxy::backend::{ConnectionState, ProviderSpec};
use tool_proxy::catalog::{CatalogAggregator, QualifiedName};
use tool_proxy::config::ProxyConfig;
use tool_proxy::Proxy;

const READ_TIMEOUT: Duration = Duration::from_secs(10);

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn demo(label: &str) -> ProviderSpec {
    let mut env = HashMap::new();
    env.insert("DEMO_PROVIDER_LABEL".to_string(), label.to_string());
    ProviderSpec {
        name: String::new(),
        command: env!("CARGO_BIN_EXE_demo-provider").to_string(),
        args: vec![],
        env,
        cwd: None,
    }
}

fn demo_with(label: &str, flag: &str) -> ProviderSpec {
    let mut spec = demo(label);
    spec.args = vec![flag.to_string()];
    spec
}

fn missing() -> ProviderSpec {
    ProviderSpec {
        name: String::new(),
        command: "/nonexistent/tool-provider".to_string(),
        args: vec![],
        env: HashMap::new(),
        cwd: None,
    }
}

fn config(providers: Vec<(&str, ProviderSpec)>) -> ProxyConfig {
    ProxyConfig {
        listen: "127.0.0.1:0".to_string(),
        discovery_timeout_ms: 5_000,
        invocation_timeout_ms: None,
        session_queue_capacity: 16,
        providers: providers
            .into_iter()
            .map(|(name, spec)| (name.to_string(), spec))
            .collect::<BTreeMap<_, _>>(),
    }
}

struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    /// Connect and consume the initial snapshot.
    async fn connect(proxy: &Proxy) -> (Self, Value) {
        let stream = TcpStream::connect(proxy.local_addr()).await.unwrap();
        let (reader, writer) = stream.into_split();
        let mut client = Self {
            lines: BufReader::new(reader).lines(),
            writer,
        };
        let snapshot = client.next_of_type("capabilities_snapshot").await;
        (client, snapshot)
    }

    async fn send(&mut self, message: Value) {
        self.send_raw(&message.to_string()).await;
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn invoke(&mut self, provider: &str, name: &str, arguments: Value, id: &str) {
        self.send(json!({
            "type": "invoke_capability",
            "provider": provider,
            "name": name,
            "arguments": arguments,
            "correlation_id": id,
        }))
        .await;
    }

    /// Next message, or `None` on EOF.
    async fn next(&mut self) -> Option<Value> {
        let line = tokio::time::timeout(READ_TIMEOUT, self.lines.next_line())
            .await
            .expect("timed out waiting for the proxy")
            .unwrap()?;
        Some(serde_json::from_str(&line).unwrap())
    }

    /// Next message of the given type, skipping pushed snapshots and others.
    async fn next_of_type(&mut self, kind: &str) -> Value {
        loop {
            let message = self.next().await.expect("connection closed");
            if message["type"] == kind {
                return message;
            }
        }
    }

    async fn list(&mut self) -> Value {
        self.send(json!({"type": "list_capabilities"})).await;
        self.next_of_type("capabilities_snapshot").await
    }
}

fn qualified_names(snapshot: &Value) -> Vec<String> {
    snapshot["capabilities"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| format!("{}.{}", c["provider"].as_str().unwrap(), c["name"].as_str().unwrap()))
        .collect()
}

fn result_text(result: &Value) -> &str {
    result["result"]["content"][0]["text"].as_str().unwrap()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn launch_failure_leaves_other_providers_serving() {
    let proxy = Proxy::start(&config(vec![("a", demo("alpha")), ("broken", missing())]))
        .await
        .unwrap();

    let states: BTreeMap<_, _> = proxy.aggregator().connection_states().into_iter().collect();
    assert_eq!(states["a"], ConnectionState::Ready);
    assert_eq!(states["broken"], ConnectionState::Failed);

    let (mut client, snapshot) = Client::connect(&proxy).await;
    let names = qualified_names(&snapshot);
    assert_eq!(names.len(), 5);
    assert!(names.iter().all(|n| n.starts_with("a.")));

    client.invoke("a", "echo", json!({"text": "hi"}), "e1").await;
    let result = client.next_of_type("capability_result").await;
    assert_eq!(result["success"], true);
    assert_eq!(result_text(&result), "hi");

    proxy.shutdown().await;
}

#[tokio::test]
async fn unknown_capability_answers_under_same_id() {
    let proxy = Proxy::start(&config(vec![("a", demo("alpha"))])).await.unwrap();
    let (mut client, _) = Client::connect(&proxy).await;

    client.invoke("a", "does_not_exist", json!({}), "u-7").await;
    let result = client.next_of_type("capability_result").await;
    assert_eq!(result["correlation_id"], "u-7");
    assert_eq!(result["success"], false);
    assert_eq!(result["error_kind"], "unknown_capability_error");

    client.invoke("ghost", "echo", json!({"text": "x"}), "u-8").await;
    let result = client.next_of_type("capability_result").await;
    assert_eq!(result["correlation_id"], "u-8");
    assert_eq!(result["error_kind"], "unknown_capability_error");

    proxy.shutdown().await;
}

#[tokio::test]
async fn concurrent_calls_return_under_their_own_ids() {
    let proxy = Proxy::start(&config(vec![("a", demo("alpha")), ("b", demo("beta"))]))
        .await
        .unwrap();
    let (mut client, _) = Client::connect(&proxy).await;

    client.invoke("a", "sleep", json!({"ms": 600}), "slow").await;
    client.invoke("a", "sleep", json!({"ms": 10}), "fast").await;
    client.invoke("b", "echo", json!({"text": "from b"}), "other").await;

    let mut seen = Vec::new();
    let mut texts = HashMap::new();
    for _ in 0..3 {
        let result = client.next_of_type("capability_result").await;
        assert_eq!(result["success"], true, "{result}");
        let id = result["correlation_id"].as_str().unwrap().to_string();
        texts.insert(id.clone(), result_text(&result).to_string());
        seen.push(id);
    }

    assert_eq!(seen.last().map(String::as_str), Some("slow"));
    assert_eq!(texts["slow"], "slept 600ms");
    assert_eq!(texts["fast"], "slept 10ms");
    assert_eq!(texts["other"], "from b");

    proxy.shutdown().await;
}

#[tokio::test]
async fn same_local_name_routes_by_provider() {
    let proxy = Proxy::start(&config(vec![("a", demo("alpha")), ("b", demo("beta"))]))
        .await
        .unwrap();
    let (mut client, snapshot) = Client::connect(&proxy).await;

    let names = qualified_names(&snapshot);
    assert!(names.contains(&"a.read_file".to_string()));
    assert!(names.contains(&"b.read_file".to_string()));

    client.invoke("b", "read_file", json!({"path": "/etc/hosts"}), "rb").await;
    let result = client.next_of_type("capability_result").await;
    assert_eq!(result["provider"], "b");
    assert_eq!(result_text(&result), "beta:/etc/hosts");

    client.invoke("a", "read_file", json!({"path": "/etc/hosts"}), "ra").await;
    let result = client.next_of_type("capability_result").await;
    assert_eq!(result["provider"], "a");
    assert_eq!(result_text(&result), "alpha:/etc/hosts");

    proxy.shutdown().await;
}

#[tokio::test]
async fn disconnect_with_pending_calls_is_harmless() {
    let proxy = Proxy::start(&config(vec![("a", demo("alpha"))])).await.unwrap();

    let (mut client, _) = Client::connect(&proxy).await;
    for id in ["p1", "p2", "p3"] {
        client.invoke("a", "sleep", json!({"ms": 300}), id).await;
    }
    drop(client);

    // Let the abandoned results arrive and be discarded.
    tokio::time::sleep(Duration::from_millis(600)).await;

    let (mut client, _) = Client::connect(&proxy).await;
    client.invoke("a", "echo", json!({"text": "still here"}), "p1").await;
    let result = client.next_of_type("capability_result").await;
    assert_eq!(result["correlation_id"], "p1");
    assert_eq!(result_text(&result), "still here");
    assert_eq!(proxy.aggregator().ready_count(), 1);

    proxy.shutdown().await;
}

#[tokio::test]
async fn crashed_provider_leaves_catalog_but_sessions_stay() {
    let proxy = Proxy::start(&config(vec![("a", demo("alpha")), ("b", demo("beta"))]))
        .await
        .unwrap();
    let (mut client, snapshot) = Client::connect(&proxy).await;
    assert_eq!(qualified_names(&snapshot).len(), 10);

    client.invoke("a", "crash", json!({}), "boom").await;
    let result = client.next_of_type("capability_result").await;
    assert_eq!(result["correlation_id"], "boom");
    assert_eq!(result["success"], false);
    assert_eq!(result["error_kind"], "invocation_error");

    let mut names = Vec::new();
    for _ in 0..50 {
        names = qualified_names(&client.list().await);
        if names.iter().all(|n| n.starts_with("b.")) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(names.len(), 5, "{names:?}");
    assert!(names.iter().all(|n| n.starts_with("b.")));

    client.invoke("a", "echo", json!({"text": "x"}), "gone").await;
    let result = client.next_of_type("capability_result").await;
    assert_eq!(result["error_kind"], "unknown_capability_error");

    client.invoke("b", "echo", json!({"text": "alive"}), "live").await;
    let result = client.next_of_type("capability_result").await;
    assert_eq!(result_text(&result), "alive");

    proxy.shutdown().await;
}

#[tokio::test]
async fn crashed_provider_stays_failed_after_exit() {
    for _ in 0..5 {
        let proxy = Proxy::start(&config(vec![("a", demo("alpha"))])).await.unwrap();
        let conn = proxy.aggregator().backend("a").unwrap();
        let mut states = conn.subscribe_state();
        let (mut client, _) = Client::connect(&proxy).await;

        client.invoke("a", "crash", json!({}), "boom").await;
        client.next_of_type("capability_result").await;
        tokio::time::timeout(READ_TIMEOUT, states.wait_for(|s| *s == ConnectionState::Failed))
            .await
            .unwrap()
            .unwrap();

        // Give the exit watcher time to report the status 3 exit.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(conn.state(), ConnectionState::Failed);

        proxy.shutdown().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
    }
}

#[tokio::test]
async fn unanswered_tool_list_fails_only_that_provider() {
    let mut cfg = config(vec![
        ("a", demo("alpha")),
        ("stuck", demo_with("stuck", "--hang-tools-list")),
    ]);
    cfg.discovery_timeout_ms = 500;
    let aggregator = CatalogAggregator::new(cfg.provider_specs(), cfg.connection_settings());

    let errors = aggregator.start_all().await;
    assert_eq!(errors.len(), 1);
    let (provider, error) = &errors[0];
    assert_eq!(provider, "stuck");
    assert_eq!(error.kind(), "capability_list_error");
    assert!(error.to_string().contains("timed out"), "{error}");

    let states: BTreeMap<_, _> = aggregator.connection_states().into_iter().collect();
    assert_eq!(states["a"], ConnectionState::Ready);
    // Closing its stdin lets the provider exit cleanly, which may already
    // have moved it on from failed to closed.
    assert!(
        matches!(states["stuck"], ConnectionState::Failed | ConnectionState::Closed),
        "{:?}",
        states["stuck"]
    );

    let catalog = aggregator.get();
    assert_eq!(catalog.tools_for_provider("stuck"), 0);
    assert_eq!(catalog.tools_for_provider("a"), 5);
    assert!(catalog.get(&QualifiedName::new("a", "echo")).is_some());

    aggregator.shutdown_all().await;
}

#[tokio::test]
async fn tool_list_change_is_pushed_to_clients() {
    let proxy = Proxy::start(&config(vec![("d", demo_with("dyn", "--dynamic"))]))
        .await
        .unwrap();
    let (mut client, snapshot) = Client::connect(&proxy).await;
    let names = qualified_names(&snapshot);
    assert!(names.contains(&"d.grow".to_string()));
    assert!(!names.contains(&"d.grown".to_string()));

    client.invoke("d", "grow", json!({}), "g1").await;

    let mut pushed = Vec::new();
    let mut result = None;
    while result.is_none() || !pushed.contains(&"d.grown".to_string()) {
        let message = client.next().await.expect("connection closed");
        match message["type"].as_str() {
            Some("capability_result") => result = Some(message),
            Some("capabilities_snapshot") => pushed = qualified_names(&message),
            _ => {}
        }
    }
    assert_eq!(result.map(|r| r["success"].clone()), Some(json!(true)));
    assert_eq!(proxy.aggregator().backend("d").unwrap().state(), ConnectionState::Ready);

    client.invoke("d", "grown", json!({}), "g2").await;
    let result = client.next_of_type("capability_result").await;
    assert_eq!(result_text(&result), "new tool");

    proxy.shutdown().await;
}

#[tokio::test]
async fn invocation_ceiling_reports_timeout() {
    let mut cfg = config(vec![("a", demo("alpha"))]);
    cfg.invocation_timeout_ms = Some(100);
    let proxy = Proxy::start(&cfg).await.unwrap();
    let (mut client, _) = Client::connect(&proxy).await;

    client.invoke("a", "sleep", json!({"ms": 2000}), "t1").await;
    let result = client.next_of_type("capability_result").await;
    assert_eq!(result["correlation_id"], "t1");
    assert_eq!(result["success"], false);
    assert_eq!(result["error_kind"], "invocation_timeout_error");

    proxy.shutdown().await;
}

#[tokio::test]
async fn tool_errors_and_missing_arguments_are_reported() {
    let proxy = Proxy::start(&config(vec![("a", demo("alpha"))])).await.unwrap();
    let (mut client, _) = Client::connect(&proxy).await;

    client.invoke("a", "fail", json!({}), "f1").await;
    let result = client.next_of_type("capability_result").await;
    assert_eq!(result["success"], false);
    assert_eq!(result["error_kind"], "invocation_error");
    assert_eq!(result["error"], "deliberate failure");

    client.invoke("a", "echo", json!({}), "f2").await;
    let result = client.next_of_type("capability_result").await;
    assert_eq!(result["correlation_id"], "f2");
    assert_eq!(result["error_kind"], "invalid_arguments_error");

    proxy.shutdown().await;
}

#[tokio::test]
async fn duplicate_in_flight_id_is_rejected() {
    let proxy = Proxy::start(&config(vec![("a", demo("alpha"))])).await.unwrap();
    let (mut client, _) = Client::connect(&proxy).await;

    client.invoke("a", "sleep", json!({"ms": 300}), "dup").await;
    client.invoke("a", "echo", json!({"text": "second"}), "dup").await;

    let error = client.next_of_type("error").await;
    assert_eq!(error["correlation_id"], "dup");

    let result = client.next_of_type("capability_result").await;
    assert_eq!(result["correlation_id"], "dup");
    assert_eq!(result_text(&result), "slept 300ms");

    proxy.shutdown().await;
}

#[tokio::test]
async fn bad_requests_keep_session_open_but_garbage_closes_it() {
    let proxy = Proxy::start(&config(vec![("a", demo("alpha"))])).await.unwrap();
    let (mut client, _) = Client::connect(&proxy).await;

    client.send(json!({"type": "subscribe_everything"})).await;
    let error = client.next_of_type("error").await;
    assert!(error["message"].as_str().unwrap().contains("subscribe_everything"));

    client.send(json!({"type": "invoke_capability", "provider": "a"})).await;
    client.next_of_type("error").await;

    client.send(json!({"type": "set_subscription", "enabled": false})).await;
    let snapshot = client.list().await;
    assert_eq!(qualified_names(&snapshot).len(), 5);

    client.send_raw("this is not json").await;
    let error = client.next_of_type("error").await;
    assert!(error["message"].as_str().unwrap().starts_with("malformed request"));
    assert!(client.next().await.is_none());

    proxy.shutdown().await;
}

#[tokio::test]
async fn provider_without_tools_list_uses_handshake_tools() {
    let mut legacy = demo("old");
    legacy.args = vec!["--legacy".to_string()];
    let proxy = Proxy::start(&config(vec![("old", legacy)])).await.unwrap();

    let (mut client, snapshot) = Client::connect(&proxy).await;
    assert_eq!(qualified_names(&snapshot).len(), 5);

    client.invoke("old", "read_file", json!({"path": "/x"}), "l1").await;
    let result = client.next_of_type("capability_result").await;
    assert_eq!(result_text(&result), "old:/x");

    proxy.shutdown().await;
}

#[tokio::test]
async fn snapshot_carries_normalized_schemas() {
    let proxy = Proxy::start(&config(vec![("a", demo("alpha"))])).await.unwrap();
    let (_client, snapshot) = Client::connect(&proxy).await;

    let sleep = snapshot["capabilities"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["name"] == "sleep")
        .unwrap();
    assert_eq!(sleep["description"], "");
    assert_eq!(sleep["input_schema"]["properties"]["tags"]["items"]["type"], "string");
    assert_eq!(sleep["input_schema"]["required"], json!([]));

    proxy.shutdown().await;
}
