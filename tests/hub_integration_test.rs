//! End-to-end exercises over a fully wired hub: real registry connects, real
//! router, OpenAPI upstreams served by wiremock.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mcphub::Config;
use mcphub::cluster::coordinator_from_config;
use mcphub::config::{CoordinatorConfig, CoordinatorKind};
use mcphub::dispatch::Dispatcher;
use mcphub::dispatch::smart::LexicalToolSearch;
use mcphub::http::session::SessionTable;
use mcphub::http::{AppState, build_router};
use mcphub::model::{ConnectionMode, GroupConfig, GroupMember, ToolSelection, UpstreamKind};
use mcphub::storage::MemorySettingsRepository;
use mcphub::upstream::UpstreamRegistry;
use mcphub::{UpstreamConfig, UpstreamStatus};

fn time_schema(server_url: &str) -> Value {
    json!({
        "openapi": "3.0.0",
        "info": {"title": "time", "version": "1.0.0"},
        "servers": [{"url": server_url}],
        "paths": {
            "/now": {
                "get": {"operationId": "now", "summary": "Get the current time"}
            },
            "/zone": {
                "get": {"operationId": "zone", "summary": "Convert a timestamp between timezones"}
            }
        }
    })
}

async fn mount_time_endpoints(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/now"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"time": "12:00:00Z"})))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/zone"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"offset": "+02:00"})))
        .mount(server)
        .await;
}

struct Hub {
    app: axum::Router,
    state: AppState,
}

async fn build_hub(configure: impl FnOnce(&mut Config)) -> Hub {
    let mut config = Config::default();
    configure(&mut config);
    let config = Arc::new(config);

    let search = Arc::new(LexicalToolSearch::new());
    let registry = UpstreamRegistry::new(
        &config,
        Arc::new(MemorySettingsRepository::new()),
        search.clone(),
    );
    registry.register_all(None).await.unwrap();

    let coordinator = coordinator_from_config(&config).unwrap();
    if let Some(coordinator) = &coordinator {
        coordinator.initialize().await.unwrap();
    }

    let sessions = SessionTable::new(coordinator.clone());
    registry.set_listener(sessions.clone());

    let state = AppState {
        config: config.clone(),
        registry: registry.clone(),
        dispatcher: Arc::new(Dispatcher::new(registry, config, search)),
        sessions,
        coordinator,
    };

    Hub {
        app: build_router(state.clone()),
        state,
    }
}

fn rpc(method: &str, id: u64, params: Value) -> String {
    json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}).to_string()
}

async fn post_mcp(hub: &Hub, uri: &str, session: Option<&str>, body: String) -> (StatusCode, Value, Option<String>) {
    let mut request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(session) = session {
        request = request.header("mcp-session-id", session);
    }

    let response = hub
        .app
        .clone()
        .oneshot(request.body(Body::from(body)).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let session_id = response
        .headers()
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let body: Value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body, session_id)
}

async fn open_session(hub: &Hub, uri: &str) -> String {
    let (status, _, session) = post_mcp(hub, uri, None, rpc("initialize", 1, json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    session.expect("initialize returns a session id")
}

fn tool_names(body: &Value) -> Vec<String> {
    body["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap().to_string())
        .collect()
}

/// Seed #1: one upstream named `time` with tool `now`; a global session sees
/// `time-now` and calling it returns the upstream's raw result.
#[tokio::test]
async fn direct_call_through_the_hub() {
    let server = MockServer::start().await;
    mount_time_endpoints(&server).await;

    let hub = build_hub(|config| {
        config.mcp_servers.insert(
            "time".into(),
            UpstreamConfig {
                kind: Some(UpstreamKind::OpenApi),
                schema: Some(time_schema(&server.uri())),
                ..Default::default()
            },
        );
    })
    .await;

    assert!(hub.state.registry.healthy());

    let session = open_session(&hub, "/mcp").await;

    let (status, listed, _) =
        post_mcp(&hub, "/mcp", Some(&session), rpc("tools/list", 2, json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    let names = tool_names(&listed);
    assert!(names.contains(&"time-now".to_string()));
    assert!(names.contains(&"time-zone".to_string()));

    let (status, result, _) = post_mcp(
        &hub,
        "/mcp",
        Some(&session),
        rpc("tools/call", 3, json!({"name": "time-now", "arguments": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let text = result["result"]["content"][0]["text"].as_str().unwrap();
    assert!(text.contains("12:00:00Z"));
}

/// Seed #2: a group clause `{time, tools: [now]}` hides `zone` even though
/// the upstream exposes it.
#[tokio::test]
async fn group_clause_filters_the_catalog() {
    let server = MockServer::start().await;
    mount_time_endpoints(&server).await;

    let hub = build_hub(|config| {
        config.mcp_servers.insert(
            "time".into(),
            UpstreamConfig {
                kind: Some(UpstreamKind::OpenApi),
                schema: Some(time_schema(&server.uri())),
                ..Default::default()
            },
        );
        config.groups.push(GroupConfig {
            name: "ops".into(),
            servers: vec![GroupMember {
                name: "time".into(),
                tools: ToolSelection::Named(vec!["now".into()]),
            }],
        });
    })
    .await;

    let session = open_session(&hub, "/mcp/ops").await;
    let (_, listed, _) =
        post_mcp(&hub, "/mcp/ops", Some(&session), rpc("tools/list", 2, json!({}))).await;
    assert_eq!(tool_names(&listed), vec!["time-now".to_string()]);

    // the hidden tool is not callable either
    let (_, result, _) = post_mcp(
        &hub,
        "/mcp/ops",
        Some(&session),
        rpc("tools/call", 3, json!({"name": "time-zone", "arguments": {}})),
    )
    .await;
    assert!(result["error"]["message"].as_str().unwrap().contains("time-zone"));
}

/// Seed #3: a `$smart` session sees exactly the two meta tools; search for
/// "current time" resolves `time-now` at threshold 0.2.
#[tokio::test]
async fn smart_discovery_surface() {
    let server = MockServer::start().await;
    mount_time_endpoints(&server).await;

    let hub = build_hub(|config| {
        config.mcp_servers.insert(
            "time".into(),
            UpstreamConfig {
                kind: Some(UpstreamKind::OpenApi),
                schema: Some(time_schema(&server.uri())),
                ..Default::default()
            },
        );
    })
    .await;

    let session = open_session(&hub, "/mcp/$smart").await;

    let (_, listed, _) = post_mcp(
        &hub,
        "/mcp/$smart",
        Some(&session),
        rpc("tools/list", 2, json!({})),
    )
    .await;
    assert_eq!(
        tool_names(&listed),
        vec!["search_tools".to_string(), "call_tool".to_string()]
    );

    let (_, search, _) = post_mcp(
        &hub,
        "/mcp/$smart",
        Some(&session),
        rpc(
            "tools/call",
            3,
            json!({"name": "search_tools", "arguments": {"query": "current time", "limit": 3}}),
        ),
    )
    .await;

    let result = &search["result"];
    assert_eq!(result["metadata"]["threshold"], 0.2);
    let hits = result["tools"].as_array().unwrap();
    assert!(!hits.is_empty());
    assert_eq!(hits[0]["name"], "time-now");
    assert!(hits[0]["description"].as_str().unwrap().contains("time"));

    // and the meta call_tool reaches the same upstream as a direct call
    let (_, meta, _) = post_mcp(
        &hub,
        "/mcp/$smart",
        Some(&session),
        rpc(
            "tools/call",
            4,
            json!({"name": "call_tool", "arguments": {"toolName": "time-now", "arguments": {}}}),
        ),
    )
    .await;
    let text = meta["result"]["content"][0]["text"].as_str().unwrap();
    assert!(text.contains("12:00:00Z"));
}

/// On-demand upstreams keep no connection but stay callable through JIT
/// dials; their catalog is published from registration time.
#[tokio::test]
async fn on_demand_upstreams_dial_per_call() {
    let server = MockServer::start().await;
    mount_time_endpoints(&server).await;

    let hub = build_hub(|config| {
        config.mcp_servers.insert(
            "time".into(),
            UpstreamConfig {
                kind: Some(UpstreamKind::OpenApi),
                schema: Some(time_schema(&server.uri())),
                connection_mode: ConnectionMode::OnDemand,
                ..Default::default()
            },
        );
    })
    .await;

    // catalog loaded, no live connection, still healthy
    let infos = hub.state.registry.infos();
    assert_eq!(infos[0].status, UpstreamStatus::Disconnected);
    assert_eq!(infos[0].tool_count, 2);
    assert!(hub.state.registry.healthy());

    let session = open_session(&hub, "/mcp").await;
    let (_, result, _) = post_mcp(
        &hub,
        "/mcp",
        Some(&session),
        rpc("tools/call", 2, json!({"name": "time-now", "arguments": {}})),
    )
    .await;
    let text = result["result"]["content"][0]["text"].as_str().unwrap();
    assert!(text.contains("12:00:00Z"));
}

/// Sessions stick to the node that minted them: the coordinator carries the
/// binding for every downstream frame.
#[tokio::test]
async fn cluster_records_session_affinity() {
    let server = MockServer::start().await;
    mount_time_endpoints(&server).await;

    let hub = build_hub(|config| {
        config.mcp_servers.insert(
            "time".into(),
            UpstreamConfig {
                kind: Some(UpstreamKind::OpenApi),
                schema: Some(time_schema(&server.uri())),
                ..Default::default()
            },
        );
        config.coordinator = Some(CoordinatorConfig {
            kind: CoordinatorKind::Memory,
            redis_url: None,
            prefix: "mcphub".into(),
            heartbeat_interval: 10,
            offline_after_ms: 45_000,
            base_url: Some("http://127.0.0.1:3000".into()),
            node_id: Some("node-test".into()),
            session_ttl_seconds: None,
        });
    })
    .await;

    let session = open_session(&hub, "/mcp/ops").await;

    let coordinator = hub.state.coordinator.clone().unwrap();
    let record = coordinator.get_session(&session).await.unwrap().unwrap();
    assert_eq!(record.node_id, "node-test");

    // repeated frames keep landing locally and succeed
    for id in 2..5 {
        let (status, _, _) = post_mcp(
            &hub,
            "/mcp/ops",
            Some(&session),
            rpc("tools/list", id, json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    // termination clears the binding
    let response = hub
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/mcp/ops")
                .header("mcp-session-id", &session)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert!(coordinator.get_session(&session).await.unwrap().is_none());
}

/// A broken upstream config surfaces as a disconnected upstream with an
/// error, and /health degrades.
#[tokio::test]
async fn config_errors_degrade_health() {
    let hub = build_hub(|config| {
        config.mcp_servers.insert(
            "broken".into(),
            UpstreamConfig {
                kind: Some(UpstreamKind::OpenApi),
                // no schema and no url: rejected at registration, not retried
                url: Some("http://127.0.0.1:1/openapi.json".into()),
                ..Default::default()
            },
        );
    })
    .await;

    let infos = hub.state.registry.infos();
    assert_eq!(infos[0].status, UpstreamStatus::Disconnected);
    assert!(infos[0].last_error.is_some());
    assert!(!hub.state.registry.healthy());

    let response = hub
        .app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
