use std::borrow::Cow;

use rmcp::model::Tool;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::*;
use crate::model::{GroupMember, ToolSelection, UpstreamConfig, UpstreamStatus};
use crate::storage::MemorySettingsRepository;
use crate::upstream::transport::UpstreamTransport;
use crate::upstream::openapi::OpenApiClient;
use smart::{IndexedTool, LexicalToolSearch};

fn tool(name: &str, description: &str) -> Tool {
    Tool::new(
        Cow::Owned(name.to_string()),
        Cow::Owned(description.to_string()),
        std::sync::Arc::new(
            json!({"type": "object", "properties": {}})
                .as_object()
                .unwrap()
                .clone(),
        ),
    )
}

struct Fixture {
    dispatcher: Dispatcher,
    registry: Arc<UpstreamRegistry>,
}

async fn fixture() -> Fixture {
    let mut config = Config::default();
    config.mcp_servers.insert(
        "time".into(),
        UpstreamConfig {
            name: "time".into(),
            url: Some("https://time.example.com/mcp".into()),
            ..Default::default()
        },
    );
    config.mcp_servers.insert(
        "weather".into(),
        UpstreamConfig {
            name: "weather".into(),
            url: Some("https://weather.example.com/mcp".into()),
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

    let config = Arc::new(config);
    let search = Arc::new(LexicalToolSearch::new());
    let registry = UpstreamRegistry::new(
        &config,
        Arc::new(MemorySettingsRepository::new()),
        search.clone(),
    );

    registry.insert_test_upstream(
        UpstreamConfig {
            name: "time".into(),
            url: Some("https://time.example.com/mcp".into()),
            ..Default::default()
        },
        UpstreamStatus::Connected,
        vec![
            tool("now", "Get the current time"),
            tool("zone", "Convert between timezones"),
        ],
        vec![],
    );
    registry.insert_test_upstream(
        UpstreamConfig {
            name: "weather".into(),
            url: Some("https://weather.example.com/mcp".into()),
            ..Default::default()
        },
        UpstreamStatus::Connected,
        vec![tool("forecast", "Weather forecast for a city")],
        vec![],
    );

    search
        .index(
            "time",
            &[
                IndexedTool {
                    name: "now".into(),
                    description: "Get the current time".into(),
                },
                IndexedTool {
                    name: "zone".into(),
                    description: "Convert between timezones".into(),
                },
            ],
        )
        .await;
    search
        .index(
            "weather",
            &[IndexedTool {
                name: "forecast".into(),
                description: "Weather forecast for a city".into(),
            }],
        )
        .await;

    Fixture {
        dispatcher: Dispatcher::new(registry.clone(), config, search),
        registry,
    }
}

fn names(tools: &[Value]) -> Vec<String> {
    tools
        .iter()
        .map(|t| t["name"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn global_scope_lists_prefixed_union() {
    let f = fixture().await;
    let tools = f
        .dispatcher
        .list_tools(&RequestScope::new("", None))
        .await
        .unwrap();

    let names = names(&tools);
    assert!(names.contains(&"time-now".to_string()));
    assert!(names.contains(&"time-zone".to_string()));
    assert!(names.contains(&"weather-forecast".to_string()));
}

#[tokio::test]
async fn group_scope_projects_member_tool_clauses() {
    let f = fixture().await;
    let tools = f
        .dispatcher
        .list_tools(&RequestScope::new("ops", None))
        .await
        .unwrap();

    // `zone` exists upstream but the member clause only allows `now`
    assert_eq!(names(&tools), vec!["time-now".to_string()]);
}

#[tokio::test]
async fn group_listing_is_subset_of_global() {
    let f = fixture().await;
    let global = names(
        &f.dispatcher
            .list_tools(&RequestScope::new("", None))
            .await
            .unwrap(),
    );
    let grouped = names(
        &f.dispatcher
            .list_tools(&RequestScope::new("ops", None))
            .await
            .unwrap(),
    );
    assert!(grouped.iter().all(|name| global.contains(name)));
}

#[tokio::test]
async fn upstream_name_acts_as_single_scope() {
    let f = fixture().await;
    let tools = f
        .dispatcher
        .list_tools(&RequestScope::new("weather", None))
        .await
        .unwrap();
    assert_eq!(names(&tools), vec!["weather-forecast".to_string()]);
}

#[tokio::test]
async fn unknown_group_lists_nothing() {
    let f = fixture().await;
    let tools = f
        .dispatcher
        .list_tools(&RequestScope::new("nope", None))
        .await
        .unwrap();
    assert!(tools.is_empty());
}

#[tokio::test]
async fn smart_scope_is_exactly_the_two_meta_tools() {
    let f = fixture().await;
    let tools = f
        .dispatcher
        .list_tools(&RequestScope::new("$smart", None))
        .await
        .unwrap();

    assert_eq!(
        names(&tools),
        vec!["search_tools".to_string(), "call_tool".to_string()]
    );
    // scope enumeration mentions both upstreams
    let desc = tools[0]["description"].as_str().unwrap();
    assert!(desc.contains("time"));
    assert!(desc.contains("weather"));
}

#[tokio::test]
async fn smart_group_narrows_the_universe() {
    let f = fixture().await;
    let tools = f
        .dispatcher
        .list_tools(&RequestScope::new("$smart/ops", None))
        .await
        .unwrap();
    let desc = tools[0]["description"].as_str().unwrap();
    assert!(desc.contains("time"));
    assert!(!desc.contains("weather"));
}

#[tokio::test]
async fn search_tools_resolves_hits_against_the_catalog() {
    let f = fixture().await;
    let mut args = serde_json::Map::new();
    args.insert("query".into(), json!("current time"));
    args.insert("limit".into(), json!(3));

    let result = f
        .dispatcher
        .call_tool(
            &RequestScope::new("$smart", None),
            "search_tools",
            Some(args),
        )
        .await
        .unwrap();

    // short query relaxes the threshold
    assert_eq!(result["metadata"]["threshold"], 0.2);
    let hits = result["tools"].as_array().unwrap();
    assert!(!hits.is_empty());
    assert_eq!(hits[0]["name"], "time-now");
    assert!(hits[0]["description"].as_str().unwrap().contains("time"));
    assert_eq!(result["metadata"]["query"], "current time");
    assert!(result["metadata"]["guideline"].as_str().is_some());
}

#[tokio::test]
async fn smart_search_in_unknown_group_is_empty_with_guideline() {
    let f = fixture().await;
    let mut args = serde_json::Map::new();
    args.insert("query".into(), json!("current time"));

    let result = f
        .dispatcher
        .call_tool(
            &RequestScope::new("$smart/ghost", None),
            "search_tools",
            Some(args),
        )
        .await
        .unwrap();

    assert_eq!(result["metadata"]["totalResults"], 0);
    assert!(
        result["metadata"]["guideline"]
            .as_str()
            .unwrap()
            .contains("No servers are available")
    );
}

#[tokio::test]
async fn owner_scoped_upstreams_are_hidden_from_other_users() {
    let f = fixture().await;
    f.registry.insert_test_upstream(
        UpstreamConfig {
            name: "private".into(),
            url: Some("https://private.example.com/mcp".into()),
            owner: Some("alice".into()),
            ..Default::default()
        },
        UpstreamStatus::Connected,
        vec![tool("secret", "Alice's private tool")],
        vec![],
    );

    let anonymous = names(
        &f.dispatcher
            .list_tools(&RequestScope::new("", None))
            .await
            .unwrap(),
    );
    assert!(!anonymous.contains(&"private-secret".to_string()));

    let alice = names(
        &f.dispatcher
            .list_tools(&RequestScope::new("", Some("alice".into())))
            .await
            .unwrap(),
    );
    assert!(alice.contains(&"private-secret".to_string()));
}

#[tokio::test]
async fn disabled_upstreams_never_publish() {
    let f = fixture().await;
    f.registry.insert_test_upstream(
        UpstreamConfig {
            name: "dead".into(),
            url: Some("https://dead.example.com/mcp".into()),
            enabled: false,
            ..Default::default()
        },
        UpstreamStatus::Disconnected,
        vec![tool("gone", "Should not appear")],
        vec![],
    );

    let listed = names(
        &f.dispatcher
            .list_tools(&RequestScope::new("", None))
            .await
            .unwrap(),
    );
    assert!(!listed.contains(&"dead-gone".to_string()));
}

#[tokio::test]
async fn unknown_tool_call_is_not_found() {
    let f = fixture().await;
    let err = f
        .dispatcher
        .call_tool(&RequestScope::new("", None), "time-nonexistent", None)
        .await;
    // the prefix resolves but the upstream has no live transport in this
    // fixture, so either way the call must not silently succeed
    assert!(err.is_err());

    let err = f
        .dispatcher
        .call_tool(&RequestScope::new("", None), "unprefixed", None)
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::NotFound { .. }));
}

/// Direct and smart invocations of the same tool produce identical upstream
/// requests.
#[tokio::test]
async fn direct_and_smart_calls_hit_the_same_upstream() {
    let f = fixture().await;

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/now"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"time": "12:00"})))
        .expect(2)
        .mount(&server)
        .await;

    let schema = json!({
        "openapi": "3.0.0",
        "servers": [{"url": server.uri()}],
        "paths": {
            "/now": {"get": {"operationId": "now", "summary": "Get the current time"}}
        }
    });
    let openapi_config = UpstreamConfig {
        name: "time".into(),
        kind: Some(crate::model::UpstreamKind::OpenApi),
        schema: Some(schema),
        ..Default::default()
    };
    let client = OpenApiClient::initialize(&openapi_config).await.unwrap();
    f.registry
        .install_test_transport("time", UpstreamTransport::OpenApi(Box::new(client)));

    let scope = RequestScope::new("", None);

    let direct = f
        .dispatcher
        .call_tool(&scope, "time-now", None)
        .await
        .unwrap();

    let mut smart_args = serde_json::Map::new();
    smart_args.insert("toolName".into(), json!("time-now"));
    smart_args.insert("arguments".into(), json!({}));
    let smart = f
        .dispatcher
        .call_tool(&scope, "call_tool", Some(smart_args))
        .await
        .unwrap();

    assert_eq!(direct["content"][0]["text"], smart["content"][0]["text"]);
    server.verify().await;
}

/// The HTTP-40x POST pattern triggers exactly one transport rebuild; any
/// other failure surfaces immediately with no retry.
#[tokio::test]
async fn retry_after_http_40x_is_bounded_to_one_attempt() {
    use crate::upstream::transport::FailingTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    let f = fixture().await;
    let calls = Arc::new(AtomicUsize::new(0));

    // `time` is configured as streamable-http with an unreachable URL, so the
    // rebuild attempt fails fast and the error surfaces to the caller
    f.registry.insert_test_upstream(
        UpstreamConfig {
            name: "time".into(),
            url: Some("http://127.0.0.1:9/mcp".into()),
            ..Default::default()
        },
        UpstreamStatus::Connected,
        vec![tool("now", "Get the current time")],
        vec![],
    );
    f.registry.install_test_transport(
        "time",
        UpstreamTransport::Failing(FailingTransport {
            message: "Error POSTing to endpoint (HTTP 401): unauthorized".into(),
            calls: calls.clone(),
        }),
    );

    let err = f
        .dispatcher
        .call_tool(&RequestScope::new("", None), "time-now", None)
        .await
        .unwrap_err();

    // the failing transport was invoked once, then replaced; the surfaced
    // error is the rebuild failure, not a second POST
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!err.to_string().contains("HTTP 401"));
}

#[tokio::test]
async fn non_retryable_errors_surface_without_a_rebuild() {
    use crate::upstream::transport::FailingTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    let f = fixture().await;
    let calls = Arc::new(AtomicUsize::new(0));

    f.registry.insert_test_upstream(
        UpstreamConfig {
            name: "time".into(),
            url: Some("http://127.0.0.1:9/mcp".into()),
            ..Default::default()
        },
        UpstreamStatus::Connected,
        vec![tool("now", "Get the current time")],
        vec![],
    );
    f.registry.install_test_transport(
        "time",
        UpstreamTransport::Failing(FailingTransport {
            message: "Error POSTing to endpoint (HTTP 500): boom".into(),
            calls: calls.clone(),
        }),
    );

    let err = f
        .dispatcher
        .call_tool(&RequestScope::new("", None), "time-now", None)
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(err.to_string().contains("HTTP 500"));
}

#[tokio::test]
async fn group_scope_blocks_calls_outside_the_clause() {
    let f = fixture().await;
    let err = f
        .dispatcher
        .call_tool(&RequestScope::new("ops", None), "time-zone", None)
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::NotFound { .. }));
}
