//! Smart routing: the `$smart` meta-tool surface
//!
//! A session bound to `$smart` (or `$smart/{group}`) sees exactly two
//! synthetic tools: `search_tools` finds candidates through the vector-search
//! collaborator, `call_tool` dispatches one by its unified name. The search
//! backend itself is a black box behind `ToolSearch`; the shipped lexical
//! implementation keeps development and tests self-contained.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rmcp::model::Tool;
use serde_json::{Map, Value, json};

use crate::Result;
use crate::constants::{SMART_TOOL_CALL, SMART_TOOL_SEARCH};

/// One catalog entry handed to the search index (bare tool name, published
/// description)
#[derive(Debug, Clone)]
pub struct IndexedTool {
    pub name: String,
    pub description: String,
}

/// A scored search result
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub server: String,
    pub tool: String,
    pub score: f64,
}

/// The tool-discovery collaborator: `search(query) -> [(server, tool, score)]`
/// plus index maintenance hooks the registry drives on (re)connect.
#[async_trait::async_trait]
pub trait ToolSearch: Send + Sync {
    async fn search(
        &self,
        query: &str,
        scope: Option<&[String]>,
        limit: usize,
        threshold: f64,
    ) -> Result<Vec<SearchHit>>;

    async fn index(&self, server: &str, tools: &[IndexedTool]);

    async fn remove(&self, server: &str);
}

/// Threshold adapted to query shape: short, broad queries need a permissive
/// cutoff; long, specific ones can afford a strict one.
pub fn threshold_for(query: &str) -> f64 {
    match query.split_whitespace().count() {
        0..=2 => 0.2,
        3..=4 => 0.3,
        5..=8 => 0.45,
        _ => 0.6,
    }
}

/// The two synthetic tools published to `$smart` sessions. Their
/// descriptions spell out which upstreams are reachable in this scope.
pub fn smart_tools(upstreams_in_scope: &[String]) -> Vec<Tool> {
    let scope_description = if upstreams_in_scope.is_empty() {
        "No servers are currently available in this scope.".to_string()
    } else {
        format!(
            "Available servers: {}.",
            upstreams_in_scope.join(", ")
        )
    };

    let search_schema = json!({
        "type": "object",
        "properties": {
            "query": {
                "type": "string",
                "description": "What you want to accomplish, in plain words"
            },
            "limit": {
                "type": "integer",
                "description": "Maximum number of tools to return (default 10)"
            }
        },
        "required": ["query"]
    });

    let call_schema = json!({
        "type": "object",
        "properties": {
            "toolName": {
                "type": "string",
                "description": "Exact tool name as returned by search_tools"
            },
            "arguments": {
                "type": "object",
                "description": "Arguments for the tool"
            }
        },
        "required": ["toolName"]
    });

    vec![
        Tool::new(
            Cow::Borrowed(SMART_TOOL_SEARCH),
            Cow::Owned(format!(
                "Find relevant tools across the connected MCP servers by describing the task. {}",
                scope_description
            )),
            Arc::new(as_object(search_schema)),
        ),
        Tool::new(
            Cow::Borrowed(SMART_TOOL_CALL),
            Cow::Owned(format!(
                "Invoke a tool found via search_tools by its exact name. {}",
                scope_description
            )),
            Arc::new(as_object(call_schema)),
        ),
    ]
}

fn as_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Shape of the `search_tools` response: resolved tool records plus the
/// metadata block that teaches the model what to do next.
pub fn search_response(
    query: &str,
    threshold: f64,
    tools: Vec<Value>,
    scope_is_empty: bool,
) -> Value {
    let guideline = if tools.is_empty() {
        if scope_is_empty {
            "No servers are available in this scope, so no tools can be discovered. \
             Check the group name or connect upstream servers first."
                .to_string()
        } else {
            format!(
                "No tools matched '{}'. Try a shorter, broader query; thresholds relax \
                 automatically for short queries.",
                query
            )
        }
    } else {
        "Pick the best-matching tool and invoke it with call_tool, passing its exact \
         name as toolName."
            .to_string()
    };

    json!({
        "tools": tools,
        "metadata": {
            "query": query,
            "threshold": threshold,
            "totalResults": tools.len(),
            "guideline": guideline,
            "nextSteps": [
                format!("Call {} with the chosen toolName and its arguments", SMART_TOOL_CALL),
                format!("Refine the query and call {} again if nothing fits", SMART_TOOL_SEARCH),
            ],
        }
    })
}

/// Keyword-overlap search over the indexed catalog. Stands in for the vector
/// index during development and in tests; real deployments plug an embedding
/// backend into `ToolSearch`.
#[derive(Default)]
pub struct LexicalToolSearch {
    index: RwLock<HashMap<String, Vec<IndexedTool>>>,
}

impl LexicalToolSearch {
    pub fn new() -> Self {
        Self::default()
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(str::to_string)
        .collect()
}

fn score(query_tokens: &[String], tool: &IndexedTool) -> f64 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    let haystack = tokenize(&format!("{} {}", tool.name, tool.description));
    let matched = query_tokens
        .iter()
        .filter(|token| haystack.iter().any(|h| h.contains(token.as_str())))
        .count();
    matched as f64 / query_tokens.len() as f64
}

#[async_trait::async_trait]
impl ToolSearch for LexicalToolSearch {
    async fn search(
        &self,
        query: &str,
        scope: Option<&[String]>,
        limit: usize,
        threshold: f64,
    ) -> Result<Vec<SearchHit>> {
        let query_tokens = tokenize(query);
        let index = self.index.read();

        let mut hits: Vec<SearchHit> = index
            .iter()
            .filter(|(server, _)| match scope {
                Some(scope) => scope.iter().any(|s| s == *server),
                None => true,
            })
            .flat_map(|(server, tools)| {
                let query_tokens = query_tokens.clone();
                tools.iter().map(move |tool| SearchHit {
                    server: server.clone(),
                    tool: tool.name.clone(),
                    score: score(&query_tokens, tool),
                })
            })
            .filter(|hit| hit.score >= threshold)
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn index(&self, server: &str, tools: &[IndexedTool]) {
        self.index.write().insert(server.to_string(), tools.to_vec());
    }

    async fn remove(&self, server: &str) {
        self.index.write().remove(server);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_tracks_query_length() {
        assert_eq!(threshold_for("current time"), 0.2);
        assert_eq!(threshold_for("convert timezone of timestamp"), 0.3);
        assert_eq!(
            threshold_for("find the commit that introduced a flaky test"),
            0.45
        );
        assert_eq!(
            threshold_for(
                "given a repository with many branches find the oldest release tag that still \
                 contains the vulnerable dependency version"
            ),
            0.6
        );
    }

    #[test]
    fn smart_surface_is_exactly_two_tools() {
        let tools = smart_tools(&["time".into(), "weather".into()]);
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, SMART_TOOL_SEARCH);
        assert_eq!(tools[1].name, SMART_TOOL_CALL);
        for tool in &tools {
            let desc = tool.description.as_ref().unwrap();
            assert!(desc.contains("time"));
            assert!(desc.contains("weather"));
        }
    }

    #[test]
    fn empty_scope_is_spelled_out() {
        let tools = smart_tools(&[]);
        assert!(
            tools[0]
                .description
                .as_ref()
                .unwrap()
                .contains("No servers are currently available")
        );
    }

    #[tokio::test]
    async fn lexical_search_scores_and_scopes() {
        let search = LexicalToolSearch::new();
        search
            .index(
                "time",
                &[IndexedTool {
                    name: "now".into(),
                    description: "Get the current time in a timezone".into(),
                }],
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

        let hits = search.search("current time", None, 10, 0.2).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].server, "time");
        assert_eq!(hits[0].tool, "now");

        // scoping to the other server hides the hit
        let scoped = search
            .search("current time", Some(&["weather".to_string()]), 10, 0.2)
            .await
            .unwrap();
        assert!(scoped.is_empty());
    }

    #[test]
    fn empty_result_metadata_has_a_guideline() {
        let response = search_response("obscure query", 0.2, vec![], true);
        assert_eq!(response["metadata"]["totalResults"], 0);
        assert!(
            response["metadata"]["guideline"]
                .as_str()
                .unwrap()
                .contains("No servers are available")
        );
    }
}
