//! Request dispatcher
//!
//! Backs the four MCP methods the hub exposes downstream. Resolves a
//! tool/prompt name to the owning upstream through the unified-name prefix,
//! applies group and per-tool visibility, merges catalogs for listings, and
//! handles the two special cases: on-demand upstreams (dialed per call) and
//! the bounded reconnect-and-retry after an HTTP-40x POST failure.

pub mod smart;

use std::sync::Arc;

use serde_json::{Map, Value, json};

use crate::config::Config;
use crate::constants::{SMART_SCOPE, SMART_TOOL_CALL, SMART_TOOL_SEARCH};
use crate::model::{GroupConfig, RequestScope, UpstreamKind};
use crate::upstream::{UpstreamRegistry, UpstreamSnapshot};
use crate::{HubError, Result};

use smart::ToolSearch;

/// How a session's group string maps onto the catalog
enum ResolvedScope<'a> {
    /// "" — every visible upstream
    Global,
    /// A configured group, with its per-member tool clauses
    Group(&'a GroupConfig),
    /// No group of that name, but an upstream of that name exists
    Single(String),
    /// `$smart` or `$smart/{group}` — the meta-tool surface
    Smart(Option<String>),
    /// Neither a group nor an upstream; an empty catalog
    Unknown,
}

pub struct Dispatcher {
    registry: Arc<UpstreamRegistry>,
    config: Arc<Config>,
    search: Arc<dyn ToolSearch>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<UpstreamRegistry>,
        config: Arc<Config>,
        search: Arc<dyn ToolSearch>,
    ) -> Self {
        Self {
            registry,
            config,
            search,
        }
    }

    fn resolve<'a>(&'a self, scope: &RequestScope) -> ResolvedScope<'a> {
        let group = scope.group.as_str();
        if group.is_empty() {
            return ResolvedScope::Global;
        }
        if group == SMART_SCOPE {
            return ResolvedScope::Smart(None);
        }
        if let Some(inner) = group.strip_prefix(&format!("{}/", SMART_SCOPE)) {
            return ResolvedScope::Smart(Some(inner.to_string()));
        }
        if let Some(config) = self.config.group(group) {
            return ResolvedScope::Group(config);
        }
        if self.config.mcp_servers.contains_key(group) {
            return ResolvedScope::Single(group.to_string());
        }
        ResolvedScope::Unknown
    }

    fn visible(snapshot: &UpstreamSnapshot, scope: &RequestScope) -> bool {
        match &snapshot.owner {
            None => true,
            Some(owner) => scope.user.as_deref() == Some(owner.as_str()),
        }
    }

    /// The upstream names a `$smart` session may reach, for the synthetic
    /// tool descriptions and as the search universe
    fn smart_universe(&self, inner_group: Option<&str>, scope: &RequestScope) -> Vec<String> {
        let snapshots = self.registry.snapshots();
        let allowed: Option<Vec<String>> = match inner_group {
            Some(name) => match self.config.group(name) {
                Some(group) => Some(group.servers.iter().map(|m| m.name.clone()).collect()),
                // unknown inner group: an empty universe, phrased as such
                None => Some(Vec::new()),
            },
            None => None,
        };

        snapshots
            .iter()
            .filter(|s| s.callable() && Self::visible(s, scope))
            .filter(|s| match &allowed {
                Some(allowed) => allowed.iter().any(|a| a == &s.name),
                None => true,
            })
            .map(|s| s.name.clone())
            .collect()
    }

    // ------------------------------------------------------------------
    // tools/list
    // ------------------------------------------------------------------

    pub async fn list_tools(&self, scope: &RequestScope) -> Result<Vec<Value>> {
        let snapshots = self.registry.snapshots();
        let separator = self.registry.separator();

        let tools: Vec<Value> = match self.resolve(scope) {
            ResolvedScope::Global => snapshots
                .iter()
                .filter(|s| s.callable() && Self::visible(s, scope))
                .flat_map(|s| s.tools.iter())
                .map(|t| serde_json::to_value(t))
                .collect::<std::result::Result<_, _>>()?,
            ResolvedScope::Group(group) => {
                let mut out = Vec::new();
                for snapshot in snapshots
                    .iter()
                    .filter(|s| s.callable() && Self::visible(s, scope))
                {
                    let Some(member) = group.member(&snapshot.name) else {
                        continue;
                    };
                    let prefix = format!("{}{}", snapshot.name, separator);
                    for tool in &snapshot.tools {
                        let bare = tool.name.strip_prefix(&prefix).unwrap_or(tool.name.as_ref());
                        if member.tools.allows(bare) {
                            out.push(serde_json::to_value(tool)?);
                        }
                    }
                }
                out
            }
            ResolvedScope::Single(name) => snapshots
                .iter()
                .filter(|s| s.name == name && s.callable() && Self::visible(s, scope))
                .flat_map(|s| s.tools.iter())
                .map(|t| serde_json::to_value(t))
                .collect::<std::result::Result<_, _>>()?,
            ResolvedScope::Smart(inner) => {
                let universe = self.smart_universe(inner.as_deref(), scope);
                smart::smart_tools(&universe)
                    .iter()
                    .map(|t| serde_json::to_value(t))
                    .collect::<std::result::Result<_, _>>()?
            }
            ResolvedScope::Unknown => Vec::new(),
        };

        Ok(tools)
    }

    // ------------------------------------------------------------------
    // tools/call
    // ------------------------------------------------------------------

    pub async fn call_tool(
        &self,
        scope: &RequestScope,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<Value> {
        if let ResolvedScope::Smart(inner) = self.resolve(scope) {
            return match name {
                SMART_TOOL_SEARCH => self.search_tools(inner.as_deref(), scope, arguments).await,
                SMART_TOOL_CALL => self.smart_call(scope, arguments).await,
                other => Err(HubError::not_found("tool", other)),
            };
        }

        // direct mode: the unified name starts with `{upstream}{separator}`
        if let Some((upstream, bare)) = self.resolve_prefixed_tool(scope, name) {
            return self.dispatch_call(&upstream, &bare, arguments, scope).await;
        }

        // smart mode outside the $smart surface: the literal meta tool
        if name == SMART_TOOL_CALL {
            return self.smart_call(scope, arguments).await;
        }

        Err(HubError::not_found("tool", name))
    }

    /// Map a unified tool name onto (upstream, bare tool), honoring scope
    /// visibility and group tool clauses. Prefers the longest matching
    /// upstream name; the separator may legitimately appear inside both
    /// upstream and tool names.
    fn resolve_prefixed_tool(&self, scope: &RequestScope, name: &str) -> Option<(String, String)> {
        let snapshots = self.registry.snapshots();
        let separator = self.registry.separator();

        let group = match self.resolve(scope) {
            ResolvedScope::Group(group) => Some(group),
            ResolvedScope::Single(single) => {
                let snapshot = snapshots
                    .iter()
                    .filter(|s| s.callable() && Self::visible(s, scope))
                    .find(|s| s.name == single)?;
                let prefix = format!("{}{}", snapshot.name, separator);
                let bare = name.strip_prefix(&prefix)?;
                return Some((snapshot.name.clone(), bare.to_string()));
            }
            ResolvedScope::Global => None,
            _ => return None,
        };

        let mut candidates: Vec<(&UpstreamSnapshot, String)> = snapshots
            .iter()
            .filter(|s| s.callable() && Self::visible(s, scope))
            .filter_map(|s| {
                let prefix = format!("{}{}", s.name, separator);
                name.strip_prefix(&prefix).map(|bare| (s, bare.to_string()))
            })
            .collect();
        candidates.sort_by_key(|(s, _)| std::cmp::Reverse(s.name.len()));

        for (snapshot, bare) in candidates {
            if let Some(group) = group {
                let Some(member) = group.member(&snapshot.name) else {
                    continue;
                };
                if !member.tools.allows(&bare) {
                    continue;
                }
            }
            return Some((snapshot.name.clone(), bare));
        }
        None
    }

    /// `call_tool` meta dispatch: read `{toolName, arguments}` and route to
    /// the first enabled upstream whose catalog carries that unified name
    async fn smart_call(
        &self,
        scope: &RequestScope,
        arguments: Option<Map<String, Value>>,
    ) -> Result<Value> {
        let args = arguments.unwrap_or_default();
        let tool_name = args
            .get("toolName")
            .and_then(Value::as_str)
            .ok_or_else(|| HubError::mcp("call_tool requires a toolName argument"))?;
        let inner_arguments = args
            .get("arguments")
            .and_then(Value::as_object)
            .cloned();

        let snapshots = self.registry.snapshots();
        let separator = self.registry.separator();

        // enabled upstreams sort first, so this finds the same target a
        // direct prefixed call would
        for snapshot in snapshots.iter().filter(|s| s.callable() && Self::visible(s, scope)) {
            if snapshot.tools.iter().any(|t| t.name == tool_name) {
                let prefix = format!("{}{}", snapshot.name, separator);
                let bare = tool_name.strip_prefix(&prefix).unwrap_or(tool_name);
                return self
                    .dispatch_call(&snapshot.name, bare, inner_arguments, scope)
                    .await;
            }
        }

        Err(HubError::not_found("tool", tool_name))
    }

    /// `search_tools`: delegate to the search collaborator, then re-resolve
    /// every hit against the live catalog so disabled tools drop out and
    /// description overrides apply
    async fn search_tools(
        &self,
        inner_group: Option<&str>,
        scope: &RequestScope,
        arguments: Option<Map<String, Value>>,
    ) -> Result<Value> {
        let args = arguments.unwrap_or_default();
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| HubError::mcp("search_tools requires a query argument"))?;
        let limit = args
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(10)
            .max(1) as usize;

        let threshold = smart::threshold_for(query);
        let universe = self.smart_universe(inner_group, scope);
        let scope_list = inner_group.map(|_| universe.clone());

        let hits = self
            .search
            .search(query, scope_list.as_deref(), limit, threshold)
            .await?;

        let snapshots = self.registry.snapshots();
        let separator = self.registry.separator();

        let mut tools = Vec::new();
        for hit in hits {
            let Some(snapshot) = snapshots
                .iter()
                .find(|s| s.name == hit.server && s.callable())
            else {
                continue;
            };
            if !Self::visible(snapshot, scope) || !universe.contains(&snapshot.name) {
                continue;
            }
            let unified = format!("{}{}{}", hit.server, separator, hit.tool);
            // hits whose tool has been disabled since indexing fall out here
            let Some(tool) = snapshot.tools.iter().find(|t| t.name == unified) else {
                continue;
            };
            let mut record = serde_json::to_value(tool)?;
            if let Some(obj) = record.as_object_mut() {
                obj.insert("server".to_string(), json!(hit.server));
                obj.insert("score".to_string(), json!(hit.score));
            }
            tools.push(record);
        }

        let response =
            smart::search_response(query, threshold, tools, universe.is_empty());

        let mut result = json!({
            "content": [{
                "type": "text",
                "text": serde_json::to_string_pretty(&response)?,
            }],
            "isError": false,
        });
        if let (Some(result_obj), Some(response_obj)) =
            (result.as_object_mut(), response.as_object())
        {
            for (k, v) in response_obj {
                result_obj.insert(k.clone(), v.clone());
            }
        }
        Ok(result)
    }

    /// Route one call to one upstream, with the on-demand and retry-once
    /// special cases
    async fn dispatch_call(
        &self,
        upstream: &str,
        tool: &str,
        arguments: Option<Map<String, Value>>,
        scope: &RequestScope,
    ) -> Result<Value> {
        let snapshot = self
            .registry
            .snapshots()
            .into_iter()
            .find(|s| s.name == upstream)
            .ok_or_else(|| HubError::not_found("upstream", upstream))?;

        if snapshot.on_demand {
            // dial, call, and hang up, even on error
            let transport = self.registry.jit_connect(upstream).await?;
            let result = transport
                .call_tool(tool, arguments, &snapshot.options, scope)
                .await;
            if let Err(e) = transport.close().await {
                tracing::debug!(server = %upstream, "on-demand close: {}", e);
            }
            return result;
        }

        let transport = self
            .registry
            .transport(upstream)
            .ok_or_else(|| HubError::transport(format!("upstream '{}' is not connected", upstream)))?;

        let first = transport
            .call_tool(tool, arguments.clone(), &snapshot.options, scope)
            .await;

        let retryable = matches!(
            snapshot.kind,
            UpstreamKind::Sse | UpstreamKind::StreamableHttp
        );
        match first {
            Err(e) if retryable && e.is_retryable_post() => {
                tracing::warn!(
                    server = %upstream,
                    "POST rejected with HTTP 40x, rebuilding transport and retrying once: {}",
                    e
                );
                self.registry.restart(upstream).await?;
                let transport = self.registry.transport(upstream).ok_or_else(|| {
                    HubError::transport(format!("upstream '{}' did not come back", upstream))
                })?;
                // exactly one retry; a second failure surfaces unchanged
                transport
                    .call_tool(tool, arguments, &snapshot.options, scope)
                    .await
            }
            other => other,
        }
    }

    // ------------------------------------------------------------------
    // prompts
    // ------------------------------------------------------------------

    pub async fn list_prompts(&self, scope: &RequestScope) -> Result<Vec<Value>> {
        let snapshots = self.registry.snapshots();

        let prompts: Vec<Value> = match self.resolve(scope) {
            ResolvedScope::Global => snapshots
                .iter()
                .filter(|s| s.callable() && Self::visible(s, scope))
                .flat_map(|s| s.prompts.iter())
                .map(|p| serde_json::to_value(p))
                .collect::<std::result::Result<_, _>>()?,
            ResolvedScope::Group(group) => snapshots
                .iter()
                .filter(|s| s.callable() && Self::visible(s, scope))
                .filter(|s| group.member(&s.name).is_some())
                .flat_map(|s| s.prompts.iter())
                .map(|p| serde_json::to_value(p))
                .collect::<std::result::Result<_, _>>()?,
            ResolvedScope::Single(name) => snapshots
                .iter()
                .filter(|s| s.name == name && s.callable() && Self::visible(s, scope))
                .flat_map(|s| s.prompts.iter())
                .map(|p| serde_json::to_value(p))
                .collect::<std::result::Result<_, _>>()?,
            // the meta surface carries no prompts
            ResolvedScope::Smart(_) => Vec::new(),
            ResolvedScope::Unknown => Vec::new(),
        };

        Ok(prompts)
    }

    pub async fn get_prompt(
        &self,
        scope: &RequestScope,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<Value> {
        let snapshots = self.registry.snapshots();
        let separator = self.registry.separator();

        let resolved = snapshots
            .iter()
            .filter(|s| s.callable() && Self::visible(s, scope))
            .filter(|s| match self.resolve(scope) {
                ResolvedScope::Global => true,
                ResolvedScope::Group(group) => group.member(&s.name).is_some(),
                ResolvedScope::Single(ref single) => &s.name == single,
                _ => false,
            })
            .find_map(|s| {
                let prefix = format!("{}{}", s.name, separator);
                name.strip_prefix(&prefix)
                    .filter(|_| s.prompts.iter().any(|p| p.name == name))
                    .map(|bare| (s.name.clone(), bare.to_string(), s.on_demand, s.options.clone()))
            });

        let Some((upstream, bare, on_demand, options)) = resolved else {
            return Err(HubError::not_found("prompt", name));
        };

        if on_demand {
            let transport = self.registry.jit_connect(&upstream).await?;
            let result = transport.get_prompt(&bare, arguments, &options).await;
            if let Err(e) = transport.close().await {
                tracing::debug!(server = %upstream, "on-demand close: {}", e);
            }
            return result;
        }

        let transport = self
            .registry
            .transport(&upstream)
            .ok_or_else(|| HubError::transport(format!("upstream '{}' is not connected", upstream)))?;
        transport.get_prompt(&bare, arguments, &options).await
    }
}
