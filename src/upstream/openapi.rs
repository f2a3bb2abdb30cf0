//! OpenAPI upstreams
//!
//! Translates an OpenAPI v3 document into synthetic MCP tools on the fly.
//! `call_tool` renders the corresponding HTTP operation: path and query
//! parameters from the arguments, a JSON body for the rest, plus any
//! configured passthrough headers lifted from the ambient request scope.

use std::borrow::Cow;
use std::sync::Arc;

use rmcp::model::Tool;
use serde_json::{Map, Value, json};

use crate::model::{RequestScope, UpstreamConfig};
use crate::{HubError, Result};

// never forwarded, whatever the passthrough list says
const BLOCKED_PASSTHROUGH: &[&str] = &[
    "host",
    "content-length",
    "content-encoding",
    "connection",
    "transfer-encoding",
    "keep-alive",
    "upgrade",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParamLocation {
    Path,
    Query,
    Header,
}

#[derive(Debug, Clone)]
struct ParamSpec {
    name: String,
    location: ParamLocation,
    required: bool,
    schema: Value,
    description: Option<String>,
}

#[derive(Debug, Clone)]
struct Operation {
    name: String,
    description: Option<String>,
    method: reqwest::Method,
    path: String,
    params: Vec<ParamSpec>,
    has_body: bool,
    body_properties: Vec<String>,
}

/// Synthetic MCP client over one OpenAPI document
pub struct OpenApiClient {
    base_url: String,
    operations: Vec<Operation>,
    http: reqwest::Client,
    passthrough: Vec<String>,
}

impl OpenApiClient {
    /// Load the document (inline schema or fetched from the configured URL)
    /// and derive the tool set.
    pub(crate) async fn initialize(config: &UpstreamConfig) -> Result<Self> {
        let document = match &config.schema {
            Some(schema) => schema.clone(),
            None => {
                let url = config.url.as_deref().ok_or_else(|| {
                    HubError::config(format!(
                        "upstream '{}': openapi requires a schema or a url",
                        config.name
                    ))
                })?;
                let text = reqwest::get(url).await?.error_for_status()?.text().await?;
                serde_json::from_str(&text)
                    .or_else(|_| serde_yaml::from_str::<Value>(&text))
                    .map_err(|e| {
                        HubError::config(format!(
                            "upstream '{}': failed to parse OpenAPI document: {}",
                            config.name, e
                        ))
                    })?
            }
        };

        let base_url = server_prefix(&document, config)?;
        let operations = parse_operations(&document, &config.name)?;

        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(configured) = &config.headers {
            for (k, v) in configured {
                let name = reqwest::header::HeaderName::from_bytes(k.as_bytes())
                    .map_err(|e| HubError::config(format!("invalid header name '{}': {}", k, e)))?;
                let value = reqwest::header::HeaderValue::from_str(v)
                    .map_err(|e| HubError::config(format!("invalid header value '{}': {}", k, e)))?;
                headers.insert(name, value);
            }
        }
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| HubError::transport(format!("http client build failed: {}", e)))?;

        Ok(Self {
            base_url,
            operations,
            http,
            passthrough: config
                .passthrough_headers
                .clone()
                .unwrap_or_default()
                .into_iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
        })
    }

    /// The synthetic tool catalog
    pub(crate) fn tools(&self) -> Vec<Tool> {
        self.operations
            .iter()
            .map(|op| {
                Tool::new(
                    Cow::Owned(op.name.clone()),
                    Cow::Owned(op.description.clone().unwrap_or_default()),
                    Arc::new(input_schema(op)),
                )
            })
            .collect()
    }

    /// Issue the HTTP operation behind one synthetic tool
    pub(crate) async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
        scope: &RequestScope,
    ) -> Result<Value> {
        let op = self
            .operations
            .iter()
            .find(|op| op.name == name)
            .ok_or_else(|| HubError::not_found("tool", name))?;

        let args = arguments.unwrap_or_default();

        let mut path = op.path.clone();
        let mut query: Vec<(String, String)> = Vec::new();
        let mut header_params: Vec<(String, String)> = Vec::new();
        for param in &op.params {
            let value = args.get(&param.name);
            match (value, param.required) {
                (None, true) => {
                    return Err(HubError::mcp(format!(
                        "missing required parameter '{}' for tool '{}'",
                        param.name, name
                    )));
                }
                (None, false) => continue,
                (Some(value), _) => {
                    let rendered = render_param(value).ok_or_else(|| {
                        HubError::mcp(format!(
                            "parameter '{}' of tool '{}' has an unsupported value",
                            param.name, name
                        ))
                    })?;
                    match param.location {
                        ParamLocation::Path => {
                            path = path.replace(
                                &format!("{{{}}}", param.name),
                                &urlencoding::encode(&rendered),
                            );
                        }
                        ParamLocation::Query => query.push((param.name.clone(), rendered)),
                        ParamLocation::Header => header_params.push((param.name.clone(), rendered)),
                    }
                }
            }
        }

        let url = normalize_url_path(&self.base_url, &path);
        let mut request = self.http.request(op.method.clone(), &url);
        for (header_name, rendered) in header_params {
            request = request.header(header_name.as_str(), rendered);
        }
        if !query.is_empty() {
            request = request.query(&query);
        }

        // passthrough headers from the downstream request
        for header_name in &self.passthrough {
            if BLOCKED_PASSTHROUGH.contains(&header_name.as_str()) {
                continue;
            }
            if let Some(value) = scope.headers.get(header_name.as_str()) {
                request = request.header(header_name.as_str(), value.as_bytes());
            }
        }

        if op.has_body {
            let mut body = Map::new();
            for key in &op.body_properties {
                if let Some(value) = args.get(key) {
                    body.insert(key.clone(), value.clone());
                }
            }
            // operations with a free-form body take every leftover argument
            if op.body_properties.is_empty() {
                let consumed: Vec<&String> = op.params.iter().map(|p| &p.name).collect();
                for (key, value) in &args {
                    if !consumed.contains(&key) {
                        body.insert(key.clone(), value.clone());
                    }
                }
            }
            request = request.json(&Value::Object(body));
        }

        let response = request
            .send()
            .await
            .map_err(|e| HubError::transport(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(HubError::transport(format!(
                "upstream returned HTTP {} for tool '{}': {}",
                status.as_u16(),
                name,
                text
            )));
        }

        // pretty-print JSON bodies, pass anything else through verbatim
        let rendered = match serde_json::from_str::<Value>(&text) {
            Ok(parsed) => serde_json::to_string_pretty(&parsed).unwrap_or(text),
            Err(_) => text,
        };

        Ok(json!({
            "content": [{"type": "text", "text": rendered}],
            "isError": false,
        }))
    }
}

/// Resolve the server prefix: `servers[0].url`, made absolute against the
/// document URL when relative.
fn server_prefix(document: &Value, config: &UpstreamConfig) -> Result<String> {
    let declared = document
        .get("servers")
        .and_then(|s| s.as_array())
        .and_then(|s| s.first())
        .and_then(|s| s.get("url"))
        .and_then(Value::as_str);

    match declared {
        Some(url) if url.starts_with("http://") || url.starts_with("https://") => {
            Ok(url.trim_end_matches('/').to_string())
        }
        Some(relative) => {
            let base = config.url.as_deref().ok_or_else(|| {
                HubError::config(format!(
                    "upstream '{}': relative server url '{}' needs a document url to resolve against",
                    config.name, relative
                ))
            })?;
            let origin = url::Url::parse(base)
                .map_err(|e| HubError::config(format!("invalid document url: {}", e)))?;
            let origin = format!(
                "{}://{}{}",
                origin.scheme(),
                origin.host_str().unwrap_or_default(),
                origin
                    .port()
                    .map(|p| format!(":{}", p))
                    .unwrap_or_default()
            );
            Ok(format!(
                "{}/{}",
                origin.trim_end_matches('/'),
                relative.trim_matches('/')
            )
            .trim_end_matches('/')
            .to_string())
        }
        None => {
            let base = config.url.as_deref().ok_or_else(|| {
                HubError::config(format!(
                    "upstream '{}': OpenAPI document declares no servers and no url is configured",
                    config.name
                ))
            })?;
            let origin = url::Url::parse(base)
                .map_err(|e| HubError::config(format!("invalid document url: {}", e)))?;
            Ok(format!(
                "{}://{}{}",
                origin.scheme(),
                origin.host_str().unwrap_or_default(),
                origin
                    .port()
                    .map(|p| format!(":{}", p))
                    .unwrap_or_default()
            ))
        }
    }
}

fn parse_operations(document: &Value, upstream: &str) -> Result<Vec<Operation>> {
    let paths = document
        .get("paths")
        .and_then(Value::as_object)
        .ok_or_else(|| {
            HubError::config(format!(
                "upstream '{}': OpenAPI document has no paths object",
                upstream
            ))
        })?;

    let mut operations = Vec::new();
    for (path, item) in paths {
        let Some(item) = item.as_object() else {
            continue;
        };

        let shared_params = item
            .get("parameters")
            .map(|p| parse_params(p))
            .unwrap_or_default();

        for (method_name, method) in [
            ("get", reqwest::Method::GET),
            ("post", reqwest::Method::POST),
            ("put", reqwest::Method::PUT),
            ("delete", reqwest::Method::DELETE),
            ("patch", reqwest::Method::PATCH),
        ] {
            let Some(op) = item.get(method_name).and_then(Value::as_object) else {
                continue;
            };

            let name = op
                .get("operationId")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| synthesize_name(method_name, path));

            let description = op
                .get("summary")
                .or_else(|| op.get("description"))
                .and_then(Value::as_str)
                .map(str::to_string);

            let mut params = shared_params.clone();
            if let Some(own) = op.get("parameters") {
                params.extend(parse_params(own));
            }

            let body_schema = op
                .get("requestBody")
                .and_then(|b| b.get("content"))
                .and_then(|c| c.get("application/json"))
                .and_then(|m| m.get("schema"));
            let has_body = body_schema.is_some();
            let body_properties = body_schema
                .and_then(|s| s.get("properties"))
                .and_then(Value::as_object)
                .map(|props| props.keys().cloned().collect())
                .unwrap_or_default();

            operations.push(Operation {
                name,
                description,
                method: method.clone(),
                path: path.clone(),
                params,
                has_body,
                body_properties,
            });
        }
    }

    Ok(operations)
}

fn parse_params(value: &Value) -> Vec<ParamSpec> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let name = item.get("name")?.as_str()?.to_string();
            let location = match item.get("in")?.as_str()? {
                "path" => ParamLocation::Path,
                "query" => ParamLocation::Query,
                "header" => ParamLocation::Header,
                // cookies and $refs are out of scope for synthetic tools
                _ => return None,
            };
            Some(ParamSpec {
                name,
                location,
                required: item
                    .get("required")
                    .and_then(Value::as_bool)
                    .unwrap_or(location == ParamLocation::Path),
                schema: item
                    .get("schema")
                    .cloned()
                    .unwrap_or_else(|| json!({"type": "string"})),
                description: item
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
        })
        .collect()
}

fn synthesize_name(method: &str, path: &str) -> String {
    let cleaned: String = path
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{}{}", method, cleaned)
        .trim_end_matches('_')
        .to_string()
}

/// JSON-schema input for one operation: parameters plus flattened body
/// properties, `$schema` never included.
fn input_schema(op: &Operation) -> Map<String, Value> {
    let mut properties = Map::new();
    let mut required = Vec::new();

    for param in &op.params {
        let mut schema = param.schema.clone();
        if let (Some(obj), Some(desc)) = (schema.as_object_mut(), &param.description) {
            obj.entry("description".to_string())
                .or_insert_with(|| Value::String(desc.clone()));
        }
        properties.insert(param.name.clone(), schema);
        if param.required {
            required.push(Value::String(param.name.clone()));
        }
    }
    if op.has_body && op.body_properties.is_empty() {
        // free-form body: accept arbitrary additional arguments
        properties.insert("body".to_string(), json!({"type": "object"}));
    }

    let mut schema = Map::new();
    schema.insert("type".to_string(), Value::String("object".to_string()));
    schema.insert("properties".to_string(), Value::Object(properties));
    if !required.is_empty() {
        schema.insert("required".to_string(), Value::Array(required));
    }
    schema
}

fn render_param(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(items) => {
            let parts: Option<Vec<String>> = items.iter().map(render_param).collect();
            parts.map(|p| p.join(","))
        }
        _ => None,
    }
}

fn normalize_url_path(prefix: &str, path: &str) -> String {
    format!(
        "{}/{}",
        prefix.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
