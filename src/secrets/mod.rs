//! Secrets and environment expansion
//!
//! All environment variable access goes through the `SecretsProvider` trait,
//! and every string-valued upstream config field is expanded through
//! `expand_value` at load time. Both `${VAR}` and `$VAR` forms are supported;
//! unknown variables expand to the empty string so a missing secret never
//! leaks its placeholder to an upstream.

mod env;

pub use env::EnvSecretsProvider;

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::Result;

/// Provides access to secrets and environment variables
#[async_trait::async_trait]
pub trait SecretsProvider: Send + Sync {
    /// Get a single secret value by key. Returns None if it doesn't exist.
    async fn get_secret(&self, key: &str) -> Result<Option<String>>;

    /// Get a secret value with a default fallback
    async fn get_secret_or(&self, key: &str, default: &str) -> Result<String> {
        Ok(self
            .get_secret(key)
            .await?
            .unwrap_or_else(|| default.to_string()))
    }

    /// Check if a secret exists
    async fn has_secret(&self, key: &str) -> bool {
        self.get_secret(key).await.ok().flatten().is_some()
    }

    /// Get all secrets as a HashMap
    async fn get_all_secrets(&self) -> Result<HashMap<String, String>>;
}

// `${VAR}` first so `${FOO}` never half-matches as `$FOO` plus a stray brace
static ENV_VAR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("Invalid environment variable regex")
});

/// Expand `${VAR}` and `$VAR` patterns in a string.
///
/// Known variables are replaced with their value; unknown variables expand to
/// the empty string. A string with no `$` at all is returned unchanged, which
/// also makes expansion idempotent on already-expanded input.
pub async fn expand_value(value: &str, provider: &Arc<dyn SecretsProvider>) -> Result<String> {
    if !value.contains('$') {
        return Ok(value.to_string());
    }

    let var_names: Vec<String> = ENV_VAR_PATTERN
        .captures_iter(value)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
        .map(|m| m.as_str().to_string())
        .collect();

    let mut resolved = HashMap::new();
    for name in var_names {
        if let Some(secret) = provider.get_secret(&name).await? {
            resolved.insert(name, secret);
        }
    }

    let mut result = String::new();
    let mut last_match = 0;
    for cap in ENV_VAR_PATTERN.captures_iter(value) {
        let full = cap.get(0).unwrap();
        let name = cap
            .get(1)
            .or_else(|| cap.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();

        result.push_str(&value[last_match..full.start()]);
        if let Some(secret) = resolved.get(name) {
            result.push_str(secret);
        }
        // unknown variables contribute nothing
        last_match = full.end();
    }
    result.push_str(&value[last_match..]);

    Ok(result)
}

/// Expand every string inside an arbitrarily nested JSON value.
///
/// Maps and arrays are walked recursively; map keys are left untouched.
pub async fn expand_tree(value: &Value, provider: &Arc<dyn SecretsProvider>) -> Result<Value> {
    Ok(match value {
        Value::String(s) => Value::String(expand_value(s, provider).await?),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(Box::pin(expand_tree(item, provider)).await?);
            }
            Value::Array(out)
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), Box::pin(expand_tree(v, provider)).await?);
            }
            Value::Object(out)
        }
        other => other.clone(),
    })
}
