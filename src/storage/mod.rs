//! Settings persistence seam
//!
//! The hub persists one settings document: upstream descriptors, groups, and
//! per-upstream OAuth state. Everything behind `SettingsRepository` is opaque
//! to the core; the relational store lives outside this crate and plugs in
//! through the same trait. Shipped impls are the file-backed legacy and an
//! in-memory store for tests, selected by the MCPHUB_SETTINGS_BACKEND toggle.

mod file;
mod memory;

pub use file::FileSettingsRepository;
pub use memory::MemorySettingsRepository;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::model::{GroupConfig, OAuthState, UpstreamConfig};
use crate::{Result, constants};

/// The single persisted settings document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsDocument {
    #[serde(default)]
    pub mcp_servers: HashMap<String, UpstreamConfig>,

    #[serde(default)]
    pub groups: Vec<GroupConfig>,

    /// Per-upstream OAuth state, keyed by upstream name
    #[serde(default)]
    pub oauth: HashMap<String, OAuthState>,
}

/// Repository interface over the settings document.
///
/// OAuth accessors run under a per-repository critical section so the
/// transport refresh path and the authorization-completion path observe a
/// consistent last-writer-wins snapshot.
#[async_trait::async_trait]
pub trait SettingsRepository: Send + Sync {
    /// Load the whole document
    async fn load(&self) -> Result<SettingsDocument>;

    /// Replace the whole document
    async fn save(&self, doc: &SettingsDocument) -> Result<()>;

    /// Read one upstream's OAuth state
    async fn get_oauth_state(&self, server: &str) -> Result<Option<OAuthState>>;

    /// Write one upstream's OAuth state atomically
    async fn put_oauth_state(&self, server: &str, state: &OAuthState) -> Result<()>;
}

/// Build the settings repository selected by MCPHUB_SETTINGS_BACKEND
/// (`file` default, `memory` for ephemeral runs).
pub fn settings_repository_from_env(data_root: &str) -> Arc<dyn SettingsRepository> {
    match std::env::var(constants::ENV_SETTINGS_BACKEND).as_deref() {
        Ok("memory") => Arc::new(MemorySettingsRepository::new()),
        _ => {
            let path = PathBuf::from(data_root).join(constants::SETTINGS_FILE_NAME);
            Arc::new(FileSettingsRepository::new(path))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn oauth_state_round_trip_memory() {
        let repo = MemorySettingsRepository::new();
        assert!(repo.get_oauth_state("time").await.unwrap().is_none());

        let state = OAuthState {
            client_id: Some("abc".into()),
            access_token: Some("tok".into()),
            ..Default::default()
        };
        repo.put_oauth_state("time", &state).await.unwrap();

        let loaded = repo.get_oauth_state("time").await.unwrap().unwrap();
        assert_eq!(loaded.client_id.as_deref(), Some("abc"));
        assert_eq!(loaded.access_token.as_deref(), Some("tok"));
    }

    #[tokio::test]
    async fn file_repository_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let repo = FileSettingsRepository::new(path.clone());

        let mut doc = SettingsDocument::default();
        doc.oauth.insert(
            "weather".into(),
            OAuthState {
                refresh_token: Some("r".into()),
                ..Default::default()
            },
        );
        repo.save(&doc).await.unwrap();

        // a second repository over the same path sees the write
        let repo2 = FileSettingsRepository::new(path);
        let loaded = repo2.load().await.unwrap();
        assert_eq!(
            loaded.oauth["weather"].refresh_token.as_deref(),
            Some("r")
        );
    }

    #[tokio::test]
    async fn put_oauth_state_preserves_other_servers() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileSettingsRepository::new(dir.path().join("settings.json"));

        repo.put_oauth_state(
            "a",
            &OAuthState {
                client_id: Some("ca".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        repo.put_oauth_state(
            "b",
            &OAuthState {
                client_id: Some("cb".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let a = repo.get_oauth_state("a").await.unwrap().unwrap();
        assert_eq!(a.client_id.as_deref(), Some("ca"));
    }
}
