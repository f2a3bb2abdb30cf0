//! File-backed settings repository
//!
//! The legacy storage format: one JSON document on disk. Writes go through a
//! temp file + rename so a crash mid-write never leaves a torn document.

use std::path::PathBuf;

use tokio::sync::Mutex;

use super::{SettingsDocument, SettingsRepository};
use crate::model::OAuthState;
use crate::{HubError, Result};

pub struct FileSettingsRepository {
    path: PathBuf,
    // serializes read-modify-write cycles across tasks
    lock: Mutex<()>,
}

impl FileSettingsRepository {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    fn read_document(&self) -> Result<SettingsDocument> {
        if !self.path.exists() {
            return Ok(SettingsDocument::default());
        }
        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(SettingsDocument::default());
        }
        serde_json::from_str(&content)
            .map_err(|e| HubError::storage(format!("corrupt settings document: {}", e)))
    }

    fn write_document(&self, doc: &SettingsDocument) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(doc)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl SettingsRepository for FileSettingsRepository {
    async fn load(&self) -> Result<SettingsDocument> {
        let _guard = self.lock.lock().await;
        self.read_document()
    }

    async fn save(&self, doc: &SettingsDocument) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.write_document(doc)
    }

    async fn get_oauth_state(&self, server: &str) -> Result<Option<OAuthState>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_document()?.oauth.get(server).cloned())
    }

    async fn put_oauth_state(&self, server: &str, state: &OAuthState) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut doc = self.read_document()?;
        doc.oauth.insert(server.to_string(), state.clone());
        self.write_document(&doc)
    }
}
