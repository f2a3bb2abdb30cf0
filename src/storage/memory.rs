//! In-memory settings repository
//!
//! Used by tests and by ephemeral runs (MCPHUB_SETTINGS_BACKEND=memory).
//! Nothing survives the process.

use parking_lot::RwLock;

use super::{SettingsDocument, SettingsRepository};
use crate::Result;
use crate::model::OAuthState;

#[derive(Default)]
pub struct MemorySettingsRepository {
    doc: RwLock<SettingsDocument>,
}

impl MemorySettingsRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl SettingsRepository for MemorySettingsRepository {
    async fn load(&self) -> Result<SettingsDocument> {
        Ok(self.doc.read().clone())
    }

    async fn save(&self, doc: &SettingsDocument) -> Result<()> {
        *self.doc.write() = doc.clone();
        Ok(())
    }

    async fn get_oauth_state(&self, server: &str) -> Result<Option<OAuthState>> {
        Ok(self.doc.read().oauth.get(server).cloned())
    }

    async fn put_oauth_state(&self, server: &str, state: &OAuthState) -> Result<()> {
        self.doc
            .write()
            .oauth
            .insert(server.to_string(), state.clone());
        Ok(())
    }
}
