//! Environment variable based secrets provider
//!
//! The default provider. Reads directly from the process environment, with
//! .env file support via dotenvy.

use super::*;

/// Default secrets provider backed by environment variables.
///
/// This is the only place where `dotenvy::dotenv()`, `std::env::var()` and
/// `std::env::vars()` are called for expansion purposes; everything else goes
/// through the SecretsProvider trait.
pub struct EnvSecretsProvider;

impl EnvSecretsProvider {
    /// Create a new environment-based secrets provider.
    ///
    /// Loads a .env file from the current or any parent directory if one
    /// exists; a missing .env file is not an error.
    pub fn new() -> Self {
        let _ = dotenvy::dotenv();
        Self
    }
}

impl Default for EnvSecretsProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SecretsProvider for EnvSecretsProvider {
    async fn get_secret(&self, key: &str) -> Result<Option<String>> {
        Ok(std::env::var(key).ok())
    }

    async fn get_all_secrets(&self) -> Result<HashMap<String, String>> {
        Ok(std::env::vars().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_secret_reads_environment() {
        unsafe {
            std::env::set_var("HUB_ENV_PROVIDER_TEST", "test_value");
        }

        let provider = EnvSecretsProvider::new();
        let result = provider.get_secret("HUB_ENV_PROVIDER_TEST").await.unwrap();
        assert_eq!(result, Some("test_value".to_string()));

        unsafe {
            std::env::remove_var("HUB_ENV_PROVIDER_TEST");
        }
    }

    #[tokio::test]
    async fn missing_secret_is_none() {
        let provider = EnvSecretsProvider::new();
        let result = provider.get_secret("HUB_NONEXISTENT_VAR").await.unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn get_secret_or_falls_back() {
        let provider = EnvSecretsProvider::new();
        let result = provider
            .get_secret_or("HUB_NONEXISTENT_VAR", "8080")
            .await
            .unwrap();
        assert_eq!(result, "8080");
    }
}
