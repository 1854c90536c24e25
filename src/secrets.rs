//! API credential access
//!
//! Key storage/encryption lives outside this service; the core only sees
//! the `SecretStore` interface. The env-backed implementation is what
//! deployments wire in when an external vault is not configured.

use crate::models::Id;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SecretError {
    #[error("No credentials configured for account {0}")]
    NotFound(Id),

    #[error("Secret backend error: {0}")]
    Backend(String),
}

/// Exchange API credentials. `Debug` never prints the secret material.
#[derive(Clone)]
pub struct ApiCredentials {
    pub api_key: String,
    pub api_secret: String,
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &format!("{}***", &self.api_key[..4.min(self.api_key.len())]))
            .field("api_secret", &"***")
            .finish()
    }
}

pub trait SecretStore: Send + Sync {
    fn get(&self, account_id: Id) -> Result<ApiCredentials, SecretError>;
}

/// Reads `ACCOUNT_<id>_API_KEY` / `ACCOUNT_<id>_API_SECRET`.
pub struct EnvSecretStore;

impl SecretStore for EnvSecretStore {
    fn get(&self, account_id: Id) -> Result<ApiCredentials, SecretError> {
        let api_key = std::env::var(format!("ACCOUNT_{}_API_KEY", account_id))
            .map_err(|_| SecretError::NotFound(account_id))?;
        let api_secret = std::env::var(format!("ACCOUNT_{}_API_SECRET", account_id))
            .map_err(|_| SecretError::NotFound(account_id))?;
        Ok(ApiCredentials { api_key, api_secret })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_masks_secrets() {
        let creds = ApiCredentials {
            api_key: "vmPUZE6mv9SD5VNHk4Hl".to_string(),
            api_secret: "NhqPtmdSJYdKjVHjA7PZ".to_string(),
        };
        let dbg = format!("{:?}", creds);
        assert!(dbg.contains("vmPU***"));
        assert!(!dbg.contains("NhqPtmdSJYdKjVHjA7PZ"));
        assert!(!dbg.contains("vmPUZE6mv9SD5VNHk4Hl"));
    }

    #[test]
    fn test_env_store_missing() {
        let store = EnvSecretStore;
        assert!(matches!(store.get(987654), Err(SecretError::NotFound(_))));
    }
}
