//! Bearer credentials for AVS requests.
//!
//! The login flow itself lives outside this crate. It hands tokens to a
//! [`TokenSource`], and the client asks that source for the current token
//! right before every request.

use crate::config::ConfigError;
use crate::error::{AvsError, Result};
use secrecy::{ExposeSecret, SecretBox};
use std::env;
use std::sync::RwLock;

pub const ACCESS_TOKEN_ENV: &str = "AVS_ACCESS_TOKEN";

/// Supplies the current bearer token on demand
pub trait TokenSource: Send + Sync {
    /// Returns the token, or `AvsError::Auth` when not logged in
    fn bearer_token(&self) -> Result<String>;
}

/// A token fixed at construction time
pub struct StaticTokenSource {
    token: SecretBox<String>,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: SecretBox::new(Box::new(token.into())),
        }
    }

    /// Read the token from `AVS_ACCESS_TOKEN` (or a `.env` file)
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let token = env::var(ACCESS_TOKEN_ENV)
            .map_err(|_| ConfigError::MissingEnvVar(ACCESS_TOKEN_ENV.to_string()))?;
        if token.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                var: ACCESS_TOKEN_ENV.to_string(),
                reason: "access token cannot be empty".to_string(),
            });
        }

        Ok(Self::new(token.trim()))
    }
}

impl TokenSource for StaticTokenSource {
    fn bearer_token(&self) -> Result<String> {
        Ok(self.token.expose_secret().clone())
    }
}

/// A token slot the login flow can fill, refresh and clear at runtime
#[derive(Default)]
pub struct SharedTokenSource {
    token: RwLock<Option<SecretBox<String>>>,
}

impl SharedTokenSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_token(&self, token: impl Into<String>) {
        let mut slot = self.token.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(SecretBox::new(Box::new(token.into())));
        log::debug!("🔑 Access token updated");
    }

    /// Forget the token, e.g. after logout
    pub fn clear(&self) {
        let mut slot = self.token.write().unwrap_or_else(|e| e.into_inner());
        *slot = None;
        log::debug!("🔑 Access token cleared");
    }
}

impl TokenSource for SharedTokenSource {
    fn bearer_token(&self) -> Result<String> {
        let slot = self.token.read().unwrap_or_else(|e| e.into_inner());
        slot.as_ref()
            .map(|token| token.expose_secret().clone())
            .ok_or_else(|| AvsError::Auth("not logged in, no access token available".to_string()))
    }
}
