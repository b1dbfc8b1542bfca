//! Trait and types for talking to a vehicle-sharing provider.

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use crate::fleet::Vehicle;

/// Failures reported by a [`FleetApi`].
#[derive(Debug, Error)]
pub enum ApiError {
    /// The provider rejected the request with a 4xx status. Logging in again
    /// is expected to fix it.
    #[error("provider requires authentication (HTTP {status}): {message}")]
    AuthRequired { status: u16, message: String },
    #[error("provider returned HTTP {status}: {message}")]
    Server { status: u16, message: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected response body: {0}")]
    Decode(#[from] serde_json::Error),
    /// The login handshake itself failed.
    #[error("login failed: {0}")]
    Login(String),
    #[error("invalid client configuration: {0}")]
    Config(String),
}

impl ApiError {
    pub fn is_auth_required(&self) -> bool {
        matches!(self, ApiError::AuthRequired { .. })
    }
}

/// Supplies the one-time code sent out of band (e.g. by SMS) during login.
#[async_trait]
pub trait CodePrompt: Send + Sync {
    async fn one_time_code(&self) -> Result<String>;
}

/// A prompt that always answers with the same code. Useful for automated
/// credential refresh and tests.
#[derive(Debug, Clone)]
pub struct FixedCode(pub String);

#[async_trait]
impl CodePrompt for FixedCode {
    async fn one_time_code(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Abstraction over a provider's fleet endpoint.
#[async_trait]
pub trait FleetApi: Send + Sync {
    /// Namespace the vehicles belong to, e.g. `"circ"`.
    fn provider(&self) -> &str;

    /// Returns every vehicle currently visible in the configured area.
    async fn fetch_fleet(&self) -> Result<Vec<Vehicle>, ApiError>;

    /// Runs the interactive login, asking `prompt` for the one-time code.
    async fn reauthenticate(&self, prompt: &dyn CodePrompt) -> Result<(), ApiError>;
}
