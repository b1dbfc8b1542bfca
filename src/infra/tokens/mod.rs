//! Provider session token persistence.
//!
//! [`Tokens`] is the access/refresh pair issued by the provider.
//! [`TokenStore`] is the async trait for keeping it across restarts.
//! [`FileTokenStore`] implements [`TokenStore`] with a plain JSON file.

mod file;

pub use file::FileTokenStore;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tokens {
    pub access_token: String,
    pub refresh_token: String,
}

/// Loads and stores the current session tokens.
#[async_trait::async_trait]
pub trait TokenStore: Send + Sync {
    async fn load(&self) -> Result<Tokens>;
    async fn store(&self, tokens: &Tokens) -> Result<()>;
}
