use anyhow::{Context, Result};
use std::path::PathBuf;

use super::{TokenStore, Tokens};

/// Keeps tokens in an unencrypted JSON file.
///
/// The file is replaced atomically on every store, so a crash leaves either
/// the old or the new tokens. Parent directories are created as needed.
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl TokenStore for FileTokenStore {
    async fn load(&self) -> Result<Tokens> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read token file '{}'", self.path.display()))?;
        let tokens = serde_json::from_str(&content)
            .with_context(|| format!("token file '{}' is not valid", self.path.display()))?;
        Ok(tokens)
    }

    async fn store(&self, tokens: &Tokens) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, serde_json::to_vec(tokens)?)
            .await
            .with_context(|| format!("failed to write token file '{}'", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("failed to replace token file '{}'", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[tokio::test]
    async fn test_store_then_load() {
        let dir = env::temp_dir().join("fleet_trips_tokens_rw");
        let _ = std::fs::remove_dir_all(&dir);
        let store = FileTokenStore::new(dir.join("nested").join(".tokens"));

        let tokens = Tokens {
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
        };
        store.store(&tokens).await.unwrap();
        assert_eq!(store.load().await.unwrap(), tokens);

        let newer = Tokens {
            access_token: "access2".to_string(),
            refresh_token: "refresh2".to_string(),
        };
        store.store(&newer).await.unwrap();
        assert_eq!(store.load().await.unwrap(), newer);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_failed_store_keeps_previous_tokens() {
        let dir = env::temp_dir().join("fleet_trips_tokens_keep");
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("tokens.json");
        let store = FileTokenStore::new(&path);

        let tokens = Tokens {
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
        };
        store.store(&tokens).await.unwrap();
        assert!(!path.with_extension("tmp").exists());

        // A directory in the way of the temporary file makes the write fail.
        std::fs::create_dir(path.with_extension("tmp")).unwrap();
        let newer = Tokens {
            access_token: "access2".to_string(),
            refresh_token: "refresh2".to_string(),
        };
        assert!(store.store(&newer).await.is_err());
        assert_eq!(store.load().await.unwrap(), tokens);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_load_missing_file_fails() {
        let store = FileTokenStore::new(env::temp_dir().join("fleet_trips_no_such_token_file"));
        assert!(store.load().await.is_err());
    }
}
