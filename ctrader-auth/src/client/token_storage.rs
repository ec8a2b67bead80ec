use crate::common::OAuthTokens;
use crate::error::AuthError;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

/// JSON token file shared with other tools.
///
/// Saving merges into whatever object is already on disk, so fields this crate does not
/// know about (credentials, UI state) survive a refresh.
#[derive(Debug, Clone)]
pub struct TokenStore {
    token_path: PathBuf,
}

impl TokenStore {
    pub fn new(token_path: impl Into<PathBuf>) -> Self {
        Self {
            token_path: token_path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.token_path
    }

    pub fn save(&self, tokens: &OAuthTokens) -> Result<(), AuthError> {
        self.save_with_extra(tokens, Map::new())
    }

    /// Persist `tokens` plus `extra` top-level fields. Token fields take precedence.
    pub fn save_with_extra(
        &self,
        tokens: &OAuthTokens,
        extra: Map<String, Value>,
    ) -> Result<(), AuthError> {
        let mut document = self.read_document();
        document.extend(extra);

        match serde_json::to_value(tokens)? {
            Value::Object(fields) => document.extend(fields),
            _ => return Err(AuthError::TokenStorage("tokens must serialize to an object".into())),
        }

        if let Some(parent) = self.token_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                AuthError::TokenStorage(format!("Failed to create token directory: {}", e))
            })?;
        }

        let json = serde_json::to_string_pretty(&Value::Object(document))?;
        fs::write(&self.token_path, json)
            .map_err(|e| AuthError::TokenStorage(format!("Failed to save token: {}", e)))?;

        // Set permissions to 0600 (read/write for owner only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&self.token_path)
                .map_err(|e| {
                    AuthError::TokenStorage(format!("Failed to get file permissions: {}", e))
                })?
                .permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&self.token_path, perms).map_err(|e| {
                AuthError::TokenStorage(format!("Failed to set file permissions: {}", e))
            })?;
        }

        tracing::debug!(path = %self.token_path.display(), "Saved OAuth tokens");
        Ok(())
    }

    /// Load tokens, ignoring any extra fields in the file.
    pub fn load(&self) -> Result<Option<OAuthTokens>, AuthError> {
        if !self.token_path.exists() {
            return Ok(None);
        }

        let json = fs::read_to_string(&self.token_path)
            .map_err(|e| AuthError::TokenStorage(format!("Failed to read token: {}", e)))?;

        let tokens: OAuthTokens = serde_json::from_str(&json)?;
        Ok(Some(tokens))
    }

    pub fn delete(&self) -> Result<(), AuthError> {
        if self.token_path.exists() {
            fs::remove_file(&self.token_path)
                .map_err(|e| AuthError::TokenStorage(format!("Failed to delete token: {}", e)))?;
        }
        Ok(())
    }

    fn read_document(&self) -> Map<String, Value> {
        fs::read_to_string(&self.token_path)
            .ok()
            .and_then(|json| serde_json::from_str::<Value>(&json).ok())
            .and_then(|value| match value {
                Value::Object(fields) => Some(fields),
                _ => None,
            })
            .unwrap_or_default()
    }
}
