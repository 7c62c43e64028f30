//! Default credential store for container registries.
//!
//! Reads the Docker client configuration (`$DOCKER_CONFIG/config.json`, or
//! `~/.docker/config.json`). Entries carry either a base64 `auth` field
//! (`user:password`) or explicit `username`/`password` fields.

use std::collections::HashMap;
use std::path::PathBuf;

use base64::Engine;
use relok_core::error::{MoverError, Result};
use serde::Deserialize;

use super::reference::normalize_registry;

/// Per-registry credential entry.
#[derive(Debug, Clone, Default, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/// Docker client config file format (only the parts we read).
#[derive(Debug, Default, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
}

/// Read-only view of the local Docker credential store.
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Open the store at its default location.
    pub fn default_path() -> Result<Self> {
        if let Ok(dir) = std::env::var("DOCKER_CONFIG") {
            if !dir.is_empty() {
                return Ok(Self {
                    path: PathBuf::from(dir).join("config.json"),
                });
            }
        }
        let home = dirs::home_dir().ok_or_else(|| {
            MoverError::Other("Cannot determine home directory for credential store".to_string())
        })?;
        Ok(Self {
            path: home.join(".docker").join("config.json"),
        })
    }

    /// Open a store at a custom path.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Get credentials for a registry. Returns `(username, password)`.
    pub fn get(&self, registry: &str) -> Result<Option<(String, String)>> {
        let file = self.load()?;
        let wanted = normalize_server(registry);

        let entry = file
            .auths
            .iter()
            .find(|(server, _)| normalize_server(server) == wanted)
            .map(|(_, entry)| entry);

        match entry {
            Some(entry) => decode_entry(registry, entry),
            None => Ok(None),
        }
    }

    /// Load the config file from disk. Returns empty if not found.
    fn load(&self) -> Result<DockerConfigFile> {
        if !self.path.exists() {
            return Ok(DockerConfigFile::default());
        }
        let data = std::fs::read_to_string(&self.path).map_err(|e| {
            MoverError::Other(format!(
                "Failed to read credential store {}: {}",
                self.path.display(),
                e
            ))
        })?;
        serde_json::from_str(&data).map_err(|e| {
            MoverError::Other(format!(
                "Failed to parse credential store {}: {}",
                self.path.display(),
                e
            ))
        })
    }
}

fn decode_entry(registry: &str, entry: &AuthEntry) -> Result<Option<(String, String)>> {
    if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
        return Ok(Some((username.clone(), password.clone())));
    }

    let Some(auth) = entry.auth.as_deref().filter(|a| !a.is_empty()) else {
        return Ok(None);
    };
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(auth)
        .map_err(|e| {
            MoverError::InvalidCredentials(format!("bad auth entry for {}: {}", registry, e))
        })?;
    let decoded = String::from_utf8(decoded).map_err(|e| {
        MoverError::InvalidCredentials(format!("bad auth entry for {}: {}", registry, e))
    })?;
    match decoded.split_once(':') {
        Some((user, pass)) => Ok(Some((user.to_string(), pass.to_string()))),
        None => Err(MoverError::InvalidCredentials(format!(
            "auth entry for {} is not user:password",
            registry
        ))),
    }
}

/// Reduce a config key (which may be a URL) to a canonical registry host.
fn normalize_server(server: &str) -> String {
    let s = server
        .strip_prefix("https://")
        .or_else(|| server.strip_prefix("http://"))
        .unwrap_or(server);
    let host = s.split('/').next().unwrap_or(s);
    normalize_registry(host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_with(dir: &TempDir, json: &str) -> CredentialStore {
        let path = dir.path().join("config.json");
        std::fs::write(&path, json).unwrap();
        CredentialStore::new(path)
    }

    #[test]
    fn test_get_base64_auth() {
        let dir = TempDir::new().unwrap();
        // "user1:pass1"
        let store = store_with(&dir, r#"{"auths":{"ghcr.io":{"auth":"dXNlcjE6cGFzczE="}}}"#);
        let creds = store.get("ghcr.io").unwrap();
        assert_eq!(creds, Some(("user1".to_string(), "pass1".to_string())));
    }

    #[test]
    fn test_get_username_password() {
        let dir = TempDir::new().unwrap();
        let store = store_with(
            &dir,
            r#"{"auths":{"harbor.local:8443":{"username":"robot","password":"s3cret"}}}"#,
        );
        let creds = store.get("harbor.local:8443").unwrap();
        assert_eq!(creds, Some(("robot".to_string(), "s3cret".to_string())));
    }

    #[test]
    fn test_get_nonexistent() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir, r#"{"auths":{}}"#);
        assert_eq!(store.get("ghcr.io").unwrap(), None);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path().join("absent.json"));
        assert_eq!(store.get("ghcr.io").unwrap(), None);
    }

    #[test]
    fn test_docker_hub_url_key() {
        let dir = TempDir::new().unwrap();
        let store = store_with(
            &dir,
            r#"{"auths":{"https://index.docker.io/v1/":{"auth":"dXNlcjpwYXNz"}}}"#,
        );
        let expected = Some(("user".to_string(), "pass".to_string()));
        assert_eq!(store.get("index.docker.io").unwrap(), expected);
        assert_eq!(store.get("docker.io").unwrap(), expected);
    }

    #[test]
    fn test_malformed_auth_rejected() {
        let dir = TempDir::new().unwrap();
        // "nocolon"
        let store = store_with(&dir, r#"{"auths":{"quay.io":{"auth":"bm9jb2xvbg=="}}}"#);
        assert!(store.get("quay.io").is_err());
    }

    #[test]
    fn test_normalize_server() {
        assert_eq!(normalize_server("https://quay.io/v2/"), "quay.io");
        assert_eq!(normalize_server("registry-1.docker.io"), "index.docker.io");
        assert_eq!(normalize_server("localhost:5000"), "localhost:5000");
    }
}
