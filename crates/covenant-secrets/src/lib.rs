/*
 * Covenant - Workload agreement negotiation fabric
 * Copyright (C) 2025–2026 Covenant Systems <oss@covenantsystems.io>
 *
 * This program is free software: you can redistribute it
 * and/or modify it under the terms of the GNU Affero
 * General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your
 * option) any later version.
 *
 * This program is distributed in the hope that it will be
 * useful, but WITHOUT ANY WARRANTY; without even the
 * implied warranty of MERCHANTABILITY or FITNESS FOR A
 * PARTICULAR PURPOSE. See the GNU Affero General Public
 * License for more details.
 *
 * You should have received a copy of the GNU Affero General
 * Public License along with this program. If not, see
 * <https://www.gnu.org/licenses/>.
 */

//! Secrets access for Covenant services. An agbot resolves a handful of
//! credentials at startup (exchange token, database password) and
//! workload passwords at proposal time, so the access pattern is a small,
//! read-mostly key set. Providers serve dotted keys (`exchange.token`);
//! nested documents are flattened to that form.

#![allow(clippy::module_name_repetitions)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

/// Errors from secrets operations.
#[derive(thiserror::Error, Debug)]
pub enum SecretsError {
    #[error("secret not found: {0}")]
    NotFound(String),
    #[error("secrets backend failed: {0}")]
    Backend(String),
    #[error("secrets misconfigured: {0}")]
    Config(String),
}

/// Trait for secrets providers.
#[async_trait::async_trait]
pub trait SecretsProvider: Send + Sync {
    async fn get(&self, key: &str) -> Result<String, SecretsError>;
    async fn list(&self) -> Result<Vec<String>, SecretsError>;
}

// ---------------------------------------------------------------------------
// SOPS provider
// ---------------------------------------------------------------------------

struct SopsSnapshot {
    values: HashMap<String, String>,
    loaded_at: Instant,
}

/// SOPS-backed provider for development and small fleets.
///
/// Decrypts the whole file once per refresh window and answers lookups
/// (hits and misses alike) from the flattened snapshot. With a key set
/// this small, one subprocess per window beats one per lookup, and a
/// missing key never shells out repeatedly.
pub struct SopsProvider {
    secrets_file: PathBuf,
    identity: PathBuf,
    refresh: Duration,
    exec_timeout: Duration,
    snapshot: RwLock<Option<SopsSnapshot>>,
}

impl SopsProvider {
    #[must_use]
    pub fn new(secrets_file: PathBuf, identity: PathBuf) -> Self {
        Self {
            secrets_file,
            identity,
            refresh: Duration::from_secs(300),
            exec_timeout: Duration::from_secs(5),
            snapshot: RwLock::new(None),
        }
    }

    #[cfg(test)]
    fn with_snapshot(values: HashMap<String, String>) -> Self {
        let mut p = Self::new(PathBuf::from("/dev/null"), PathBuf::from("/dev/null"));
        p.snapshot = RwLock::new(Some(SopsSnapshot {
            values,
            loaded_at: Instant::now(),
        }));
        p
    }

    async fn decrypt_file(&self) -> Result<HashMap<String, String>, SecretsError> {
        let output = tokio::time::timeout(
            self.exec_timeout,
            tokio::process::Command::new("sops")
                .arg("--decrypt")
                .arg("--output-type")
                .arg("json")
                .arg(&self.secrets_file)
                .env("SOPS_AGE_KEY_FILE", &self.identity)
                .output(),
        )
        .await
        .map_err(|_| SecretsError::Backend("sops timed out".to_string()))?
        .map_err(|e| SecretsError::Backend(format!("sops failed to run: {e}")))?;

        if !output.status.success() {
            return Err(SecretsError::Backend(format!(
                "sops exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let doc: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| SecretsError::Backend(format!("sops produced invalid json: {e}")))?;
        let mut values = HashMap::new();
        flatten_into("", &doc, &mut values);
        Ok(values)
    }

    /// Look a key up in the current snapshot, refreshing it first when
    /// stale or absent.
    async fn lookup(&self, key: &str) -> Result<Option<String>, SecretsError> {
        {
            let snapshot = self.snapshot.read().await;
            if let Some(s) = snapshot.as_ref() {
                if s.loaded_at.elapsed() < self.refresh {
                    return Ok(s.values.get(key).cloned());
                }
            }
        }

        let values = self.decrypt_file().await?;
        let found = values.get(key).cloned();
        let mut snapshot = self.snapshot.write().await;
        *snapshot = Some(SopsSnapshot {
            values,
            loaded_at: Instant::now(),
        });
        Ok(found)
    }
}

#[async_trait::async_trait]
impl SecretsProvider for SopsProvider {
    async fn get(&self, key: &str) -> Result<String, SecretsError> {
        self.lookup(key)
            .await?
            .ok_or_else(|| SecretsError::NotFound(key.to_string()))
    }

    async fn list(&self) -> Result<Vec<String>, SecretsError> {
        // Force a lookup so the snapshot exists, then read its keys.
        let _ = self.lookup("").await?;
        let snapshot = self.snapshot.read().await;
        let mut keys: Vec<String> = snapshot
            .as_ref()
            .map(|s| s.values.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }
}

/// Flatten a decrypted document into dotted keys. Nested objects recurse;
/// scalars stringify; nulls are dropped.
fn flatten_into(prefix: &str, value: &serde_json::Value, out: &mut HashMap<String, String>) {
    match value {
        serde_json::Value::Object(map) => {
            for (k, v) in map {
                let key = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{prefix}.{k}")
                };
                flatten_into(&key, v, out);
            }
        }
        serde_json::Value::Null => {}
        serde_json::Value::String(s) => {
            if !prefix.is_empty() {
                out.insert(prefix.to_string(), s.clone());
            }
        }
        other => {
            if !prefix.is_empty() {
                out.insert(prefix.to_string(), other.to_string());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Env provider
// ---------------------------------------------------------------------------

/// Environment-variable secrets provider for containerized deployments
/// where secrets are injected by the orchestrator.
///
/// A key `pg.password` with prefix `COVENANT` resolves to the env var
/// `COVENANT_PG_PASSWORD`.
pub struct EnvProvider {
    prefix: String,
}

impl EnvProvider {
    #[must_use]
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    fn var_name(&self, key: &str) -> String {
        let suffix = key.replace(['.', '-', '/'], "_").to_uppercase();
        if self.prefix.is_empty() {
            suffix
        } else {
            format!("{}_{suffix}", self.prefix)
        }
    }
}

#[async_trait::async_trait]
impl SecretsProvider for EnvProvider {
    async fn get(&self, key: &str) -> Result<String, SecretsError> {
        let name = self.var_name(key);
        match std::env::var(&name) {
            Ok(v) if !v.is_empty() => Ok(v),
            _ => Err(SecretsError::NotFound(key.to_string())),
        }
    }

    async fn list(&self) -> Result<Vec<String>, SecretsError> {
        let prefix = if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}_", self.prefix)
        };
        Ok(std::env::vars()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => PathBuf::from(path),
    }
}

/// Build the provider the `[secrets]` config section names.
///
/// # Errors
///
/// Returns `SecretsError::Config` when the named backend is unknown or
/// the section is missing the fields that backend needs.
pub fn create_provider(
    cfg: &covenant_config::SecretsConfig,
) -> Result<Box<dyn SecretsProvider>, SecretsError> {
    let missing =
        |field: &str| SecretsError::Config(format!("secrets.{field} is required for sops"));
    match cfg.provider.as_str() {
        "sops" => {
            let file = cfg.sops_file.as_deref().ok_or_else(|| missing("sops_file"))?;
            let identity = cfg
                .age_identity
                .as_deref()
                .ok_or_else(|| missing("age_identity"))?;
            Ok(Box::new(SopsProvider::new(
                expand_tilde(file),
                expand_tilde(identity),
            )))
        }
        "env" => Ok(Box::new(EnvProvider::new(
            cfg.env_prefix.as_deref().unwrap_or("COVENANT"),
        ))),
        other => Err(SecretsError::Config(format!(
            "unknown secrets provider: {other}"
        ))),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_nested_document() {
        let doc = serde_json::json!({
            "exchange": {"token": "t0k3n"},
            "pg": {"password": "pw"},
            "workload-pw": {"e2edev/weather": "wpw"},
            "retries": 3,
            "unset": null
        });
        let mut out = HashMap::new();
        flatten_into("", &doc, &mut out);

        assert_eq!(out.get("exchange.token").unwrap(), "t0k3n");
        assert_eq!(out.get("pg.password").unwrap(), "pw");
        assert_eq!(out.get("workload-pw.e2edev/weather").unwrap(), "wpw");
        assert_eq!(out.get("retries").unwrap(), "3", "scalars stringify");
        assert!(!out.contains_key("unset"), "nulls are dropped");
    }

    #[test]
    fn test_flatten_top_level_scalar_is_ignored() {
        let mut out = HashMap::new();
        flatten_into("", &serde_json::json!("bare"), &mut out);
        assert!(out.is_empty(), "a keyless scalar has no address");
    }

    #[tokio::test]
    async fn test_sops_snapshot_serves_hits_and_misses() {
        let mut values = HashMap::new();
        values.insert("exchange.token".to_string(), "t0k3n".to_string());
        let provider = SopsProvider::with_snapshot(values);

        assert_eq!(provider.get("exchange.token").await.unwrap(), "t0k3n");
        // A miss against a fresh snapshot must not shell out to sops.
        assert!(matches!(
            provider.get("no.such.key").await,
            Err(SecretsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sops_list_returns_sorted_keys() {
        let mut values = HashMap::new();
        values.insert("pg.password".to_string(), "x".to_string());
        values.insert("exchange.token".to_string(), "y".to_string());
        let provider = SopsProvider::with_snapshot(values);

        let keys = provider.list().await.unwrap();
        assert_eq!(keys, vec!["exchange.token", "pg.password"]);
    }

    fn secrets_config(provider: &str) -> covenant_config::SecretsConfig {
        covenant_config::SecretsConfig {
            provider: provider.to_string(),
            sops_file: Some("./secrets.enc.json".to_string()),
            age_identity: Some("~/.config/sops/age/keys.txt".to_string()),
            env_prefix: None,
        }
    }

    #[test]
    fn test_factory_builds_configured_backends() {
        assert!(create_provider(&secrets_config("sops")).is_ok());
        assert!(create_provider(&secrets_config("env")).is_ok());
    }

    #[test]
    fn test_factory_requires_sops_paths() {
        let mut cfg = secrets_config("sops");
        cfg.sops_file = None;
        let err = create_provider(&cfg).err().unwrap();
        assert!(matches!(err, SecretsError::Config(_)));
        assert!(err.to_string().contains("sops_file"));
    }

    #[test]
    fn test_factory_rejects_unknown_backend() {
        let err = create_provider(&secrets_config("vault")).err().unwrap();
        assert!(err.to_string().contains("unknown secrets provider"));
    }

    #[test]
    fn test_env_var_name_mapping() {
        let p = EnvProvider::new("COVENANT");
        assert_eq!(p.var_name("pg.password"), "COVENANT_PG_PASSWORD");
        assert_eq!(p.var_name("agbot-token"), "COVENANT_AGBOT_TOKEN");
        assert_eq!(p.var_name("workload-pw/org/pol"), "COVENANT_WORKLOAD_PW_ORG_POL");
    }

    #[tokio::test]
    async fn test_env_provider_roundtrip() {
        std::env::set_var("COVTEST_EXCHANGE_TOKEN", "s3cret");
        let p = EnvProvider::new("COVTEST");
        let v = p.get("exchange.token").await.unwrap();
        assert_eq!(v, "s3cret");
        std::env::remove_var("COVTEST_EXCHANGE_TOKEN");
    }

    #[tokio::test]
    async fn test_env_provider_missing_key() {
        let p = EnvProvider::new("COVTEST");
        let result = p.get("no.such.key").await;
        assert!(matches!(result, Err(SecretsError::NotFound(_))));
    }

    #[test]
    fn test_tilde_expansion_in_paths() {
        let expanded = expand_tilde("~/keys/age.txt");
        assert!(!expanded.starts_with("~"));
        assert!(expanded.to_string_lossy().ends_with("keys/age.txt"));
        assert_eq!(expand_tilde("/abs/path"), PathBuf::from("/abs/path"));
    }
}
