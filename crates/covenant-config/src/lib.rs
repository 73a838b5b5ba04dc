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

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use serde::Deserialize;
use std::collections::HashMap;

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    pub covenant: CovenantConfig,
    pub exchange: ExchangeConfig,
    pub agbot: AgbotConfig,
    pub postgres: PostgresConfig,
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Deserialize, Clone, Debug)]
pub struct CovenantConfig {
    pub env: String,
    pub version: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ExchangeConfig {
    /// Base URL of the exchange, with a trailing slash (e.g. `https://exchange/v1/`).
    pub url: String,
    /// Object-store (CSS) URL. Empty disables MMS object re-evaluation.
    #[serde(default)]
    pub css_url: String,
    /// Directory holding the agbot mailbox keypair (`agbot.priv` / `agbot.pub`).
    pub message_key_path: String,
    #[serde(default = "default_message_ttl_factor")]
    pub message_ttl_factor: u64,
    #[serde(default = "default_message_ttl_s")]
    pub message_ttl_s: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_message_ttl_factor() -> u64 {
    3
}

fn default_message_ttl_s() -> u64 {
    1800
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl ExchangeConfig {
    /// TTL for an outbound mailbox message, derived from the receiver's
    /// max-heartbeat interval. A node that heartbeats is given `factor`
    /// heartbeat windows to pick the message up; a node with no published
    /// interval gets the static default.
    #[must_use]
    pub fn message_ttl(&self, max_heartbeat_s: u64) -> u64 {
        if max_heartbeat_s == 0 {
            self.message_ttl_s
        } else {
            max_heartbeat_s * self.message_ttl_factor
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct AgbotConfig {
    /// Fully qualified agbot exchange id, `org/id` form.
    pub id: String,
    /// Secrets key holding the agbot's exchange token.
    pub token_key: String,
    /// Datastore partition owned by this instance.
    pub partition: String,
    #[serde(default = "default_agreement_workers")]
    pub agreement_workers: usize,
    #[serde(default = "default_agreement_queue_size")]
    pub agreement_queue_size: usize,
    #[serde(default = "default_process_governance_interval_s")]
    pub process_governance_interval_s: u64,
    #[serde(default = "default_no_data_interval_s")]
    pub no_data_interval_s: u64,
    #[serde(default)]
    pub default_workload_pw: String,
    /// Maps reported node architectures onto their canonical names
    /// (e.g. `x86_64 = "amd64"`).
    #[serde(default)]
    pub arch_synonyms: HashMap<String, String>,
}

fn default_agreement_workers() -> usize {
    5
}

fn default_agreement_queue_size() -> usize {
    250
}

fn default_process_governance_interval_s() -> u64 {
    10
}

fn default_no_data_interval_s() -> u64 {
    300
}

impl AgbotConfig {
    /// Canonical architecture for a node-reported arch string.
    /// Returns the input unchanged when no synonym is configured.
    #[must_use]
    pub fn canonical_arch<'a>(&'a self, arch: &'a str) -> &'a str {
        self.arch_synonyms.get(arch).map_or(arch, String::as_str)
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password_key: String,
    #[serde(default = "default_pg_min")]
    pub min_connections: u32,
    #[serde(default = "default_pg_max")]
    pub max_connections: u32,
}

fn default_pg_min() -> u32 {
    2
}
fn default_pg_max() -> u32 {
    10
}

#[derive(Deserialize, Clone, Debug)]
pub struct SecretsConfig {
    pub provider: String,
    #[serde(default)]
    pub sops_file: Option<String>,
    #[serde(default)]
    pub age_identity: Option<String>,
    #[serde(default)]
    pub env_prefix: Option<String>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otlp_endpoint")]
    pub otlp_endpoint: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            otlp_endpoint: default_otlp_endpoint(),
            sample_rate: default_sample_rate(),
        }
    }
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_sample_rate() -> f64 {
    1.0
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{home}/{rest}");
        }
    }
    path.to_string()
}

impl Config {
    /// Load configuration from the file path in the `COVENANT_CONFIG` env var
    /// (default `config.toml`), with environment variable overrides.
    ///
    /// # Errors
    ///
    /// Returns `config::ConfigError` if the config file is missing, malformed,
    /// or required fields are absent.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("COVENANT_CONFIG").unwrap_or_else(|_| "config.toml".to_string());

        let settings = config::Config::builder()
            .add_source(config::File::with_name(&config_path))
            .add_source(
                config::Environment::with_prefix("COVENANT")
                    .separator("_")
                    .try_parsing(true),
            )
            .build()?;

        let mut cfg: Self = settings.try_deserialize()?;

        cfg.exchange.message_key_path = expand_tilde(&cfg.exchange.message_key_path);
        if let Some(ref p) = cfg.secrets.age_identity {
            cfg.secrets.age_identity = Some(expand_tilde(p));
        }
        if let Some(ref p) = cfg.secrets.sops_file {
            cfg.secrets.sops_file = Some(expand_tilde(p));
        }

        Ok(cfg)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// Helper: returns a valid TOML config string that satisfies all required fields.
    fn valid_toml() -> String {
        r#"
[covenant]
env = "test"
version = "0.3.0"

[exchange]
url = "https://exchange.test/v1/"
message_key_path = "/etc/covenant/keys"

[agbot]
id = "testorg/agbot1"
token_key = "AGBOT_TOKEN"
partition = "p1"

[postgres]
host = "127.0.0.1"
port = 5432
database = "covenant"
user = "covenant"
password_key = "PG_PASSWORD"

[secrets]
provider = "env"
"#
        .to_string()
    }

    #[test]
    fn test_load_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        std::fs::write(&config_path, valid_toml()).unwrap();

        std::env::set_var("COVENANT_CONFIG", config_path.to_str().unwrap());

        let cfg = Config::load().unwrap();

        assert_eq!(cfg.covenant.env, "test");
        assert_eq!(cfg.exchange.url, "https://exchange.test/v1/");
        assert_eq!(cfg.agbot.id, "testorg/agbot1");
        assert_eq!(cfg.agbot.partition, "p1");
        assert_eq!(cfg.postgres.port, 5432);
        assert_eq!(cfg.secrets.provider, "env");

        std::env::remove_var("COVENANT_CONFIG");
    }

    #[test]
    fn test_agbot_defaults() {
        let toml_str = r#"
id = "o/a"
token_key = "K"
partition = "p0"
"#;
        let cfg: AgbotConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.agreement_workers, 5);
        assert_eq!(cfg.agreement_queue_size, 250);
        assert_eq!(cfg.process_governance_interval_s, 10);
        assert_eq!(cfg.no_data_interval_s, 300);
        assert!(cfg.default_workload_pw.is_empty());
        assert!(cfg.arch_synonyms.is_empty());
    }

    #[test]
    fn test_canonical_arch_with_synonym() {
        let toml_str = r#"
id = "o/a"
token_key = "K"
partition = "p0"

[arch_synonyms]
x86_64 = "amd64"
armv7l = "arm"
"#;
        let cfg: AgbotConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.canonical_arch("x86_64"), "amd64");
        assert_eq!(cfg.canonical_arch("armv7l"), "arm");
        assert_eq!(cfg.canonical_arch("riscv64"), "riscv64", "unknown arch passes through");
    }

    #[test]
    fn test_message_ttl_derivation() {
        let toml_str = r#"
url = "https://exchange.test/v1/"
message_key_path = "/keys"
"#;
        let cfg: ExchangeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.message_ttl(600), 1800, "heartbeat * factor");
        assert_eq!(cfg.message_ttl(0), 1800, "no heartbeat falls back to static ttl");
    }

    #[test]
    fn test_telemetry_defaults() {
        let cfg = TelemetryConfig::default();
        assert!(!cfg.enabled);
        assert_eq!(cfg.otlp_endpoint, "http://localhost:4317");
        assert!((cfg.sample_rate - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_expand_tilde() {
        let path = expand_tilde("~/covenant/keys");
        assert!(!path.starts_with('~'), "tilde should be expanded");
        assert!(path.ends_with("covenant/keys"));
    }
}
