//! Proxy configuration: TOML file + CLI overrides, plus the credential
//! store the user ledger is seeded from.

use mesh_core::{MeshError, MeshResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub proxy: ProxySection,
}

/// `[proxy]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxySection {
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
    #[serde(default = "default_users_file")]
    pub users_file: String,
    #[serde(default = "default_offline_timeout")]
    pub offline_timeout_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            tcp_port: default_tcp_port(),
            udp_port: default_udp_port(),
            users_file: default_users_file(),
            offline_timeout_secs: default_offline_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_tcp_port() -> u16 {
    12290
}
fn default_udp_port() -> u16 {
    12291
}
fn default_users_file() -> String {
    "users.toml".to_string()
}
fn default_offline_timeout() -> u64 {
    3
}
fn default_sweep_interval() -> u64 {
    1
}

/// Resolved proxy configuration (CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub tcp_port: u16,
    pub udp_port: u16,
    pub users_file: PathBuf,
    pub offline_timeout: Duration,
    pub sweep_interval: Duration,
}

impl ProxyConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_tcp_port: Option<u16>,
        cli_udp_port: Option<u16>,
        cli_users_file: Option<&str>,
        cli_offline_timeout_secs: Option<u64>,
        cli_sweep_interval_secs: Option<u64>,
    ) -> MeshResult<Self> {
        let file_config = if let Some(path) = config_path {
            if path.exists() {
                info!(path = %path.display(), "loading config file");
                let content = std::fs::read_to_string(path)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| MeshError::Other(format!("config parse error: {e}")))?
            } else {
                info!(path = %path.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        let tcp_port = cli_tcp_port.unwrap_or(file_config.proxy.tcp_port);
        let udp_port = cli_udp_port.unwrap_or(file_config.proxy.udp_port);
        let users_file = cli_users_file
            .map(|s| s.to_string())
            .unwrap_or(file_config.proxy.users_file);
        let offline_timeout_secs =
            cli_offline_timeout_secs.unwrap_or(file_config.proxy.offline_timeout_secs);
        let sweep_interval_secs =
            cli_sweep_interval_secs.unwrap_or(file_config.proxy.sweep_interval_secs);

        Ok(Self {
            tcp_port,
            udp_port,
            users_file: PathBuf::from(users_file),
            offline_timeout: Duration::from_secs(offline_timeout_secs),
            sweep_interval: Duration::from_secs(sweep_interval_secs),
        })
    }
}

/// Load user accounts from the credential store.
///
/// The store is a flat TOML table: one `name = "password"` entry plus one
/// quoted `"name.credits" = <integer>` entry per account. Accounts missing
/// either half are skipped with a warning; an unreadable store is an error.
pub fn load_users(path: &Path) -> MeshResult<Vec<(String, String, i64)>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| MeshError::Other(format!("cannot read users file {}: {e}", path.display())))?;
    let table: toml::Table = toml::from_str(&content)
        .map_err(|e| MeshError::Other(format!("users file parse error: {e}")))?;

    let mut accounts = Vec::new();
    for (name, value) in &table {
        if name.ends_with(".credits") {
            continue;
        }
        let Some(password) = value.as_str() else {
            warn!(user = %name, "skipping user without a string password");
            continue;
        };
        let credits_key = format!("{}.credits", name);
        let Some(credits) = table.get(&credits_key).and_then(|v| v.as_integer()) else {
            warn!(user = %name, "skipping user without a credits entry");
            continue;
        };
        accounts.push((name.clone(), password.to_string(), credits));
    }
    info!(count = accounts.len(), path = %path.display(), "loaded user accounts");
    Ok(accounts)
}
