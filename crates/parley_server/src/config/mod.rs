#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use parley_util::secret::SecretString;
use serde::Deserialize;
use tracing::info;

/// Default config path: `~/.parley/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".parley").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
#[allow(dead_code)]
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub persistence: PersistenceSettings,
	pub ledger: LedgerSettings,
}

/// Server settings loaded by the server.
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// HMAC secret for signed room credentials.
	pub auth_hmac_secret: Option<SecretString>,
	/// Credential-less development mode.
	pub allow_anonymous: bool,
	/// Number of recent messages sent on auth success.
	pub history_limit: usize,
	/// Outbound queue depth per connection.
	pub outbound_queue_capacity: usize,
	/// Grace delay between `chat_ended` and closing connections, in ms.
	pub end_grace_ms: u64,
}

/// Persistence settings loaded by the server.
#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Enable persistence for the chat log and session snapshots.
	pub enabled: bool,
	/// Database URL (sqlite: or postgres:).
	pub database_url: Option<String>,
}

/// External ledger settings loaded by the server.
#[derive(Debug, Clone, Default)]
pub struct LedgerSettings {
	/// Ledger API base URL; unset disables ledger sync and billing.
	pub base_url: Option<String>,
	/// Bearer token for ledger calls.
	pub api_token: Option<SecretString>,
	/// Request timeout in seconds; bounds the awaited end-room call.
	pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	ledger: FileLedgerSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	auth_hmac_secret: Option<String>,
	allow_anonymous: Option<bool>,
	history_limit: Option<usize>,
	outbound_queue_capacity: Option<usize>,
	end_grace_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileLedgerSettings {
	base_url: Option<String>,
	api_token: Option<String>,
	timeout_secs: Option<u64>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		Self {
			server: ServerSettings {
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				auth_hmac_secret: file
					.server
					.auth_hmac_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				allow_anonymous: file.server.allow_anonymous.unwrap_or(false),
				history_limit: file.server.history_limit.unwrap_or(50),
				outbound_queue_capacity: file.server.outbound_queue_capacity.unwrap_or(256),
				end_grace_ms: file.server.end_grace_ms.unwrap_or(1000),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
			ledger: LedgerSettings {
				base_url: file.ledger.base_url.filter(|s| !s.trim().is_empty()),
				api_token: file.ledger.api_token.filter(|s| !s.trim().is_empty()).map(SecretString::new),
				timeout_secs: file.ledger.timeout_secs.unwrap_or(10),
			},
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("PARLEY_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_AUTH_HMAC_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.auth_hmac_secret = Some(SecretString::new(v));
			info!("server auth: auth_hmac_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_ALLOW_ANONYMOUS")
		&& let Some(allow) = parse_env_bool(&v)
	{
		cfg.server.allow_anonymous = allow;
		info!(allow, "server auth: allow_anonymous overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_HISTORY_LIMIT")
		&& let Ok(limit) = v.trim().parse::<usize>()
	{
		cfg.server.history_limit = limit;
		info!(limit, "server config: history_limit overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_OUTBOUND_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
	{
		cfg.server.outbound_queue_capacity = capacity;
		info!(capacity, "server config: outbound_queue_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_END_GRACE_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.server.end_grace_ms = ms;
		info!(ms, "server config: end_grace_ms overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = Some(v);
			info!("persistence: database_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_LEDGER_BASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.ledger.base_url = Some(v);
			info!("ledger config: base_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_LEDGER_API_TOKEN") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.ledger.api_token = Some(SecretString::new(v));
			info!("ledger config: api_token overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_LEDGER_TIMEOUT_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.ledger.timeout_secs = secs;
		info!(secs, "ledger config: timeout_secs overridden by env");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_fill_in_for_an_empty_file() {
		let cfg = ServerConfig::from_file(FileConfig::default());
		assert!(cfg.server.auth_hmac_secret.is_none());
		assert!(!cfg.server.allow_anonymous);
		assert_eq!(cfg.server.history_limit, 50);
		assert_eq!(cfg.server.outbound_queue_capacity, 256);
		assert_eq!(cfg.server.end_grace_ms, 1000);
		assert!(!cfg.persistence.enabled);
		assert_eq!(cfg.ledger.timeout_secs, 10);
	}

	#[test]
	fn blank_strings_are_treated_as_unset() {
		let file: FileConfig = toml::from_str(
			r#"
			[server]
			metrics_bind = "  "
			auth_hmac_secret = ""

			[ledger]
			base_url = ""
			"#,
		)
		.unwrap();

		let cfg = ServerConfig::from_file(file);
		assert!(cfg.server.metrics_bind.is_none());
		assert!(cfg.server.auth_hmac_secret.is_none());
		assert!(cfg.ledger.base_url.is_none());
	}

	#[test]
	fn file_values_are_applied() {
		let file: FileConfig = toml::from_str(
			r#"
			[server]
			allow_anonymous = true
			history_limit = 10
			end_grace_ms = 50

			[persistence]
			enabled = true
			database_url = "sqlite::memory:"

			[ledger]
			base_url = "https://ledger.example.com/api"
			api_token = "tok"
			timeout_secs = 3
			"#,
		)
		.unwrap();

		let cfg = ServerConfig::from_file(file);
		assert!(cfg.server.allow_anonymous);
		assert_eq!(cfg.server.history_limit, 10);
		assert_eq!(cfg.server.end_grace_ms, 50);
		assert!(cfg.persistence.enabled);
		assert_eq!(cfg.persistence.database_url.as_deref(), Some("sqlite::memory:"));
		assert_eq!(cfg.ledger.base_url.as_deref(), Some("https://ledger.example.com/api"));
		assert!(cfg.ledger.api_token.is_some());
		assert_eq!(cfg.ledger.timeout_secs, 3);
	}
}
