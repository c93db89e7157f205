#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use cohort_protocol::DEFAULT_MAX_FRAME_SIZE;
use cohort_util::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.cohort/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".cohort").join("config.toml"))
}

/// Load the server config from TOML at `path`, then apply env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	/// Static token accepted from every client.
	pub auth_token: Option<SecretString>,
	pub server: ServerSettings,
	pub dispatch: DispatchSettings,
	pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// HMAC secret for per-participant connection tokens.
	pub auth_hmac_secret: Option<SecretString>,
}

/// Mailbox sizes and logging for the dispatch actors.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
	pub dispatcher_mailbox_capacity: usize,
	pub channel_mailbox_capacity: usize,
	pub registry_mailbox_capacity: usize,
	pub max_frame_bytes: usize,
	pub debug_logs: bool,
}

impl Default for DispatchSettings {
	fn default() -> Self {
		Self {
			dispatcher_mailbox_capacity: 256,
			channel_mailbox_capacity: 256,
			registry_mailbox_capacity: 1024,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			debug_logs: false,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Store entities in a database instead of memory.
	pub enabled: bool,
	/// Database URL (sqlite:, postgres: or mysql:).
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	auth_token: Option<String>,

	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	dispatch: FileDispatchSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	auth_hmac_secret: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileDispatchSettings {
	dispatcher_mailbox_capacity: Option<usize>,
	channel_mailbox_capacity: Option<usize>,
	registry_mailbox_capacity: Option<usize>,
	max_frame_bytes: Option<usize>,
	debug_logs: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.filter(|s| !s.trim().is_empty())
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = DispatchSettings::default();
		let positive = |v: Option<usize>, default: usize| v.filter(|v| *v > 0).unwrap_or(default);

		Self {
			auth_token: non_empty(file.auth_token).map(SecretString::new),
			server: ServerSettings {
				tls_cert_path: non_empty(file.server.tls_cert_path).map(PathBuf::from),
				tls_key_path: non_empty(file.server.tls_key_path).map(PathBuf::from),
				metrics_bind: non_empty(file.server.metrics_bind),
				health_bind: non_empty(file.server.health_bind),
				auth_hmac_secret: non_empty(file.server.auth_hmac_secret).map(SecretString::new),
			},
			dispatch: DispatchSettings {
				dispatcher_mailbox_capacity: positive(
					file.dispatch.dispatcher_mailbox_capacity,
					defaults.dispatcher_mailbox_capacity,
				),
				channel_mailbox_capacity: positive(file.dispatch.channel_mailbox_capacity, defaults.channel_mailbox_capacity),
				registry_mailbox_capacity: positive(
					file.dispatch.registry_mailbox_capacity,
					defaults.registry_mailbox_capacity,
				),
				max_frame_bytes: positive(file.dispatch.max_frame_bytes, defaults.max_frame_bytes),
				debug_logs: file.dispatch.debug_logs.unwrap_or(false),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: non_empty(file.persistence.database_url),
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
		Ok(s) => Ok(Some(parse_toml(&s)?)),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn parse_toml(s: &str) -> anyhow::Result<FileConfig> {
	toml::from_str(s).context("parse TOML")
}

fn env_string(name: &str) -> Option<String> {
	std::env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_capacity(name: &str) -> Option<usize> {
	env_string(name).and_then(|v| v.parse::<usize>().ok()).filter(|v| *v > 0)
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Some(v) = env_string("COHORT_SERVER_AUTH_TOKEN") {
		cfg.auth_token = Some(SecretString::new(v));
		info!("server auth: auth_token overridden by env");
	}

	if let Some(v) = env_string("COHORT_SERVER_TLS_CERT") {
		cfg.server.tls_cert_path = Some(PathBuf::from(v));
		info!("server config: tls_cert_path overridden by env");
	}

	if let Some(v) = env_string("COHORT_SERVER_TLS_KEY") {
		cfg.server.tls_key_path = Some(PathBuf::from(v));
		info!("server config: tls_key_path overridden by env");
	}

	if let Some(v) = env_string("COHORT_SERVER_AUTH_HMAC_SECRET") {
		cfg.server.auth_hmac_secret = Some(SecretString::new(v));
		info!("server auth: auth_hmac_secret overridden by env");
	}

	if let Some(v) = env_string("COHORT_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = env_string("COHORT_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(capacity) = env_capacity("COHORT_DISPATCHER_MAILBOX_CAPACITY") {
		cfg.dispatch.dispatcher_mailbox_capacity = capacity;
		info!(capacity, "dispatch config: dispatcher_mailbox_capacity overridden by env");
	}

	if let Some(capacity) = env_capacity("COHORT_CHANNEL_MAILBOX_CAPACITY") {
		cfg.dispatch.channel_mailbox_capacity = capacity;
		info!(capacity, "dispatch config: channel_mailbox_capacity overridden by env");
	}

	if let Some(capacity) = env_capacity("COHORT_REGISTRY_MAILBOX_CAPACITY") {
		cfg.dispatch.registry_mailbox_capacity = capacity;
		info!(capacity, "dispatch config: registry_mailbox_capacity overridden by env");
	}

	if let Some(bytes) = env_capacity("COHORT_MAX_FRAME_BYTES") {
		cfg.dispatch.max_frame_bytes = bytes;
		info!(bytes, "dispatch config: max_frame_bytes overridden by env");
	}

	if let Ok(v) = std::env::var("COHORT_DEBUG_LOGS")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.dispatch.debug_logs = enabled;
		info!(enabled, "dispatch config: debug_logs overridden by env");
	}

	if let Ok(v) = std::env::var("COHORT_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Some(v) = env_string("COHORT_PERSISTENCE_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if cfg.persistence.enabled && cfg.persistence.database_url.is_none() {
		warn!("persistence: enabled without database_url; falling back to in-memory store");
		cfg.persistence.enabled = false;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_file_uses_defaults() {
		let cfg = ServerConfig::from_file(parse_toml("").unwrap());
		assert!(cfg.auth_token.is_none());
		assert_eq!(cfg.dispatch.dispatcher_mailbox_capacity, 256);
		assert_eq!(cfg.dispatch.registry_mailbox_capacity, 1024);
		assert_eq!(cfg.dispatch.max_frame_bytes, DEFAULT_MAX_FRAME_SIZE);
		assert!(!cfg.persistence.enabled);
	}

	#[test]
	fn sections_are_read_and_blank_values_ignored() {
		let cfg = ServerConfig::from_file(
			parse_toml(
				r#"
auth_token = "  "

[server]
health_bind = "127.0.0.1:18304"
auth_hmac_secret = "k"

[dispatch]
dispatcher_mailbox_capacity = 32
channel_mailbox_capacity = 0
debug_logs = true

[persistence]
enabled = true
database_url = "sqlite::memory:"
"#,
			)
			.unwrap(),
		);

		assert!(cfg.auth_token.is_none());
		assert_eq!(cfg.server.health_bind.as_deref(), Some("127.0.0.1:18304"));
		assert_eq!(cfg.server.auth_hmac_secret.as_ref().map(SecretString::expose), Some("k"));
		assert_eq!(cfg.dispatch.dispatcher_mailbox_capacity, 32);
		assert_eq!(cfg.dispatch.channel_mailbox_capacity, 256);
		assert!(cfg.dispatch.debug_logs);
		assert!(cfg.persistence.enabled);
		assert_eq!(cfg.persistence.database_url.as_deref(), Some("sqlite::memory:"));
	}

	#[test]
	fn env_bools() {
		assert_eq!(parse_env_bool(" Yes "), Some(true));
		assert_eq!(parse_env_bool("off"), Some(false));
		assert_eq!(parse_env_bool("maybe"), None);
	}
}
