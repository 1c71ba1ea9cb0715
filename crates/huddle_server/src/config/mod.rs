#![forbid(unsafe_code)]

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use huddle_protocol::DEFAULT_MAX_FRAME_SIZE;
use serde::Deserialize;
use tracing::{info, warn};

pub const DEFAULT_WS_BIND: &str = "127.0.0.1:18204";

/// Default config path: `~/.huddle/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".huddle").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

/// A secret that never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// WebSocket listener (host:port).
	pub ws_bind: String,
	/// Optional health + history HTTP bind address (host:port).
	pub http_bind: Option<String>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// HMAC secret for bearer tokens.
	pub auth_hmac_secret: Option<SecretString>,
	/// Dev only: accept `?user=<name>` on the websocket URL without a token.
	pub allow_insecure_usernames: bool,
	/// Include low-level error detail in client-facing `error` events.
	pub expose_error_detail: bool,
	/// Outbound events buffered per connection before deliveries are dropped.
	pub outbound_queue_capacity: usize,
	/// `send_message` rate limiting: per-connection burst size (0 disables).
	pub send_rate_limit_burst: u32,
	/// `send_message` rate limiting: per-connection sends per minute (0 disables).
	pub send_rate_limit_per_minute: u32,
	pub max_frame_bytes: usize,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			ws_bind: DEFAULT_WS_BIND.to_string(),
			http_bind: None,
			metrics_bind: None,
			auth_hmac_secret: None,
			allow_insecure_usernames: false,
			expose_error_detail: false,
			outbound_queue_capacity: 256,
			send_rate_limit_burst: 20,
			send_rate_limit_per_minute: 120,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Database URL (sqlite:, postgres:, mysql:). None selects the in-memory store.
	pub database_url: Option<String>,
	/// Users registered at startup.
	pub seed_users: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	ws_bind: Option<String>,
	http_bind: Option<String>,
	metrics_bind: Option<String>,
	auth_hmac_secret: Option<String>,
	allow_insecure_usernames: Option<bool>,
	expose_error_detail: Option<bool>,
	outbound_queue_capacity: Option<usize>,
	send_rate_limit_burst: Option<u32>,
	send_rate_limit_per_minute: Option<u32>,
	max_frame_bytes: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
	#[serde(default)]
	seed_users: Vec<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ServerSettings::default();

		Self {
			server: ServerSettings {
				ws_bind: file
					.server
					.ws_bind
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(defaults.ws_bind),
				http_bind: file.server.http_bind.filter(|s| !s.trim().is_empty()),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				auth_hmac_secret: file
					.server
					.auth_hmac_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				allow_insecure_usernames: file.server.allow_insecure_usernames.unwrap_or(false),
				expose_error_detail: file.server.expose_error_detail.unwrap_or(false),
				outbound_queue_capacity: file
					.server
					.outbound_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(defaults.outbound_queue_capacity),
				send_rate_limit_burst: file.server.send_rate_limit_burst.unwrap_or(defaults.send_rate_limit_burst),
				send_rate_limit_per_minute: file
					.server
					.send_rate_limit_per_minute
					.unwrap_or(defaults.send_rate_limit_per_minute),
				max_frame_bytes: file
					.server
					.max_frame_bytes
					.filter(|v| *v > 0)
					.unwrap_or(defaults.max_frame_bytes),
			},
			persistence: PersistenceSettings {
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
				seed_users: file
					.persistence
					.seed_users
					.into_iter()
					.map(|s| s.trim().to_string())
					.filter(|s| !s.is_empty())
					.collect(),
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

fn apply_env_overrides(cfg: &mut ServerConfig, env: impl Fn(&str) -> Option<String>) {
	let non_empty = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = non_empty("HUDDLE_WS_BIND") {
		cfg.server.ws_bind = v;
		info!("server config: ws_bind overridden by env");
	}

	if let Some(v) = non_empty("HUDDLE_HTTP_BIND") {
		cfg.server.http_bind = Some(v);
		info!("server config: http_bind overridden by env");
	}

	if let Some(v) = non_empty("HUDDLE_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = non_empty("HUDDLE_AUTH_HMAC_SECRET") {
		cfg.server.auth_hmac_secret = Some(SecretString::new(v));
		info!("server auth: auth_hmac_secret overridden by env");
	}

	if let Some(v) = env("HUDDLE_ALLOW_INSECURE_USERNAMES")
		&& let Some(allow) = parse_env_bool(&v)
	{
		cfg.server.allow_insecure_usernames = allow;
		info!(allow, "server auth: allow_insecure_usernames overridden by env");
	}

	if let Some(v) = env("HUDDLE_EXPOSE_ERROR_DETAIL")
		&& let Some(expose) = parse_env_bool(&v)
	{
		cfg.server.expose_error_detail = expose;
		info!(expose, "server config: expose_error_detail overridden by env");
	}

	if let Some(v) = env("HUDDLE_OUTBOUND_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
		&& capacity > 0
	{
		cfg.server.outbound_queue_capacity = capacity;
		info!(capacity, "server config: outbound_queue_capacity overridden by env");
	}

	if let Some(v) = env("HUDDLE_SEND_RATE_LIMIT_BURST")
		&& let Ok(burst) = v.trim().parse::<u32>()
	{
		cfg.server.send_rate_limit_burst = burst;
		info!(burst, "server config: send_rate_limit_burst overridden by env");
	}

	if let Some(v) = env("HUDDLE_SEND_RATE_LIMIT_PER_MINUTE")
		&& let Ok(rate) = v.trim().parse::<u32>()
	{
		cfg.server.send_rate_limit_per_minute = rate;
		info!(rate, "server config: send_rate_limit_per_minute overridden by env");
	}

	if let Some(v) = env("HUDDLE_MAX_FRAME_BYTES")
		&& let Ok(max) = v.trim().parse::<usize>()
		&& max > 0
	{
		cfg.server.max_frame_bytes = max;
		info!(max, "server config: max_frame_bytes overridden by env");
	}

	if let Some(v) = non_empty("HUDDLE_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if let Some(v) = non_empty("HUDDLE_SEED_USERS") {
		cfg.persistence.seed_users = v
			.split(',')
			.map(|s| s.trim().to_string())
			.filter(|s| !s.is_empty())
			.collect();
		info!(
			count = cfg.persistence.seed_users.len(),
			"persistence: seed_users overridden by env"
		);
	}

	if cfg.server.allow_insecure_usernames {
		warn!("server auth: allow_insecure_usernames is enabled; clients may claim any username");
	}
}
