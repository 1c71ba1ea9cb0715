#![forbid(unsafe_code)]

mod config;
mod server;
mod store;
mod util;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::auth::{Authenticator, sign_token};
use crate::server::connection::{ConnectionSettings, handle_connection};
use crate::server::http::{HealthState, HttpState, spawn_http_server};
use crate::server::presence::PresenceRegistry;
use crate::server::router::{MessageRouter, RouterConfig};

const DEFAULT_TOKEN_TTL_SECS: u64 = 24 * 60 * 60;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: huddle_server [--config path] [--bind host:port]\n\
\x20      huddle_server --issue-token <username> [--ttl secs] [--config path]\n\
\n\
Options:\n\
\t--config       Config file (default: ~/.huddle/config.toml)\n\
\t--bind         WebSocket bind address (default: from config, else 127.0.0.1:18204)\n\
\t--issue-token  Print a signed session token for <username> and exit\n\
\t--ttl          Token lifetime in seconds (default: 86400)\n\
\t--help         Show this help\n\
"
	);
	std::process::exit(2)
}

#[derive(Debug, Default)]
struct Args {
	config: Option<PathBuf>,
	bind: Option<SocketAddr>,
	issue_token: Option<String>,
	ttl_secs: Option<u64>,
}

fn parse_args() -> Args {
	let mut args = Args::default();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.config = Some(PathBuf::from(v));
			}
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let addr = v.trim().parse::<SocketAddr>().unwrap_or_else(|e| {
					eprintln!("--bind: {e} (expected host:port)");
					usage_and_exit();
				});
				args.bind = Some(addr);
			}
			"--issue-token" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--issue-token needs a username");
					usage_and_exit();
				}
				args.issue_token = Some(v);
			}
			"--ttl" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let ttl = v.trim().parse::<u64>().unwrap_or_else(|e| {
					eprintln!("--ttl: {e}");
					usage_and_exit();
				});
				args.ttl_secs = Some(ttl);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,huddle_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	let Some(endpoint) = otlp_endpoint else {
		base.init();
		return;
	};

	use opentelemetry::global;
	use opentelemetry::trace::TracerProvider as _;
	use opentelemetry_otlp::WithExportConfig;

	match opentelemetry_otlp::SpanExporter::builder()
		.with_tonic()
		.with_endpoint(endpoint.clone())
		.build()
	{
		Ok(exporter) => {
			let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
				.with_batch_exporter(exporter)
				.build();
			let tracer = provider.tracer("huddle_server");
			global::set_tracer_provider(provider);
			base.with(tracing_opentelemetry::layer().with_tracer(tracer)).init();
			info!(endpoint = %endpoint, "otlp tracing enabled");
		}
		Err(e) => {
			base.init();
			warn!(error = %e, "failed to initialize otlp tracing");
		}
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => match metrics_exporter_prometheus::PrometheusBuilder::new()
			.with_http_listener(addr)
			.install()
		{
			Ok(()) => info!(%addr, "metrics exporter listening"),
			Err(e) => warn!(error = %e, "failed to start metrics exporter"),
		},
		Err(e) => warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)"),
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = parse_args();

	let config_path = match args.config.clone() {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let cfg = crate::config::load_server_config_from_path(&config_path)?;

	if let Some(username) = args.issue_token.as_deref() {
		let Some(secret) = cfg.server.auth_hmac_secret.as_ref() else {
			anyhow::bail!("auth_hmac_secret is not configured; cannot issue tokens");
		};
		let ttl = args.ttl_secs.unwrap_or(DEFAULT_TOKEN_TTL_SECS);
		println!("{}", sign_token(username.trim(), ttl, secret.expose())?);
		return Ok(());
	}

	init_tracing();
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");
	init_metrics(cfg.server.metrics_bind.as_deref());

	if cfg.server.auth_hmac_secret.is_none() && !cfg.server.allow_insecure_usernames {
		warn!("no auth_hmac_secret and insecure usernames disabled; every websocket client will be rejected");
	}
	if cfg.server.allow_insecure_usernames {
		warn!("allow_insecure_usernames is on; clients may claim any registered username");
	}

	let store = crate::store::connect(cfg.persistence.database_url.as_deref(), &cfg.persistence.seed_users).await?;
	let presence = PresenceRegistry::new();
	let router = Arc::new(MessageRouter::new(
		Arc::clone(&store),
		presence.clone(),
		RouterConfig {
			expose_error_detail: cfg.server.expose_error_detail,
			max_frame_bytes: cfg.server.max_frame_bytes,
		},
	));
	let authenticator = Authenticator::new(
		cfg.server.auth_hmac_secret.clone(),
		cfg.server.allow_insecure_usernames,
	);

	let health = HealthState::new();
	if let Some(bind) = cfg.server.http_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => spawn_http_server(
				addr,
				HttpState {
					health: health.clone(),
					store: Arc::clone(&store),
					presence: presence.clone(),
					authenticator: authenticator.clone(),
				},
			),
			Err(e) => warn!(error = %e, %bind, "invalid http bind address (expected host:port)"),
		}
	}

	let conn_settings = ConnectionSettings {
		max_frame_bytes: cfg.server.max_frame_bytes,
		outbound_queue_capacity: cfg.server.outbound_queue_capacity,
		send_rate_limit_burst: cfg.server.send_rate_limit_burst,
		send_rate_limit_per_minute: cfg.server.send_rate_limit_per_minute,
	};

	let bind_addr = match args.bind {
		Some(addr) => addr,
		None => cfg
			.server
			.ws_bind
			.parse::<SocketAddr>()
			.map_err(|e| anyhow::anyhow!("invalid ws_bind {:?}: {e}", cfg.server.ws_bind))?,
	};
	let listener = TcpListener::bind(bind_addr).await?;
	info!(bind = %bind_addr, "huddle_server: websocket listener ready");
	health.mark_ready();

	let mut next_conn_id: u64 = 1;
	loop {
		let (stream, remote) = match listener.accept().await {
			Ok(accepted) => accepted,
			Err(e) => {
				warn!(error = %e, "accept failed");
				continue;
			}
		};

		let conn_id = next_conn_id;
		next_conn_id += 1;
		metrics::counter!("huddle_server_connections_total").increment(1);
		if let Err(e) = stream.set_nodelay(true) {
			warn!(conn_id, error = %e, "failed to set TCP_NODELAY");
		}

		let router = Arc::clone(&router);
		let authenticator = authenticator.clone();
		let conn_settings = conn_settings.clone();
		tokio::spawn(async move {
			info!(conn_id, %remote, "accepted connection");
			if let Err(e) = handle_connection(conn_id, stream, router, authenticator, conn_settings).await {
				warn!(conn_id, error = %e, "connection handler exited with error");
			}
		});
	}
}
