#![forbid(unsafe_code)]

mod config;
mod quic;
mod server;

use std::net::SocketAddr;
use std::sync::Arc;

use cohort_util::endpoint::{DEFAULT_BIND_ENDPOINT, QuicEndpoint};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::ServerConfig;
use crate::quic::config::QuicServerConfig;
use crate::server::auth::AuthPolicy;
use crate::server::connection::{ConnectionSettings, handle_connection};
use crate::server::dispatcher::DispatcherConfig;
use crate::server::dispatcher_registry::{DispatcherRegistry, RegistryConfig};
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::session_service::{SessionService, SessionServiceConfig};
use crate::server::sql_store::{SqlEntityStore, SqlPool};
use crate::server::store::{BatchRecord, EntityStore, GroupRecord, InMemoryEntityStore};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: cohort_server [--bind quic://host:port]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default: {DEFAULT_BIND_ENDPOINT})\n\
\t         Format: quic://host:port\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> SocketAddr {
	let mut bind_endpoint = DEFAULT_BIND_ENDPOINT.to_string();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected quic://host:port)");
					usage_and_exit();
				}
				bind_endpoint = v;
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let bind = QuicEndpoint::parse(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	bind.to_socket_addr_if_ip_literal().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	})
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,cohort_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("cohort_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

type Stores = (Arc<dyn EntityStore<GroupRecord>>, Arc<dyn EntityStore<BatchRecord>>);

async fn build_stores(cfg: &ServerConfig) -> anyhow::Result<Stores> {
	if cfg.persistence.enabled {
		let Some(database_url) = cfg.persistence.database_url.as_deref() else {
			return Err(anyhow::anyhow!("persistence enabled but no database_url configured"));
		};
		let pool = SqlPool::connect(database_url).await?;
		info!("entity store: sql");
		let groups: Arc<dyn EntityStore<GroupRecord>> = Arc::new(SqlEntityStore::new(pool.clone()));
		let batches: Arc<dyn EntityStore<BatchRecord>> = Arc::new(SqlEntityStore::new(pool));
		return Ok((groups, batches));
	}

	warn!("entity store: in-memory (records must be inserted by the embedding web layer)");
	let groups: Arc<dyn EntityStore<GroupRecord>> = Arc::new(InMemoryEntityStore::default());
	let batches: Arc<dyn EntityStore<BatchRecord>> = Arc::new(InMemoryEntityStore::default());
	Ok((groups, batches))
}

fn build_session_service(cfg: &ServerConfig, stores: Stores) -> SessionService {
	let registry_cfg = RegistryConfig {
		mailbox_capacity: cfg.dispatch.registry_mailbox_capacity,
		dispatcher: DispatcherConfig {
			mailbox_capacity: cfg.dispatch.dispatcher_mailbox_capacity,
			debug_logs: cfg.dispatch.debug_logs,
		},
	};

	let (groups, batches) = stores;
	SessionService::new(
		DispatcherRegistry::spawn(groups, registry_cfg.clone()),
		DispatcherRegistry::spawn(batches, registry_cfg),
		SessionServiceConfig {
			channel_mailbox_capacity: cfg.dispatch.channel_mailbox_capacity,
			debug_logs: cfg.dispatch.debug_logs,
		},
	)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let bind_addr = parse_args();

	let config_path = crate::config::default_config_path()?;
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let stores = build_stores(&server_cfg).await?;
	let sessions = build_session_service(&server_cfg, stores);

	let health_state = HealthState::new(sessions.clone());
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let quic_cfg = QuicServerConfig::dev(bind_addr);
	let endpoint = if let (Some(cert_path), Some(key_path)) = (
		server_cfg.server.tls_cert_path.as_deref(),
		server_cfg.server.tls_key_path.as_deref(),
	) {
		info!(cert = %cert_path.display(), key = %key_path.display(), "loading TLS cert/key");
		quic_cfg.bind_endpoint_with_tls(cert_path, key_path)?
	} else {
		let (endpoint, server_cert_der) = quic_cfg.bind_dev_endpoint()?;
		info!(
			bind = %bind_addr,
			cert_der_len = server_cert_der.len(),
			"cohort_server: QUIC endpoint ready (dev self-signed cert)"
		);
		endpoint
	};

	let conn_settings = ConnectionSettings {
		auth: AuthPolicy {
			static_token: server_cfg.auth_token.clone(),
			hmac_secret: server_cfg.server.auth_hmac_secret.clone(),
		},
		max_frame_bytes: server_cfg.dispatch.max_frame_bytes,
		transport_capacity: server_cfg.dispatch.channel_mailbox_capacity,
	};
	if conn_settings.auth.is_open() {
		warn!("no auth_token or auth_hmac_secret configured; accepting every connection");
	}

	health_state.mark_ready();

	let mut next_conn_id: u64 = 1;

	while let Some(incoming) = endpoint.accept().await {
		let conn_id = next_conn_id;
		next_conn_id += 1;
		metrics::counter!("cohort_connections_total").increment(1);

		let sessions = sessions.clone();
		let conn_settings = conn_settings.clone();
		tokio::spawn(async move {
			match incoming.await {
				Ok(connection) => {
					info!(conn_id, remote = %connection.remote_address(), "accepted connection");
					if let Err(e) = handle_connection(conn_id, connection, sessions, conn_settings).await {
						warn!(conn_id, error = %e, "connection handler exited with error");
					}
				}
				Err(e) => {
					warn!(conn_id, error = %e, "failed to establish QUIC connection");
				}
			}
		});
	}

	Ok(())
}
