#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use parley_server::config;
use parley_server::server::auth::AuthSettings;
use parley_server::server::connection::{ConnectionSettings, serve};
use parley_server::server::ledger::{HttpLedger, LedgerApi, NullLedger};
use parley_server::server::log::{ChatLogService, PersistentChatLog};
use parley_server::server::registry::{InMemorySnapshotStore, PersistentSnapshotStore, SnapshotStore};
use parley_server::server::room::RoomSettings;
use parley_server::server::router::RoomDirectory;
use parley_util::endpoint::WsEndpoint;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use url::Url;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: parley_server [--bind ws://host:port]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default: ws://127.0.0.1:9030)\n\
\t         Format: ws://host:port\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> SocketAddr {
	let mut bind_endpoint = "ws://127.0.0.1:9030".to_string();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected ws://host:port)");
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

	let bind = WsEndpoint::parse(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	let addr: SocketAddr = bind.to_socket_addr_if_ip_literal().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	addr
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,parley_server=debug".to_string());

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
				let tracer = tracer_provider.tracer("parley_server");
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

	match bind.parse::<std::net::SocketAddr>() {
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let bind_addr = parse_args();

	let config_path = config::default_config_path()?;
	let server_cfg = config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	if server_cfg.server.auth_hmac_secret.is_none() && !server_cfg.server.allow_anonymous {
		warn!("no auth_hmac_secret configured and allow_anonymous is off; every auth attempt will fail");
	}

	let (log, snapshots): (ChatLogService, Arc<dyn SnapshotStore>) = if server_cfg.persistence.enabled {
		let Some(database_url) = server_cfg.persistence.database_url.as_deref() else {
			return Err(anyhow::anyhow!("persistence enabled but no database_url configured"));
		};
		let backend = PersistentChatLog::connect(database_url).await?;
		let store = PersistentSnapshotStore::connect(database_url).await?;
		info!("persistence enabled (chat log + session snapshots)");
		(ChatLogService::new_persistent(backend), Arc::new(store))
	} else {
		(ChatLogService::new_in_memory(), Arc::new(InMemorySnapshotStore::default()))
	};

	let ledger: Arc<dyn LedgerApi> = match server_cfg.ledger.base_url.as_deref() {
		Some(base) => {
			let base = Url::parse(base).context("parse ledger base_url")?;
			info!(base = %base, "ledger sync enabled");
			Arc::new(HttpLedger::new(
				base,
				server_cfg.ledger.api_token.clone(),
				Duration::from_secs(server_cfg.ledger.timeout_secs),
			)?)
		}
		None => {
			warn!("no ledger configured; message sync and billing are local no-ops");
			Arc::new(NullLedger)
		}
	};

	let room_settings = RoomSettings {
		auth: AuthSettings {
			hmac_secret: server_cfg.server.auth_hmac_secret.clone(),
			allow_anonymous: server_cfg.server.allow_anonymous,
		},
		history_limit: server_cfg.server.history_limit,
		end_grace: Duration::from_millis(server_cfg.server.end_grace_ms),
		..RoomSettings::default()
	};

	let directory = RoomDirectory::new(room_settings, log, ledger, snapshots);

	let listener = TcpListener::bind(bind_addr)
		.await
		.with_context(|| format!("bind {bind_addr}"))?;
	info!(bind = %bind_addr, "parley_server: websocket endpoint ready");

	serve(
		listener,
		directory,
		ConnectionSettings {
			outbound_queue_capacity: server_cfg.server.outbound_queue_capacity,
		},
	)
	.await
}
