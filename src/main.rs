use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::task::JoinSet;
use toolbridge::config;
use toolbridge::host;
use toolbridge::transport::{self, TransportKind};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
	/// Path to the services.json host configuration.
	#[arg(long)]
	config: std::path::PathBuf,

	/// Comma-separated transports to bind.
	#[arg(long, value_delimiter = ',', default_values_t = default_transports())]
	transport: Vec<TransportKind>,

	#[arg(long, default_value_t = 8080)]
	port: u16,

	#[arg(long = "ssePort", default_value_t = 8081)]
	sse_port: u16,

	#[arg(long = "wsPort", default_value_t = 8082)]
	ws_port: u16,

	/// Bypass every transport loop: invoke a single method once and exit.
	#[arg(long, num_args = 2, value_names = ["METHOD", "PARAMS_JSON"])]
	once: Option<Vec<String>>,
}

fn default_transports() -> Vec<TransportKind> {
	vec![
		TransportKind::Stdio,
		TransportKind::Http,
		TransportKind::WebSocket,
		TransportKind::Sse,
	]
}

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
		.with_writer(std::io::stderr)
		.with_ansi(false)
		.init();

	let args = Args::parse();

	let host_config = match config::load_host_config(&args.config) {
		Ok(c) => c,
		Err(e) => {
			eprintln!("config error: {e}");
			std::process::exit(1);
		},
	};

	if host_config.services.is_empty() {
		eprintln!("config error: no services configured");
		std::process::exit(1);
	}

	let policy_config = config::policy_config_from_env();
	let audit_sink = config::audit_sink_from_env();
	let host = Arc::new(host::build(host_config, audit_sink, policy_config).await);

	if host.registry.is_empty() {
		eprintln!("startup error: every configured service failed to load, no tools registered");
		std::process::exit(1);
	}

	if let Some(once) = args.once {
		return run_once(host, once).await;
	}

	let mut tasks = JoinSet::new();
	for kind in args.transport {
		let host = host.clone();
		match kind {
			TransportKind::Stdio => {
				tasks.spawn(async move { transport::stdio::run(host).await.map_err(anyhow::Error::from) });
			},
			TransportKind::Http => {
				let port = args.port;
				tasks.spawn(async move { transport::http::serve(host, port).await.map_err(anyhow::Error::from) });
			},
			TransportKind::WebSocket => {
				let port = args.ws_port;
				tasks.spawn(async move { transport::ws::serve(host, port).await.map_err(anyhow::Error::from) });
			},
			TransportKind::Sse => {
				let port = args.sse_port;
				tasks.spawn(async move { transport::sse::serve(host, port).await.map_err(anyhow::Error::from) });
			},
		}
	}

	while let Some(result) = tasks.join_next().await {
		result??;
	}

	Ok(())
}

async fn run_once(host: Arc<host::Host>, once: Vec<String>) -> Result<()> {
	let [method, params_json] = <[String; 2]>::try_from(once).expect("clap enforces exactly two values");

	let params: serde_json::Value = serde_json::from_str(&params_json).context("--once PARAMS-JSON is not valid JSON")?;
	let request = serde_json::json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params });
	let raw = serde_json::to_string(&request)?;

	match toolbridge::rpc::dispatch(&host, &raw).await {
		Some(response) => {
			let is_error = response.error.is_some();
			println!("{}", serde_json::to_string(&response)?);
			if is_error {
				std::process::exit(2);
			}
			Ok(())
		},
		None => Ok(()),
	}
}
