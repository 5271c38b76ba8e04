use std::sync::Arc;

use geobridge_rs::config::{ConfigOverrides, GatewayConfig, ServerOverrides};
use geobridge_rs::grpc_server::run_grpc_server;
use geobridge_rs::ingress::{ChannelPublisher, IngressDispatcher};
use geobridge_rs::Gateways;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

fn print_help() {
    eprintln!(
        r#"geobridge_server - temporal record gateway

USAGE:
    geobridge_server [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to config file (TOML)
    -l, --listen <ADDR>     Override listen address [default: 127.0.0.1:50070]
        --in-memory         Serve from in-process stores instead of the feature service
        --ingress-stdin     Read ingress messages as JSON lines from stdin and print
                            responses as JSON lines on stdout
    -h, --help              Print help

ENVIRONMENT:
    GEOBRIDGE_CONFIG                Path to config file
    GEOBRIDGE_SERVER__LISTEN        Listen address
    GEOBRIDGE_ASSETS__URL           Asset layer endpoint
    GEOBRIDGE_ROUTES__URL           Route layer endpoint
    RUST_LOG                        Log filter [default: info]

CONFIG FILE (geobridge.toml):
    [assets]
    url = "https://gis.example.org/arcgis/rest/services/Bridges/FeatureServer/0"
    [routes]
    url = "https://gis.example.org/arcgis/rest/services/Roads/FeatureServer/0"
"#
    );
}

/// Feed stdin lines through the dispatcher and echo published responses.
fn spawn_stdin_ingress(dispatcher: Arc<IngressDispatcher>, capacity: usize) {
    let (tx, rx) = mpsc::channel::<Vec<u8>>(capacity.max(1));
    tokio::spawn(dispatcher.run(rx));
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    if tx.send(line.into_bytes()).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "stdin ingress stopped");
                    break;
                }
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if has_flag("-h") || has_flag("--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Build CLI overrides
    let mut overrides = ConfigOverrides::default();
    let mut server_overrides = ServerOverrides::default();

    if let Some(listen) = parse_arg("--listen").or_else(|| parse_arg("-l")) {
        server_overrides.listen = Some(listen.parse()?);
    }
    if has_flag("--in-memory") {
        server_overrides.in_memory = Some(true);
    }
    if server_overrides.listen.is_some() || server_overrides.in_memory.is_some() {
        overrides.server = Some(server_overrides);
    }

    // Load config: CLI > Env > File > Defaults
    let config_path = parse_arg("--config")
        .or_else(|| parse_arg("-c"))
        .or_else(|| std::env::var("GEOBRIDGE_CONFIG").ok());
    let config = GatewayConfig::load(config_path.as_deref(), overrides)?;

    let gateways = Gateways::from_config(&config)?;

    if has_flag("--ingress-stdin") {
        let (publisher, mut published) = ChannelPublisher::new(config.ingress.channel_capacity);
        let dispatcher = Arc::new(IngressDispatcher::new(
            gateways.assets.clone(),
            Arc::new(publisher),
        ));
        spawn_stdin_ingress(dispatcher, config.ingress.channel_capacity);
        tokio::spawn(async move {
            while let Some(response) = published.recv().await {
                match serde_json::to_string(&response) {
                    Ok(line) => println!("{line}"),
                    Err(err) => tracing::warn!(error = %err, "cannot encode ingress response"),
                }
            }
        });
    }

    tracing::info!(in_memory = config.server.in_memory, "geobridge server starting");
    run_grpc_server(config.server.listen, gateways.assets, gateways.routes).await
}
