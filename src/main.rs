use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use switchyard::{
    FederatedQueryPlanner, FederationGateway, GatewayConfig, HttpDispatcher, HttpSchemaFetcher,
    SchemaComposer,
    server::{self, ServerState},
};

#[derive(Parser, Debug)]
#[command(name = "switchyard", version, about = "GraphQL federation gateway")]
struct Cli {
    /// Gateway configuration file.
    #[arg(long, env = "SWITCHYARD_CONFIG", default_value = "gateway.yaml")]
    config: PathBuf,

    /// Port to listen on.
    #[arg(long, env = "PORT", default_value_t = 4000)]
    port: u16,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, default_value_t = false)]
    json_logs: bool,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().with_target(false)).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_telemetry(&cli);

    let config = GatewayConfig::from_path(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    let fetcher = Arc::new(HttpSchemaFetcher::new(config.subgraph_timeout()));
    let composer = Arc::new(SchemaComposer::new(config.registry()?, fetcher));

    let schema = composer
        .bootstrap(&config.startup)
        .await
        .context("composing the supergraph")?;
    tracing::info!(subgraphs = schema.subgraphs().len(), "supergraph composed");

    let polling = config.poll_interval().map(|interval| {
        tracing::info!(?interval, "polling subgraphs for schema changes");
        composer.start_polling(interval)
    });

    let dispatcher = HttpDispatcher::new(config.header_policy()?, config.subgraph_timeout());
    let gateway = Arc::new(FederationGateway::new(
        composer.subscribe(),
        Box::new(FederatedQueryPlanner::new()),
        Box::new(dispatcher),
    ));
    let state = Arc::new(ServerState::new(gateway, config.uploads.clone()));

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, cli.port));
    let listener = server::bind(addr).await?;
    tracing::info!("Gateway ready at http://{addr}{}", server::GRAPHQL_PATH);

    server::serve(listener, state, server::shutdown_signal()).await;

    if let Some(polling) = polling {
        polling.stop().await;
    }

    tracing::info!("gateway stopped");
    Ok(())
}
