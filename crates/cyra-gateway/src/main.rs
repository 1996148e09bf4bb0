//! cyra-gateway server binary.
//!
//! Reads `cyra.toml` (or the path given with `--config`) layered with
//! `CYRA_*` environment variables, opens the SQLite subscriber store, starts
//! the threat-feed poller and serves the JSON API over HTTP.
//!
//! Nested keys use a double underscore, e.g. `CYRA_CHAT__API_KEY`.

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use anyhow::Context as _;
use clap::Parser;
use cyra_gateway::GatewayConfig;
use cyra_store_sqlite::SqliteStore;
use tokio::net::TcpListener;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Cyra subscription gateway")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "cyra.toml")]
  config: PathBuf,

  /// Validate the configuration and plan catalog, then exit.
  #[arg(long)]
  check_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  // Initialise tracing.
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  // Load configuration.
  let settings = config::Config::builder()
    .add_source(config::File::from(cli.config).required(false))
    .add_source(
      config::Environment::with_prefix("CYRA")
        .prefix_separator("_")
        .separator("__"),
    )
    .build()
    .context("failed to read config file")?;

  let gateway_cfg: GatewayConfig = settings
    .try_deserialize()
    .context("failed to deserialise GatewayConfig")?;

  let catalog = gateway_cfg.catalog().context("invalid plan catalog")?;
  if cli.check_config {
    for plan in catalog.list() {
      println!("{:<12} {:>5} queries  ${}/mo", plan.id.as_str(), plan.max_queries, plan.monthly_price_usd);
    }
    return Ok(());
  }

  // Expand `~` in store path.
  let store_path = expand_tilde(&gateway_cfg.store_path);

  // Open SQLite store.
  let store = SqliteStore::open(&store_path)
    .await
    .with_context(|| format!("failed to open store at {store_path:?}"))?;

  let collaborators = cyra_gateway::collaborators(&gateway_cfg)
    .context("failed to build collaborator clients")?;
  let engine = Arc::new(
    cyra_gateway::build_engine(Arc::new(store), &gateway_cfg, collaborators)
      .context("failed to build engine")?,
  );

  let _poller = cyra_gateway::spawn_poller(engine.clone(), gateway_cfg.poll_interval());

  let app = cyra_gateway::router(engine);
  let address = format!("{}:{}", gateway_cfg.host, gateway_cfg.port);

  tracing::info!("Listening on http://{address}");
  let listener = TcpListener::bind(&address)
    .await
    .with_context(|| format!("failed to bind {address}"))?;

  axum::serve(listener, app).await.context("server error")?;

  Ok(())
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
