//! Chain-to-Cache Sync Engine CLI

use anyhow::Result;
use clap::{Parser, Subcommand};
use marketsync::services::{FeedConfig, RateLimitedClient};
use marketsync::{
    BlockScanner, Config, Database, EventApplier, EventListener, RpcChainReader, SyncScheduler,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "marketsync")]
#[command(about = "Synchronizes on-chain prediction market state into a local cache")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync engine continuously
    Run,

    /// Perform a single full sync and print the report
    Sync,

    /// Show cache statistics
    Stats,

    /// Fetch a feed API endpoint through the rate-limited client
    Fetch {
        /// Endpoint path, e.g. "markets"
        endpoint: String,

        /// Query parameters as key=value pairs
        #[arg(short, long)]
        param: Vec<String>,

        /// Bypass the response cache
        #[arg(long)]
        no_cache: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    let config = Config::from_env()?;

    match cli.command {
        Commands::Run => run_engine(&config).await?,
        Commands::Sync => run_sync(&config).await?,
        Commands::Stats => show_stats(&config).await?,
        Commands::Fetch {
            endpoint,
            param,
            no_cache,
        } => fetch_feed(&config, &endpoint, &param, !no_cache).await?,
    }

    Ok(())
}

fn chain_reader(config: &Config) -> Result<Option<Arc<RpcChainReader>>> {
    match &config.contract_address {
        Some(address) => Ok(Some(Arc::new(RpcChainReader::new(&config.rpc_url, address)?))),
        None => Ok(None),
    }
}

async fn run_engine(config: &Config) -> Result<()> {
    let db = Arc::new(Database::new(&config.database_path).await?);
    info!("Database ready at {}", config.database_path);

    let Some(chain) = chain_reader(config)? else {
        warn!("PREDICTION_MARKET_CONTRACT_ADDRESS not set, chain sync disabled");
        warn!("Serving cached data only; set the contract address to enable sync");
        tokio::signal::ctrl_c().await?;
        return Ok(());
    };
    let chain: Arc<dyn marketsync::ChainReader> = chain;

    let applier = Arc::new(EventApplier::new(Arc::clone(&db), Arc::clone(&chain)));

    let listener = Arc::new(EventListener::new(
        Arc::clone(&chain),
        Arc::clone(&applier),
        Duration::from_secs(config.event_poll_seconds),
        Duration::from_secs(config.event_error_backoff_seconds),
    ));
    let scanner = Arc::new(BlockScanner::new(
        Arc::clone(&chain),
        Arc::clone(&applier),
        Duration::from_secs(config.scan_interval_seconds),
        Duration::from_secs(config.event_error_backoff_seconds),
    ));
    let scheduler = Arc::new(SyncScheduler::new(
        Arc::clone(&db),
        Arc::clone(&chain),
        Duration::from_secs(config.sync_interval_seconds),
    ));

    listener.start().await;
    scanner.start().await;
    scheduler.start().await;
    info!("Sync engine running (Ctrl+C to stop)");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    listener.stop().await;
    scanner.stop().await;
    scheduler.stop().await;

    Ok(())
}

async fn run_sync(config: &Config) -> Result<()> {
    let db = Arc::new(Database::new(&config.database_path).await?);

    let Some(chain) = chain_reader(config)? else {
        anyhow::bail!("PREDICTION_MARKET_CONTRACT_ADDRESS required for sync");
    };

    let scheduler = SyncScheduler::new(
        Arc::clone(&db),
        chain,
        Duration::from_secs(config.sync_interval_seconds),
    );
    let report = scheduler.force_sync().await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.success {
        std::process::exit(1);
    }
    Ok(())
}

async fn fetch_feed(
    config: &Config,
    endpoint: &str,
    params: &[String],
    use_cache: bool,
) -> Result<()> {
    let params: Vec<(String, String)> = params
        .iter()
        .map(|p| match p.split_once('=') {
            Some((k, v)) => Ok((k.to_string(), v.to_string())),
            None => Err(anyhow::anyhow!("Invalid parameter (expected key=value): {}", p)),
        })
        .collect::<Result<_>>()?;

    let client = RateLimitedClient::new(
        FeedConfig {
            base_url: config.feed_base_url.clone(),
            ..FeedConfig::default()
        },
        config.feed_api_key.clone(),
    );

    match client.get(endpoint, &params, use_cache).await {
        Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        None => anyhow::bail!("Feed request failed"),
    }
    Ok(())
}

async fn show_stats(config: &Config) -> Result<()> {
    let db = Database::new(&config.database_path).await?;

    let markets = db.count_markets().await?;
    let bets = db.count_bets().await?;

    println!("\n{}", "=".repeat(50));
    println!("  CACHE STATISTICS");
    println!("{}\n", "=".repeat(50));
    println!("  Database:  {}", config.database_path);
    println!("  Markets:   {}", markets);
    println!("  Bets:      {}", bets);

    Ok(())
}
