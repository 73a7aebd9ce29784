//! Paper-trading daemon: wires the pipeline against the in-process paper
//! exchange and runs scheduled ticks. Live exchange adapters plug in behind
//! the same ports.

use anyhow::Result;
use breakwater::application::pipeline::{
    Ports, TickContext, create_hybrid_pipeline, create_single_ticker_pipeline,
};
use breakwater::application::position::PortfolioManager;
use breakwater::application::risk_management::RiskManager;
use breakwater::application::scanner::HistoricalDataSync;
use breakwater::config::BotConfig;
use breakwater::domain::ports::LockPort;
use breakwater::infrastructure::fear_greed::FearGreedClient;
use breakwater::infrastructure::idempotency::InMemoryIdempotencyStore;
use breakwater::infrastructure::locks::InMemoryLockService;
use breakwater::infrastructure::paper::PaperExchange;
use clap::Parser;
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "breakwater", about = "Adaptive spot-trading decision engine")]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of ticks to run before exiting (0 = run forever).
    #[arg(long, default_value_t = 1)]
    ticks: u64,

    /// Seconds between ticks.
    #[arg(long, default_value_t = 60)]
    interval_secs: u64,

    /// Starting quote-currency balance for the paper exchange.
    #[arg(long, default_value = "10000000")]
    paper_balance: Decimal,

    /// Disable scanning and trade only the configured ticker.
    #[arg(long)]
    single_ticker: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = Arc::new(BotConfig::load(cli.config.as_deref())?);
    info!(
        "breakwater starting: ticker {}, scanning {}",
        config.ticker, config.scanner.enable_scanning
    );

    let exchange = Arc::new(
        PaperExchange::builder()
            .quote_balance(cli.paper_balance)
            .build(),
    );
    let ports = Ports {
        exchange: exchange.clone(),
        ai: None,
        market_data: Some(Arc::new(FearGreedClient::new())),
        idempotency: Arc::new(InMemoryIdempotencyStore::new()),
    };
    let risk = Arc::new(RiskManager::new(config.trading.clone()));
    let portfolio_manager = Arc::new(PortfolioManager::new(
        exchange.clone(),
        risk.clone(),
        config.trading.clone(),
        config.quote_currency.clone(),
    ));
    let data_sync = Arc::new(HistoricalDataSync::new(
        exchange.clone(),
        config.data_dir.clone(),
        config.scanner.sync_years,
        config.scanner.max_years,
        config.scanner.per_ticker_sync_timeout_secs,
        config.scanner.bulk_sync_timeout_secs,
    )?);
    let locks = InMemoryLockService::new();

    let pipeline = if cli.single_ticker || !config.scanner.enable_scanning {
        create_single_ticker_pipeline(data_sync)
    } else {
        create_hybrid_pipeline(&config, data_sync)
    };

    let lock_name = format!("tick:{}", config.ticker);
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(cli.interval_secs));
    let mut completed = 0u64;

    loop {
        interval.tick().await;

        // A tick that arrives while the previous one is in flight is
        // dropped, never queued.
        if !locks.acquire(&lock_name).await? {
            warn!("tick dropped: pipeline already in flight");
            continue;
        }

        let mut ctx = TickContext::new(
            config.ticker.clone(),
            config.clone(),
            ports.clone(),
            risk.clone(),
            portfolio_manager.clone(),
        );
        let result = pipeline.execute(&mut ctx).await;
        info!(
            "tick finished: {} -> {} ({})",
            result.ticker, result.outcome, result.reason
        );

        locks.release(&lock_name).await?;
        let expired = ports.idempotency.cleanup_expired().await?;
        if expired > 0 {
            info!("reclaimed {} expired idempotency key(s)", expired);
        }

        completed += 1;
        if cli.ticks > 0 && completed >= cli.ticks {
            break;
        }
    }

    info!("breakwater stopped after {} tick(s)", completed);
    Ok(())
}
