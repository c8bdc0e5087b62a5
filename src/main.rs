mod config;
mod monetary;
mod price_cache;
mod profit_tracking;
mod rec_tracker;
mod reconciler;
mod routes;
mod store;
mod suggestion;
mod trend_cache;
mod types;
mod utils;
mod wire;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use crate::{config::Settings, price_cache::PriceCache, routes::AppState, store::Ledger, trend_cache::TrendCache};

#[derive(Debug, Parser)]
#[command(name = "ge-copilot", version)]
struct Cli {
    /// Override BIND_ADDR
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let mut settings = Settings::load()?;
    if let Some(b) = cli.bind {
        settings.bind_addr = b;
    }

    let ledger = Ledger::new(&settings.db_path)?;
    ledger.init_db()?;

    log::info!(
        "app.start bind_addr={} db={} buy_queue={}",
        settings.bind_addr,
        ledger.path(),
        settings.buy_queue_path
    );

    let price_cache = PriceCache::new();
    price_cache.start_refresh(settings.clone());

    let trend_cache = Arc::new(TrendCache::new(
        settings.price_feed_base_url.clone(),
        settings.trend_cache_ttl_seconds as i64,
        settings.price_feed_timeout_seconds,
    ));

    let state = AppState {
        settings: settings.clone(),
        ledger,
        price_cache,
        trend_cache,
    };

    let app = routes::router(state);
    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("bind {}", settings.bind_addr))?;

    log::info!("app.listening addr={}", settings.bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
