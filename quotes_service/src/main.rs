use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use quotes_service::config::QuotesConfig;
use quotes_service::exchange::BinanceClient;
use quotes_service::service::QuotesService;
use quotes_service::store::BarStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cfg = QuotesConfig::from_env()?;
    info!(
        "Quotes service starting: store at {:?}, exchange {}",
        cfg.data_dir, cfg.exchange_rest_url
    );

    let store = Arc::new(BarStore::new(cfg.data_dir.clone()));
    let exchange = Arc::new(BinanceClient::new(&cfg.exchange_rest_url)?);
    let service = Arc::new(QuotesService::new(cfg, store, exchange)?);

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = stop_tx.send(true);
        }
    });

    service.run(stop_rx).await?;
    Ok(())
}
