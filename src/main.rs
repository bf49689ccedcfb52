use std::sync::Arc;

use stockpulse::PulseError;
use stockpulse::config::fetch_config;
use stockpulse::history::HistoryClient;
use stockpulse::models::Granularity;
use stockpulse::models::aggs::MarketStatus;
use stockpulse::view::StockView;
use stockpulse::websocket::ConnectionManager;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), PulseError> {
    // Initialize tracing subscriber for logging output.
    tracing_subscriber::fmt::init();

    let app_config = fetch_config()?;

    let mut args = std::env::args().skip(1);
    let symbol = args.next().unwrap_or_else(|| "AAPL".to_string());
    let granularity: Granularity = match args.next() {
        Some(raw) => raw.parse()?,
        None => Granularity::Min1,
    };

    let history = Arc::new(HistoryClient::new(&app_config.polygon)?);
    let market = history.market_status().await.unwrap_or_else(|e| {
        warn!("Market status unavailable, assuming open: {e}");
        MarketStatus::Open
    });

    let (manager, feed) = ConnectionManager::new(
        app_config.polygon.websocket_url.clone(),
        app_config.polygon.api_key.clone(),
        app_config.reconnect,
    );
    let feed_task = tokio::spawn(manager.run());

    let view = StockView::open(&symbol, granularity, history, &feed, market);
    let mut snapshots = view.snapshots();

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                match snapshot.candles.last() {
                    Some(latest) => info!(
                        symbol = snapshot.symbol,
                        granularity = %snapshot.granularity,
                        candles = snapshot.candles.len(),
                        time = latest.time,
                        open = %latest.open,
                        high = %latest.high,
                        low = %latest.low,
                        close = %latest.close,
                        "Series updated"
                    ),
                    None => info!(symbol = snapshot.symbol, "Series empty"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    view.close().await;
    drop(feed);
    if let Err(e) = feed_task.await {
        warn!("Feed task ended abnormally: {e}");
    }

    Ok(())
}
