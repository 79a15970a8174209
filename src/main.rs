//! Collection daemon.
//!
//! Startup order: DB + migrations (fatal on failure), writer thread,
//! analysis components, then collectors / aggregator / listing monitor /
//! notice poller / health loop as concurrent tasks, with the token
//! bootstrap in the background.
//!
//! Shutdown order: stop signal, close sockets, flush second buckets, force
//! the in-progress rollup, flush the alert batch, cancel tasks, writer
//! sentinel + join.

use anyhow::{Context, Result};
use dotenv::dotenv;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kimp_radar::alerts::TelegramAlert;
use kimp_radar::analysis::listing_type::ListingTypeClassifier;
use kimp_radar::analysis::{GateChecker, PremiumCalculator};
use kimp_radar::collectors::hot_wallet::HotWalletProbe;
use kimp_radar::collectors::notice::NoticePoller;
use kimp_radar::collectors::{
    Aggregator, BithumbCatalog, BithumbCollector, ListingMonitor, UpbitCatalog, UpbitCollector,
};
use kimp_radar::config::AppConfig;
use kimp_radar::metrics::HealthMonitor;
use kimp_radar::store::database::{apply_migrations, default_migrations_dir, open_connection};
use kimp_radar::store::token_registry::bootstrap_top_tokens;
use kimp_radar::store::writer::DEFAULT_QUEUE_CAPACITY;
use kimp_radar::store::{resolve_db_path, DatabaseWriter, TokenRegistry};

/// Seed watchlist (top KRW markets); new listings are appended at runtime.
const UPBIT_MARKETS: [&str; 20] = [
    "KRW-BTC", "KRW-ETH", "KRW-XRP", "KRW-SOL", "KRW-DOGE",
    "KRW-ADA", "KRW-AVAX", "KRW-LINK", "KRW-DOT", "KRW-TRX",
    "KRW-SHIB", "KRW-ETC", "KRW-ATOM", "KRW-NEAR", "KRW-BCH",
    "KRW-APT", "KRW-ARB", "KRW-OP", "KRW-SUI", "KRW-SEI",
];

const BITHUMB_MARKETS: [&str; 20] = [
    "BTC_KRW", "ETH_KRW", "XRP_KRW", "SOL_KRW", "DOGE_KRW",
    "ADA_KRW", "AVAX_KRW", "LINK_KRW", "DOT_KRW", "TRX_KRW",
    "SHIB_KRW", "ETC_KRW", "ATOM_KRW", "NEAR_KRW", "BCH_KRW",
    "APT_KRW", "ARB_KRW", "OP_KRW", "SUI_KRW", "SEI_KRW",
];

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv();
    init_tracing();

    info!("kimp-radar starting");

    // ---- 1. DB + migrations (fatal on failure) ----
    let config_dir = AppConfig::default_dir();
    let config = AppConfig::load(&config_dir).context("configuration load failed")?;

    let db_path = resolve_db_path()?;
    let migration_conn = open_connection(&db_path)?;
    let schema_version = apply_migrations(&migration_conn, &default_migrations_dir())
        .context("migrations failed, refusing to start")?;
    drop(migration_conn);
    info!(schema_version, "database ready");

    // ---- 2. Writer ----
    let writer = DatabaseWriter::new(open_connection(&db_path)?, DEFAULT_QUEUE_CAPACITY);
    writer.start();

    // ---- 3. Analysis components ----
    let registry = Arc::new(TokenRegistry::new(open_connection(&db_path)?, writer.clone()));
    let premium = Arc::new(PremiumCalculator::new(writer.clone(), config.fx));
    let alert = Arc::new(TelegramAlert::new(
        writer.clone(),
        open_connection(&db_path)?,
        None,
        None,
    ));
    info!(
        telegram = if alert.is_configured() { "configured" } else { "dry-run" },
        "alert router ready"
    );

    // ---- 4. Collectors ----
    let upbit_markets: Vec<String> = UPBIT_MARKETS.iter().map(|m| m.to_string()).collect();
    let bithumb_markets: Vec<String> = BITHUMB_MARKETS.iter().map(|m| m.to_string()).collect();

    let (upbit_runner, upbit_handle, upbit_bucket) =
        UpbitCollector::new(upbit_markets, writer.clone());
    let (bithumb_runner, bithumb_handle, bithumb_bucket, bithumb_books) =
        BithumbCollector::new(bithumb_markets, writer.clone());

    let hot_wallet = if config.features.hot_wallet_probe {
        Some(Arc::new(HotWalletProbe::new(&config_dir, None)))
    } else {
        None
    };

    let gate = Arc::new(GateChecker::new(
        premium,
        config.clone(),
        ListingTypeClassifier::new(Some(open_connection(&db_path)?)),
        Some(bithumb_books),
        Some(registry.clone()),
        hot_wallet,
    ));

    let aggregator = Arc::new(Aggregator::new(open_connection(&db_path)?, writer.clone()));

    let collector_handles = HashMap::from([
        ("upbit", upbit_handle.clone()),
        ("bithumb", bithumb_handle.clone()),
    ]);
    let monitor = Arc::new(ListingMonitor::new(
        writer.clone(),
        registry.clone(),
        gate,
        alert.clone(),
        collector_handles,
    ));

    let health = HealthMonitor::new(
        writer.clone(),
        vec![upbit_handle.clone(), bithumb_handle.clone()],
        schema_version,
        None,
    );

    // ---- 5. Task spawn ----
    let (stop_tx, stop_rx) = watch::channel(false);

    let mut tasks = vec![
        tokio::spawn(upbit_runner.run()),
        tokio::spawn(bithumb_runner.run()),
    ];
    {
        let aggregator = aggregator.clone();
        let stop = stop_rx.clone();
        tasks.push(tokio::spawn(async move { aggregator.run(stop).await }));
    }
    {
        let monitor = monitor.clone();
        let stop = stop_rx.clone();
        tasks.push(tokio::spawn(async move {
            let catalog = UpbitCatalog::new();
            monitor.run_source(&catalog, stop).await
        }));
    }
    {
        let monitor = monitor.clone();
        let stop = stop_rx.clone();
        tasks.push(tokio::spawn(async move {
            let catalog = BithumbCatalog::new();
            monitor.run_source(&catalog, stop).await
        }));
    }
    {
        let stop = stop_rx.clone();
        tasks.push(tokio::spawn(async move { health.run(stop).await }));
    }
    if config.features.notice_poller {
        let poller = NoticePoller::new(writer.clone(), open_connection(&db_path)?, alert.clone());
        let stop = stop_rx.clone();
        tasks.push(tokio::spawn(async move { poller.run(stop).await }));
    }

    // Token bootstrap in the background so startup is never blocked on it.
    if std::env::var("COINGECKO_API_KEY").is_ok() {
        let registry = registry.clone();
        tasks.push(tokio::spawn(async move {
            match tokio::time::timeout(
                Duration::from_secs(120),
                bootstrap_top_tokens(&registry, 500),
            )
            .await
            {
                Ok(Ok(count)) => info!(count, "token bootstrap complete"),
                Ok(Err(e)) => warn!(error = %e, "token bootstrap failed, continuing"),
                Err(_) => warn!("token bootstrap timed out after 120s, continuing"),
            }
        }));
    } else {
        info!("COINGECKO_API_KEY unset, token bootstrap skipped");
    }

    info!(
        upbit_markets = UPBIT_MARKETS.len(),
        bithumb_markets = BITHUMB_MARKETS.len(),
        "daemon running"
    );

    // ---- 6. Wait for a shutdown signal ----
    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    let _ = stop_tx.send(true);

    // ---- 7. Graceful shutdown ----
    info!("shutdown 1/6: closing websockets");
    upbit_handle.close();
    bithumb_handle.close();
    tokio::time::sleep(Duration::from_millis(500)).await;

    info!("shutdown 2/6: flushing second buckets");
    let upbit_flushed = upbit_bucket.lock().flush_all();
    let bithumb_flushed = bithumb_bucket.lock().flush_all();
    info!(upbit = upbit_flushed, bithumb = bithumb_flushed, "buckets flushed");

    info!("shutdown 3/6: forced rollup of the current minute");
    aggregator.force_rollup_current();

    info!("shutdown 4/6: flushing alert batch");
    alert.flush_batch().await;

    info!("shutdown 5/6: waiting for tasks");
    for task in tasks {
        if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
            warn!("task did not finish within 5s, detaching");
        }
    }

    info!("shutdown 6/6: writer sentinel");
    writer.shutdown();

    info!("daemon stopped cleanly");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kimp_radar=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable, ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
