use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use relaycast::activity::BroadcastActivityLog;
use relaycast::channels::TelegramProvider;
use relaycast::config::{ForwarderConfig, TelegramConfig, rules_path_from_env};
use relaycast::pipeline::{EngineDeps, ForwardingController};
use relaycast::store::JsonRuleStore;

/// How often the running engine's counters are logged.
const STATS_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Hold the appender guard for the life of the process so buffered lines flush.
    let _log_guard = init_tracing();

    let config = ForwarderConfig::from_env();
    config.validate()?;
    let telegram_config = TelegramConfig::from_env()?;

    eprintln!("📡 Relaycast v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Workers: {}", config.worker_count);
    eprintln!(
        "   Rate: {} per {}s",
        config.max_per_window,
        config.rate_window.as_secs()
    );
    eprintln!("   Daily cap: {}", config.max_daily_forwards);

    // ── Provider ────────────────────────────────────────────────────────
    let provider = Arc::new(TelegramProvider::new(telegram_config));
    let bot = provider
        .authenticate()
        .await
        .context("Telegram authentication failed")?;
    eprintln!("   Bot: @{bot}");

    // ── Engine ──────────────────────────────────────────────────────────
    let activity = Arc::new(BroadcastActivityLog::default());
    let controller = ForwardingController::new(
        config,
        EngineDeps {
            source: provider.clone(),
            resolver: provider.clone(),
            publisher: provider.clone(),
            session: provider.clone(),
            activity,
        },
    );

    let rules_path = rules_path_from_env();
    let store = JsonRuleStore::new(&rules_path);
    let active = controller
        .reconcile(&store, true)
        .await
        .with_context(|| format!("Failed to load rules from {}", rules_path.display()))?;
    eprintln!("   Rules: {} ({})", active, rules_path.display());
    eprintln!("   Press Ctrl-C to stop.\n");

    let mut stats_tick = tokio::time::interval(STATS_INTERVAL);
    stats_tick.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = stats_tick.tick() => {
                let stats = controller.stats().await;
                info!(
                    state = ?stats.state,
                    daily_forwards = stats.daily_forwards,
                    processed = stats.processed_events,
                    dropped = stats.dropped_events,
                    queue_depth = stats.queue_depth,
                    busy_workers = stats.busy_workers,
                    consecutive_errors = stats.consecutive_errors,
                    "Engine stats"
                );
            }
        }
    }

    info!("Shutdown requested");
    controller.shutdown().await;
    provider.shutdown();
    eprintln!("👋 Stopped");
    Ok(())
}

/// Console logging, plus daily rolling files when `RELAYCAST_LOG_DIR` is set.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match std::env::var("RELAYCAST_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "relaycast.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    guard
}
