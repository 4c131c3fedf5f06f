use std::sync::Arc;
use std::time::Duration;

use gamesvr_core::AppActionLoop;
use gamesvr_core::AppRuntime;
use gamesvr_core::Error;
use gamesvr_core::HashStore;
use gamesvr_core::LogConfig;
use gamesvr_core::RedisHashStore;
use gamesvr_core::RedisMessageDispatcher;
use gamesvr_core::Result;
use gamesvr_core::RouterManagerSet;
use gamesvr_core::Settings;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio::time::Instant;
use tokio::time::Interval;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;

/// Upper bound of graceful close when no background task timeout is configured
const DEFAULT_CLOSE_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1);
    let settings = Settings::load(config_path.as_deref())?;

    // Initializing Logs
    let _guard = init_observability(&settings.log)?;

    let shutdown = CancellationToken::new();
    let (app_loop, loop_handle) = AppActionLoop::start(shutdown.clone());

    let store: Arc<dyn HashStore> = Arc::new(RedisHashStore::connect(&settings.logic.redis).await?);
    let dispatcher = Arc::new(RedisMessageDispatcher::new(&settings, store));
    dispatcher.init().await?;

    let tick_interval = settings.app.tick_interval();
    let close_deadline = settings.task.nomsg_timeout().unwrap_or(DEFAULT_CLOSE_DEADLINE);
    let app = AppRuntime::new(settings, app_loop);
    let router_set = RouterManagerSet::new(app.clone());
    info!(
        app_id = app.logic_id(),
        app_name = %app.settings().app.name,
        "Application started. Waiting for shutdown signal..."
    );

    let mut ticker = tokio::time::interval(tick_interval);
    let stop_signal = wait_for_signal();
    tokio::pin!(stop_signal);
    loop {
        tokio::select! {
            _ = ticker.tick() => router_set.tick(),
            received = &mut stop_signal => {
                if let Err(e) = received {
                    error!("Failed to listen for shutdown signal: {:?}", e);
                }
                break;
            }
        }
    }

    graceful_close(&router_set, tick_interval, close_deadline).await;

    shutdown.cancel();
    if let Err(e) = loop_handle.await {
        warn!("app loop join failed: {:?}", e);
    }
    info!("Shutdown completed");
    Ok(())
}

/// Stops the router set and keeps ticking until it reports closed. Past `deadline` the closing
/// task is force killed and its fallback pass gets one more `deadline` to finish its saves.
async fn graceful_close(
    router_set: &Arc<RouterManagerSet>,
    tick_interval: Duration,
    deadline: Duration,
) {
    info!(deadline_ms = deadline.as_millis() as u64, "closing router manager set");
    router_set.set_pre_closing();
    router_set.stop();

    let mut ticker = tokio::time::interval(tick_interval);
    if tick_until_closed(router_set, &mut ticker, deadline).await {
        return;
    }

    warn!(
        pending_actions = router_set.pending_action_count(),
        "router manager set did not close in time"
    );
    router_set.force_close();
    if !tick_until_closed(router_set, &mut ticker, deadline).await {
        error!(
            pending_actions = router_set.pending_action_count(),
            "router closing fallback did not finish, unsaved objects are dropped"
        );
    }
}

async fn tick_until_closed(
    router_set: &RouterManagerSet,
    ticker: &mut Interval,
    deadline: Duration,
) -> bool {
    let until = Instant::now() + deadline;
    while !router_set.is_closed() {
        if Instant::now() >= until {
            return false;
        }
        ticker.tick().await;
        router_set.tick();
    }
    true
}

async fn wait_for_signal() -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).map_err(|e| Error::Fatal(format!("install SIGINT handler: {e}")))?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(|e| Error::Fatal(format!("install SIGTERM handler: {e}")))?;
    tokio::select! {
        _ = sigint.recv() => {
            info!("SIGINT detected.");
        },
        _ = sigterm.recv() => {
            info!("SIGTERM detected.");
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl+C detected.");
        },
    }
    Ok(())
}

pub fn init_observability(config: &LogConfig) -> Result<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let (non_blocking, guard) = match &config.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| Error::Fatal(format!("create log dir {}: {e}", dir.display())))?;
            tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "gamesvr.log"))
        }
        None => tracing_appender::non_blocking(std::io::stdout()),
    };
    let base_subscriber = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_filter(filter);
    tracing_subscriber::registry().with(base_subscriber).init();

    Ok(guard)
}
