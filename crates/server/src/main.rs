use anyhow::Context;
use reelcast_server::config::ServerConfig;
use reelcast_server::routes::build_router;
use reelcast_server::state::AppState;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env().context("invalid configuration")?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    if config.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let tc = &config.transcoder;
    tokio::fs::create_dir_all(&tc.transcode_dir)
        .await
        .with_context(|| format!("failed to create {}", tc.transcode_dir.display()))?;
    info!(
        transcode_dir = %tc.transcode_dir.display(),
        cache_dir = %tc.cache_dir.display(),
        max_concurrent = tc.max_concurrent,
        "transcoder configured"
    );

    let state = AppState::new(config.transcoder.clone());
    state
        .cache
        .ensure_root()
        .await
        .context("failed to create cache dir")?;

    // Leftovers from a previous run are untracked now; reclaim them before serving.
    let report = state.registry.cleanup_orphans().await;
    if report.total() > 0 {
        info!(?report, "reclaimed resources from a previous run");
    }
    state.registry.start_sweeper(config.sweep_interval);

    // Probe hardware in the background so the first stream does not pay for it.
    {
        let detector = state.detector.clone();
        tokio::spawn(async move {
            let profile = detector.detect().await;
            info!(
                accel = profile.accel_name(),
                encoder = %profile.encoder,
                "hardware profile ready"
            );
        });
    }

    let app = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .context("failed to bind")?;
    info!(addr = %config.bind, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down, stopping all transcodes");
    state.registry.stop_sweeper();
    state.registry.cleanup_all().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
