use clap::Parser; // for cli
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use request_governor::config::Args;
use request_governor::handlers::router;
use request_governor::housekeeper::MAX_IDLE_AGE;
use request_governor::inbound::{InboundLimiter, inbound_sweeper};
use request_governor::state::AppState;
use request_governor::Governor;

// this is main async function with tokio
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // parse cli arguments
    let args = Args::parse();

    let governor = Governor::new();
    if let Some(path) = &args.limits {
        let applied = governor.registry().load_overrides(path)?;
        info!(path = %path.display(), applied, "limit overrides loaded");
    }

    // idle entry sweep, tied to this governor
    let housekeeper =
        governor.start_housekeeper_with(Duration::from_secs(args.sweep_interval), MAX_IDLE_AGE);

    let inbound = Arc::new(InboundLimiter::new(
        args.inbound_limit,
        Duration::from_secs(args.inbound_window),
    ));
    tokio::spawn(inbound_sweeper(inbound.clone(), Duration::from_secs(args.sweep_interval)));

    // creating shared state
    let state = Arc::new(AppState {
        client: reqwest::Client::new(),
        upstream: args.upstream.clone(),
        governor,
        inbound,
    });

    let app = router(state);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(port = args.port, "gateway running on http://localhost:{}", args.port);
    info!(upstream = %args.upstream, "forwarding to upstream");
    info!(
        "inbound limit: {} requests per {} seconds per API key",
        args.inbound_limit, args.inbound_window
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    housekeeper.stop().await;
    Ok(())
}
