use tabfleet_agent::{Orchestrator, ProfileResolver};
use tabfleet_control::{
    config::ControlConfig, reporter::FleetReporter, routes, runtime, state::AppState,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ControlConfig::from_env();
    let orchestrator = Orchestrator::new(config.orchestrator.clone())?;
    let profiles = ProfileResolver::new(&config.orchestrator.base_dir);
    let state = AppState::new(orchestrator.clone(), profiles.clone(), config.proxy_timeout)?;

    FleetReporter::new(orchestrator.clone()).spawn();
    if config.auto_launch {
        runtime::spawn_auto_launch(&config, orchestrator.clone(), profiles);
    }

    let app = routes::router(state.clone());
    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    tracing::info!(
        addr = %config.listen,
        base_dir = %config.orchestrator.base_dir.display(),
        "tabfleet-control HTTP listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(runtime::shutdown_signal(orchestrator, state.shutdown.clone()))
        .await?;

    tracing::info!("tabfleet-control stopped");
    Ok(())
}
