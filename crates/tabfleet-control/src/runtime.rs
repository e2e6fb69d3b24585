use std::{sync::Arc, time::Duration};

use tabfleet_agent::{Orchestrator, ProfileResolver};
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::config::ControlConfig;

const AUTO_LAUNCH_DELAY: Duration = Duration::from_millis(500);

/// Exit status used when a second signal forces the process down.
pub const FORCED_EXIT_CODE: i32 = 130;

/// Launches the default profile shortly after startup.
pub fn spawn_auto_launch(
    config: &ControlConfig,
    orchestrator: Orchestrator,
    profiles: ProfileResolver,
) -> tokio::task::JoinHandle<()> {
    let profile = config.default_profile.clone();
    let port = config.default_port;
    let headless = !config.headed;
    tokio::spawn(async move {
        tokio::time::sleep(AUTO_LAUNCH_DELAY).await;
        if let Err(e) = profiles.ensure(&profile).await {
            error!(%profile, error = %e, "auto-launch: cannot prepare profile");
            return;
        }
        match orchestrator.launch(&profile, port, headless).await {
            Ok(inst) => info!(id = %inst.id, port = inst.port, "auto-launched default profile"),
            Err(e) => error!(%profile, error = %e, "auto-launch failed"),
        }
    })
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut s) => {
            s.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "cannot install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}

async fn interrupt() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

/// Resolves once an interrupt, SIGTERM or `POST /shutdown` arrives, after
/// stopping every instance. A second signal during that stop kills all
/// workers and exits the process.
pub async fn shutdown_signal(orchestrator: Orchestrator, requested: Arc<Notify>) {
    tokio::select! {
        _ = interrupt() => info!("interrupt received, shutting down"),
        _ = terminate_signal() => info!("SIGTERM received, shutting down"),
        _ = requested.notified() => info!("shutdown requested"),
    }

    let graceful = orchestrator.shutdown();
    tokio::select! {
        _ = graceful => info!("all instances stopped"),
        _ = async {
            tokio::select! {
                _ = interrupt() => {}
                _ = terminate_signal() => {}
            }
        } => {
            warn!("second signal received, killing all instances");
            orchestrator.force_shutdown().await;
            std::process::exit(FORCED_EXIT_CODE);
        }
    }
}
