use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tabfleet_agent::{Orchestrator, ProfileResolver};
use tokio::sync::Notify;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub profiles: ProfileResolver,
    /// Outbound client for proxied worker requests.
    pub proxy: reqwest::Client,
    /// Signalled by `POST /shutdown`.
    pub shutdown: Arc<Notify>,
}

impl AppState {
    pub fn new(
        orchestrator: Orchestrator,
        profiles: ProfileResolver,
        proxy_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let proxy = reqwest::Client::builder()
            .timeout(proxy_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("build proxy client")?;
        Ok(Self {
            orchestrator,
            profiles,
            proxy,
            shutdown: Arc::new(Notify::new()),
        })
    }
}
