use std::{collections::BTreeMap, time::Duration};

use chrono::{DateTime, Utc};
use tabfleet_agent::Orchestrator;
use tabfleet_process::InstanceId;
use tracing::info;

const REPORT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct FleetSnapshot {
    pub taken_at: DateTime<Utc>,
    pub running: usize,
    pub tabs: BTreeMap<InstanceId, usize>,
}

/// Periodically logs how many workers are running and how many tabs each
/// one holds.
#[derive(Clone)]
pub struct FleetReporter {
    orchestrator: Orchestrator,
}

impl FleetReporter {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }

    pub fn spawn(self) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(REPORT_INTERVAL).await;
                self.tick().await;
            }
        });
    }

    pub async fn tick(&self) -> FleetSnapshot {
        let running = self.orchestrator.running_instances().await;
        let mut tabs: BTreeMap<InstanceId, usize> =
            running.iter().map(|i| (i.id.clone(), 0)).collect();
        for tab in self.orchestrator.all_tabs().await {
            *tabs.entry(tab.instance_id).or_default() += 1;
        }

        for (id, count) in &tabs {
            info!(%id, tabs = count, "instance tabs");
        }
        info!(running = running.len(), "fleet status");

        FleetSnapshot {
            taken_at: Utc::now(),
            running: running.len(),
            tabs,
        }
    }
}
