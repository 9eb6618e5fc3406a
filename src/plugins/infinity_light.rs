use crate::facade::McServer;
use crate::plugin::{Plugin, PluginInfo};
use crate::server::ProcessStatus;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Players carrying this tag get light blocks filled in around them.
pub const LIGHT_TAG: &str = "mscr_infinity_light";

/// Keeps the air around tagged players filled with light blocks.
#[derive(Debug, Clone)]
pub struct InfinityLight {
    period: Duration,
}

impl InfinityLight {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }

    fn fill_command() -> String {
        format!(
            "execute at @a[tag={LIGHT_TAG}] run fill ~-5 ~-5 ~-5 ~5 ~5 ~5 minecraft:light replace minecraft:air"
        )
    }
}

impl Default for InfinityLight {
    fn default() -> Self {
        Self::new(Duration::from_millis(125))
    }
}

#[async_trait]
impl Plugin for InfinityLight {
    fn info(&self) -> PluginInfo {
        PluginInfo::new(
            "infinity-light",
            env!("CARGO_PKG_VERSION"),
            "Light up players tagged mscr_infinity_light",
        )
    }

    fn on_start(&self, server: &Arc<McServer>) {
        tokio::spawn(refill(Arc::clone(server), self.period));
    }
}

async fn refill(server: Arc<McServer>, period: Duration) {
    let command = InfinityLight::fill_command();
    let mut ticks = tokio::time::interval(period);
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticks.tick().await;
        match server.process().status().await {
            ProcessStatus::Stopped => return,
            ProcessStatus::Running => {
                if let Err(e) = server.run_command(&command).await {
                    debug!(error = %e, "light refill skipped");
                }
            }
            _ => {}
        }
    }
}
