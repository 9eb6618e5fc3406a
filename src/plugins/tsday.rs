use crate::facade::McServer;
use crate::plugin::{tellraw, ChatCommand, Plugin, PluginCommand, PluginInfo};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

/// `~!tsday`: admins set the time to day.
#[derive(Debug, Clone, Default)]
pub struct TsDay {
    admins: Arc<Vec<String>>,
}

impl TsDay {
    pub fn new(admins: Vec<String>) -> Self {
        Self {
            admins: Arc::new(admins),
        }
    }
}

#[async_trait]
impl Plugin for TsDay {
    fn info(&self) -> PluginInfo {
        PluginInfo::new("tsday", env!("CARGO_PKG_VERSION"), "Set the time to day")
    }

    fn commands(&self) -> Vec<PluginCommand> {
        vec![PluginCommand::new("tsday", Arc::new(self.clone()))]
    }
}

#[async_trait]
impl ChatCommand for TsDay {
    async fn run(&self, server: Arc<McServer>, sender: String, _args: Vec<String>) -> anyhow::Result<()> {
        if !self.admins.iter().any(|admin| *admin == sender) {
            let denied = json!({"text": "Only tsday admins can use this command", "color": "red"});
            tellraw(&server, &sender, &denied).await?;
            return Ok(());
        }

        server.run_command("/time set day").await?;
        let notice = json!({
            "text": format!("{sender} used tsday, the time is now day"),
            "color": "green",
        });
        tellraw(&server, "@a", &notice).await?;
        info!(%sender, "time set to day");
        Ok(())
    }
}
