use crate::facade::McServer;
use crate::plugin::{tellraw, ChatCommand, Plugin, PluginCommand, PluginInfo};
use crate::shell::Shell;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// `~!run-cmd <line>`: admins run one operator console line from chat.
///
/// The line may be given as a JSON string (`~!run-cmd "cmd time set day"`)
/// or bare (`~!run-cmd cmd time set day`).
#[derive(Debug, Clone)]
pub struct RunCmd {
    admins: Arc<Vec<String>>,
    response_timeout: Duration,
}

impl RunCmd {
    pub fn new(admins: Vec<String>, response_timeout: Duration) -> Self {
        Self {
            admins: Arc::new(admins),
            response_timeout,
        }
    }
}

/// The console line carried by the chat arguments.
fn console_line(args: &[String]) -> serde_json::Result<String> {
    let joined = args.join(" ");
    if joined.starts_with('"') {
        serde_json::from_str(&joined)
    } else {
        Ok(joined)
    }
}

async fn reply(server: &McServer, sender: &str, text: &str, color: &str) -> anyhow::Result<()> {
    tellraw(server, sender, &json!({"text": text, "color": color})).await?;
    Ok(())
}

#[async_trait]
impl Plugin for RunCmd {
    fn info(&self) -> PluginInfo {
        PluginInfo::new("run-cmd", env!("CARGO_PKG_VERSION"), "Run console commands from chat")
    }

    fn commands(&self) -> Vec<PluginCommand> {
        vec![PluginCommand::new("run-cmd", Arc::new(self.clone())).concurrent()]
    }
}

#[async_trait]
impl ChatCommand for RunCmd {
    async fn run(&self, server: Arc<McServer>, sender: String, args: Vec<String>) -> anyhow::Result<()> {
        if args.is_empty() {
            reply(&server, &sender, "usage: run-cmd <json-content>", "red").await?;
            return reply(&server, &sender, "example: run-cmd \"cmd time set day\"", "red").await;
        }
        if !self.admins.iter().any(|admin| *admin == sender) {
            return reply(&server, &sender, "You do not have permission to use this command", "red").await;
        }

        let line = match console_line(&args) {
            Ok(line) => line,
            Err(e) => return reply(&server, &sender, &format!("bad argument: {e}"), "red").await,
        };
        info!(%sender, command = %line, "running console line from chat");

        let mut shell = Shell::detached(Arc::clone(&server), self.response_timeout);
        match shell.execute(&line).await {
            Ok(_) => reply(&server, &sender, "ran successfully", "green").await,
            Err(e) => reply(&server, &sender, &format!("{e:#}"), "red").await,
        }
    }
}
