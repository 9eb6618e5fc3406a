use crate::facade::McServer;
use crate::plugin::{tellraw, ChatCommand, Plugin, PluginCommand, PluginInfo};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

type Aliases = HashMap<String, String>;

/// `~!tp <player|alias>` and `~!c-tp-aa <alias> <player>`.
#[derive(Debug, Clone)]
pub struct TeleportPlugin {
    global: Arc<Aliases>,
    personal: Arc<Mutex<HashMap<String, Aliases>>>,
    list_timeout: Duration,
}

impl TeleportPlugin {
    pub fn new(global: Aliases) -> Self {
        Self {
            global: Arc::new(global),
            personal: Arc::default(),
            list_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_list_timeout(mut self, list_timeout: Duration) -> Self {
        self.list_timeout = list_timeout;
        self
    }

    /// Remember `alias` for `sender` only.
    pub fn add_alias(&self, sender: &str, alias: &str, player: &str) {
        self.personal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(sender.to_string())
            .or_default()
            .insert(alias.to_string(), player.to_string());
    }

    fn resolve(&self, sender: &str, name: &str, online: &[String]) -> Option<String> {
        let personal = self.personal.lock().unwrap_or_else(PoisonError::into_inner);
        resolve_target(name, online, personal.get(sender), &self.global)
    }
}

/// An online name wins, then the sender's own alias, then a global one.
fn resolve_target(
    name: &str,
    online: &[String],
    personal: Option<&Aliases>,
    global: &Aliases,
) -> Option<String> {
    if online.iter().any(|player| player == name) {
        return Some(name.to_string());
    }
    personal
        .and_then(|aliases| aliases.get(name))
        .or_else(|| global.get(name))
        .cloned()
}

async fn reply(server: &McServer, sender: &str, text: &str, color: &str) -> anyhow::Result<()> {
    tellraw(server, sender, &json!({"text": text, "color": color})).await?;
    Ok(())
}

#[async_trait]
impl Plugin for TeleportPlugin {
    fn info(&self) -> PluginInfo {
        PluginInfo::new("tp", env!("CARGO_PKG_VERSION"), "Teleport to other players")
    }

    fn commands(&self) -> Vec<PluginCommand> {
        vec![
            PluginCommand::new("tp", Arc::new(Teleport(self.clone()))).concurrent(),
            PluginCommand::new("c-tp-aa", Arc::new(AddAlias(self.clone()))).concurrent(),
        ]
    }
}

struct Teleport(TeleportPlugin);

#[async_trait]
impl ChatCommand for Teleport {
    async fn run(&self, server: Arc<McServer>, sender: String, args: Vec<String>) -> anyhow::Result<()> {
        let Some(name) = args.first() else {
            return reply(&server, &sender, "usage: tp <player>", "red").await;
        };

        let online = tokio::time::timeout(self.0.list_timeout, server.players()).await??;
        let Some(target) = self.0.resolve(&sender, name, &online) else {
            return reply(&server, &sender, &format!("No player named {name}"), "red").await;
        };

        server.run_command(&format!("/tp {sender} {target}")).await?;
        tellraw(&server, "@a", &json!({"text": format!("{sender} teleported to {target}")})).await?;
        Ok(())
    }
}

struct AddAlias(TeleportPlugin);

#[async_trait]
impl ChatCommand for AddAlias {
    async fn run(&self, server: Arc<McServer>, sender: String, args: Vec<String>) -> anyhow::Result<()> {
        let [alias, player, ..] = args.as_slice() else {
            return reply(&server, &sender, "usage: c-tp-aa <alias> <player>", "red").await;
        };
        self.0.add_alias(&sender, alias, player);
        reply(&server, &sender, &format!("Added alias {alias} -> {player}"), "green").await
    }
}
