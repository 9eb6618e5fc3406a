//! Plugin surface: chat-triggered commands and log hooks.
//!
//! Players trigger commands by chatting `<prefix><name> args...` (for
//! example `~!tp Alex`). The [`PluginHost`] is the tailer's log hook: it
//! feeds every line to the plugins and routes chat lines to handlers.

use crate::facade::McServer;
use crate::tailer::LogHook;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub description: String,
}

impl PluginInfo {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: description.into(),
        }
    }
}

/// Handler for one chat command.
#[async_trait]
pub trait ChatCommand: Send + Sync {
    async fn run(&self, server: Arc<McServer>, sender: String, args: Vec<String>) -> anyhow::Result<()>;
}

/// A chat command a plugin offers.
#[derive(Clone)]
pub struct PluginCommand {
    pub prefix: String,
    pub handler: Arc<dyn ChatCommand>,
    /// When set, only these senders may run the command.
    pub allow_users: Option<Vec<String>>,
    /// Run on its own task instead of inside log processing.
    pub concurrent: bool,
}

impl std::fmt::Debug for PluginCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginCommand")
            .field("prefix", &self.prefix)
            .field("allow_users", &self.allow_users)
            .field("concurrent", &self.concurrent)
            .finish()
    }
}

impl PluginCommand {
    /// A command that runs inline, open to every sender.
    ///
    /// Inline handlers hold up log processing while they run, so they must
    /// not wait on server output (`McServer::players` without RCON, log
    /// waiters). Use [`PluginCommand::concurrent`] for those.
    pub fn new(prefix: impl Into<String>, handler: Arc<dyn ChatCommand>) -> Self {
        Self {
            prefix: prefix.into(),
            handler,
            allow_users: None,
            concurrent: false,
        }
    }

    pub fn concurrent(mut self) -> Self {
        self.concurrent = true;
        self
    }

    pub fn allow_users(mut self, users: Vec<String>) -> Self {
        self.allow_users = Some(users);
        self
    }

    fn permits(&self, sender: &str) -> bool {
        self.allow_users
            .as_ref()
            .map_or(true, |users| users.iter().any(|u| u == sender))
    }
}

/// A plugin. Every hook except `info` is optional.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn info(&self) -> PluginInfo;

    fn commands(&self) -> Vec<PluginCommand> {
        Vec::new()
    }

    /// Called once after the server has started.
    fn on_start(&self, _server: &Arc<McServer>) {}

    /// Called for every server output line.
    async fn on_log(&self, _server: &Arc<McServer>, _line: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn close(&self) {}
}

/// A chat line: `<sender> text`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub sender: String,
    pub text: String,
}

/// Extract the sender and text from a server chat log line.
///
/// The `<sender>` must open the message, right after the `]: ` that ends
/// the log header and an optional `[Not Secure] ` marker. Anything later in
/// the line is player text, as in `/me` emotes (`* Steve <Admin> ...`).
pub fn parse_chat(line: &str) -> Option<ChatMessage> {
    let message = match line.find("]: ") {
        Some(index) => &line[index + 3..],
        None => line,
    };
    let message = message.strip_prefix("[Not Secure] ").unwrap_or(message);
    let rest = message.strip_prefix('<')?;
    let end = rest.find('>')?;
    let sender = &rest[..end];
    if sender.is_empty() || sender.contains(char::is_whitespace) {
        return None;
    }
    let text = &rest[end + 1..];
    Some(ChatMessage {
        sender: sender.to_string(),
        text: text.strip_prefix(' ').unwrap_or(text).to_string(),
    })
}

/// Send a raw JSON text message to `target`.
pub async fn tellraw(server: &McServer, target: &str, raw: &Value) -> crate::Result<()> {
    server.run_command(&format!("tellraw {target} {raw}")).await
}

/// Settings for a [`PluginHost`].
#[derive(Debug, Clone)]
pub struct HostSettings {
    pub command_prefix: String,
    pub echo_output: bool,
    pub max_concurrent_handlers: usize,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            command_prefix: "~!".to_string(),
            echo_output: true,
            max_concurrent_handlers: 8,
        }
    }
}

/// Owns the loaded plugins and serves as the server's log hook.
pub struct PluginHost {
    server: Arc<McServer>,
    plugins: Vec<Arc<dyn Plugin>>,
    commands: Vec<PluginCommand>,
    settings: HostSettings,
    permits: Arc<Semaphore>,
}

impl PluginHost {
    pub fn new(server: Arc<McServer>, settings: HostSettings) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_handlers.max(1)));
        Self {
            server,
            plugins: Vec::new(),
            commands: Vec::new(),
            settings,
            permits,
        }
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        let info = plugin.info();
        info!(
            name = %info.name,
            version = %info.version,
            description = %info.description,
            "loaded plugin"
        );
        self.commands.extend(plugin.commands());
        self.plugins.push(plugin);
    }

    pub fn plugins(&self) -> impl Iterator<Item = PluginInfo> + '_ {
        self.plugins.iter().map(|p| p.info())
    }

    pub fn start(&self) {
        for plugin in &self.plugins {
            plugin.on_start(&self.server);
        }
    }

    pub fn close(&self) {
        for plugin in &self.plugins {
            plugin.close();
        }
    }

    /// Route a chat line to the matching command. Returns whether one matched.
    pub async fn dispatch_chat(&self, line: &str) -> bool {
        let Some(message) = parse_chat(line) else {
            return false;
        };
        let mut tokens = message.text.split_whitespace();
        let Some(name) = tokens.next().and_then(|t| t.strip_prefix(&self.settings.command_prefix)) else {
            return false;
        };
        let Some(command) = self.commands.iter().find(|c| c.prefix == name) else {
            return false;
        };
        let args: Vec<String> = tokens.map(str::to_string).collect();

        if !command.permits(&message.sender) {
            debug!(sender = %message.sender, command = %name, "chat command denied");
            let denied = json!({"text": "You do not have permission to use this command", "color": "red"});
            if let Err(e) = tellraw(&self.server, &message.sender, &denied).await {
                warn!(error = %e, "failed to notify denied sender");
            }
            return true;
        }

        debug!(sender = %message.sender, command = %name, ?args, "running chat command");
        let handler = Arc::clone(&command.handler);
        let server = Arc::clone(&self.server);
        let sender = message.sender;
        let name = name.to_string();

        if command.concurrent {
            let permits = Arc::clone(&self.permits);
            tokio::spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                if let Err(e) = handler.run(server, sender, args).await {
                    warn!(command = %name, error = %e, "chat command failed");
                }
            });
        } else if let Err(e) = handler.run(server, sender, args).await {
            warn!(command = %name, error = %e, "chat command failed");
        }
        true
    }
}

#[async_trait]
impl LogHook for PluginHost {
    async fn on_line(&self, line: &str) -> anyhow::Result<Option<String>> {
        for plugin in &self.plugins {
            if let Err(e) = plugin.on_log(&self.server, line).await {
                warn!(plugin = %plugin.info().name, error = %e, "plugin log hook failed");
            }
        }
        self.dispatch_chat(line).await;
        Ok(self.settings.echo_output.then(|| line.to_string()))
    }
}
