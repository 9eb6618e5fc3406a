use crate::facade::McServer;
use crate::plugin::{tellraw, ChatCommand, Plugin, PluginCommand, PluginInfo};
use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const HELP: &str = "\
Prefix every command with ~!pfh

find-sw \"<text>\"  players whose name starts with the text
find-ew \"<text>\"  players whose name ends with the text
find-in \"<text>\"  players whose name contains the text
find-re \"<regex>\" players whose name matches the regular expression";

/// How a name is compared with the search pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindMode {
    StartsWith,
    EndsWith,
    Contains,
    Regex,
}

impl FindMode {
    fn from_subcommand(name: &str) -> Option<Self> {
        match name {
            "find-sw" => Some(Self::StartsWith),
            "find-ew" => Some(Self::EndsWith),
            "find-in" => Some(Self::Contains),
            "find-re" => Some(Self::Regex),
            _ => None,
        }
    }
}

/// Online players whose names match `pattern`, in list order.
pub fn find_players(mode: FindMode, pattern: &str, players: &[String]) -> anyhow::Result<Vec<String>> {
    let keep: Box<dyn Fn(&str) -> bool + '_> = match mode {
        FindMode::StartsWith => Box::new(|name: &str| name.starts_with(pattern)),
        FindMode::EndsWith => Box::new(|name: &str| name.ends_with(pattern)),
        FindMode::Contains => Box::new(|name: &str| name.contains(pattern)),
        FindMode::Regex => {
            let re = Regex::new(pattern).with_context(|| format!("bad regular expression {pattern:?}"))?;
            Box::new(move |name: &str| re.is_match(name))
        }
    };
    Ok(players.iter().filter(|name| keep(name.as_str())).cloned().collect())
}

/// The tellraw array listing `found`; shift-clicking a name inserts it.
fn result_message(found: &[String]) -> Value {
    let mut parts = vec![json!({"text": format!("Found {} players:\n", found.len())})];
    parts.extend(found.iter().enumerate().map(|(i, name)| {
        json!({
            "text": format!("{}. {name}", i + 1),
            "insertion": name,
            "hoverEvent": {"action": "show_text", "contents": format!("Shift+click to copy: {name}")},
        })
    }));
    Value::Array(parts)
}

/// `~!pfh <find-sw|find-ew|find-in|find-re> "<pattern>"`: admins search the
/// online player list. Other senders are ignored without a reply.
#[derive(Debug, Clone)]
pub struct PlayerFindHelper {
    admins: Arc<Vec<String>>,
    list_timeout: Duration,
}

impl PlayerFindHelper {
    pub fn new(admins: Vec<String>) -> Self {
        Self {
            admins: Arc::new(admins),
            list_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_list_timeout(mut self, list_timeout: Duration) -> Self {
        self.list_timeout = list_timeout;
        self
    }
}

#[async_trait]
impl Plugin for PlayerFindHelper {
    fn info(&self) -> PluginInfo {
        PluginInfo::new(
            "player-find-helper",
            env!("CARGO_PKG_VERSION"),
            "Help server admins find players",
        )
    }

    fn commands(&self) -> Vec<PluginCommand> {
        vec![PluginCommand::new("pfh", Arc::new(self.clone())).concurrent()]
    }
}

#[async_trait]
impl ChatCommand for PlayerFindHelper {
    async fn run(&self, server: Arc<McServer>, sender: String, args: Vec<String>) -> anyhow::Result<()> {
        if !self.admins.iter().any(|admin| *admin == sender) {
            debug!(%sender, "pfh ignored for non-admin");
            return Ok(());
        }

        let Some((subcommand, rest)) = args.split_first() else {
            tellraw(&server, &sender, &json!([HELP])).await?;
            return Ok(());
        };
        if subcommand == "help" {
            tellraw(&server, &sender, &json!([HELP])).await?;
            return Ok(());
        }
        let Some(mode) = FindMode::from_subcommand(subcommand) else {
            let unknown = json!({"text": "Unknown command, see ~!pfh help"});
            tellraw(&server, &sender, &unknown).await?;
            return Ok(());
        };

        let pattern = match serde_json::from_str::<String>(&rest.join(" ")) {
            Ok(pattern) => pattern,
            Err(_) => {
                let bad = json!({"text": "Bad argument, see ~!pfh help"});
                tellraw(&server, &sender, &bad).await?;
                return Ok(());
            }
        };

        let players = tokio::time::timeout(self.list_timeout, server.players())
            .await
            .context("player list timed out")??;
        let message = match find_players(mode, &pattern, &players) {
            Ok(found) => result_message(&found),
            Err(e) => json!({"text": format!("{e:#}"), "color": "red"}),
        };
        tellraw(&server, &sender, &message).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn plain_modes_compare_substrings() {
        let online = names(&["Steve", "Alex", "SteveJr", "Jr_Alex"]);
        assert_eq!(find_players(FindMode::StartsWith, "Steve", &online).unwrap(), names(&["Steve", "SteveJr"]));
        assert_eq!(find_players(FindMode::EndsWith, "Alex", &online).unwrap(), names(&["Alex", "Jr_Alex"]));
        assert_eq!(find_players(FindMode::Contains, "Jr", &online).unwrap(), names(&["SteveJr", "Jr_Alex"]));
    }

    #[test]
    fn regex_searches_anywhere_in_the_name() {
        let online = names(&["Steve", "Alex", "Steve2"]);
        assert_eq!(find_players(FindMode::Regex, r"\d$", &online).unwrap(), names(&["Steve2"]));
        assert_eq!(find_players(FindMode::Regex, "le", &online).unwrap(), names(&["Alex"]));
    }

    #[test]
    fn invalid_regex_is_an_error() {
        assert!(find_players(FindMode::Regex, "(", &names(&["Steve"])).is_err());
    }

    #[test]
    fn result_lists_numbered_insertable_names() {
        let message = result_message(&names(&["Steve", "Alex"]));
        let parts = message.as_array().unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0]["text"], "Found 2 players:\n");
        assert_eq!(parts[2]["text"], "2. Alex");
        assert_eq!(parts[2]["insertion"], "Alex");
        assert_eq!(parts[2]["hoverEvent"]["action"], "show_text");
    }

    #[test]
    fn subcommands_map_to_modes() {
        assert_eq!(FindMode::from_subcommand("find-in"), Some(FindMode::Contains));
        assert_eq!(FindMode::from_subcommand("find"), None);
    }
}

#[cfg(all(test, unix))]
mod process_tests {
    use super::*;
    use crate::datapack::PackageLayout;
    use crate::facade::StartOptions;
    use crate::server::test_support::fake_launch;
    use crate::tailer::EchoHook;
    use tokio::time::{sleep, timeout};

    const WAIT: Duration = Duration::from_secs(5);

    async fn running_server(dir: &std::path::Path) -> Arc<McServer> {
        let layout = PackageLayout::new(dir.join("world").join("datapacks"), "mscr", "mscr");
        let server = Arc::new(McServer::new(fake_launch(dir), layout, StartOptions::default()));
        server.start(Arc::new(EchoHook)).await.unwrap();
        server
    }

    fn args(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_string).collect()
    }

    #[tokio::test]
    async fn admin_gets_matching_players() {
        let dir = tempfile::tempdir().unwrap();
        let server = running_server(dir.path()).await;
        let plugin = PlayerFindHelper::new(vec!["Admin".to_string()]).with_list_timeout(WAIT);

        let result = server.wait_for_log(|line| line.starts_with("cmd: tellraw Admin") && line.contains("Found"));
        plugin
            .run(server.clone(), "Admin".to_string(), args(r#"find-sw "St""#))
            .await
            .unwrap();

        let line = timeout(WAIT, result.wait()).await.unwrap();
        assert!(line.contains("Found 1 players"));
        assert!(line.contains("1. Steve"));
        assert!(!line.contains("Alex"));
        timeout(WAIT, server.stop()).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unquoted_pattern_is_a_bad_argument() {
        let dir = tempfile::tempdir().unwrap();
        let server = running_server(dir.path()).await;
        let plugin = PlayerFindHelper::new(vec!["Admin".to_string()]);

        let bad = server.wait_for_log(|line| line.starts_with("cmd: tellraw Admin") && line.contains("Bad argument"));
        plugin.run(server.clone(), "Admin".to_string(), args("find-sw St")).await.unwrap();

        timeout(WAIT, bad.wait()).await.unwrap();
        timeout(WAIT, server.stop()).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn non_admins_get_no_reply() {
        let dir = tempfile::tempdir().unwrap();
        let server = running_server(dir.path()).await;
        let plugin = PlayerFindHelper::new(vec!["Admin".to_string()]);

        let any_reply = server.wait_for_log(|line| line.starts_with("cmd: tellraw Steve"));
        plugin
            .run(server.clone(), "Steve".to_string(), args(r#"find-sw "St""#))
            .await
            .unwrap();

        sleep(Duration::from_millis(200)).await;
        assert!(!any_reply.is_resolved());
        timeout(WAIT, server.stop()).await.unwrap().unwrap();
    }
}
