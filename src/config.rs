//! `mscr_config.json`: where the server lives and how to drive it.

use crate::datapack::PackageLayout;
use crate::error::{Error, Result};
use crate::facade::StartOptions;
use crate::plugin::HostSettings;
use crate::server::Launch;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub const CONFIG_FILE: &str = "mscr_config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the server jar. Required to run.
    pub server_path: Option<PathBuf>,
    /// Working directory of the server. Defaults to the jar's directory.
    pub server_rundir: Option<PathBuf>,
    pub java_path: PathBuf,
    pub memory_limit: String,
    pub extra_args: Vec<String>,
    pub world_name: String,
    pub datapack: DatapackConfig,
    pub command_prefix: String,
    pub echo_server_output: bool,
    pub max_concurrent_handlers: usize,
    pub rcon: RconConfig,
    pub response_timeout_secs: u64,
    pub tsday_admins: Vec<String>,
    pub run_cmd_admins: Vec<String>,
    pub player_find_helper_admins: Vec<String>,
    pub global_tp_alias: BTreeMap<String, String>,
    /// Fill light blocks around players tagged `mscr_infinity_light`.
    pub infinity_light: bool,
    pub infinity_light_period_ms: u64,
    /// Shell lines run before the prompt appears.
    pub boot_commands: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_path: None,
            server_rundir: None,
            java_path: PathBuf::from("java"),
            memory_limit: "2G".to_string(),
            extra_args: vec!["nogui".to_string()],
            world_name: "world".to_string(),
            datapack: DatapackConfig::default(),
            command_prefix: "~!".to_string(),
            echo_server_output: true,
            max_concurrent_handlers: 8,
            rcon: RconConfig::default(),
            response_timeout_secs: 10,
            tsday_admins: Vec::new(),
            run_cmd_admins: Vec::new(),
            player_find_helper_admins: Vec::new(),
            global_tp_alias: BTreeMap::new(),
            infinity_light: false,
            infinity_light_period_ms: 125,
            boot_commands: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatapackConfig {
    pub name: String,
    pub namespace: String,
    pub description: String,
    pub pack_format: u32,
    /// `function` on current servers, `functions` before 1.21.
    pub function_dir: String,
}

impl Default for DatapackConfig {
    fn default() -> Self {
        Self {
            name: "mscr".to_string(),
            namespace: "mscr".to_string(),
            description: "Generated by mscr".to_string(),
            pack_format: 48,
            function_dir: "function".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RconConfig {
    pub addr: String,
    pub port: u16,
    pub password: String,
    /// Keep trying to connect once the server is up.
    pub auto_connect: bool,
}

impl Default for RconConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1".to_string(),
            port: 25575,
            password: String::new(),
            auto_connect: false,
        }
    }
}

/// `--config` if given, else `./mscr_config.json` if present, else the
/// per-user config directory.
pub fn resolve_path(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    let local = PathBuf::from(CONFIG_FILE);
    if local.is_file() {
        return local;
    }
    match dirs::config_dir() {
        Some(dir) => dir.join("mscr").join(CONFIG_FILE),
        None => local,
    }
}

impl Config {
    /// Load `path`, filling in defaults, and write the result back.
    /// A missing file is created with the defaults.
    pub fn load_or_init(path: &Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            info!(path = %path.display(), "writing default configuration");
            Config::default()
        };
        config.save(path)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn launch(&self) -> Result<Launch> {
        let jar = self.server_path.clone().ok_or(Error::MissingServerPath)?;
        Ok(Launch {
            java: self.java_path.clone(),
            workdir: self.rundir(&jar),
            jar,
        })
    }

    fn rundir(&self, jar: &Path) -> PathBuf {
        if let Some(rundir) = &self.server_rundir {
            return rundir.clone();
        }
        match jar.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    pub fn package_layout(&self, launch: &Launch) -> PackageLayout {
        let pack = &self.datapack;
        PackageLayout::new(
            launch.workdir.join(&self.world_name).join("datapacks"),
            &pack.name,
            &pack.namespace,
        )
        .with_description(&pack.description)
        .with_pack_format(pack.pack_format)
        .with_function_dir(&pack.function_dir)
    }

    pub fn start_options(&self) -> StartOptions {
        StartOptions {
            memory_limit: self.memory_limit.clone(),
            extra_args: self.extra_args.clone(),
        }
    }

    pub fn host_settings(&self) -> HostSettings {
        HostSettings {
            command_prefix: self.command_prefix.clone(),
            echo_output: self.echo_server_output,
            max_concurrent_handlers: self.max_concurrent_handlers,
        }
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    /// Never zero, so the refill loop cannot spin.
    pub fn infinity_light_period(&self) -> Duration {
        Duration::from_millis(self.infinity_light_period_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        let config = Config::load_or_init(&path).unwrap();
        assert_eq!(config, Config::default());

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["command_prefix"], "~!");
        assert_eq!(written["rcon"]["port"], 25575);
        assert!(written["server_path"].is_null());
    }

    #[test]
    fn partial_file_is_filled_in_and_written_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            r#"{"server_path": "/srv/mc/server.jar", "rcon": {"password": "pw"}, "boot_commands": ["players"]}"#,
        )
        .unwrap();

        let config = Config::load_or_init(&path).unwrap();
        assert_eq!(config.server_path, Some(PathBuf::from("/srv/mc/server.jar")));
        assert_eq!(config.rcon.password, "pw");
        assert_eq!(config.rcon.port, 25575);
        assert_eq!(config.boot_commands, vec!["players"]);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"memory_limit\": \"2G\""));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "{ not json").unwrap();
        assert!(Config::load_or_init(&path).is_err());
    }

    #[test]
    fn launch_requires_server_path() {
        assert!(matches!(Config::default().launch(), Err(Error::MissingServerPath)));
    }

    #[test]
    fn rundir_defaults_to_jar_directory() {
        let config = Config {
            server_path: Some(PathBuf::from("/srv/mc/server.jar")),
            ..Default::default()
        };
        let launch = config.launch().unwrap();
        assert_eq!(launch.workdir, PathBuf::from("/srv/mc"));
        assert_eq!(
            config.package_layout(&launch).root(),
            Path::new("/srv/mc/world/datapacks/mscr")
        );

        let bare = Config {
            server_path: Some(PathBuf::from("server.jar")),
            ..Default::default()
        };
        assert_eq!(bare.launch().unwrap().workdir, PathBuf::from("."));

        let explicit = Config {
            server_path: Some(PathBuf::from("/srv/mc/server.jar")),
            server_rundir: Some(PathBuf::from("/var/mc")),
            ..Default::default()
        };
        assert_eq!(explicit.launch().unwrap().workdir, PathBuf::from("/var/mc"));
    }

    #[test]
    fn plugin_keys_default_off() {
        let config: Config = serde_json::from_str(r#"{"run_cmd_admins": ["Admin"]}"#).unwrap();
        assert_eq!(config.run_cmd_admins, vec!["Admin"]);
        assert!(config.player_find_helper_admins.is_empty());
        assert!(!config.infinity_light);
        assert_eq!(config.infinity_light_period(), Duration::from_millis(125));

        let zero = Config {
            infinity_light_period_ms: 0,
            ..Default::default()
        };
        assert_eq!(zero.infinity_light_period(), Duration::from_millis(1));
    }

    #[test]
    fn explicit_path_wins() {
        let path = PathBuf::from("/tmp/custom.json");
        assert_eq!(resolve_path(Some(path.clone())), path);
    }
}
