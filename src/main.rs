use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mscr::client::RconSession;
use mscr::config::{self, Config};
use mscr::plugin::PluginHost;
use mscr::plugins::{AutoConnectRcon, InfinityLight, PlayerFindHelper, RunCmd, TeleportPlugin, TsDay};
use mscr::server::ProcessStatus;
use mscr::shell::{self, Shell};
use mscr::McServer;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mscr")]
#[command(about = "Run a Minecraft server and drive it over stdin, RCON and generated datapacks")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server, the plugins and the operator console
    Run {
        /// Configuration file (default: ./mscr_config.json, then the user config dir)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Write the configuration file, filling in defaults
    Init {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Send one command over RCON and print the response
    Rcon {
        #[arg(short, long, default_value = "127.0.0.1")]
        addr: String,

        #[arg(short, long, default_value = "25575")]
        port: u16,

        #[arg(long, default_value = "")]
        password: String,

        /// Seconds to wait for the response
        #[arg(short, long, default_value = "10")]
        timeout: u64,

        /// Command to run, without the leading slash
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            run(config).await?;
        }
        Commands::Init { config } => {
            let path = config::resolve_path(config);
            Config::load_or_init(&path)?;
            println!("{}", path.display());
        }
        Commands::Rcon {
            addr,
            port,
            password,
            timeout,
            command,
        } => {
            rcon(&addr, port, &password, Duration::from_secs(timeout), &command.join(" ")).await?;
        }
    }

    Ok(())
}

async fn run(config_path: Option<PathBuf>) -> Result<()> {
    let path = config::resolve_path(config_path);
    let config = Config::load_or_init(&path)?;
    info!(path = %path.display(), "configuration loaded");

    let launch = config
        .launch()
        .with_context(|| format!("Set server_path in {}", path.display()))?;
    let layout = config.package_layout(&launch);
    let server = Arc::new(McServer::new(launch, layout, config.start_options()));

    let host = Arc::new(plugin_host(&server, &config));
    server
        .start(host.clone())
        .await
        .context("Failed to start server")?;
    host.start();

    let mut shell = Shell::new(Arc::clone(&server), shell::stdin_lines(), config.response_timeout());
    let result = tokio::select! {
        result = shell.run(&config.boot_commands) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            Ok(())
        }
    };

    if server.process().status().await == ProcessStatus::Running {
        if let Err(e) = server.stop().await {
            warn!(error = %e, "failed to stop server");
        }
    }
    host.close();
    result
}

fn plugin_host(server: &Arc<McServer>, config: &Config) -> PluginHost {
    let mut host = PluginHost::new(Arc::clone(server), config.host_settings());
    if config.rcon.auto_connect {
        let rcon = &config.rcon;
        host.register(Arc::new(AutoConnectRcon::new(&rcon.addr, rcon.port, &rcon.password)));
    }
    host.register(Arc::new(TsDay::new(config.tsday_admins.clone())));
    host.register(Arc::new(TeleportPlugin::new(
        config.global_tp_alias.clone().into_iter().collect(),
    )));
    host.register(Arc::new(RunCmd::new(
        config.run_cmd_admins.clone(),
        config.response_timeout(),
    )));
    host.register(Arc::new(PlayerFindHelper::new(config.player_find_helper_admins.clone())));
    if config.infinity_light {
        host.register(Arc::new(InfinityLight::new(config.infinity_light_period())));
    }
    host
}

async fn rcon(addr: &str, port: u16, password: &str, timeout: Duration, command: &str) -> Result<()> {
    let session = RconSession::new();
    session
        .connect(addr, port, password)
        .await
        .with_context(|| format!("Failed to connect to {addr}:{port}"))?;

    let response = session.command(command).await?;
    let response = tokio::time::timeout(timeout, response.wait())
        .await
        .context("Timed out waiting for the response")?;
    println!("{}", response.body);

    session.close().await;
    Ok(())
}
