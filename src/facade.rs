//! The public command surface used by the shell and by plugins.

use crate::batch::{BatchChannel, BatchExecutor, BatchOutcome};
use crate::client::RconSession;
use crate::datapack::PackageLayout;
use crate::error::{Error, Result};
use crate::pending::RconResponse;
use crate::promise::Promise;
use crate::server::{Launch, ProcessStatus, ServerProcess};
use crate::tailer::{LogHook, LogWaiter, LogWaiters};
use async_trait::async_trait;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Strip the single leading `/` chat commands carry; the console does not want it.
pub fn normalize_command(command: &str) -> &str {
    command.strip_prefix('/').unwrap_or(command)
}

/// Which channel a command goes out on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dispatch {
    /// Write to the server's stdin. Nothing comes back.
    #[default]
    Stdin,
    /// Send over RCON and get a response handle.
    Rcon,
}

/// How `flush` sends the deferred commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMode {
    /// One newline-joined command.
    #[default]
    Joined,
    /// One generated datapack function.
    Batched,
}

/// What a `flush` produced.
#[derive(Debug)]
pub enum Flushed {
    /// The deferred list was empty.
    Nothing,
    /// Written to stdin.
    Sent,
    Response(Promise<RconResponse>),
    Batch(Promise<BatchOutcome>),
}

/// Memory limit and extra arguments used when starting the server.
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub memory_limit: String,
    pub extra_args: Vec<String>,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            memory_limit: "2G".to_string(),
            extra_args: vec!["nogui".to_string()],
        }
    }
}

/// A supervised server together with its RCON session.
#[derive(Debug)]
pub struct McServer {
    process: ServerProcess,
    rcon: RconSession,
    batch: BatchExecutor,
    waiters: LogWaiters,
    options: StartOptions,
    deferred: Mutex<Vec<String>>,
}

impl McServer {
    pub fn new(launch: Launch, layout: PackageLayout, options: StartOptions) -> Self {
        let waiters = LogWaiters::new();
        Self {
            process: ServerProcess::new(launch, layout.clone(), waiters.clone()),
            rcon: RconSession::new(),
            batch: BatchExecutor::new(layout, waiters.clone()),
            waiters,
            options,
            deferred: Mutex::new(Vec::new()),
        }
    }

    pub fn process(&self) -> &ServerProcess {
        &self.process
    }

    pub fn rcon(&self) -> &RconSession {
        &self.rcon
    }

    pub fn waiters(&self) -> &LogWaiters {
        &self.waiters
    }

    pub async fn start(&self, hook: Arc<dyn LogHook>) -> Result<()> {
        self.process
            .start(&self.options.extra_args, &self.options.memory_limit, hook)
            .await
    }

    /// Close RCON, then stop the server and wait for it to exit.
    pub async fn stop(&self) -> Result<ExitStatus> {
        self.rcon.close().await;
        self.process.stop().await
    }

    pub async fn connect_rcon(&self, addr: &str, port: u16, password: &str) -> Result<()> {
        self.rcon.connect(addr, port, password).await
    }

    /// Register a waiter for the next output line matching `predicate`.
    pub fn wait_for_log<F>(&self, predicate: F) -> LogWaiter
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.waiters.register(predicate)
    }

    /// Write one command to stdin.
    pub async fn run_command(&self, command: &str) -> Result<()> {
        self.ensure_ready(Dispatch::Stdin).await?;
        if command.is_empty() {
            return Ok(());
        }
        self.process.write_line(normalize_command(command)).await
    }

    /// Send one command over RCON.
    pub async fn run_command_rcon(&self, command: &str) -> Result<Promise<RconResponse>> {
        self.rcon.command(normalize_command(command)).await
    }

    /// Send one command on the chosen channel.
    pub async fn send(&self, command: &str, via: Dispatch) -> Result<Option<Promise<RconResponse>>> {
        match via {
            Dispatch::Stdin => self.run_command(command).await.map(|()| None),
            Dispatch::Rcon => self.run_command_rcon(command).await.map(Some),
        }
    }

    /// Send several commands as one newline-joined command.
    pub async fn run_commands(
        &self,
        commands: &[String],
        via: Dispatch,
    ) -> Result<Option<Promise<RconResponse>>> {
        let joined = commands
            .iter()
            .map(|c| normalize_command(c))
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        self.ensure_ready(via).await?;
        if joined.is_empty() {
            return Ok(None);
        }
        match via {
            Dispatch::Stdin => self.process.write_line(&joined).await.map(|()| None),
            Dispatch::Rcon => self.rcon.command(&joined).await.map(Some),
        }
    }

    /// Run commands as one generated datapack function.
    pub async fn run_batch(&self, commands: &[String], via: Dispatch) -> Result<Promise<BatchOutcome>> {
        if via == Dispatch::Rcon && !self.rcon.is_connected() {
            return Err(Error::SessionNotConnected);
        }
        self.batch.submit(&Route { server: self, via }, commands).await
    }

    /// Queue a command for the next `flush`.
    pub fn defer(&self, command: impl Into<String>) {
        self.deferred().push(command.into());
    }

    pub fn defer_all<I, S>(&self, commands: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deferred().extend(commands.into_iter().map(Into::into));
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred().len()
    }

    /// Send and clear the deferred commands.
    ///
    /// If sending fails the commands are put back in front of anything
    /// deferred in the meantime.
    pub async fn flush(&self, mode: FlushMode, via: Dispatch) -> Result<Flushed> {
        let commands = std::mem::take(&mut *self.deferred());
        if commands.is_empty() {
            return Ok(Flushed::Nothing);
        }
        debug!(count = commands.len(), ?mode, ?via, "flushing deferred commands");

        let result = match mode {
            FlushMode::Joined => self.run_commands(&commands, via).await.map(|response| match response {
                Some(response) => Flushed::Response(response),
                None => Flushed::Sent,
            }),
            FlushMode::Batched => self.run_batch(&commands, via).await.map(Flushed::Batch),
        };

        if result.is_err() {
            let mut deferred = self.deferred();
            let newer = std::mem::replace(&mut *deferred, commands);
            deferred.extend(newer);
        }
        result
    }

    /// Names of the players currently online.
    ///
    /// Uses RCON when connected, otherwise reads the answer from the log.
    /// Does not time out.
    pub async fn players(&self) -> Result<Vec<String>> {
        let line = if self.rcon.is_connected() {
            self.run_command_rcon("list").await?.wait().await.body
        } else {
            let waiter = self.waiters.register(|line| line.contains(PLAYER_LIST_MARKER));
            if let Err(e) = self.run_command("list").await {
                self.waiters.cancel(&waiter);
                return Err(e);
            }
            waiter.wait().await
        };
        Ok(parse_player_list(&line))
    }

    /// Fail fast when the channel `via` names is down, whatever the input.
    async fn ensure_ready(&self, via: Dispatch) -> Result<()> {
        match via {
            Dispatch::Stdin if self.process.status().await != ProcessStatus::Running => {
                Err(Error::NotRunning)
            }
            Dispatch::Rcon if !self.rcon.is_connected() => Err(Error::SessionNotConnected),
            _ => Ok(()),
        }
    }

    fn deferred(&self) -> MutexGuard<'_, Vec<String>> {
        self.deferred.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

const PLAYER_LIST_MARKER: &str = "players online:";

/// Parse `There are N of a max of M players online: a, b`.
pub fn parse_player_list(text: &str) -> Vec<String> {
    let Some(index) = text.find(PLAYER_LIST_MARKER) else {
        warn!(%text, "unexpected player list format");
        return Vec::new();
    };
    text[index + PLAYER_LIST_MARKER.len()..]
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Sends batch trigger directives through the facade.
struct Route<'a> {
    server: &'a McServer,
    via: Dispatch,
}

#[async_trait]
impl BatchChannel for Route<'_> {
    fn correlates(&self) -> bool {
        self.via == Dispatch::Rcon
    }

    async fn trigger(&self, directives: &[String]) -> Result<Option<Promise<RconResponse>>> {
        match self.via {
            Dispatch::Stdin => {
                self.server.process.write_line(&directives.join("\n")).await?;
                Ok(None)
            }
            Dispatch::Rcon => {
                let mut last = None;
                for directive in directives {
                    last = Some(self.server.rcon.command(directive).await?);
                }
                Ok(last)
            }
        }
    }
}


#[cfg(all(test, unix))]
mod process_tests {
    use super::*;
    use crate::server::test_support::fake_launch;
    use crate::tailer::EchoHook;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    async fn running_server(dir: &std::path::Path) -> McServer {
        let layout = PackageLayout::new(dir.join("world").join("datapacks"), "mscr", "mscr");
        let server = McServer::new(fake_launch(dir), layout, StartOptions::default());
        server.start(Arc::new(EchoHook)).await.unwrap();
        server
    }

    #[tokio::test]
    async fn commands_fail_fast_when_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let layout = PackageLayout::new(dir.path(), "mscr", "mscr");
        let server = McServer::new(fake_launch(dir.path()), layout, StartOptions::default());

        assert!(matches!(server.run_command("say hi").await, Err(Error::NotRunning)));
        assert!(matches!(
            server.run_command_rcon("say hi").await,
            Err(Error::SessionNotConnected)
        ));
        assert!(matches!(server.stop().await, Err(Error::NotRunning)));
    }

    #[tokio::test]
    async fn immediate_dispatch_strips_leading_slash() {
        let dir = tempfile::tempdir().unwrap();
        let server = running_server(dir.path()).await;

        let stripped = server.wait_for_log(|line| line == "cmd: time set day");
        server.run_command("/time set day").await.unwrap();
        timeout(WAIT, stripped.wait()).await.unwrap();

        let unchanged = server.wait_for_log(|line| line == "cmd: time set night");
        server.run_command("time set night").await.unwrap();
        timeout(WAIT, unchanged.wait()).await.unwrap();

        timeout(WAIT, server.stop()).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn flush_joined_sends_deferred_lines_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let server = running_server(dir.path()).await;

        server.defer("/say one");
        server.defer_all(["say two"]);
        assert_eq!(server.deferred_len(), 2);
        let second = server.wait_for_log(|line| line == "cmd: say two");

        let flushed = server.flush(FlushMode::Joined, Dispatch::Stdin).await.unwrap();
        assert!(matches!(flushed, Flushed::Sent));
        assert_eq!(server.deferred_len(), 0);
        timeout(WAIT, second.wait()).await.unwrap();

        let empty = server.flush(FlushMode::Joined, Dispatch::Stdin).await.unwrap();
        assert!(matches!(empty, Flushed::Nothing));

        timeout(WAIT, server.stop()).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn failed_flush_keeps_deferred_commands() {
        let dir = tempfile::tempdir().unwrap();
        let layout = PackageLayout::new(dir.path(), "mscr", "mscr");
        let server = McServer::new(fake_launch(dir.path()), layout, StartOptions::default());

        server.defer("say kept");
        let err = server.flush(FlushMode::Joined, Dispatch::Stdin).await.unwrap_err();
        assert!(matches!(err, Error::NotRunning));
        assert_eq!(server.deferred_len(), 1);
    }

    #[tokio::test]
    async fn batched_flush_runs_function_and_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let server = running_server(dir.path()).await;
        let toggled = server.wait_for_log(|line| line.starts_with("cmd: datapack enable"));

        server.defer_all(["say A", "say B"]);
        let Flushed::Batch(outcome) = server.flush(FlushMode::Batched, Dispatch::Stdin).await.unwrap() else {
            panic!("expected a batch job");
        };

        let outcome = timeout(WAIT, outcome.wait()).await.unwrap();
        assert!(matches!(outcome, BatchOutcome::Logged(_)));
        assert!(outcome.text().contains("from function 'mscr:job_"));
        assert!(toggled.is_resolved());

        let functions = dir.path().join("world/datapacks/mscr/data/mscr/function");
        assert_eq!(std::fs::read_dir(functions).unwrap().count(), 0);

        timeout(WAIT, server.stop()).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn players_from_log_without_rcon() {
        let dir = tempfile::tempdir().unwrap();
        let server = running_server(dir.path()).await;

        let players = timeout(WAIT, server.players()).await.unwrap().unwrap();
        assert_eq!(players, vec!["Steve", "Alex"]);

        timeout(WAIT, server.stop()).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn batch_over_rcon_requires_session() {
        let dir = tempfile::tempdir().unwrap();
        let server = running_server(dir.path()).await;

        let err = server
            .run_batch(&["say A".to_string()], Dispatch::Rcon)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionNotConnected));

        timeout(WAIT, server.stop()).await.unwrap().unwrap();
    }
}
