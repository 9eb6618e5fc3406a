//! The operator console: one command per line on stdin.

use crate::facade::{Dispatch, FlushMode, Flushed, McServer};
use anyhow::{bail, Context};
use std::future::Future;
use std::io::{BufRead, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const HELP: &str = "\
commands:
  stop | exit | quit             stop the server and leave
  cmd | command <command>        run one command
  defer <command>                queue a command for the next flush
  flush                          send the queued commands
  batch <c1> ; <c2> ; ...        run commands as one datapack function
  players                        list online players
  connect-rcon [addr:port [pw]]  connect to RCON
  enable-rcon | disable-rcon     send commands over RCON or stdin
  enable-batch | disable-batch   flush as a datapack function or one line
  cls | clear                    clear the screen
  help                           show this message";

#[derive(Debug, Clone, PartialEq, Eq)]
enum ShellCommand<'a> {
    Empty,
    Stop,
    Command(&'a str),
    Defer(&'a str),
    Flush,
    Batch(Vec<String>),
    Players,
    ConnectRcon {
        target: Option<&'a str>,
        password: Option<&'a str>,
    },
    SetDispatch(Dispatch),
    SetFlushMode(FlushMode),
    Clear,
    Help,
    Unknown(&'a str),
}

fn parse(line: &str) -> ShellCommand<'_> {
    let line = line.trim();
    let (head, rest) = match line.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (line, ""),
    };

    match head {
        "" => ShellCommand::Empty,
        "stop" | "exit" | "quit" => ShellCommand::Stop,
        "cmd" | "command" => ShellCommand::Command(rest),
        "defer" => ShellCommand::Defer(rest),
        "flush" => ShellCommand::Flush,
        "batch" => ShellCommand::Batch(
            rest.split(';')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect(),
        ),
        "players" => ShellCommand::Players,
        "connect-rcon" => {
            let mut parts = rest.split_whitespace();
            ShellCommand::ConnectRcon {
                target: parts.next(),
                password: parts.next(),
            }
        }
        "enable-rcon" => ShellCommand::SetDispatch(Dispatch::Rcon),
        "disable-rcon" => ShellCommand::SetDispatch(Dispatch::Stdin),
        "enable-batch" => ShellCommand::SetFlushMode(FlushMode::Batched),
        "disable-batch" => ShellCommand::SetFlushMode(FlushMode::Joined),
        "cls" | "clear" => ShellCommand::Clear,
        "help" => ShellCommand::Help,
        other => ShellCommand::Unknown(other),
    }
}

fn split_target(target: &str) -> anyhow::Result<(&str, u16)> {
    let (addr, port) = target
        .rsplit_once(':')
        .with_context(|| format!("expected addr:port, got {target:?}"))?;
    let port = port
        .parse()
        .with_context(|| format!("invalid port {port:?}"))?;
    Ok((addr, port))
}

fn prompt(label: &str) {
    print!("{label}");
    let _ = std::io::stdout().flush();
}

/// Read lines from `reader` on a dedicated thread.
///
/// A blocked read stays on that thread, so dropping the receiver (or the
/// runtime) never waits for the next line. The channel closes at end of
/// input or on the first read error.
pub fn spawn_line_reader<R>(reader: R) -> mpsc::Receiver<String>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::channel(16);
    let spawned = std::thread::Builder::new()
        .name("console-input".to_string())
        .spawn(move || {
            for line in reader.lines() {
                match line {
                    Ok(line) => {
                        if tx.blocking_send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "console read failed");
                        break;
                    }
                }
            }
        });
    if let Err(e) = spawned {
        error!(error = %e, "failed to start console reader");
    }
    rx
}

/// Lines typed on the process's stdin.
pub fn stdin_lines() -> mpsc::Receiver<String> {
    spawn_line_reader(std::io::BufReader::new(std::io::stdin()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Reads operator commands and drives the server with them.
pub struct Shell {
    server: Arc<McServer>,
    input: mpsc::Receiver<String>,
    dispatch: Dispatch,
    flush_mode: FlushMode,
    response_timeout: Duration,
}

impl Shell {
    pub fn new(server: Arc<McServer>, input: mpsc::Receiver<String>, response_timeout: Duration) -> Self {
        Self {
            server,
            input,
            dispatch: Dispatch::default(),
            flush_mode: FlushMode::default(),
            response_timeout,
        }
    }

    /// A shell with no console behind it; commands that prompt fail.
    pub fn detached(server: Arc<McServer>, response_timeout: Duration) -> Self {
        let (_, input) = mpsc::channel(1);
        Self::new(server, input, response_timeout)
    }

    pub fn dispatch(&self) -> Dispatch {
        self.dispatch
    }

    pub fn flush_mode(&self) -> FlushMode {
        self.flush_mode
    }

    /// Run `boot` as if typed, then read commands until `stop` or end of input.
    pub async fn run(&mut self, boot: &[String]) -> anyhow::Result<()> {
        for line in boot {
            info!(command = %line, "boot command");
            if self.step(line).await == Flow::Exit {
                return Ok(());
            }
        }

        loop {
            prompt(">>> ");
            let Some(line) = self.input.recv().await else {
                info!("console input closed");
                return Ok(());
            };
            if self.step(&line).await == Flow::Exit {
                return Ok(());
            }
        }
    }

    async fn step(&mut self, line: &str) -> Flow {
        match self.execute(line).await {
            Ok(flow) => flow,
            Err(e) => {
                error!("{e:#}");
                Flow::Continue
            }
        }
    }

    /// Run one console line.
    pub async fn execute(&mut self, line: &str) -> anyhow::Result<Flow> {
        match parse(line) {
            ShellCommand::Empty => {}
            ShellCommand::Stop => {
                match self.server.stop().await {
                    Ok(status) => println!("server exited: {status}"),
                    Err(e) => warn!(error = %e, "stop failed"),
                }
                return Ok(Flow::Exit);
            }
            ShellCommand::Command(command) => {
                if command.is_empty() {
                    bail!("usage: cmd <command>");
                }
                if let Some(response) = self.server.send(command, self.dispatch).await? {
                    let response = self.bounded(response.wait()).await?;
                    println!("{}", response.body);
                }
            }
            ShellCommand::Defer(command) => {
                if command.is_empty() {
                    bail!("usage: defer <command>");
                }
                self.server.defer(command);
                println!("{} command(s) deferred", self.server.deferred_len());
            }
            ShellCommand::Flush => match self.server.flush(self.flush_mode, self.dispatch).await? {
                Flushed::Nothing => println!("nothing to flush"),
                Flushed::Sent => println!("flushed"),
                Flushed::Response(response) => {
                    println!("{}", self.bounded(response.wait()).await?.body);
                }
                Flushed::Batch(outcome) => {
                    println!("{}", self.bounded(outcome.wait()).await?.text());
                }
            },
            ShellCommand::Batch(commands) => {
                if commands.is_empty() {
                    bail!("usage: batch <c1> ; <c2> ; ...");
                }
                let outcome = self.server.run_batch(&commands, self.dispatch).await?;
                println!("{}", self.bounded(outcome.wait()).await?.text());
            }
            ShellCommand::Players => {
                let players = self.bounded(self.server.players()).await??;
                println!("{} online: {}", players.len(), players.join(", "));
            }
            ShellCommand::ConnectRcon { target, password } => {
                let target = match target {
                    Some(target) => target.to_string(),
                    None => self.ask("addr:port > ").await?,
                };
                let (addr, port) = split_target(&target)?;
                let password = match password {
                    Some(password) => password.to_string(),
                    None => self.ask("password > ").await?,
                };
                self.server.connect_rcon(addr, port, &password).await?;
                println!("connect rcon success.");
            }
            ShellCommand::SetDispatch(dispatch) => {
                self.dispatch = dispatch;
                println!("dispatch: {dispatch:?}");
            }
            ShellCommand::SetFlushMode(mode) => {
                self.flush_mode = mode;
                println!("flush mode: {mode:?}");
            }
            ShellCommand::Clear => prompt("\x1bc"),
            ShellCommand::Help => println!("{HELP}"),
            ShellCommand::Unknown(word) => println!("unknown command: {word} (try help)"),
        }
        Ok(Flow::Continue)
    }

    async fn ask(&mut self, label: &str) -> anyhow::Result<String> {
        prompt(label);
        let line = self.input.recv().await.context("console input closed")?;
        Ok(line.trim().to_string())
    }

    async fn bounded<F: Future>(&self, future: F) -> anyhow::Result<F::Output> {
        tokio::time::timeout(self.response_timeout, future)
            .await
            .with_context(|| format!("no response within {:?}", self.response_timeout))
    }
}
