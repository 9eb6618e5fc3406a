//! Supervision of the server child process.

use crate::datapack::PackageLayout;
use crate::error::{Error, Result};
use crate::tailer::{spawn_tailer, LogHook, LogWaiters};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

/// How to launch the server: `<java> -Xmx<mem> -jar <jar> <args...>` in `workdir`.
#[derive(Debug, Clone)]
pub struct Launch {
    pub java: PathBuf,
    pub jar: PathBuf,
    pub workdir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    NotStarted,
    Running,
    Stopped,
}

struct Running {
    child: Child,
    stdin: ChildStdin,
    tailer: JoinHandle<()>,
}

enum State {
    NotStarted,
    Running(Running),
    Stopped,
}

/// The supervised server process.
///
/// Starts at most once. After `stop` the instance is finished; build a new
/// one to run the server again.
pub struct ServerProcess {
    launch: Launch,
    package: PackageLayout,
    waiters: LogWaiters,
    state: Mutex<State>,
}

impl std::fmt::Debug for ServerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerProcess")
            .field("launch", &self.launch)
            .field("package", &self.package.root())
            .finish()
    }
}

impl ServerProcess {
    pub fn new(launch: Launch, package: PackageLayout, waiters: LogWaiters) -> Self {
        Self {
            launch,
            package,
            waiters,
            state: Mutex::new(State::NotStarted),
        }
    }

    pub fn launch(&self) -> &Launch {
        &self.launch
    }

    pub async fn status(&self) -> ProcessStatus {
        match *self.state.lock().await {
            State::NotStarted => ProcessStatus::NotStarted,
            State::Running(_) => ProcessStatus::Running,
            State::Stopped => ProcessStatus::Stopped,
        }
    }

    pub async fn pid(&self) -> Option<u32> {
        match &*self.state.lock().await {
            State::Running(running) => running.child.id(),
            _ => None,
        }
    }

    /// Prepare the managed package, launch the server and start tailing its output.
    pub async fn start(
        &self,
        extra_args: &[String],
        memory_limit: &str,
        hook: Arc<dyn LogHook>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        match *state {
            State::Running(_) => return Err(Error::AlreadyRunning),
            State::Stopped => return Err(Error::Stopped),
            State::NotStarted => {}
        }

        self.package.prepare().await?;

        let mut child = self.command(extra_args, memory_limit).spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("server stdin was not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("server stdout was not captured"))?;
        let tailer = spawn_tailer(stdout, self.waiters.clone(), hook);

        info!(
            pid = child.id(),
            jar = %self.launch.jar.display(),
            workdir = %self.launch.workdir.display(),
            "server started"
        );
        *state = State::Running(Running {
            child,
            stdin,
            tailer,
        });
        Ok(())
    }

    fn command(&self, extra_args: &[String], memory_limit: &str) -> Command {
        let mut cmd = Command::new(&self.launch.java);
        cmd.arg(format!("-Xmx{memory_limit}"))
            .arg("-jar")
            .arg(&self.launch.jar)
            .args(extra_args)
            .current_dir(&self.launch.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        // Keep terminal signals aimed at us away from the server.
        #[cfg(unix)]
        cmd.process_group(0);
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);

        cmd
    }

    /// Write one line to the server console.
    pub async fn write_line(&self, line: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let State::Running(running) = &mut *state else {
            return Err(Error::NotRunning);
        };

        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        running.stdin.write_all(&data).await?;
        running.stdin.flush().await?;
        Ok(())
    }

    /// Ask the server to stop and wait for it to exit.
    pub async fn stop(&self) -> Result<ExitStatus> {
        let mut running = {
            let mut state = self.state.lock().await;
            match std::mem::replace(&mut *state, State::Stopped) {
                State::Running(running) => running,
                other => {
                    *state = other;
                    return Err(Error::NotRunning);
                }
            }
        };

        if running.child.try_wait()?.is_none() {
            debug!("sending stop to server");
            if let Err(e) = send_stop(&mut running.stdin).await {
                warn!(error = %e, "failed to send stop; waiting for exit anyway");
            }
        }
        drop(running.stdin);

        let status = running.child.wait().await?;
        if let Err(e) = running.tailer.await {
            warn!(error = %e, "server output tailer ended abnormally");
        }

        info!(%status, "server stopped");
        Ok(status)
    }
}

async fn send_stop(stdin: &mut ChildStdin) -> std::io::Result<()> {
    stdin.write_all(b"stop\n").await?;
    stdin.flush().await
}


#[cfg(all(test, unix))]
mod tests {
    use super::test_support::fake_launch;
    use super::*;
    use crate::tailer::EchoHook;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn process(dir: &std::path::Path, waiters: &LogWaiters) -> ServerProcess {
        let layout = PackageLayout::new(dir.join("world").join("datapacks"), "mscr", "mscr");
        ServerProcess::new(fake_launch(dir), layout, waiters.clone())
    }

    #[tokio::test]
    async fn stop_before_start_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let server = process(dir.path(), &LogWaiters::new());
        assert!(matches!(server.stop().await, Err(Error::NotRunning)));
        assert!(matches!(server.write_line("say hi").await, Err(Error::NotRunning)));
        assert_eq!(server.status().await, ProcessStatus::NotStarted);
    }

    #[tokio::test]
    async fn start_twice_is_already_running() {
        let dir = tempfile::tempdir().unwrap();
        let waiters = LogWaiters::new();
        let server = process(dir.path(), &waiters);

        server.start(&[], "1G", Arc::new(EchoHook)).await.unwrap();
        let err = server.start(&[], "1G", Arc::new(EchoHook)).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning));

        timeout(WAIT, server.stop()).await.unwrap().unwrap();
        assert_eq!(server.status().await, ProcessStatus::Stopped);
        let err = server.start(&[], "1G", Arc::new(EchoHook)).await.unwrap_err();
        assert!(matches!(err, Error::Stopped));
    }

    #[tokio::test]
    async fn launches_with_memory_flag_and_prepares_package() {
        let dir = tempfile::tempdir().unwrap();
        let waiters = LogWaiters::new();
        let server = process(dir.path(), &waiters);
        let args = waiters.register(|line| line.starts_with("args: "));

        server
            .start(&["nogui".to_string()], "2G", Arc::new(EchoHook))
            .await
            .unwrap();

        let args = timeout(WAIT, args.wait()).await.unwrap();
        let jar = dir.path().join("server.jar");
        assert_eq!(args, format!("args: -Xmx2G -jar {} nogui", jar.display()));
        assert!(dir
            .path()
            .join("world/datapacks/mscr/pack.mcmeta")
            .exists());

        timeout(WAIT, server.stop()).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stop_sends_directive_and_waits_for_exit() {
        let dir = tempfile::tempdir().unwrap();
        let waiters = LogWaiters::new();
        let server = process(dir.path(), &waiters);
        server.start(&[], "1G", Arc::new(EchoHook)).await.unwrap();
        let stopping = waiters.register_contains("Stopping server");

        let status = timeout(WAIT, server.stop()).await.unwrap().unwrap();
        assert!(status.success());
        assert!(stopping.is_resolved());
    }
}
