//! Batched execution through generated datapack functions.
//!
//! A command set that is too large for one stdin line or RCON packet is
//! written into a function file, the pack is toggled so the host notices
//! the file, and the function is invoked. The result is either the RCON
//! response to the invocation or the host's own "executed ... from" log
//! line. The file is deleted once the result is in.

use crate::datapack::PackageLayout;
use crate::error::Result;
use crate::facade::normalize_command;
use crate::pending::RconResponse;
use crate::promise::Promise;
use crate::tailer::{LogWaiter, LogWaiters};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// How a batch job finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// The host answered the invocation over RCON.
    Response(RconResponse),
    /// The host logged that it ran the function.
    Logged(String),
}

impl BatchOutcome {
    pub fn text(&self) -> &str {
        match self {
            BatchOutcome::Response(response) => &response.body,
            BatchOutcome::Logged(line) => line,
        }
    }
}

/// The channel used to send a job's trigger directives.
#[async_trait]
pub trait BatchChannel: Send + Sync {
    /// Whether `trigger` returns a correlatable response.
    fn correlates(&self) -> bool;

    /// Send the directives in order. Correlating channels return a handle
    /// to the response of the last one.
    async fn trigger(&self, directives: &[String]) -> Result<Option<Promise<RconResponse>>>;
}

/// Writes and runs batch jobs inside the managed package.
#[derive(Debug, Clone)]
pub struct BatchExecutor {
    layout: PackageLayout,
    waiters: LogWaiters,
}

impl BatchExecutor {
    pub fn new(layout: PackageLayout, waiters: LogWaiters) -> Self {
        Self { layout, waiters }
    }

    pub fn layout(&self) -> &PackageLayout {
        &self.layout
    }

    /// Run `commands` as one generated function.
    ///
    /// Returns once the job has been triggered. The promise resolves after
    /// the host reports completion and the function file is gone.
    pub async fn submit<C>(&self, channel: &C, commands: &[String]) -> Result<Promise<BatchOutcome>>
    where
        C: BatchChannel + ?Sized,
    {
        let script = script_body(commands);
        let (job, path) = self.write_job(&script).await?;
        let qualified = self.layout.qualified(&job);
        debug!(job = %qualified, commands = commands.len(), "batch job written");

        let waiter = (!channel.correlates()).then(|| self.completion_waiter(&qualified));

        let response = match channel.trigger(&self.layout.trigger_directives(&job)).await {
            Ok(response) => response,
            Err(e) => {
                if let Some(waiter) = &waiter {
                    self.waiters.cancel(waiter);
                }
                remove_job(&path).await;
                return Err(e);
            }
        };

        let completion = match response {
            Some(response) => {
                if let Some(waiter) = &waiter {
                    self.waiters.cancel(waiter);
                }
                Completion::Response(response)
            }
            None => Completion::Logged(
                waiter.unwrap_or_else(|| self.completion_waiter(&qualified)),
            ),
        };

        let outcome = Promise::new();
        let resolved = outcome.clone();
        tokio::spawn(async move {
            let result = match completion {
                Completion::Response(response) => BatchOutcome::Response(response.wait().await),
                Completion::Logged(waiter) => BatchOutcome::Logged(waiter.wait().await),
            };
            remove_job(&path).await;
            debug!(job = %qualified, "batch job finished");
            resolved.resolve(result);
        });

        Ok(outcome)
    }

    fn completion_waiter(&self, qualified: &str) -> LogWaiter {
        let needle = qualified.to_string();
        self.waiters.register(move |line| {
            mentions_function(line, &needle) && line.to_ascii_lowercase().contains("executed")
        })
    }

    /// Create the function file under a fresh random name.
    async fn write_job(&self, script: &str) -> Result<(String, PathBuf)> {
        loop {
            let job = format!("job_{}", rand::random_range(0..=i32::MAX));
            let path = self.layout.function_path(&job);
            let file = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await;

            match file {
                Ok(mut file) => {
                    file.write_all(script.as_bytes()).await?;
                    file.flush().await?;
                    return Ok((job, path));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

enum Completion {
    Response(Promise<RconResponse>),
    Logged(LogWaiter),
}

/// Join commands into a function body, one per line, without leading slashes.
pub fn script_body(commands: &[String]) -> String {
    commands
        .iter()
        .map(|c| normalize_command(c))
        .filter(|c| !c.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// True when `line` names `qualified` as a whole function name.
fn mentions_function(line: &str, qualified: &str) -> bool {
    line.match_indices(qualified).any(|(start, _)| {
        !line[start + qualified.len()..].starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_')
    })
}

async fn remove_job(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!(path = %path.display(), error = %e, "failed to delete batch function");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    /// Records directives; optionally answers like RCON would.
    #[derive(Default)]
    struct RecordingChannel {
        correlated: Option<Promise<RconResponse>>,
        fail: bool,
        sent: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl BatchChannel for RecordingChannel {
        fn correlates(&self) -> bool {
            self.correlated.is_some()
        }

        async fn trigger(&self, directives: &[String]) -> Result<Option<Promise<RconResponse>>> {
            if self.fail {
                return Err(Error::NotRunning);
            }
            self.sent.lock().unwrap().push(directives.to_vec());
            Ok(self.correlated.clone())
        }
    }

    async fn executor() -> (tempfile::TempDir, BatchExecutor, LogWaiters) {
        let dir = tempfile::tempdir().unwrap();
        let layout = PackageLayout::new(dir.path(), "mscr", "mscr");
        layout.prepare().await.unwrap();
        let waiters = LogWaiters::new();
        (dir, BatchExecutor::new(layout, waiters.clone()), waiters)
    }

    fn job_files(executor: &BatchExecutor) -> Vec<PathBuf> {
        std::fs::read_dir(executor.layout().functions_dir())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect()
    }

    #[test]
    fn completion_line_must_name_the_whole_function() {
        assert!(mentions_function("Executed 1 command from function 'mscr:job_1'", "mscr:job_1"));
        assert!(!mentions_function("Executed 1 command from function 'mscr:job_12'", "mscr:job_1"));
    }

    #[test]
    fn script_body_strips_slashes_and_blank_commands() {
        let commands = vec!["/say A".to_string(), String::new(), "say B".to_string()];
        assert_eq!(script_body(&commands), "say A\nsay B");
    }

    #[tokio::test]
    async fn stdin_job_completes_from_log_line_and_cleans_up() {
        let (_dir, executor, waiters) = executor().await;
        let channel = RecordingChannel::default();
        let commands = vec!["say A".to_string(), "say B".to_string()];

        let outcome = executor.submit(&channel, &commands).await.unwrap();

        let files = job_files(&executor);
        assert_eq!(files.len(), 1);
        assert_eq!(std::fs::read_to_string(&files[0]).unwrap(), "say A\nsay B");

        let sent = channel.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        let job = files[0].file_stem().unwrap().to_str().unwrap().to_string();
        assert_eq!(sent[0], executor.layout().trigger_directives(&job).to_vec());

        assert_eq!(waiters.dispatch("[Server thread/INFO]: Executed 2 commands from function 'mscr:other'"), 0);
        assert!(!outcome.is_resolved());

        let line = format!("[Server thread/INFO]: Executed 2 commands from function 'mscr:{job}'");
        assert_eq!(waiters.dispatch(&line), 1);

        let result = timeout(WAIT, outcome.wait()).await.unwrap();
        assert_eq!(result, BatchOutcome::Logged(line));
        assert!(job_files(&executor).is_empty());
    }

    #[tokio::test]
    async fn rcon_job_uses_response_without_log_waiter() {
        let (_dir, executor, waiters) = executor().await;
        let response = Promise::new();
        let channel = RecordingChannel {
            correlated: Some(response.clone()),
            ..Default::default()
        };

        let outcome = executor
            .submit(&channel, &["/time set day".to_string()])
            .await
            .unwrap();
        assert!(waiters.is_empty());
        assert_eq!(job_files(&executor).len(), 1);

        response.resolve(RconResponse {
            request_id: 1,
            packet_type: 0,
            body: "Executed 1 command".to_string(),
        });
        let result = timeout(WAIT, outcome.wait()).await.unwrap();
        assert_eq!(result.text(), "Executed 1 command");
        assert!(job_files(&executor).is_empty());
    }

    #[tokio::test]
    async fn concurrent_jobs_get_distinct_files() {
        let (_dir, executor, waiters) = executor().await;
        let channel = RecordingChannel::default();

        let first = executor.submit(&channel, &["say 1".to_string()]).await.unwrap();
        let second = executor.submit(&channel, &["say 2".to_string()]).await.unwrap();
        assert_eq!(job_files(&executor).len(), 2);
        assert_eq!(waiters.len(), 2);

        let sent = channel.sent.lock().unwrap().clone();
        let first_job = sent[0][2].trim_start_matches("function ").to_string();
        waiters.dispatch(&format!("Executed 1 command from function '{first_job}'"));

        timeout(WAIT, first.wait()).await.unwrap();
        assert_eq!(job_files(&executor).len(), 1);
        assert!(!second.is_resolved());
    }

    #[tokio::test]
    async fn failed_trigger_removes_file_and_waiter() {
        let (_dir, executor, waiters) = executor().await;
        let channel = RecordingChannel {
            fail: true,
            ..Default::default()
        };

        let err = executor
            .submit(&channel, &["say A".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotRunning));
        assert!(job_files(&executor).is_empty());
        assert!(waiters.is_empty());
    }
}
