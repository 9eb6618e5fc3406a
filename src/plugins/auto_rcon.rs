use crate::facade::McServer;
use crate::plugin::{Plugin, PluginInfo};
use crate::server::ProcessStatus;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Connects RCON as soon as the server starts accepting it.
#[derive(Debug, Clone)]
pub struct AutoConnectRcon {
    addr: String,
    port: u16,
    password: String,
    retry: Duration,
}

impl AutoConnectRcon {
    pub fn new(addr: impl Into<String>, port: u16, password: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            port,
            password: password.into(),
            retry: Duration::from_secs(3),
        }
    }

    pub fn with_retry(mut self, retry: Duration) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl Plugin for AutoConnectRcon {
    fn info(&self) -> PluginInfo {
        PluginInfo::new(
            "auto-connect-rcon",
            env!("CARGO_PKG_VERSION"),
            "Connect to RCON once the server is up",
        )
    }

    fn on_start(&self, server: &Arc<McServer>) {
        tokio::spawn(connect_until_ready(Arc::clone(server), self.clone()));
    }
}

async fn connect_until_ready(server: Arc<McServer>, target: AutoConnectRcon) {
    loop {
        match server
            .connect_rcon(&target.addr, target.port, &target.password)
            .await
        {
            Ok(()) => {
                info!(addr = %target.addr, port = target.port, "auto-connected RCON");
                return;
            }
            Err(e) => {
                debug!(error = %e, retry = ?target.retry, "RCON not ready");
            }
        }

        tokio::time::sleep(target.retry).await;
        if server.process().status().await == ProcessStatus::Stopped {
            return;
        }
    }
}
