//! SSH port forwarding to the coordination database.

use async_trait::async_trait;
use hpo_types::{ConfigError, HpoError, HpoResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info};

pub const DEFAULT_LOCAL_PORT: u16 = 33306;

/// Where to forward the database port through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSettings {
    pub gateway: String,
    pub user: Option<String>,
    pub local_port: u16,
}

impl TunnelSettings {
    /// Read tunnel keys. Returns `None` when no gateway is configured.
    pub fn from_map(values: &HashMap<String, String>) -> Result<Option<Self>, ConfigError> {
        let Some(gateway) = values.get("SSH_TUNNEL_GATEWAY").filter(|g| !g.is_empty()) else {
            return Ok(None);
        };
        let local_port = match values.get("SSH_TUNNEL_LOCAL_PORT") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "SSH_TUNNEL_LOCAL_PORT".into(),
                message: format!("not a port number: {raw}"),
            })?,
            None => DEFAULT_LOCAL_PORT,
        };
        Ok(Some(Self {
            gateway: gateway.clone(),
            user: values.get("SSH_TUNNEL_USER").cloned(),
            local_port,
        }))
    }

    /// Arguments for `ssh` forwarding `local_port` to `host:port`.
    pub fn ssh_args(&self, host: &str, port: u16) -> Vec<String> {
        let destination = match &self.user {
            Some(user) => format!("{user}@{}", self.gateway),
            None => self.gateway.clone(),
        };
        vec![
            "-N".into(),
            "-o".into(),
            "ExitOnForwardFailure=yes".into(),
            "-L".into(),
            format!("{}:{host}:{port}", self.local_port),
            destination,
        ]
    }
}

/// A live tunnel. Dropping it closes the forward.
#[derive(Debug)]
pub struct TunnelHandle {
    pub local_port: u16,
    child: Option<Child>,
}

impl TunnelHandle {
    pub fn new(local_port: u16, child: Option<Child>) -> Self {
        Self { local_port, child }
    }

    /// A handle for a forward managed outside this process.
    pub fn external(local_port: u16) -> Self {
        Self::new(local_port, None)
    }

    pub fn is_process_backed(&self) -> bool {
        self.child.is_some()
    }
}

#[async_trait]
pub trait TunnelOpener: Send + Sync {
    async fn open(&self, settings: &TunnelSettings, host: &str, port: u16)
        -> HpoResult<TunnelHandle>;
}

/// Opens tunnels by spawning the system `ssh` client.
#[derive(Debug, Clone)]
pub struct SshTunnelOpener {
    pub ready_timeout: Duration,
    pub probe_interval: Duration,
}

impl Default for SshTunnelOpener {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(20),
            probe_interval: Duration::from_millis(250),
        }
    }
}

#[async_trait]
impl TunnelOpener for SshTunnelOpener {
    async fn open(
        &self,
        settings: &TunnelSettings,
        host: &str,
        port: u16,
    ) -> HpoResult<TunnelHandle> {
        // A listener already on the port would satisfy the readiness check
        // without ssh ever forwarding.
        if let Err(e) = TcpListener::bind(("127.0.0.1", settings.local_port)).await {
            return Err(HpoError::Tunnel(format!(
                "local port {} is already in use: {e}",
                settings.local_port
            )));
        }

        let args = settings.ssh_args(host, port);
        debug!(?args, "spawning ssh tunnel");

        let mut child = Command::new("ssh")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HpoError::Tunnel(format!("failed to spawn ssh: {e}")))?;

        let deadline = tokio::time::Instant::now() + self.ready_timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                let stderr = read_stderr(child.stderr.take()).await;
                return Err(HpoError::Tunnel(format!(
                    "ssh exited before the forward was ready ({status}): {}",
                    stderr.trim()
                )));
            }
            if TcpStream::connect(("127.0.0.1", settings.local_port))
                .await
                .is_ok()
            {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(HpoError::Tunnel(format!(
                    "port {} not reachable after {:?}",
                    settings.local_port, self.ready_timeout
                )));
            }
            tokio::time::sleep(self.probe_interval).await;
        }

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(stderr));
        }
        info!(
            gateway = %settings.gateway,
            local_port = settings.local_port,
            "tunnel to {host}:{port} open"
        );
        Ok(TunnelHandle::new(settings.local_port, Some(child)))
    }
}

async fn read_stderr(stderr: Option<ChildStderr>) -> String {
    let mut out = String::new();
    if let Some(mut stderr) = stderr {
        let _ = stderr.read_to_string(&mut out).await;
    }
    out
}

/// Keep the pipe drained for the life of the tunnel.
async fn log_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "hpo_study::tunnel::ssh", "{line}");
    }
}
