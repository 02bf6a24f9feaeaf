//! Connection target of the shared study backend.

use hpo_types::{ConfigError, HpoError, HpoResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

use crate::tunnel::{SshTunnelOpener, TunnelHandle, TunnelOpener, TunnelSettings};

pub const DEFAULT_SCHEME: &str = "mysql";

/// Settings read once at start from the environment or a key/value file.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    pub scheme: String,
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: Option<u16>,
    pub database: String,
    pub tunnel: Option<TunnelSettings>,
}

fn required(values: &HashMap<String, String>, key: &str) -> Result<String, ConfigError> {
    values
        .get(key)
        .cloned()
        .ok_or_else(|| ConfigError::MissingKey {
            key: key.to_string(),
        })
}

impl ConnectionSettings {
    pub fn from_map(values: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let port = match values.get("MYSQL_PORT") {
            Some(raw) => Some(raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "MYSQL_PORT".into(),
                message: format!("not a port number: {raw}"),
            })?),
            None => None,
        };

        Ok(Self {
            scheme: values
                .get("HPOPT_DB_SCHEME")
                .cloned()
                .unwrap_or_else(|| DEFAULT_SCHEME.to_string()),
            username: required(values, "MYSQL_USERNAME")?,
            password: required(values, "MYSQL_PASSWORD")?,
            host: required(values, "MYSQL_NODE")?,
            port,
            database: required(values, "HPOPT_DB")?,
            tunnel: TunnelSettings::from_map(values)?,
        })
    }

    /// Same settings pointed at another host, e.g. the node the database
    /// job landed on.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(3306)
    }
}

impl std::fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("scheme", &self.scheme)
            .field("username", &self.username)
            .field("password", &"***")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("tunnel", &self.tunnel)
            .finish()
    }
}

/// Resolved address of the shared backend.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTarget {
    pub scheme: String,
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: Option<u16>,
    pub database: String,
}

impl ConnectionTarget {
    fn direct(settings: &ConnectionSettings) -> Self {
        Self {
            scheme: settings.scheme.clone(),
            username: settings.username.clone(),
            password: settings.password.clone(),
            host: settings.host.clone(),
            port: settings.port,
            database: settings.database.clone(),
        }
    }

    pub fn is_mysql(&self) -> bool {
        self.scheme.starts_with("mysql")
    }

    /// `<scheme>://<user>:***@<host>[:<port>]/<database>`, safe to log.
    pub fn redacted(&self) -> String {
        format!(
            "{}://{}:***@{}/{}",
            self.scheme,
            self.username,
            self.authority(),
            self.database
        )
    }

    fn authority(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{port}", self.host),
            None => self.host.clone(),
        }
    }
}

impl std::fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}://{}:{}@{}/{}",
            self.scheme,
            self.username,
            self.password,
            self.authority(),
            self.database
        )
    }
}

impl std::fmt::Debug for ConnectionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.redacted())
    }
}

/// Holds the connection target, and the tunnel behind it, for one process.
///
/// Both are computed on first use and never change afterwards.
pub struct BackendContext {
    settings: ConnectionSettings,
    opener: Arc<dyn TunnelOpener>,
    tunnel: OnceCell<TunnelHandle>,
    target: OnceCell<ConnectionTarget>,
}

impl BackendContext {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self::with_opener(settings, Arc::new(SshTunnelOpener::default()))
    }

    pub fn with_opener(settings: ConnectionSettings, opener: Arc<dyn TunnelOpener>) -> Self {
        Self {
            settings,
            opener,
            tunnel: OnceCell::new(),
            target: OnceCell::new(),
        }
    }

    pub fn from_map(values: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Ok(Self::new(ConnectionSettings::from_map(values)?))
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn tunnel(&self) -> Option<&TunnelHandle> {
        self.tunnel.get()
    }

    /// The backend address, opening the tunnel first if one is configured.
    pub async fn connection_target(&self) -> HpoResult<&ConnectionTarget> {
        self.target
            .get_or_try_init(|| async {
                let mut target = ConnectionTarget::direct(&self.settings);
                if let Some(tunnel_settings) = &self.settings.tunnel {
                    let handle = self
                        .tunnel
                        .get_or_try_init(|| {
                            self.opener.open(
                                tunnel_settings,
                                &self.settings.host,
                                self.settings.port_or_default(),
                            )
                        })
                        .await?;
                    target.host = "127.0.0.1".to_string();
                    target.port = Some(handle.local_port);
                }
                info!(backend = %target.redacted(), "resolved study backend");
                Ok::<_, HpoError>(target)
            })
            .await
    }
}

impl std::fmt::Debug for BackendContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendContext")
            .field("settings", &self.settings)
            .field("target", &self.target.get())
            .finish()
    }
}
