//! Server descriptors supplied by the host application.
//!
//! Descriptors are immutable once handed over; configuration changes arrive
//! as a complete replacement list, never as in-place mutation. Runtime
//! health for a server id survives replacement and is tracked elsewhere.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Login for the AUTHINFO exchange.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            password: password.into(),
        }
    }
}

// Keeps passwords out of logs. Descriptors get logged on reload.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Immutable description of one news server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Stable identity. Health state is keyed by this, so it should survive
    /// host/port edits when the operator considers it the same server.
    pub id: String,
    pub host: String,
    pub port: u16,
    /// Connect over TLS (NNTPS, conventionally port 563).
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    /// Upper bound on simultaneous connections to this server.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Failover rank; lower is tried first. Ties break on id.
    #[serde(default)]
    pub priority: u8,
    /// Disabled servers are skipped entirely without forgetting their health.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Advertised retention in days, when the operator knows it. Informational.
    #[serde(default)]
    pub retention_days: Option<u32>,
}

fn default_max_connections() -> usize {
    4
}

fn default_true() -> bool {
    true
}

impl ServerConfig {
    /// Descriptor with defaults: plain TCP, no credentials, priority 0,
    /// enabled, 4 connections.
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        ServerConfig {
            id: id.into(),
            host: host.into(),
            port,
            tls: false,
            credentials: None,
            max_connections: default_max_connections(),
            priority: 0,
            enabled: true,
            retention_days: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::Config("server id must not be empty".into()));
        }
        if self.host.trim().is_empty() {
            return Err(Error::Config(format!("server {}: host must not be empty", self.id)));
        }
        if self.max_connections == 0 {
            return Err(Error::Config(format!(
                "server {}: max_connections must be at least 1",
                self.id
            )));
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
