//! Connection configuration.

use std::time::Duration;

use crate::auth::AuthMethod;
use crate::error::{ClientError, ClientResult};

/// Configuration for one connection.
///
/// When `user` is `None` the connection stays a guest session and the auth
/// exchange is skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: String,
    pub auth_method: AuthMethod,
    pub connect_timeout: Duration,
    /// Default per-request deadline; individual calls may override it.
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port: 3301,
            user: None,
            password: String::new(),
            auth_method: AuthMethod::default(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    /// Validates the configuration. Failures are synchronous and never
    /// retried.
    pub fn validate(&self) -> ClientResult<()> {
        if self.host.is_empty() {
            return Err(ClientError::Config("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(ClientError::Config("port must be non-zero".into()));
        }
        if self.connect_timeout.is_zero() || self.request_timeout.is_zero() {
            return Err(ClientError::Config("timeouts must be positive".into()));
        }
        Ok(())
    }

    /// `host:port` form used for the TCP connect.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
