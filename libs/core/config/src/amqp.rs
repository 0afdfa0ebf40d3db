use crate::{ConfigError, FromEnv, env_or_default, env_parse};

/// AMQP broker connection settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AmqpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    /// Connection timeout in seconds
    pub connection_timeout_secs: u64,
    /// Heartbeat interval in seconds, 0 disables heartbeats
    pub heartbeat_secs: u16,
}

impl AmqpConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            password: password.into(),
            ..Self::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = vhost.into();
        self
    }

    pub fn with_heartbeat_secs(mut self, heartbeat_secs: u16) -> Self {
        self.heartbeat_secs = heartbeat_secs;
        self
    }

    /// `amqp://` URI with the vhost percent-encoded and heartbeat/timeout as query
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}?heartbeat={}&connection_timeout={}",
            urlencoding::encode(&self.username),
            urlencoding::encode(&self.password),
            self.host,
            self.port,
            urlencoding::encode(&self.vhost),
            self.heartbeat_secs,
            self.connection_timeout_secs * 1000,
        )
    }
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            connection_timeout_secs: 6,
            heartbeat_secs: 0,
        }
    }
}

impl FromEnv for AmqpConfig {
    /// Reads AMQP_* variables, defaulting to a local broker with guest credentials
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            host: env_or_default("AMQP_HOST", &defaults.host),
            port: env_parse("AMQP_PORT", defaults.port)?,
            username: env_or_default("AMQP_USERNAME", &defaults.username),
            password: env_or_default("AMQP_PASSWORD", &defaults.password),
            vhost: env_or_default("AMQP_VHOST", &defaults.vhost),
            connection_timeout_secs: env_parse(
                "AMQP_CONNECTION_TIMEOUT_SECS",
                defaults.connection_timeout_secs,
            )?,
            heartbeat_secs: env_parse("AMQP_HEARTBEAT_SECS", defaults.heartbeat_secs)?,
        })
    }
}
