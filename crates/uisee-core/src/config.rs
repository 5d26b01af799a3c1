//! Connection profiles and environment-driven settings.

use std::{fmt, path::Path, path::PathBuf, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{CommandError, ConfigError};

/// Default location of the dotenv file.
pub const DEFAULT_ENV_FILE: &str = "config/.env";

/// Tried when [`DEFAULT_ENV_FILE`] is missing or unreadable.
pub const FALLBACK_ENV_FILE: &str = ".env";

/// Broker address and credentials for the publish/subscribe channel.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionProfile {
    pub broker: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub tls: bool,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
}

impl ConnectionProfile {
    #[must_use]
    pub fn new(broker: impl Into<String>, port: u16) -> Self {
        Self {
            broker: broker.into(),
            port,
            username: None,
            password: None,
            tls: false,
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Set username and password.
    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// `host:port` for log lines.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.broker, self.port)
    }
}

impl Default for ConnectionProfile {
    fn default() -> Self {
        Self::new("localhost", 1883)
    }
}

impl fmt::Debug for ConnectionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionProfile")
            .field("broker", &self.broker)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("tls", &self.tls)
            .field("keep_alive", &self.keep_alive)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// Topics used by the request/response correlator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Topics {
    /// Commands are published here.
    pub command: String,
    /// Acknowledgements arrive here.
    pub response: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            command: "exec".into(),
            response: "exec/response".into(),
        }
    }
}

/// Per-device topic templates; `{id}` is replaced by the device id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceTopics {
    pub firmware: String,
    pub firmware_status: String,
    pub tests: String,
}

impl DeviceTopics {
    /// Topic that receives firmware update requests for `device`.
    #[must_use]
    pub fn firmware(&self, device: &str) -> String {
        self.firmware.replace("{id}", device)
    }

    /// Topic the device reports firmware progress on.
    #[must_use]
    pub fn firmware_status(&self, device: &str) -> String {
        self.firmware_status.replace("{id}", device)
    }

    /// Topic that receives test plans for `device`.
    #[must_use]
    pub fn tests(&self, device: &str) -> String {
        self.tests.replace("{id}", device)
    }
}

impl Default for DeviceTopics {
    fn default() -> Self {
        Self {
            firmware: "device/{id}/firmware".into(),
            firmware_status: "device/{id}/firmware/status".into(),
            tests: "device/{id}/tests".into(),
        }
    }
}

/// Credential for the remote shell.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ShellCredential {
    Password(String),
    KeyFile(PathBuf),
}

impl fmt::Debug for ShellCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(***)"),
            Self::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
        }
    }
}

/// Remote shell endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShellTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub credential: Option<ShellCredential>,
}

impl ShellTarget {
    #[must_use]
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: user.into(),
            credential: None,
        }
    }

    #[must_use]
    pub fn with_credential(mut self, credential: ShellCredential) -> Self {
        self.credential = Some(credential);
        self
    }

    /// `user@host` destination.
    #[must_use]
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Check that host, user and a credential are all present.
    ///
    /// # Errors
    /// Returns `Credentials` naming the missing fields.
    pub fn validate(&self) -> Result<(), CommandError> {
        let mut missing = Vec::new();
        if self.host.trim().is_empty() {
            missing.push("host");
        }
        if self.user.trim().is_empty() {
            missing.push("user");
        }
        match &self.credential {
            None => missing.push("password or key"),
            Some(ShellCredential::Password(p)) if p.is_empty() => missing.push("password"),
            Some(ShellCredential::KeyFile(k)) if k.as_os_str().is_empty() => missing.push("key"),
            Some(_) => {}
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(CommandError::Credentials(format!("missing {}", missing.join(", "))))
        }
    }
}

impl Default for ShellTarget {
    fn default() -> Self {
        Self::new("127.0.0.1", "pi")
    }
}

/// Everything read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub mqtt: ConnectionProfile,
    pub topics: Topics,
    pub device_topics: DeviceTopics,
    pub response_timeout: Duration,
    pub shell: ShellTarget,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mqtt: ConnectionProfile::default(),
            topics: Topics::default(),
            device_topics: DeviceTopics::default(),
            response_timeout: Duration::from_secs(5),
            shell: ShellTarget::default(),
        }
    }
}

impl Settings {
    /// Load an env file (if present) and read settings from the environment.
    ///
    /// With no explicit file, `config/.env` and then `.env` are tried. Missing
    /// files are skipped quietly, malformed ones with a warning.
    ///
    /// # Errors
    /// Returns error if an explicit file cannot be loaded or a value is invalid.
    pub fn load(env_file: Option<&Path>) -> Result<Self, ConfigError> {
        match env_file {
            Some(path) => {
                dotenvy::from_path(path)?;
                tracing::debug!(path = %path.display(), "Loaded env file");
            }
            None => {
                load_first_env_file(&[
                    Path::new(DEFAULT_ENV_FILE),
                    Path::new(FALLBACK_ENV_FILE),
                ]);
            }
        }
        Self::from_env()
    }

    /// Read settings from the process environment.
    ///
    /// # Errors
    /// Returns error if a numeric value is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary key lookup.
    ///
    /// # Errors
    /// Returns error if a numeric value is invalid.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut mqtt = ConnectionProfile::new(
            get("MQTT_BROKER").unwrap_or_else(|| "localhost".into()),
            number(&get, "MQTT_PORT", 1883)?,
        );
        mqtt.username = get("MQTT_USERNAME");
        mqtt.password = get("MQTT_PASSWORD");
        mqtt.tls = get("MQTT_TLS").is_some_and(|v| flag(&v));
        mqtt.keep_alive = Duration::from_secs(number(&get, "MQTT_KEEP_ALIVE", 60)?);
        mqtt.connect_timeout = Duration::from_secs(number(&get, "MQTT_CONNECT_TIMEOUT", 5)?);

        let defaults = Topics::default();
        let topics = Topics {
            command: get("UISEE_COMMAND_TOPIC").unwrap_or(defaults.command),
            response: get("UISEE_RESPONSE_TOPIC").unwrap_or(defaults.response),
        };
        let defaults = DeviceTopics::default();
        let device_topics = DeviceTopics {
            firmware: get("UISEE_FIRMWARE_TOPIC").unwrap_or(defaults.firmware),
            firmware_status: get("UISEE_FIRMWARE_STATUS_TOPIC").unwrap_or(defaults.firmware_status),
            tests: get("UISEE_TESTS_TOPIC").unwrap_or(defaults.tests),
        };

        let credential = get("SSH_KEY")
            .map(|k| ShellCredential::KeyFile(PathBuf::from(k)))
            .or_else(|| get("SSH_PASS").map(ShellCredential::Password));
        let shell = ShellTarget {
            host: get("SSH_HOST").unwrap_or_else(|| "127.0.0.1".into()),
            port: number(&get, "SSH_PORT", 22)?,
            user: get("SSH_USER").unwrap_or_else(|| "pi".into()),
            credential,
        };

        Ok(Self {
            mqtt,
            topics,
            device_topics,
            response_timeout: Duration::from_secs(number(&get, "UISEE_RESPONSE_TIMEOUT", 5)?),
            shell,
        })
    }
}

/// Load the first candidate that parses and return its path.
fn load_first_env_file(candidates: &[&Path]) -> Option<PathBuf> {
    for path in candidates {
        match dotenvy::from_path(path) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "Loaded env file");
                return Some(path.to_path_buf());
            }
            Err(e) if e.not_found() => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable env file");
            }
        }
    }
    None
}

fn flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

fn number<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { key, value }),
        None => Ok(default),
    }
}
