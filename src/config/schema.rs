use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Environment variable naming the config file when `--config` is absent.
pub const CONFIG_PATH_ENV: &str = "TELEMETRY_UNIT_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "telemetry-unit.toml";

const CLIENT_ID_PREFIX: &str = "telemetry-unit";

// ── Top-level config ────────────────────────────────────────────

/// Top-level telemetry unit configuration, loaded from `telemetry-unit.toml`.
///
/// Resolution order for the file: `--config` flag, then `TELEMETRY_UNIT_CONFIG`,
/// then `./telemetry-unit.toml`. Selected keys can be overridden through
/// environment variables; see [`Config::apply_env_overrides`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Path the config was loaded from. Computed at load time, not serialized.
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Measurement generator settings (`[worker]`).
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Broker connection settings (`[mqtt]`).
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// Reconnection and shutdown behaviour (`[reliability]`).
    #[serde(default)]
    pub reliability: ReliabilityConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(DEFAULT_CONFIG_FILE),
            worker: WorkerConfig::default(),
            mqtt: MqttConfig::default(),
            reliability: ReliabilityConfig::default(),
        }
    }
}

/// Measurement generator configuration (`[worker]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkerConfig {
    /// Seconds between measurements.
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,
}

fn default_period_secs() -> u64 {
    1
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            period_secs: default_period_secs(),
        }
    }
}

/// Broker connection configuration (`[mqtt]` section).
///
/// The connection always uses TLS 1.3 with a client certificate.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MqttConfig {
    /// Broker host name. Also used for server certificate name checks.
    #[serde(default)]
    pub broker: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// MQTT client identifier. Empty generates `telemetry-unit-<uuid>` per run.
    #[serde(default)]
    pub client_id: String,
    /// PEM file holding the client certificate chain (and the key, unless
    /// `client_key` is set).
    #[serde(default, deserialize_with = "empty_as_none")]
    #[schemars(with = "Option<String>")]
    pub client_certificate: Option<PathBuf>,
    #[serde(default, deserialize_with = "empty_as_none")]
    #[schemars(with = "Option<String>")]
    pub client_key: Option<PathBuf>,
    /// Passphrase for an `ENCRYPTED PRIVATE KEY` (PKCS#8) block.
    #[serde(default, deserialize_with = "empty_as_none")]
    #[schemars(with = "Option<String>")]
    pub client_certificate_password: Option<String>,
    /// PEM bundle of trusted CAs. Falls back to the bundled Mozilla roots.
    #[serde(default, deserialize_with = "empty_as_none")]
    #[schemars(with = "Option<String>")]
    pub ca_certificate: Option<PathBuf>,
    /// PEM-encoded CRLs consulted when verifying the broker certificate.
    #[serde(default)]
    pub crl_files: Vec<PathBuf>,
    /// Accept the broker certificate when the only failure is that its
    /// revocation status could not be determined.
    #[serde(default)]
    pub ignore_certificate_revocation_errors: bool,
    #[serde(default = "default_topic")]
    pub topic: String,
    /// 0 (at most once) or 1 (at least once).
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_operation_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_operation_timeout_secs")]
    pub publish_timeout_secs: u64,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_topic() -> String {
    "/measurements".into()
}

fn default_qos() -> u8 {
    1
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_operation_timeout_secs() -> u64 {
    10
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: String::new(),
            port: default_mqtt_port(),
            client_id: String::new(),
            client_certificate: None,
            client_key: None,
            client_certificate_password: None,
            ca_certificate: None,
            crl_files: Vec::new(),
            ignore_certificate_revocation_errors: false,
            topic: default_topic(),
            qos: default_qos(),
            keep_alive_secs: default_keep_alive_secs(),
            connect_timeout_secs: default_operation_timeout_secs(),
            publish_timeout_secs: default_operation_timeout_secs(),
        }
    }
}

impl MqttConfig {
    /// The configured client id, or a fresh `telemetry-unit-<uuid>`.
    /// Call once per run; every call with an empty `client_id` differs.
    pub fn effective_client_id(&self) -> String {
        let configured = self.client_id.trim();
        if configured.is_empty() {
            format!("{CLIENT_ID_PREFIX}-{}", uuid::Uuid::new_v4())
        } else {
            configured.to_string()
        }
    }
}

/// Reconnection and shutdown configuration (`[reliability]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReliabilityConfig {
    /// Re-establish lost broker connections. When `false`, a failed initial
    /// connect or publish stops the publisher.
    #[serde(default = "default_true")]
    pub reconnect: bool,
    #[serde(default = "default_reconnect_initial_backoff_secs")]
    pub reconnect_initial_backoff_secs: u64,
    #[serde(default = "default_reconnect_max_backoff_secs")]
    pub reconnect_max_backoff_secs: u64,
    /// Upper bound for the generator and publisher to stop after a shutdown signal.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_reconnect_initial_backoff_secs() -> u64 {
    1
}

fn default_reconnect_max_backoff_secs() -> u64 {
    60
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            reconnect: true,
            reconnect_initial_backoff_secs: default_reconnect_initial_backoff_secs(),
            reconnect_max_backoff_secs: default_reconnect_max_backoff_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

fn empty_as_none<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: From<String>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.filter(|value| !value.trim().is_empty()).map(T::from))
}

/// `--config` flag, then `TELEMETRY_UNIT_CONFIG`, then `./telemetry-unit.toml`.
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    PathBuf::from(DEFAULT_CONFIG_FILE)
}

impl Config {
    /// Default configuration written by `init`, with placeholder broker and
    /// certificate settings to edit.
    pub fn template(config_path: PathBuf) -> Self {
        let mut config = Self {
            config_path,
            ..Self::default()
        };
        config.mqtt.broker = "broker.example.com".into();
        config.mqtt.client_certificate = Some(PathBuf::from("client.pem"));
        config
    }

    /// Read, parse and env-override the config at `path` (see
    /// [`resolve_config_path`]). Does not validate.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = resolve_config_path(path);
        if !config_path.exists() {
            anyhow::bail!(
                "Config file {} not found. Create one with `telemetry-unit init`.",
                config_path.display()
            );
        }

        // The file may carry the client key passphrase.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(meta) = fs::metadata(&config_path).await {
                if meta.permissions().mode() & 0o004 != 0 {
                    tracing::warn!(
                        "Config file {:?} is world-readable (mode {:o}). \
                         Consider restricting with: chmod 600 {:?}",
                        config_path,
                        meta.permissions().mode() & 0o777,
                        config_path,
                    );
                }
            }
        }

        let contents = fs::read_to_string(&config_path)
            .await
            .with_context(|| format!("Failed to read config file {}", config_path.display()))?;
        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", config_path.display()))?;
        config.config_path = config_path;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Checks that hold for every run, including dry runs.
    pub fn validate(&self) -> Result<()> {
        // Worker
        if self.worker.period_secs == 0 {
            anyhow::bail!("worker.period_secs must be greater than 0");
        }

        // MQTT
        if self.mqtt.port == 0 {
            anyhow::bail!("mqtt.port must be greater than 0");
        }
        let topic = self.mqtt.topic.trim();
        if topic.is_empty() {
            anyhow::bail!("mqtt.topic must not be empty");
        }
        if topic.contains(['+', '#']) {
            anyhow::bail!("mqtt.topic must not contain wildcards (+ or #)");
        }
        if self.mqtt.qos > 1 {
            anyhow::bail!("mqtt.qos must be 0 or 1");
        }
        if self.mqtt.client_id.starts_with(char::is_whitespace) {
            anyhow::bail!("mqtt.client_id must not start with whitespace");
        }
        if self.mqtt.keep_alive_secs == 0 {
            anyhow::bail!("mqtt.keep_alive_secs must be greater than 0");
        }
        if self.mqtt.connect_timeout_secs == 0 {
            anyhow::bail!("mqtt.connect_timeout_secs must be greater than 0");
        }
        if self.mqtt.publish_timeout_secs == 0 {
            anyhow::bail!("mqtt.publish_timeout_secs must be greater than 0");
        }

        // Reliability
        if self.reliability.reconnect_initial_backoff_secs == 0 {
            anyhow::bail!("reliability.reconnect_initial_backoff_secs must be greater than 0");
        }
        if self.reliability.reconnect_max_backoff_secs
            < self.reliability.reconnect_initial_backoff_secs
        {
            anyhow::bail!(
                "reliability.reconnect_max_backoff_secs must be at least reliability.reconnect_initial_backoff_secs"
            );
        }
        if self.reliability.shutdown_timeout_secs == 0 {
            anyhow::bail!("reliability.shutdown_timeout_secs must be greater than 0");
        }

        Ok(())
    }

    /// [`Config::validate`] plus the settings a real broker connection needs.
    pub fn validate_for_network(&self) -> Result<()> {
        self.validate()?;
        if self.mqtt.broker.trim().is_empty() {
            anyhow::bail!("mqtt.broker must not be empty");
        }
        if self.mqtt.client_certificate.is_none() {
            anyhow::bail!("mqtt.client_certificate must be set");
        }
        Ok(())
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        // Period: TELEMETRY_UNIT_PERIOD_SECS
        if let Ok(period) = std::env::var("TELEMETRY_UNIT_PERIOD_SECS") {
            if let Ok(period) = period.parse::<u64>() {
                self.worker.period_secs = period;
            } else if !period.is_empty() {
                tracing::warn!("Ignoring TELEMETRY_UNIT_PERIOD_SECS={period:?}: not a number");
            }
        }

        // Broker host: TELEMETRY_UNIT_MQTT_BROKER
        if let Ok(broker) = std::env::var("TELEMETRY_UNIT_MQTT_BROKER") {
            if !broker.is_empty() {
                self.mqtt.broker = broker;
            }
        }

        // Broker port: TELEMETRY_UNIT_MQTT_PORT
        if let Ok(port) = std::env::var("TELEMETRY_UNIT_MQTT_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.mqtt.port = port;
            } else if !port.is_empty() {
                tracing::warn!("Ignoring TELEMETRY_UNIT_MQTT_PORT={port:?}: not a port number");
            }
        }

        if let Ok(client_id) = std::env::var("TELEMETRY_UNIT_MQTT_CLIENT_ID") {
            if !client_id.is_empty() {
                self.mqtt.client_id = client_id;
            }
        }

        if let Ok(cert) = std::env::var("TELEMETRY_UNIT_MQTT_CLIENT_CERTIFICATE") {
            if !cert.is_empty() {
                self.mqtt.client_certificate = Some(PathBuf::from(cert));
            }
        }

        if let Ok(password) = std::env::var("TELEMETRY_UNIT_MQTT_CLIENT_CERTIFICATE_PASSWORD") {
            if !password.is_empty() {
                self.mqtt.client_certificate_password = Some(password);
            }
        }

        // Revocation tolerance: TELEMETRY_UNIT_MQTT_IGNORE_REVOCATION_ERRORS
        if let Ok(flag) = std::env::var("TELEMETRY_UNIT_MQTT_IGNORE_REVOCATION_ERRORS") {
            match flag.trim().to_ascii_lowercase().as_str() {
                "" => {}
                "1" | "true" | "yes" | "on" => self.mqtt.ignore_certificate_revocation_errors = true,
                "0" | "false" | "no" | "off" => {
                    self.mqtt.ignore_certificate_revocation_errors = false;
                }
                other => tracing::warn!(
                    "Ignoring TELEMETRY_UNIT_MQTT_IGNORE_REVOCATION_ERRORS={other:?}: expected true or false"
                ),
            }
        }
    }

    /// Atomically write this config to `config_path`.
    pub async fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = match self.config_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or(DEFAULT_CONFIG_FILE);
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

        let mut temp_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .await
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .await
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        if let Err(e) = fs::rename(&temp_path, &self.config_path).await {
            let _ = fs::remove_file(&temp_path).await;
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }

        Ok(())
    }
}
