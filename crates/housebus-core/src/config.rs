//! Configuration types for the bus client
//!
//! Every field has a default so a partial JSON document (or an empty
//! environment) yields a working configuration for a local gateway.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::traits::QoS;

/// Prefix shared by every environment variable read by [`ClientConfig::from_env`]
pub const ENV_PREFIX: &str = "HOUSEBUS_";

/// Upper bound for `client.config_retry_interval_secs` (one hour)
pub const MAX_CONFIG_RETRY_INTERVAL_SECS: u64 = 3600;

/// Main client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Broker connection settings
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// House credentials
    #[serde(default)]
    pub house: HouseConfig,

    /// Client behaviour
    #[serde(default)]
    pub client: ClientSettings,
}

impl ClientConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from `HOUSEBUS_*` environment variables
    ///
    /// Unset variables keep their defaults; set but unparsable values are
    /// reported as configuration errors.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from any source of `HOUSEBUS_*` variables
    ///
    /// `lookup` receives the full variable name and returns its value if set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let vars = EnvVars { lookup };
        let defaults = Self::default();

        let gateway = GatewayConfig {
            hostname: vars.string("GATEWAY_HOSTNAME", defaults.gateway.hostname),
            port: vars.parse("GATEWAY_PORT", defaults.gateway.port)?,
            transport: vars.parse("GATEWAY_TRANSPORT", defaults.gateway.transport)?,
            ssl: vars.flag("GATEWAY_SSL", defaults.gateway.ssl)?,
            ca_cert: vars.string("GATEWAY_CA_CERT", defaults.gateway.ca_cert),
            certfile: vars.optional("GATEWAY_CERTFILE"),
            keyfile: vars.optional("GATEWAY_KEYFILE"),
            qos_subscribe: vars.qos("GATEWAY_QOS_SUBSCRIBE", defaults.gateway.qos_subscribe)?,
            qos_publish: vars.qos("GATEWAY_QOS_PUBLISH", defaults.gateway.qos_publish)?,
            version: vars.parse("GATEWAY_VERSION", defaults.gateway.version)?,
            namespace: vars.string("NAMESPACE", defaults.gateway.namespace),
        };

        let house = HouseConfig {
            id: vars.string("ID", defaults.house.id),
            passcode: vars.string("PASSCODE", defaults.house.passcode),
        };

        let client = ClientSettings {
            verbose: vars.flag("VERBOSE", defaults.client.verbose)?,
            connect_timeout_secs: vars.parse(
                "CONNECT_TIMEOUT_SECS",
                defaults.client.connect_timeout_secs,
            )?,
            config_retry_interval_secs: vars.parse(
                "CONFIG_RETRY_SECS",
                defaults.client.config_retry_interval_secs,
            )?,
            event_channel_capacity: vars.parse(
                "EVENT_CHANNEL_CAPACITY",
                defaults.client.event_channel_capacity,
            )?,
        };

        Ok(Self {
            gateway,
            house,
            client,
        })
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.gateway.validate()?;

        if self.house.id.is_empty() {
            return Err(Error::config("House id cannot be empty"));
        }
        if self.house.id.contains('/') {
            return Err(Error::config(format!(
                "House id cannot contain '/': {}",
                self.house.id
            )));
        }

        self.client.validate()
    }
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Broker hostname
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Broker port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Wire transport used to reach the broker
    #[serde(default)]
    pub transport: GatewayTransport,

    /// Whether to use TLS
    #[serde(default)]
    pub ssl: bool,

    /// CA certificate location used when `ssl` is set
    #[serde(default = "default_ca_cert")]
    pub ca_cert: String,

    /// Client certificate (optional)
    #[serde(default)]
    pub certfile: Option<String>,

    /// Client key (optional)
    #[serde(default)]
    pub keyfile: Option<String>,

    /// QoS used for subscriptions
    #[serde(default = "default_qos")]
    pub qos_subscribe: QoS,

    /// QoS used for publishes
    #[serde(default = "default_qos")]
    pub qos_publish: QoS,

    /// Bus protocol version
    ///
    /// Version 1 brokers retain configuration messages. From version 2 on
    /// configuration must be requested from the config authority.
    #[serde(default = "default_version")]
    pub version: u32,

    /// First topic level of every bus topic
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl GatewayConfig {
    /// Whether the broker retains messages for late subscribers
    pub fn retains_messages(&self) -> bool {
        self.version < 2
    }

    /// Validate the gateway configuration
    pub fn validate(&self) -> Result<()> {
        if self.hostname.is_empty() {
            return Err(Error::config("Gateway hostname cannot be empty"));
        }
        if self.port == 0 {
            return Err(Error::config("Gateway port must be > 0"));
        }
        if self.version == 0 {
            return Err(Error::config("Gateway protocol version must be >= 1"));
        }
        if self.namespace.is_empty() || self.namespace.contains('/') {
            return Err(Error::config(format!(
                "Invalid topic namespace: '{}'",
                self.namespace
            )));
        }
        Ok(())
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            port: default_port(),
            transport: GatewayTransport::default(),
            ssl: false,
            ca_cert: default_ca_cert(),
            certfile: None,
            keyfile: None,
            qos_subscribe: default_qos(),
            qos_publish: default_qos(),
            version: default_version(),
            namespace: default_namespace(),
        }
    }
}

/// Wire transport towards the broker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayTransport {
    /// MQTT over websockets
    #[default]
    Websockets,
    /// Plain MQTT over TCP
    Tcp,
}

impl FromStr for GatewayTransport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "websockets" => Ok(Self::Websockets),
            "tcp" => Ok(Self::Tcp),
            other => Err(Error::config(format!(
                "Unsupported gateway transport '{}'. Supported: websockets, tcp",
                other
            ))),
        }
    }
}

/// House credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HouseConfig {
    /// House identifier, also the broker username
    #[serde(default = "default_house_id")]
    pub id: String,

    /// House passcode, used as the broker password
    #[serde(default)]
    pub passcode: String,
}

impl Default for HouseConfig {
    fn default() -> Self {
        Self {
            id: default_house_id(),
            passcode: String::new(),
        }
    }
}

/// Client behaviour settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Log every inbound and outbound message at debug level
    #[serde(default)]
    pub verbose: bool,

    /// Broker connect timeout (in seconds)
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Interval between configuration request retries (in seconds)
    #[serde(default = "default_config_retry_interval_secs")]
    pub config_retry_interval_secs: u64,

    /// Capacity of the [`BusEvent`](crate::engine::BusEvent) channel
    ///
    /// When full, new events are dropped with a warning.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl ClientSettings {
    /// Connect timeout as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Configuration retry interval as a duration
    pub fn config_retry_interval(&self) -> Duration {
        Duration::from_secs(self.config_retry_interval_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.config_retry_interval_secs == 0 {
            return Err(Error::config("Configuration retry interval must be > 0"));
        }
        if self.config_retry_interval_secs > MAX_CONFIG_RETRY_INTERVAL_SECS {
            return Err(Error::config(format!(
                "Configuration retry interval must be <= {} seconds",
                MAX_CONFIG_RETRY_INTERVAL_SECS
            )));
        }
        if self.event_channel_capacity == 0 {
            return Err(Error::config("Event channel capacity must be > 0"));
        }
        Ok(())
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            verbose: false,
            connect_timeout_secs: default_connect_timeout_secs(),
            config_retry_interval_secs: default_config_retry_interval_secs(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

fn default_hostname() -> String {
    "egeoffrey-gateway".to_string()
}

fn default_port() -> u16 {
    443
}

fn default_ca_cert() -> String {
    "/etc/ssl/certs".to_string()
}

fn default_qos() -> QoS {
    QoS::ExactlyOnce
}

fn default_version() -> u32 {
    1
}

fn default_namespace() -> String {
    "egeoffrey".to_string()
}

fn default_house_id() -> String {
    "house".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    2
}

fn default_config_retry_interval_secs() -> u64 {
    2
}

fn default_event_channel_capacity() -> usize {
    1000
}

struct EnvVars<F> {
    lookup: F,
}

impl<F> EnvVars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{}{}", ENV_PREFIX, name))
    }

    fn string(&self, name: &str, default: String) -> String {
        self.get(name).unwrap_or(default)
    }

    fn optional(&self, name: &str) -> Option<String> {
        self.get(name).filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, name: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(name) {
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| {
                Error::config(format!("{}{} is not valid ({}): {}", ENV_PREFIX, name, raw, e))
            }),
            None => Ok(default),
        }
    }

    /// Flags are written as integers, `0` meaning off
    fn flag(&self, name: &str, default: bool) -> Result<bool> {
        let value: u8 = self.parse(name, u8::from(default))?;
        Ok(value != 0)
    }

    fn qos(&self, name: &str, default: QoS) -> Result<QoS> {
        let level: u8 = self.parse(name, default as u8)?;
        QoS::try_from(level)
    }
}
