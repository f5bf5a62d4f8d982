//! MQTT transport over `rumqttc`.
//!
//! Every connection owns its own event loop, driven by a background task for
//! as long as the connection lives. The event loop is never reconnected: once
//! it fails the connection reports itself lost on the next publish.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS,
    Transport,
};
use surge_payload::Message;
use tokio::{task::JoinHandle, time};
use tracing::{debug, error, info, warn};

use super::{Connect, ConnectError, Publish, PublishError, Qos};

const DEFAULT_HOST: &str = "broker.emqx.io";
const DEFAULT_PORT: u16 = 9883;
const DEFAULT_PUBLISH_TIMEOUT_MILLIS: u64 = 5_000;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const KEEP_ALIVE: Duration = Duration::from_secs(60);
const REQUEST_CAPACITY: usize = 64;

/// Broker connection parameters, read from the environment.
#[derive(Clone, PartialEq, Eq)]
pub struct Config {
    /// Broker host name
    pub host: String,
    /// Broker port
    pub port: u16,
    /// User name, empty when unset
    pub username: String,
    /// Password, empty when unset. Never logged.
    pub password: String,
    /// Whether to connect over TLS
    pub tls: bool,
    /// How long a single publish may take before it is abandoned
    pub publish_timeout_millis: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            username: String::new(),
            password: String::new(),
            tls: true,
            publish_timeout_millis: DEFAULT_PUBLISH_TIMEOUT_MILLIS,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password_set", &!self.password.is_empty())
            .field("tls", &self.tls)
            .field("publish_timeout_millis", &self.publish_timeout_millis)
            .finish()
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Build the broker configuration from environment variables, looked up
    /// through `lookup`.
    ///
    /// Host is `MQTT_BROKER`, else `C8Y_DOMAIN`, else the public EMQX broker.
    /// User name is `USERNAME`, else `C8Y_TENANT/C8Y_USERNAME` when both are
    /// set. Unparsable values keep their default.
    pub fn from_env<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) =
            non_blank(lookup("MQTT_BROKER")).or_else(|| non_blank(lookup("C8Y_DOMAIN")))
        {
            config.host = host;
        }

        if let Some(raw) = lookup("MQTT_PORT") {
            match raw.trim().parse() {
                Ok(port) => config.port = port,
                Err(_) => warn!("MQTT_PORT {raw:?} is not a valid port, using {DEFAULT_PORT}"),
            }
        }

        if let Some(username) = non_blank(lookup("USERNAME")) {
            config.username = username;
        } else if let (Some(tenant), Some(user)) = (
            non_blank(lookup("C8Y_TENANT")),
            non_blank(lookup("C8Y_USERNAME")),
        ) {
            config.username = format!("{tenant}/{user}");
        }

        if let Some(password) = lookup("PASSWORD") {
            config.password = password;
        }

        if let Some(raw) = lookup("MQTT_TLS") {
            match parse_flag(&raw) {
                Some(tls) => config.tls = tls,
                None => warn!("MQTT_TLS {raw:?} is not a boolean, TLS stays enabled"),
            }
        }

        if let Some(raw) = lookup("MQTT_PUBLISH_TIMEOUT_MILLIS") {
            match raw.trim().parse::<u64>() {
                Ok(millis) if millis > 0 => config.publish_timeout_millis = millis,
                _ => warn!(
                    "MQTT_PUBLISH_TIMEOUT_MILLIS {raw:?} is invalid, using {DEFAULT_PUBLISH_TIMEOUT_MILLIS}"
                ),
            }
        }

        config
    }

    /// The credentials to authenticate with, only when both user name and
    /// password are non-blank.
    #[must_use]
    pub fn credentials(&self) -> Option<(&str, &str)> {
        if self.username.trim().is_empty() || self.password.trim().is_empty() {
            None
        } else {
            Some((&self.username, &self.password))
        }
    }

    fn options(&self, client_id: String) -> MqttOptions {
        let mut options = MqttOptions::new(client_id, self.host.clone(), self.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        if let Some((username, password)) = self.credentials() {
            options.set_credentials(username, password);
        }
        if self.tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    }
}

impl From<Qos> for QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => QoS::AtMostOnce,
            Qos::AtLeastOnce => QoS::AtLeastOnce,
        }
    }
}

#[derive(Debug, Clone)]
/// Opens one MQTT session per worker.
pub struct Mqtt {
    config: Config,
}

impl Mqtt {
    /// Create a new [`Mqtt`] connector.
    #[must_use]
    pub fn new(config: Config) -> Self {
        match config.credentials() {
            Some((username, _)) => info!("Using authentication with username: {username}"),
            None => info!("No authentication credentials provided, connecting anonymously"),
        }
        Self { config }
    }
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<(), ConnectError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(ConnectError::Refused(format!("{:?}", ack.code)))
                };
            }
            Ok(_) => {}
            Err(err) => return Err(ConnectError::Transport(err.to_string())),
        }
    }
}

async fn drive(mut eventloop: EventLoop, lost: Arc<AtomicBool>, id: u32) {
    loop {
        match eventloop.poll().await {
            Ok(event) => debug!(worker = id, "mqtt event: {event:?}"),
            Err(ConnectionError::RequestsDone) => {
                debug!(worker = id, "mqtt client dropped, event loop exiting");
                break;
            }
            Err(err) => {
                error!(worker = id, "mqtt event loop failed: {err}");
                break;
            }
        }
    }
    lost.store(true, Ordering::Release);
}

#[async_trait]
impl Connect for Mqtt {
    type Connection = Connection;

    async fn connect(&self, id: u32) -> Result<Connection, ConnectError> {
        let suffix: u16 = rand::random();
        let client_id = format!("surge-{id}-{suffix}");
        debug!(
            worker = id,
            "connecting to {host}:{port} as {client_id}",
            host = self.config.host,
            port = self.config.port
        );

        let (client, mut eventloop) =
            AsyncClient::new(self.config.options(client_id), REQUEST_CAPACITY);
        time::timeout(CONNECT_TIMEOUT, await_connack(&mut eventloop))
            .await
            .map_err(|_| ConnectError::Timeout)??;

        let lost = Arc::new(AtomicBool::new(false));
        let driver = tokio::spawn(drive(eventloop, Arc::clone(&lost), id));
        Ok(Connection {
            client,
            lost,
            driver,
            timeout: Duration::from_millis(self.config.publish_timeout_millis),
        })
    }
}

#[derive(Debug)]
/// A single MQTT session.
pub struct Connection {
    client: AsyncClient,
    lost: Arc<AtomicBool>,
    driver: JoinHandle<()>,
    timeout: Duration,
}

#[async_trait]
impl Publish for Connection {
    async fn publish(&mut self, message: Message, qos: Qos) -> Result<(), PublishError> {
        if self.lost.load(Ordering::Acquire) {
            return Err(PublishError::Connection("event loop stopped".to_string()));
        }

        let Message { topic, payload } = message;
        let publish = self
            .client
            .publish_bytes(topic.as_str(), qos.into(), false, payload);
        match time::timeout(self.timeout, publish).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(PublishError::Connection(err.to_string())),
            Err(_) => Err(PublishError::Transient {
                topic,
                reason: format!("timed out after {}ms", self.timeout.as_millis()),
            }),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use super::Config;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = Config::from_env(env(&[]));
        assert_eq!(config, Config::default());
        assert_eq!(config.host, "broker.emqx.io");
        assert_eq!(config.port, 9883);
        assert!(config.tls);
        assert!(config.credentials().is_none());
    }

    #[test]
    fn broker_host_precedence() {
        let config = Config::from_env(env(&[
            ("MQTT_BROKER", "mqtt.local"),
            ("C8Y_DOMAIN", "tenant.cumulocity.com"),
        ]));
        assert_eq!(config.host, "mqtt.local");

        let config = Config::from_env(env(&[
            ("MQTT_BROKER", ""),
            ("C8Y_DOMAIN", "tenant.cumulocity.com"),
        ]));
        assert_eq!(config.host, "tenant.cumulocity.com");
    }

    #[test]
    fn invalid_port_falls_back() {
        let config = Config::from_env(env(&[("MQTT_PORT", "nine")]));
        assert_eq!(config.port, 9883);
        let config = Config::from_env(env(&[("MQTT_PORT", "1883")]));
        assert_eq!(config.port, 1883);
    }

    #[test]
    fn username_from_tenant_and_user() {
        let config = Config::from_env(env(&[
            ("C8Y_TENANT", "t100"),
            ("C8Y_USERNAME", "loader"),
            ("PASSWORD", "secret"),
        ]));
        assert_eq!(config.credentials(), Some(("t100/loader", "secret")));

        let config = Config::from_env(env(&[
            ("USERNAME", "direct"),
            ("C8Y_TENANT", "t100"),
            ("C8Y_USERNAME", "loader"),
        ]));
        assert_eq!(config.username, "direct");
        // No password, so no credentials.
        assert!(config.credentials().is_none());
    }

    #[test]
    fn password_is_not_in_debug_output() {
        let config = Config::from_env(env(&[("USERNAME", "u"), ("PASSWORD", "hunter2")]));
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("password_set: true"));
    }

    #[test]
    fn tls_can_be_disabled() {
        let config = Config::from_env(env(&[("MQTT_TLS", "off")]));
        assert!(!config.tls);
        let config = Config::from_env(env(&[("MQTT_TLS", "maybe")]));
        assert!(config.tls);
    }
}
