// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Configuration
//!
//! [`BrokerConfig`] is the immutable snapshot of every connection, exchange
//! and behavioral setting. It deserializes with defaults for any missing
//! field, so any `config` source only has to provide what it overrides.
//! [`BrokerConfig::from_env`] reads `BURROW_*` environment variables.
//!
//! Durations are expressed in whole seconds, matching the environment
//! variables.

use crate::{errors::AmqpError, exchange::ExchangeKind, serializer};
use ::config::{Config, Environment};
use lapin::uri::{AMQPScheme, AMQPUri};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};
use uuid::Uuid;

/// Prefix of every environment variable read by [`BrokerConfig::from_env`]
pub const ENV_PREFIX: &str = "BURROW";

/// Upper bound, in bytes, the protocol puts on consumer tags
pub const MAX_CONSUMER_TAG_BYTES: usize = 255;

const DEFAULT_AMQP_PORT: u16 = 5672;
const DEFAULT_AMQPS_PORT: u16 = 5671;
const UUID_LEN: usize = 36;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// `amqp[s]://user:pass@host:port/vhost`; overrides the discrete fields
    pub uri: Option<String>,
    pub mq_host: String,
    pub mq_port: u16,
    pub mq_vhost: String,
    pub mq_username: String,
    pub mq_password: String,
    pub mq_tls: bool,
    /// PEM bundle used to verify the broker certificate
    pub mq_tls_ca_certificates: Option<PathBuf>,
    pub mq_exchange: String,
    pub mq_exchange_type: ExchangeKind,
    pub mq_exchange_arguments: BTreeMap<String, Value>,
    pub mq_api_host: String,
    pub mq_api_port: u16,
    pub mq_api_ssl: bool,
    pub heartbeat: u16,
    pub connection_timeout: u64,
    /// Timeout of management API requests
    pub read_timeout: u64,
    /// Resubscribe consumers whose channel was closed under them
    pub automatically_recover: bool,
    /// Seconds between resubscription attempts
    pub network_recovery_interval: u64,
    pub channel_prefetch: u16,
    /// Enables publisher confirms and leaves tracking them to the caller
    pub publisher_confirms: bool,
    /// Like `publisher_confirms`, but every publish waits for its confirm
    pub force_publisher_confirms: bool,
    pub enable_http_api_use: bool,
    /// Seconds in-flight deliveries get to finish on shutdown
    pub graceful_exit_timeout: u64,
    pub namespace: Option<String>,
    /// Id of the default serializer (`json` or `identity`)
    pub serializer: String,
    pub consumer_tag_prefix: String,
    /// Active consumer group; when set only its members are started
    pub group: Option<String>,
    pub consumer_groups: HashMap<String, Vec<String>>,
    pub mq_wait_exchange: Option<String>,
    pub mq_wait_queue: String,
    /// A list, or one comma separated string as environment variables give
    #[serde(deserialize_with = "string_list")]
    pub mq_wait_expiration_suffices: Vec<String>,
    pub connection_name: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            uri: None,
            mq_host: "127.0.0.1".to_owned(),
            mq_port: DEFAULT_AMQP_PORT,
            mq_vhost: "/".to_owned(),
            mq_username: "guest".to_owned(),
            mq_password: "guest".to_owned(),
            mq_tls: false,
            mq_tls_ca_certificates: None,
            mq_exchange: "burrow".to_owned(),
            mq_exchange_type: ExchangeKind::Topic,
            mq_exchange_arguments: BTreeMap::new(),
            mq_api_host: "127.0.0.1".to_owned(),
            mq_api_port: 15672,
            mq_api_ssl: false,
            heartbeat: 30,
            connection_timeout: 11,
            read_timeout: 11,
            automatically_recover: true,
            network_recovery_interval: 1,
            channel_prefetch: 0,
            publisher_confirms: false,
            force_publisher_confirms: false,
            enable_http_api_use: true,
            graceful_exit_timeout: 11,
            namespace: None,
            serializer: "json".to_owned(),
            consumer_tag_prefix: "burrow".to_owned(),
            group: None,
            consumer_groups: HashMap::new(),
            mq_wait_exchange: None,
            mq_wait_queue: "burrow_wait_queue".to_owned(),
            mq_wait_expiration_suffices: vec![],
            connection_name: "burrow".to_owned(),
        }
    }
}

impl BrokerConfig {
    /// Defaults overlaid with `BURROW_*` environment variables.
    pub fn from_env() -> Result<BrokerConfig, AmqpError> {
        BrokerConfig::from_source(environment())
    }

    /// Defaults overlaid with `source`, then validated.
    pub fn from_source(source: Environment) -> Result<BrokerConfig, AmqpError> {
        let cfg: BrokerConfig = Config::builder()
            .add_source(source)
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|err| AmqpError::ConfigError(err.to_string()))?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Rejects settings that would only fail later against the broker.
    pub fn validate(&self) -> Result<(), AmqpError> {
        let longest_tag = self.consumer_tag_prefix.len() + 1 + UUID_LEN;
        if longest_tag > MAX_CONSUMER_TAG_BYTES {
            return Err(AmqpError::ConsumerTagError(format!(
                "prefix `{}` produces {} byte tags, the limit is {}",
                self.consumer_tag_prefix, longest_tag, MAX_CONSUMER_TAG_BYTES
            )));
        }

        if serializer::by_id(&self.serializer).is_none() {
            return Err(AmqpError::ConfigError(format!(
                "unknown serializer `{}`",
                self.serializer
            )));
        }

        if self.mq_exchange.is_empty() {
            return Err(AmqpError::ConfigError("mq_exchange must not be empty".to_owned()));
        }

        if self.mq_wait_expiration_suffices.iter().any(String::is_empty) {
            return Err(AmqpError::ConfigError(
                "wait expiration suffixes must not be empty".to_owned(),
            ));
        }

        Ok(())
    }

    /// Resolves the connection parameters, giving `uri` precedence over the
    /// discrete host/port/vhost/credential fields.
    pub fn connection_params(&self) -> Result<ConnectionParams, AmqpError> {
        let mut params = ConnectionParams {
            host: self.mq_host.clone(),
            port: self.mq_port,
            vhost: if self.mq_vhost.is_empty() {
                "/".to_owned()
            } else {
                self.mq_vhost.clone()
            },
            username: self.mq_username.clone(),
            password: self.mq_password.clone(),
            tls: self.mq_tls,
            tls_ca_certificates: self.mq_tls_ca_certificates.clone(),
            heartbeat: self.heartbeat,
            connection_timeout: Duration::from_secs(self.connection_timeout),
            connection_name: self.connection_name.clone(),
        };

        if let Some(uri) = self.uri.as_deref().filter(|u| !u.is_empty()) {
            let parsed = AMQPUri::from_str(uri)
                .map_err(|err| AmqpError::ConfigError(format!("invalid uri: {err}")))?;

            params.tls = parsed.scheme == AMQPScheme::AMQPS;
            params.host = parsed.authority.host;
            params.port = match parsed.authority.port {
                0 if params.tls => DEFAULT_AMQPS_PORT,
                0 => DEFAULT_AMQP_PORT,
                port => port,
            };
            params.vhost = parsed.vhost;
            params.username = parsed.authority.userinfo.username;
            params.password = parsed.authority.userinfo.password;
        }

        Ok(params)
    }

    /// Settings for the management HTTP API. Credentials come from the
    /// resolved connection parameters, so a `uri` applies to both.
    pub fn api_params(&self) -> Result<ApiParams, AmqpError> {
        let connection = self.connection_params()?;

        Ok(ApiParams {
            host: self.mq_api_host.clone(),
            port: self.mq_api_port,
            username: connection.username,
            password: connection.password,
            ssl: self.mq_api_ssl,
            timeout: Duration::from_secs(self.read_timeout),
        })
    }

    pub fn graceful_exit_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_exit_timeout)
    }

    pub fn network_recovery_interval(&self) -> Duration {
        Duration::from_secs(self.network_recovery_interval)
    }
}

/// Everything the transport needs to open a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub username: String,
    pub password: String,
    pub tls: bool,
    pub tls_ca_certificates: Option<PathBuf>,
    pub heartbeat: u16,
    pub connection_timeout: Duration,
    pub connection_name: String,
}

impl ConnectionParams {
    /// Connection URI without the password, safe for logging.
    pub fn sanitized_uri(&self) -> String {
        let scheme = if self.tls { "amqps" } else { "amqp" };
        format!(
            "{}://{}@{}:{}/{}",
            scheme,
            self.username,
            self.host,
            self.port,
            self.vhost.trim_start_matches('/')
        )
    }
}

/// Management API endpoint and credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub ssl: bool,
    pub timeout: Duration,
}

impl ApiParams {
    pub fn base_url(&self) -> String {
        let protocol = if self.ssl { "https" } else { "http" };
        format!("{}://{}:{}/", protocol, self.host, self.port)
    }

    pub fn sanitized_uri(&self) -> String {
        let protocol = if self.ssl { "https" } else { "http" };
        format!("{}://{}@{}:{}/", protocol, self.username, self.host, self.port)
    }
}

/// Options for a single `Broker::connect` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Further gated by `BrokerConfig::enable_http_api_use`
    pub enable_http_api_use: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            enable_http_api_use: true,
        }
    }
}

/// Generates a unique `<prefix>-<uuid>` consumer tag, refusing tags the
/// protocol would reject.
pub fn consumer_tag(prefix: &str) -> Result<String, AmqpError> {
    let tag = format!("{}-{}", prefix, Uuid::new_v4());

    if tag.len() > MAX_CONSUMER_TAG_BYTES {
        return Err(AmqpError::ConsumerTagError(format!(
            "`{}...` is {} bytes, the limit is {}",
            prefix.chars().take(32).collect::<String>(),
            tag.len(),
            MAX_CONSUMER_TAG_BYTES
        )));
    }

    Ok(tag)
}

/// The `BURROW_*` environment source. Empty variables count as unset.
pub fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX).ignore_empty(true)
}

fn string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<String>),
        Joined(String),
    }

    let items = match Raw::deserialize(deserializer)? {
        Raw::List(items) => items,
        Raw::Joined(joined) => joined.split(',').map(str::to_owned).collect(),
    };

    Ok(items
        .iter()
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect())
}
