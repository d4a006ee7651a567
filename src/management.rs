// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Management API
//!
//! Binding reconciliation needs to know which bindings already exist, which
//! AMQP itself cannot tell. This module queries the HTTP management plugin
//! for them.

use crate::{config::ApiParams, errors::AmqpError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, error, info};

/// One binding as reported by `GET /api/bindings/<vhost>`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BindingInfo {
    pub source: String,
    pub destination: String,
    pub routing_key: String,
    pub vhost: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ManagementApi: Send + Sync {
    /// Lists the exchanges of the vhost; used to verify reachability and
    /// credentials at connect time.
    async fn exchanges(&self) -> Result<Vec<String>, AmqpError>;

    async fn bindings(&self) -> Result<Vec<BindingInfo>, AmqpError>;
}

#[derive(Deserialize)]
struct ExchangeInfo {
    name: String,
}

/// reqwest-backed management client.
pub struct ManagementClient {
    params: ApiParams,
    vhost: String,
    client: Client,
}

impl ManagementClient {
    pub fn new(params: ApiParams, vhost: &str) -> Result<ManagementClient, AmqpError> {
        let client = Client::builder()
            .timeout(params.timeout)
            .build()
            .map_err(|err| AmqpError::ConfigError(err.to_string()))?;

        info!(uri = params.sanitized_uri(), "connecting to rabbitmq HTTP API");

        Ok(ManagementClient {
            params,
            vhost: vhost.to_owned(),
            client,
        })
    }

    fn url(&self, resource: &str) -> Result<Url, AmqpError> {
        let mut url = Url::parse(&self.params.base_url())
            .map_err(|err| AmqpError::ConfigError(err.to_string()))?;

        url.path_segments_mut()
            .map_err(|_| AmqpError::ConfigError("management API url cannot be a base".into()))?
            .pop_if_empty()
            .push("api")
            .push(resource)
            .push(&self.vhost);

        Ok(url)
    }

    async fn get<T>(&self, resource: &str) -> Result<T, AmqpError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let url = self.url(resource)?;
        debug!(url = url.as_str(), "querying management API");

        let response = self
            .client
            .get(url)
            .basic_auth(&self.params.username, Some(&self.params.password))
            .send()
            .await
            .map_err(|err| {
                error!(error = err.to_string().to_lowercase(), "HTTP API connection error");
                if err.is_connect() || err.is_timeout() {
                    AmqpError::ConnectionError(format!(
                        "couldn't connect to HTTP API at {}",
                        self.params.sanitized_uri()
                    ))
                } else {
                    AmqpError::ManagementApiError(err.to_string())
                }
            })?;

        match response.status() {
            status if status.is_success() => response
                .json::<T>()
                .await
                .map_err(|err| AmqpError::ManagementApiError(err.to_string())),
            StatusCode::UNAUTHORIZED => {
                error!("HTTP API rejected the configured credentials");
                Err(AmqpError::AuthenticationError(
                    "invalid HTTP API credentials".to_owned(),
                ))
            }
            status => Err(AmqpError::ManagementApiError(format!(
                "GET {resource} answered {status}"
            ))),
        }
    }
}

#[async_trait]
impl ManagementApi for ManagementClient {
    async fn exchanges(&self) -> Result<Vec<String>, AmqpError> {
        let exchanges: Vec<ExchangeInfo> = self.get("exchanges").await?;
        Ok(exchanges.into_iter().map(|exchange| exchange.name).collect())
    }

    async fn bindings(&self) -> Result<Vec<BindingInfo>, AmqpError> {
        self.get("bindings").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn params() -> ApiParams {
        ApiParams {
            host: "127.0.0.1".into(),
            port: 15672,
            username: "guest".into(),
            password: "guest".into(),
            ssl: false,
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn vhost_is_a_single_encoded_segment() {
        let client = ManagementClient::new(params(), "/").unwrap();
        assert_eq!(
            client.url("bindings").unwrap().as_str(),
            "http://127.0.0.1:15672/api/bindings/%2F"
        );

        let client = ManagementClient::new(params(), "billing").unwrap();
        assert_eq!(
            client.url("exchanges").unwrap().as_str(),
            "http://127.0.0.1:15672/api/exchanges/billing"
        );
    }

    #[test]
    fn binding_info_deserializes_from_api_payload() {
        let payload = r#"[{"source":"burrow","vhost":"/","destination":"orders",
            "destination_type":"queue","routing_key":"order.created","arguments":{},
            "properties_key":"order.created"}]"#;

        let bindings: Vec<BindingInfo> = serde_json::from_str(payload).unwrap();

        assert_eq!(
            bindings,
            vec![BindingInfo {
                source: "burrow".into(),
                destination: "orders".into(),
                routing_key: "order.created".into(),
                vhost: "/".into(),
            }]
        );
    }
}
