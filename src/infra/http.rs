//! Coinage REST API client.
//!
//! A single [`HttpCoinageClient`] serves balances, deposit statuses and
//! notification writes. Credential rejections (401/403) surface as
//! [`FetchError::AuthExpired`] so callers can tell them apart from outages.
//! Ids are percent-encoded as single path segments.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error};

use crate::domain::{
    AppError, BalanceSnapshot, BalanceSource, ConfigError, FetchError, Network, Notification,
    NotificationEmitError, NotificationSink, StatusReport, TransactionStatusSource,
};

/// Configuration for the HTTP client
#[derive(Debug)]
pub struct HttpClientConfig {
    pub base_url: String,
    /// Bearer token sent with every request, if set
    pub api_token: Option<SecretString>,
    pub timeout: Duration,
}

impl HttpClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_token: None,
            timeout: Duration::from_secs(30),
        }
    }

    #[must_use]
    pub fn with_token(mut self, token: SecretString) -> Self {
        self.api_token = Some(token);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Deserialize)]
struct BalancesResponse {
    user_id: String,
    #[serde(default)]
    network: Option<Network>,
    #[serde(deserialize_with = "ordered_balances::deserialize")]
    balances: Vec<(String, Decimal)>,
}

/// Keeps balances in document order instead of hashing them
mod ordered_balances {
    use std::fmt;

    use rust_decimal::Decimal;
    use serde::Deserializer;
    use serde::de::{MapAccess, Visitor};

    struct BalancesVisitor;

    impl<'de> Visitor<'de> for BalancesVisitor {
        type Value = Vec<(String, Decimal)>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a map of token symbol to decimal balance")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut balances = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some((token, amount)) = map.next_entry::<String, Decimal>()? {
                balances.push((token, amount));
            }
            Ok(balances)
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<(String, Decimal)>, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(BalancesVisitor)
    }
}

/// Client for the Coinage backend
pub struct HttpCoinageClient {
    http_client: Client,
    base_url: Url,
    api_token: Option<SecretString>,
    timeout: Duration,
}

impl HttpCoinageClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, AppError> {
        let invalid = |message: String| {
            AppError::Config(ConfigError::Invalid {
                var: "base_url".to_string(),
                message,
            })
        };
        let base_url = Url::parse(&config.base_url).map_err(|e| invalid(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(invalid(format!("{base_url} cannot carry a path")));
        }

        let http_client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url,
            api_token: config.api_token,
            timeout: config.timeout,
        })
    }

    /// `base_url` extended with `segments`, each encoded as one path segment
    fn endpoint(&self, segments: &[&str]) -> Result<Url, FetchError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| FetchError::Transport(format!("{} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }

    fn map_send_error(&self, e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout(self.timeout.as_secs())
        } else {
            FetchError::Transport(e.to_string())
        }
    }

    /// Turn a non-2xx answer into the matching fetch error
    async fn check_status(response: Response) -> Result<Response, FetchError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                debug!(status = %status, "Coinage API rejected credentials");
                Err(FetchError::AuthExpired(format!("HTTP {}", status.as_u16())))
            }
            _ => {
                error!(status = %status, body = %body, "Coinage API returned error");
                Err(FetchError::Transport(format!(
                    "HTTP {}: {}",
                    status.as_u16(),
                    body
                )))
            }
        }
    }

    async fn get_json<T>(&self, url: Url, query: &[(&str, &str)]) -> Result<T, FetchError>
    where
        T: DeserializeOwned,
    {
        debug!(url = %url, "Calling Coinage API");

        let response = self
            .authorized(self.http_client.get(url.clone()).query(query))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let response = Self::check_status(response).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.map_send_error(e))?;

        serde_json::from_slice(&bytes).map_err(|e| {
            error!(url = %url, error = %e, "Failed to parse Coinage API response");
            FetchError::InvalidResponse(e.to_string())
        })
    }
}

#[async_trait]
impl BalanceSource for HttpCoinageClient {
    async fn fetch_balances(
        &self,
        user_id: &str,
        network: Network,
    ) -> Result<BalanceSnapshot, AppError> {
        let url = self.endpoint(&["api", "users", user_id, "balances"])?;
        let body: BalancesResponse = self
            .get_json(url, &[("network", network.as_str())])
            .await?;

        debug!(
            user_id = %body.user_id,
            tokens = body.balances.len(),
            "Balances fetched"
        );

        Ok(BalanceSnapshot::new(
            body.user_id,
            body.network.unwrap_or(network),
            body.balances,
        ))
    }
}

#[async_trait]
impl TransactionStatusSource for HttpCoinageClient {
    async fn fetch_transaction_status(
        &self,
        transaction_id: &str,
    ) -> Result<StatusReport, AppError> {
        let url = self.endpoint(&["api", "deposits", transaction_id, "status"])?;
        let report: StatusReport = self.get_json(url, &[]).await?;
        Ok(report)
    }
}

#[async_trait]
impl NotificationSink for HttpCoinageClient {
    async fn emit_notification(
        &self,
        notification: &Notification,
    ) -> Result<(), NotificationEmitError> {
        let url = self
            .endpoint(&["api", "notifications"])
            .map_err(|e| NotificationEmitError::Transport(e.to_string()))?;

        let response = self
            .authorized(self.http_client.post(url).json(notification))
            .send()
            .await
            .map_err(|e| NotificationEmitError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(NotificationEmitError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_balances_response_keeps_document_order() {
        let body = r#"{
            "user_id": "user-1",
            "network": "mainnet",
            "balances": { "cBRL": "75.0", "AZE": 100, "PCN": "10.000000" }
        }"#;

        let parsed: BalancesResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.user_id, "user-1");
        assert_eq!(parsed.network, Some(Network::Mainnet));
        assert_eq!(
            parsed.balances,
            vec![
                ("cBRL".to_string(), dec!(75.0)),
                ("AZE".to_string(), dec!(100)),
                ("PCN".to_string(), dec!(10.000000)),
            ]
        );
    }

    #[test]
    fn test_balances_response_rejects_non_numeric_amount() {
        let body = r#"{ "user_id": "u", "balances": { "AZE": "lots" } }"#;
        assert!(serde_json::from_str::<BalancesResponse>(body).is_err());
    }

    #[test]
    fn test_endpoint_ignores_trailing_slash_and_encodes_ids() {
        let config = HttpClientConfig::new("http://localhost:8080/")
            .with_timeout(Duration::from_secs(5));
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert!(config.api_token.is_none());

        let client = HttpCoinageClient::new(config).unwrap();
        let url = client.endpoint(&["api", "deposits", "a/b?c#d", "status"]).unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:8080/api/deposits/a%2Fb%3Fc%23d/status"
        );
    }

    #[test]
    fn test_endpoint_keeps_base_path_prefix() {
        let client = HttpCoinageClient::new(HttpClientConfig::new("https://host/coinage/")).unwrap();
        let url = client.endpoint(&["api", "notifications"]).unwrap();
        assert_eq!(url.as_str(), "https://host/coinage/api/notifications");
    }

    #[test]
    fn test_invalid_base_url_is_a_config_error() {
        for base_url in ["not a url", "mailto:ops@coinage.test"] {
            let err = HttpCoinageClient::new(HttpClientConfig::new(base_url))
                .err()
                .unwrap();
            assert!(
                matches!(err, AppError::Config(ConfigError::Invalid { ref var, .. }) if var == "base_url"),
                "{base_url} gave {err:?}"
            );
        }
    }
}
