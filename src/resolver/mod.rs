//! Public address lookup
//!
//! The proxy address a controller advertises must be the site's externally
//! visible address. [`JsonIpResolver`] asks an HTTP echo service that answers
//! with `{"ip": "..."}`; [`FixedAddress`] returns a preset answer for operator
//! overrides and tests.

use async_trait::async_trait;
use thiserror::Error;

/// Default echo service
pub const DEFAULT_RESOLVER_URL: &str = "http://jsonip.com";

/// Errors returned by a [`PublicAddressResolver`]
#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("request to {url} failed: {reason}")]
    Request { url: String, reason: String },
    #[error("{url} answered with HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("unexpected response body: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait PublicAddressResolver: Send + Sync {
    /// The host's public address, as text. Validation is left to the caller.
    async fn resolve(&self) -> Result<String, ResolverError>;
}

/// Always answers with the same text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedAddress(pub String);

impl FixedAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }
}

#[async_trait]
impl PublicAddressResolver for FixedAddress {
    async fn resolve(&self) -> Result<String, ResolverError> {
        Ok(self.0.clone())
    }
}

#[cfg(feature = "http-resolver")]
pub use http::JsonIpResolver;

#[cfg(feature = "http-resolver")]
mod http {
    use super::*;

    use std::time::Duration;

    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct EchoResponse {
        ip: String,
    }

    /// Looks the address up with an HTTP GET against a JSON echo service
    #[derive(Debug, Clone)]
    pub struct JsonIpResolver {
        http: reqwest::Client,
        url: String,
    }

    impl JsonIpResolver {
        pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ResolverError> {
            let url = url.into();
            let http = reqwest::Client::builder()
                .timeout(timeout)
                .user_agent(concat!("bacnet-proxy-ip/", env!("CARGO_PKG_VERSION")))
                .build()
                .map_err(|e| ResolverError::Request {
                    url: url.clone(),
                    reason: format!("failed to build HTTP client: {e}"),
                })?;
            Ok(Self { http, url })
        }

        pub fn url(&self) -> &str {
            &self.url
        }
    }

    #[async_trait]
    impl PublicAddressResolver for JsonIpResolver {
        async fn resolve(&self) -> Result<String, ResolverError> {
            let request_failed = |e: reqwest::Error| ResolverError::Request {
                url: self.url.clone(),
                reason: e.to_string(),
            };

            log::debug!("resolving public address via {}", self.url);
            let response = self.http.get(&self.url).send().await.map_err(request_failed)?;
            let status = response.status();
            if !status.is_success() {
                return Err(ResolverError::Status {
                    url: self.url.clone(),
                    status: status.as_u16(),
                });
            }

            let body = response.text().await.map_err(request_failed)?;
            let echo: EchoResponse = serde_json::from_str(&body)
                .map_err(|e| ResolverError::InvalidResponse(format!("{e}: {body}")))?;
            log::debug!("public address is {}", echo.ip);
            Ok(echo.ip)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use serde_json::json;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        async fn setup(response: ResponseTemplate) -> (MockServer, JsonIpResolver) {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/"))
                .respond_with(response)
                .mount(&server)
                .await;
            let resolver = JsonIpResolver::new(server.uri(), Duration::from_secs(2)).unwrap();
            (server, resolver)
        }

        #[tokio::test]
        async fn test_resolves_echoed_address() {
            let body = json!({ "ip": "203.0.113.5", "geo-ip": "https://getjsonip.com/#plus" });
            let (_server, resolver) = setup(ResponseTemplate::new(200).set_body_json(&body)).await;
            assert_eq!(resolver.resolve().await.unwrap(), "203.0.113.5");
        }

        #[tokio::test]
        async fn test_http_error_status() {
            let (_server, resolver) = setup(ResponseTemplate::new(503)).await;
            let error = resolver.resolve().await.unwrap_err();
            assert!(matches!(error, ResolverError::Status { status: 503, .. }));
        }

        #[tokio::test]
        async fn test_body_without_ip() {
            let (_server, resolver) =
                setup(ResponseTemplate::new(200).set_body_json(json!({ "address": "x" }))).await;
            assert!(matches!(
                resolver.resolve().await.unwrap_err(),
                ResolverError::InvalidResponse(_)
            ));
        }

        #[tokio::test]
        async fn test_unreachable_service() {
            let resolver =
                JsonIpResolver::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
            assert!(matches!(
                resolver.resolve().await.unwrap_err(),
                ResolverError::Request { .. }
            ));
        }
    }
}
