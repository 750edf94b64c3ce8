//! An instance discovery source that queries the discovery endpoint over HTTPS

use std::error;

use async_trait::async_trait;
use url::Url;

use super::{DiscoveryRequest, DiscoverySource, InstanceDiscoveryResponse};

const DISCOVERY_PATH: &str = "common/discovery/instance";
const API_VERSION: &str = "1.1";

/// Queries `https://{host}/common/discovery/instance`
#[derive(Debug, Clone)]
pub struct HttpDiscoverySource {
    client: reqwest::Client,
    base_url: Option<Url>,
}

impl HttpDiscoverySource {
    /// Constructs a new discovery source using the provided client
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: None,
        }
    }

    /// Sends every discovery request to `base_url` instead of the discovery host
    ///
    /// Useful for sovereign deployments behind a proxy and for testing.
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = Some(base_url);
        self
    }

    fn discovery_url(&self, request: &DiscoveryRequest) -> Result<Url, url::ParseError> {
        let base = match &self.base_url {
            Some(base) => base.clone(),
            None => Url::parse(&format!("https://{}/", request.discovery_host))?,
        };
        let mut url = base.join(DISCOVERY_PATH)?;
        url.query_pairs_mut()
            .append_pair("api-version", API_VERSION)
            .append_pair("authorization_endpoint", request.authorize_endpoint.as_str());
        Ok(url)
    }
}

#[async_trait]
impl DiscoverySource for HttpDiscoverySource {
    #[tracing::instrument(
        err,
        skip(self, request),
        fields(
            discovery.host = %request.discovery_host,
            authorize_endpoint = %request.authorize_endpoint,
        ),
    )]
    async fn discover(
        &self,
        request: &DiscoveryRequest,
    ) -> Result<InstanceDiscoveryResponse, Box<dyn error::Error + Send + Sync + 'static>> {
        let url = self.discovery_url(request)?;

        let resp = self.client.get(url).send().await?;

        tracing::debug!(
            response.status = resp.status().as_u16(),
            "received instance discovery response"
        );

        let resp = resp.error_for_status()?;
        let body = resp.bytes().await?;
        let parsed: InstanceDiscoveryResponse = serde_json::from_slice(&body)?;

        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;
    use wiremock::{
        matchers::{method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    #[tokio::test]
    async fn fetches_and_parses_metadata() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/common/discovery/instance"))
            .and(query_param("api-version", "1.1"))
            .and(query_param(
                "authorization_endpoint",
                "https://login.microsoftonline.com/common/oauth2/v2.0/authorize",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "tenant_discovery_endpoint": "https://login.microsoftonline.com/common/v2.0/.well-known/openid-configuration",
                "api-version": "1.1",
                "metadata": [{
                    "preferred_network": "login.microsoftonline.com",
                    "preferred_cache": "login.windows.net",
                    "aliases": ["login.microsoftonline.com", "login.windows.net"]
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let source = HttpDiscoverySource::new(reqwest::Client::new())
            .with_base_url(Url::parse(&server.uri())?);
        let request = DiscoveryRequest {
            discovery_host: "login.microsoftonline.com".into(),
            authorize_endpoint: Url::parse(
                "https://login.microsoftonline.com/common/oauth2/v2.0/authorize",
            )?,
        };

        let response = source.discover(&request).await.map_err(|e| color_eyre::eyre::eyre!(e))?;
        assert!(response.tenant_discovery_endpoint.is_some());
        assert_eq!(response.metadata.len(), 1);
        assert_eq!(response.metadata[0].preferred_cache, "login.windows.net");
        Ok(())
    }

    #[tokio::test]
    async fn error_status_is_an_error() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_instance"
            })))
            .mount(&server)
            .await;

        let source = HttpDiscoverySource::new(reqwest::Client::new())
            .with_base_url(Url::parse(&server.uri())?);
        let request = DiscoveryRequest {
            discovery_host: "login.microsoftonline.com".into(),
            authorize_endpoint: Url::parse("https://login.example.org/common/oauth2/v2.0/authorize")?,
        };

        assert!(source.discover(&request).await.is_err());
        Ok(())
    }
}
