//! A token request executor that uses the authority's token endpoint

use async_trait::async_trait;
use credence_clock::{Clock, DurationSecs, System};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use url::Url;

use super::{RefreshRequest, TokenRequestExecutor, TokenResponse};
use crate::{
    braids::{AccessToken, IdToken, RefreshToken},
    error::ServiceError,
    scope::Scopes,
};

const CORRELATION_HEADER: &str = "client-request-id";

/// Tokens living longer than this get a proactive refresh at half their
/// lifetime when the service does not say when to refresh
const PROACTIVE_REFRESH_THRESHOLD: DurationSecs = DurationSecs(2 * 60 * 60);

/// Redeems refresh tokens by posting form data to the token endpoint
#[derive(Debug, Clone)]
pub struct HttpTokenRequestExecutor<C = System> {
    client: reqwest::Client,
    token_endpoint: Option<Url>,
    clock: C,
}

impl HttpTokenRequestExecutor<System> {
    /// Constructs a new executor using the provided client
    ///
    /// Timeouts configured on `client` bound each refresh.
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            token_endpoint: None,
            clock: System,
        }
    }
}

impl<C> HttpTokenRequestExecutor<C> {
    /// Posts to `token_endpoint` instead of the authority's token endpoint
    pub fn with_token_endpoint(mut self, token_endpoint: Url) -> Self {
        self.token_endpoint = Some(token_endpoint);
        self
    }

    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> HttpTokenRequestExecutor<D> {
        HttpTokenRequestExecutor {
            client: self.client,
            token_endpoint: self.token_endpoint,
            clock,
        }
    }
}

#[derive(Serialize)]
struct RefreshTokenForm<'a> {
    grant_type: &'static str,
    client_id: &'a str,
    refresh_token: &'a str,
    scope: String,
    client_info: &'static str,
}

#[derive(Deserialize)]
struct TokenResponseDto {
    access_token: AccessToken,
    #[serde(default)]
    refresh_token: Option<RefreshToken>,
    #[serde(default)]
    id_token: Option<IdToken>,
    #[serde(deserialize_with = "seconds")]
    expires_in: u64,
    #[serde(default, deserialize_with = "optional_seconds")]
    ext_expires_in: Option<u64>,
    #[serde(default, deserialize_with = "optional_seconds")]
    refresh_in: Option<u64>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    foci: Option<String>,
    #[serde(default)]
    client_info: Option<String>,
}

#[derive(Default, Deserialize)]
struct ErrorDto {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    correlation_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Seconds {
    Number(u64),
    Text(String),
}

impl Seconds {
    fn get<E: serde::de::Error>(self) -> Result<u64, E> {
        match self {
            Self::Number(n) => Ok(n),
            Self::Text(s) => s.trim().parse().map_err(E::custom),
        }
    }
}

fn seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    Seconds::deserialize(deserializer)?.get()
}

fn optional_seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    Option::<Seconds>::deserialize(deserializer)?
        .map(Seconds::get)
        .transpose()
}

fn error_from_response(status: u16, headers: &HeaderMap, body: &[u8]) -> ServiceError {
    let dto: ErrorDto = serde_json::from_slice(body).unwrap_or_default();
    let header_correlation = headers
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let retry_after = headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);

    let error_description = dto.error_description.or_else(|| {
        if dto.error.is_none() && !body.is_empty() {
            Some(String::from_utf8_lossy(body).into_owned())
        } else {
            None
        }
    });

    ServiceError {
        status: Some(status),
        error: dto.error,
        error_description,
        correlation_id: header_correlation.or(dto.correlation_id),
        retry_after,
    }
}

#[async_trait]
impl<C: Clock + Send + Sync> TokenRequestExecutor for HttpTokenRequestExecutor<C> {
    #[tracing::instrument(
        err,
        skip(self, request),
        fields(
            token_url = tracing::field::Empty,
            client_id = %request.client_id,
            scopes = %request.scopes,
        ),
    )]
    async fn refresh(&self, request: &RefreshRequest) -> Result<TokenResponse, ServiceError> {
        let token_url = self
            .token_endpoint
            .clone()
            .unwrap_or_else(|| request.authority.token_endpoint().clone());
        tracing::Span::current().record("token_url", &tracing::field::display(&token_url));

        let form = RefreshTokenForm {
            grant_type: "refresh_token",
            client_id: request.client_id.as_str(),
            refresh_token: request.refresh_token.as_str(),
            scope: request.scopes.with_reserved().to_string(),
            client_info: "1",
        };

        tracing::trace!("requesting token from authority");

        let resp = self
            .client
            .post(token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| ServiceError::transport(e.to_string()))?;

        let status = resp.status();
        tracing::debug!(
            response.status = status.as_u16(),
            "received token response from issuing authority"
        );

        let headers = resp.headers().clone();
        let body = resp
            .bytes()
            .await
            .map_err(|e| ServiceError::transport(e.to_string()))?;

        if !status.is_success() {
            return Err(error_from_response(status.as_u16(), &headers, &body));
        }

        let dto: TokenResponseDto = serde_json::from_slice(&body).map_err(|e| ServiceError {
            status: Some(status.as_u16()),
            error_description: Some(format!("unable to parse token response: {}", e)),
            ..ServiceError::default()
        })?;

        let now = self.clock.now();
        let lifetime = DurationSecs(dto.expires_in);
        let refresh_in = dto.refresh_in.map(DurationSecs).or_else(|| {
            if lifetime > PROACTIVE_REFRESH_THRESHOLD {
                Some(DurationSecs(lifetime.0 / 2))
            } else {
                None
            }
        });

        tracing::info!(
            has_id_token = dto.id_token.is_some(),
            has_refresh_token = dto.refresh_token.is_some(),
            lifetime = lifetime.0,
            refresh_in = refresh_in.map(|r| r.0),
            family = dto.foci.as_deref(),
            "received new tokens"
        );

        Ok(TokenResponse {
            access_token: dto.access_token,
            refresh_token: dto.refresh_token,
            id_token: dto.id_token,
            expires_on: now + lifetime,
            ext_expires_on: dto.ext_expires_in.map(|e| now + DurationSecs(e)),
            refresh_on: refresh_in.map(|r| now + r),
            scopes: dto
                .scope
                .map(|s| Scopes::from_space_delimited(&s))
                .unwrap_or_default(),
            family_id: dto.foci.filter(|f| !f.is_empty()),
            client_info: dto.client_info,
        })
    }
}
