//! The collaborator that redeems refresh tokens over the network

use async_trait::async_trait;
use credence_clock::UnixTime;

use crate::{
    authority::Authority,
    braids::{AccessToken, ClientId, IdToken, RefreshToken},
    error::ServiceError,
    scope::Scopes,
};

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "http")]
pub use http::HttpTokenRequestExecutor;

/// A request to redeem a refresh token
#[derive(Clone, Debug)]
pub struct RefreshRequest {
    /// Authority to send the request to
    pub authority: Authority,
    /// The client making the request
    pub client_id: ClientId,
    /// The refresh token to redeem
    pub refresh_token: RefreshToken,
    /// The scopes requested, without the reserved OpenID Connect scopes
    pub scopes: Scopes,
}

/// Tokens returned by a successful token request
#[derive(Clone, Debug)]
pub struct TokenResponse {
    /// The new access token
    pub access_token: AccessToken,
    /// A new refresh token, if the service rotated it
    pub refresh_token: Option<RefreshToken>,
    /// A new ID token, if one was issued
    pub id_token: Option<IdToken>,
    /// When the access token expires
    pub expires_on: UnixTime,
    /// Extended expiry for use while the service is degraded
    pub ext_expires_on: Option<UnixTime>,
    /// When a proactive refresh should be attempted
    pub refresh_on: Option<UnixTime>,
    /// Scopes granted, which may be empty if the service did not echo them
    pub scopes: Scopes,
    /// The client family the refresh token belongs to, if any
    pub family_id: Option<String>,
    /// Opaque client info identifying the account
    pub client_info: Option<String>,
}

/// Performs refresh-token grants against the identity provider
///
/// Timeouts and cancellation are the executor's concern; silent acquisition
/// waits for exactly one call per refresh.
#[async_trait]
pub trait TokenRequestExecutor: Send + Sync {
    /// Redeems a refresh token for new tokens
    async fn refresh(&self, request: &RefreshRequest) -> Result<TokenResponse, ServiceError>;
}
