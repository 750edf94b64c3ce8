//! Errors surfaced by the token cache and silent acquisition

use std::{error, fmt, time::Duration};

use thiserror::Error;

/// A convenience alias for results in this crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error while acquiring a token or operating on the token cache
#[derive(Debug, Error)]
pub enum Error {
    /// The authority URL is malformed or of an unsupported kind
    #[error("invalid authority: {0}")]
    InvalidAuthority(#[from] InvalidAuthority),
    /// Instance discovery could not vouch for the authority host
    #[error("authority host {host} is not trusted")]
    AuthorityNotTrusted {
        /// The host that failed validation
        host: String,
        /// The failure reported by instance discovery, if any
        #[source]
        source: Option<DiscoveryError>,
    },
    /// No usable credential was found and there is no way to refresh one
    #[error("no usable token in cache: {0}")]
    CacheMiss(CacheMissReason),
    /// The identity provider rejected or failed a token request
    #[error(transparent)]
    Service(#[from] ServiceError),
    /// Persisted cache text could not be parsed
    #[error("malformed cache data")]
    MalformedCacheData(#[source] serde_json::Error),
    /// A cache access hook failed for a reason of its own
    #[error("cache access hook failed")]
    Storage(#[source] Box<dyn error::Error + Send + Sync + 'static>),
}

impl Error {
    /// Converts a failure reported by a cache access hook
    ///
    /// Hooks that surface one of this crate's own errors (such as
    /// [`Error::MalformedCacheData`] from deserializing a file) keep that kind.
    pub fn from_hook(error: Box<dyn error::Error + Send + Sync + 'static>) -> Self {
        match error.downcast::<Error>() {
            Ok(inner) => *inner,
            Err(other) => Self::Storage(other),
        }
    }

    /// Whether this error is a [`CacheMiss`][Error::CacheMiss]
    pub fn is_cache_miss(&self) -> bool {
        matches!(self, Self::CacheMiss(_))
    }
}

/// Why a silent lookup could not be satisfied from the cache
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheMissReason {
    /// No application token matches the requested tenant, client, and scopes
    NoAppToken,
    /// No account entry exists for the requested account
    NoAccount,
    /// A refresh was needed but no refresh token is available
    NoRefreshToken,
}

impl fmt::Display for CacheMissReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::NoAppToken => "no matching application token",
            Self::NoAccount => "account not found",
            Self::NoRefreshToken => "no refresh token available",
        })
    }
}

/// The authority URL could not be used
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidAuthority {
    /// The URL could not be parsed
    #[error("unable to parse authority URL: {0}")]
    Unparseable(#[from] url::ParseError),
    /// The URL does not use `https`
    #[error("authority must use https, found {0}")]
    InsecureScheme(String),
    /// The URL carries a query string
    #[error("authority must not have a query string")]
    HasQuery,
    /// The URL carries a fragment
    #[error("authority must not have a fragment")]
    HasFragment,
    /// The URL has no host component
    #[error("authority must have a host")]
    MissingHost,
    /// The URL has no tenant path segment
    #[error("authority must have a tenant path segment")]
    MissingPath,
    /// The URL looks like a B2C authority but lacks a tenant or policy
    #[error("B2C authority must have the form https://host/tfp/tenant/policy")]
    UnsupportedB2c,
}

/// Instance discovery did not produce usable metadata
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The discovery endpoint could not be reached or returned an error
    #[error("instance discovery request failed")]
    Request(#[source] Box<dyn error::Error + Send + Sync + 'static>),
    /// The discovery endpoint answered without a tenant discovery endpoint
    #[error("instance discovery did not return a tenant discovery endpoint")]
    MissingTenantDiscoveryEndpoint,
    /// The host did not appear in any returned metadata entry
    #[error("host not present in instance discovery metadata")]
    UnknownHost,
    /// Pre-seeded metadata could not be parsed
    #[error("invalid instance discovery metadata")]
    InvalidMetadata(#[source] serde_json::Error),
}

/// A failure reported while requesting a token from the identity provider
#[derive(Debug, Error, Clone, Default, PartialEq, Eq)]
#[error("{}", self.describe())]
pub struct ServiceError {
    /// HTTP status code, if a response was received
    pub status: Option<u16>,
    /// OAuth2 `error` code
    pub error: Option<String>,
    /// OAuth2 `error_description`
    pub error_description: Option<String>,
    /// Correlation ID echoed by the service
    pub correlation_id: Option<String>,
    /// Delay requested by the service through `Retry-After`
    ///
    /// This is reported to the caller and never acted on here.
    pub retry_after: Option<Duration>,
}

impl ServiceError {
    /// A service error with only a status code
    pub fn with_status(status: u16) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// A service error describing a transport failure with no response
    pub fn transport(description: impl Into<String>) -> Self {
        Self {
            error_description: Some(description.into()),
            ..Self::default()
        }
    }

    fn describe(&self) -> String {
        let mut out = String::from("token request failed");
        if let Some(status) = self.status {
            out.push_str(&format!(" with status {}", status));
        }
        if let Some(error) = &self.error {
            out.push_str(&format!(": {}", error));
        }
        if let Some(description) = &self.error_description {
            out.push_str(&format!(" ({})", description));
        }
        if let Some(correlation_id) = &self.correlation_id {
            out.push_str(&format!(" [correlation id {}]", correlation_id));
        }
        out
    }
}
