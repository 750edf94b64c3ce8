//! Instance discovery and the environment alias cache
//!
//! A cloud instance can be reached through several equivalent host names. Tokens
//! cached under one of them must be found when looking up through another, so
//! every lookup first expands the account's environment into its full alias set
//! using the metadata held here.
//!
//! Metadata is fetched lazily from a [`DiscoverySource`] the first time a host
//! is seen. Concurrent first lookups for the same host are not deduplicated; all
//! responses describe the same aliases, so the last write wins harmlessly.

use std::{collections::HashMap, error, sync::Arc};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    authority::{Authority, AuthorityKind},
    error::{DiscoveryError, Error},
};

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "http")]
pub use http::HttpDiscoverySource;

/// Hosts whose discovery endpoint can be queried directly
pub const TRUSTED_HOSTS: [&str; 6] = [
    "login.windows.net",
    "login.chinacloudapi.cn",
    "login-us.microsoftonline.com",
    "login.microsoftonline.de",
    "login.microsoftonline.com",
    "login.microsoftonline.us",
];

/// Host queried on behalf of hosts outside of [`TRUSTED_HOSTS`]
pub const DEFAULT_TRUSTED_HOST: &str = "login.microsoftonline.com";

/// Whether `host` is in the static trusted allowlist
pub fn is_trusted_host(host: &str) -> bool {
    TRUSTED_HOSTS.iter().any(|h| h.eq_ignore_ascii_case(host))
}

/// Discovery metadata describing one cloud instance
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryMetadata {
    /// Host to use for network requests
    pub preferred_network: String,
    /// Host to record as the environment of cached credentials
    pub preferred_cache: String,
    /// Every host name equivalent to this instance
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl DiscoveryMetadata {
    /// Metadata for a host that is only equivalent to itself
    pub fn for_self(host: &str) -> Self {
        let host = host.to_ascii_lowercase();
        Self {
            preferred_network: host.clone(),
            preferred_cache: host.clone(),
            aliases: vec![host],
        }
    }

    /// Whether `host` is one of this instance's aliases
    pub fn has_alias(&self, host: &str) -> bool {
        self.aliases.iter().any(|a| a.eq_ignore_ascii_case(host))
    }
}

/// The body returned by the instance discovery endpoint
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDiscoveryResponse {
    /// The OpenID configuration endpoint for the requested authority
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_discovery_endpoint: Option<String>,
    /// Known cloud instances
    #[serde(default)]
    pub metadata: Vec<DiscoveryMetadata>,
}

/// The parameters of an instance discovery call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveryRequest {
    /// Host whose discovery endpoint is queried
    pub discovery_host: String,
    /// Authorization endpoint of the authority being validated
    pub authorize_endpoint: Url,
}

/// A source of instance discovery metadata, usually the network
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    /// Queries the discovery endpoint
    async fn discover(
        &self,
        request: &DiscoveryRequest,
    ) -> Result<InstanceDiscoveryResponse, Box<dyn error::Error + Send + Sync + 'static>>;
}

/// A per-application cache of instance discovery metadata
///
/// Safe to share between tasks; readers never block and writers copy the map.
pub struct DiscoveryCache {
    entries: ArcSwap<HashMap<String, Arc<DiscoveryMetadata>>>,
    source: Option<Arc<dyn DiscoverySource>>,
    seeded: bool,
}

impl DiscoveryCache {
    /// Constructs a cache that queries `source` for unknown hosts
    pub fn new(source: impl DiscoverySource + 'static) -> Self {
        Self {
            entries: ArcSwap::from_pointee(HashMap::new()),
            source: Some(Arc::new(source)),
            seeded: false,
        }
    }

    /// Constructs a cache that never queries the network
    ///
    /// Every unknown host is treated as its own sole alias.
    pub fn offline() -> Self {
        Self {
            entries: ArcSwap::from_pointee(HashMap::new()),
            source: None,
            seeded: false,
        }
    }

    /// Constructs a cache pre-seeded with metadata obtained out of band
    ///
    /// A pre-seeded cache never queries the network, and hosts absent from
    /// the seed are treated as their own sole alias.
    pub fn with_metadata(metadata: impl IntoIterator<Item = DiscoveryMetadata>) -> Self {
        let cache = Self {
            entries: ArcSwap::from_pointee(HashMap::new()),
            source: None,
            seeded: true,
        };
        for entry in metadata {
            cache.register(Arc::new(entry));
        }
        cache
    }

    /// Constructs a pre-seeded cache from an instance discovery response body
    pub fn with_metadata_json(json: &str) -> Result<Self, DiscoveryError> {
        let response: InstanceDiscoveryResponse =
            serde_json::from_str(json).map_err(DiscoveryError::InvalidMetadata)?;
        Ok(Self::with_metadata(response.metadata))
    }

    /// Looks up already cached metadata for `host` without touching the network
    pub fn cached(&self, host: &str) -> Option<Arc<DiscoveryMetadata>> {
        self.entries
            .load()
            .get(&host.to_ascii_lowercase())
            .cloned()
    }

    /// The alias set for `environment`, or just `environment` if unknown
    pub fn aliases_for(&self, environment: &str) -> Vec<String> {
        self.cached(environment)
            .map(|m| m.aliases.clone())
            .unwrap_or_else(|| vec![environment.to_ascii_lowercase()])
    }

    /// Resolves the discovery metadata for an authority's host
    ///
    /// When `validate` is set, a host that discovery cannot vouch for is
    /// rejected with [`Error::AuthorityNotTrusted`]. Otherwise, such a host is
    /// treated as its own sole alias.
    #[tracing::instrument(skip(self, authority), fields(authority.host = authority.host()))]
    pub async fn resolve(
        &self,
        authority: &Authority,
        validate: bool,
    ) -> Result<Arc<DiscoveryMetadata>, Error> {
        let host = authority.host();

        if let Some(found) = self.cached(host) {
            return Ok(found);
        }

        let source = match &self.source {
            Some(source) if authority.kind() == AuthorityKind::Aad && !self.seeded => source,
            _ => {
                tracing::trace!("instance discovery not applicable, using host as its own alias");
                return Ok(self.register_self(host));
            }
        };

        let discovery_host = if is_trusted_host(host) {
            host.to_owned()
        } else {
            DEFAULT_TRUSTED_HOST.to_owned()
        };

        let request = DiscoveryRequest {
            discovery_host,
            authorize_endpoint: authority.authorize_endpoint().clone(),
        };

        tracing::debug!(discovery.host = %request.discovery_host, "requesting instance discovery metadata");

        let failure = match source.discover(&request).await {
            Ok(response) => match self.absorb(host, response, validate) {
                Ok(found) => return Ok(found),
                Err(failure) => failure,
            },
            Err(error) => DiscoveryError::Request(error),
        };

        if validate {
            tracing::warn!(error = (&failure as &dyn error::Error), "authority failed instance discovery validation");
            Err(Error::AuthorityNotTrusted {
                host: host.to_owned(),
                source: Some(failure),
            })
        } else {
            tracing::debug!(error = (&failure as &dyn error::Error), "instance discovery failed, authority validation disabled");
            Ok(self.register_self(host))
        }
    }

    fn absorb(
        &self,
        host: &str,
        response: InstanceDiscoveryResponse,
        validate: bool,
    ) -> Result<Arc<DiscoveryMetadata>, DiscoveryError> {
        if validate && response.tenant_discovery_endpoint.is_none() {
            return Err(DiscoveryError::MissingTenantDiscoveryEndpoint);
        }

        let mut found = None;
        for entry in response.metadata {
            let entry = Arc::new(entry);
            if entry.has_alias(host) {
                found = Some(entry.clone());
            }
            self.register(entry);
        }

        match found {
            Some(entry) => {
                tracing::info!(
                    preferred_network = %entry.preferred_network,
                    preferred_cache = %entry.preferred_cache,
                    aliases = entry.aliases.len(),
                    "instance discovery metadata cached"
                );
                Ok(entry)
            }
            None => Err(DiscoveryError::UnknownHost),
        }
    }

    fn register_self(&self, host: &str) -> Arc<DiscoveryMetadata> {
        let entry = Arc::new(DiscoveryMetadata::for_self(host));
        self.register(entry.clone());
        entry
    }

    fn register(&self, entry: Arc<DiscoveryMetadata>) {
        self.entries.rcu(|current| {
            let mut next = HashMap::clone(current);
            for alias in &entry.aliases {
                next.insert(alias.to_ascii_lowercase(), entry.clone());
            }
            next
        });
    }
}

impl std::fmt::Debug for DiscoveryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("DiscoveryCache")
            .field("hosts", &self.entries.load().len())
            .field("has_source", &self.source.is_some())
            .field("seeded", &self.seeded)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use color_eyre::Result;

    use super::*;

    #[derive(Default)]
    struct StubSource {
        response: Option<InstanceDiscoveryResponse>,
        calls: Arc<AtomicUsize>,
        seen_hosts: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DiscoverySource for StubSource {
        async fn discover(
            &self,
            request: &DiscoveryRequest,
        ) -> Result<InstanceDiscoveryResponse, Box<dyn error::Error + Send + Sync + 'static>>
        {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_hosts
                .lock()
                .unwrap()
                .push(request.discovery_host.clone());
            self.response
                .clone()
                .ok_or_else(|| "discovery unavailable".into())
        }
    }

    fn public_cloud() -> InstanceDiscoveryResponse {
        InstanceDiscoveryResponse {
            tenant_discovery_endpoint: Some(
                "https://login.microsoftonline.com/common/v2.0/.well-known/openid-configuration"
                    .into(),
            ),
            metadata: vec![
                DiscoveryMetadata {
                    preferred_network: "login.microsoftonline.com".into(),
                    preferred_cache: "login.windows.net".into(),
                    aliases: vec![
                        "login.microsoftonline.com".into(),
                        "login.windows.net".into(),
                        "login.microsoft.com".into(),
                        "sts.windows.net".into(),
                    ],
                },
                DiscoveryMetadata {
                    preferred_network: "login.partner.microsoftonline.cn".into(),
                    preferred_cache: "login.partner.microsoftonline.cn".into(),
                    aliases: vec![
                        "login.partner.microsoftonline.cn".into(),
                        "login.chinacloudapi.cn".into(),
                    ],
                },
            ],
        }
    }

    #[tokio::test]
    async fn registers_every_alias_of_every_entry() -> Result<()> {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = DiscoveryCache::new(StubSource {
            response: Some(public_cloud()),
            calls: calls.clone(),
            ..StubSource::default()
        });

        let authority = Authority::parse("https://login.microsoftonline.com/common")?;
        let entry = cache.resolve(&authority, true).await?;
        assert_eq!(entry.preferred_cache, "login.windows.net");

        assert!(cache.cached("sts.windows.net").is_some());
        assert!(cache.cached("login.chinacloudapi.cn").is_some());

        let alias = Authority::parse("https://login.windows.net/common")?;
        let again = cache.resolve(&alias, true).await?;
        assert_eq!(again, entry);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn untrusted_hosts_are_queried_through_the_default_host() -> Result<()> {
        let source = StubSource {
            response: Some(public_cloud()),
            ..StubSource::default()
        };
        let cache = DiscoveryCache::new(source);
        let authority = Authority::parse("https://login.example.org/common")?;

        let err = cache.resolve(&authority, true).await.unwrap_err();
        assert!(matches!(
            err,
            Error::AuthorityNotTrusted {
                source: Some(DiscoveryError::UnknownHost),
                ..
            }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn discovery_host_follows_allowlist() -> Result<()> {
        let source = Arc::new(StubSource {
            response: Some(public_cloud()),
            ..StubSource::default()
        });

        struct Shared(Arc<StubSource>);

        #[async_trait]
        impl DiscoverySource for Shared {
            async fn discover(
                &self,
                request: &DiscoveryRequest,
            ) -> Result<InstanceDiscoveryResponse, Box<dyn error::Error + Send + Sync + 'static>>
            {
                self.0.discover(request).await
            }
        }

        let cache = DiscoveryCache::new(Shared(source.clone()));
        cache
            .resolve(&Authority::parse("https://login.chinacloudapi.cn/common")?, true)
            .await?;
        let _ = cache
            .resolve(&Authority::parse("https://login.example.org/common")?, false)
            .await?;

        let seen = source.seen_hosts.lock().unwrap().clone();
        assert_eq!(seen, vec!["login.chinacloudapi.cn", DEFAULT_TRUSTED_HOST]);
        Ok(())
    }

    #[tokio::test]
    async fn failure_without_validation_synthesizes_self_entry() -> Result<()> {
        let cache = DiscoveryCache::new(StubSource::default());
        let authority = Authority::parse("https://login.example.org/common")?;

        let entry = cache.resolve(&authority, false).await?;
        assert_eq!(*entry, DiscoveryMetadata::for_self("login.example.org"));
        Ok(())
    }

    #[tokio::test]
    async fn failure_with_validation_is_untrusted() -> Result<()> {
        let cache = DiscoveryCache::new(StubSource::default());
        let authority = Authority::parse("https://login.microsoftonline.com/common")?;

        let err = cache.resolve(&authority, true).await.unwrap_err();
        assert!(matches!(
            err,
            Error::AuthorityNotTrusted {
                source: Some(DiscoveryError::Request(_)),
                ..
            }
        ));
        assert!(cache.cached("login.microsoftonline.com").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn missing_tenant_discovery_endpoint_fails_validation() -> Result<()> {
        let mut response = public_cloud();
        response.tenant_discovery_endpoint = None;
        let cache = DiscoveryCache::new(StubSource {
            response: Some(response),
            ..StubSource::default()
        });
        let authority = Authority::parse("https://login.microsoftonline.com/common")?;

        let err = cache.resolve(&authority, true).await.unwrap_err();
        assert!(matches!(
            err,
            Error::AuthorityNotTrusted {
                source: Some(DiscoveryError::MissingTenantDiscoveryEndpoint),
                ..
            }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn adfs_skips_discovery() -> Result<()> {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = DiscoveryCache::new(StubSource {
            calls: calls.clone(),
            ..StubSource::default()
        });
        let authority = Authority::parse("https://fs.contoso.com/adfs")?;

        let entry = cache.resolve(&authority, true).await?;
        assert_eq!(entry.aliases, vec!["fs.contoso.com".to_owned()]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn seeded_metadata_is_used_without_network() -> Result<()> {
        let json = serde_json::to_string(&public_cloud())?;
        let cache = DiscoveryCache::with_metadata_json(&json)?;

        let known = Authority::parse("https://login.microsoft.com/common")?;
        assert_eq!(
            cache.resolve(&known, true).await?.preferred_network,
            "login.microsoftonline.com"
        );

        let unknown = Authority::parse("https://login.example.org/common")?;
        assert_eq!(
            cache.resolve(&unknown, true).await?.aliases,
            vec!["login.example.org".to_owned()]
        );
        Ok(())
    }

    #[test]
    fn aliases_for_unknown_environment_is_itself() {
        let cache = DiscoveryCache::offline();
        assert_eq!(
            cache.aliases_for("Login.Example.org"),
            vec!["login.example.org".to_owned()]
        );
    }
}
