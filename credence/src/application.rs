//! The client application that ties the cache, discovery, and refresh together

use std::sync::Arc;

use credence_clock::{Clock, DurationSecs, System};
use tokio::sync::Mutex;

use crate::{
    account::Account,
    authority::Authority,
    braids::{ClientId, ClientIdRef, RefreshToken},
    cache::{AccessTokenQuery, CacheAccessContext, CacheAccessHook, TokenCache, TokenResponseContext},
    discovery::{DiscoveryCache, DiscoveryMetadata},
    error::{CacheMissReason, Error, Result},
    executor::{RefreshRequest, TokenRequestExecutor, TokenResponse},
    scope::Scopes,
    silent::{
        self, AuthenticationResult, Decision, RefreshOutcome, RefreshReason, SilentRequest,
        TokenSource,
    },
};

/// Tunables for a [`ClientApplication`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ApplicationConfig {
    /// How long a cached access token must remain valid to be returned
    pub expiry_buffer: DurationSecs,
    /// Whether authorities must be vouched for by instance discovery
    pub validate_authority: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            expiry_buffer: DurationSecs(300),
            validate_authority: true,
        }
    }
}

/// Builds a [`ClientApplication`]
pub struct ClientApplicationBuilder<C = System> {
    client_id: ClientId,
    authority: Authority,
    config: ApplicationConfig,
    hook: Option<Arc<dyn CacheAccessHook>>,
    discovery: Option<Arc<DiscoveryCache>>,
    executor: Option<Arc<dyn TokenRequestExecutor>>,
    clock: C,
}

impl<C> ClientApplicationBuilder<C> {
    /// Persists the token cache through `hook`
    pub fn with_cache_hook(mut self, hook: impl CacheAccessHook + 'static) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    /// Uses `discovery` instead of a discovery cache of its own
    ///
    /// Applications that trust the same authorities can share one cache.
    pub fn with_discovery_cache(mut self, discovery: Arc<DiscoveryCache>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Redeems refresh tokens with `executor`
    pub fn with_executor(mut self, executor: impl TokenRequestExecutor + 'static) -> Self {
        self.executor = Some(Arc::new(executor));
        self
    }

    /// Replaces the default configuration
    pub fn with_config(mut self, config: ApplicationConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> ClientApplicationBuilder<D> {
        ClientApplicationBuilder {
            client_id: self.client_id,
            authority: self.authority,
            config: self.config,
            hook: self.hook,
            discovery: self.discovery,
            executor: self.executor,
            clock,
        }
    }

    /// Builds the application
    ///
    /// Without an explicit executor or discovery cache, HTTP-backed ones are
    /// used when the `http` feature is enabled. Otherwise discovery is
    /// offline and every refresh fails.
    pub fn build(self) -> ClientApplication<C> {
        #[cfg(feature = "http")]
        let client = reqwest::Client::new();

        let discovery = self.discovery.unwrap_or_else(|| {
            #[cfg(feature = "http")]
            let cache = DiscoveryCache::new(crate::discovery::HttpDiscoverySource::new(client.clone()));
            #[cfg(not(feature = "http"))]
            let cache = DiscoveryCache::offline();
            Arc::new(cache)
        });

        let executor = self.executor.unwrap_or_else(|| {
            #[cfg(feature = "http")]
            let executor: Arc<dyn TokenRequestExecutor> =
                Arc::new(crate::executor::HttpTokenRequestExecutor::new(client));
            #[cfg(not(feature = "http"))]
            let executor: Arc<dyn TokenRequestExecutor> = Arc::new(NoExecutor);
            executor
        });

        ClientApplication {
            client_id: self.client_id,
            authority: self.authority,
            config: self.config,
            hook: self.hook,
            discovery,
            executor,
            cache: Mutex::new(TokenCache::new()),
            clock: self.clock,
        }
    }
}

impl<C> std::fmt::Debug for ClientApplicationBuilder<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ClientApplicationBuilder")
            .field("client_id", &self.client_id)
            .field("authority", &self.authority)
            .field("config", &self.config)
            .field("has_hook", &self.hook.is_some())
            .finish()
    }
}

#[cfg(not(feature = "http"))]
#[derive(Debug)]
struct NoExecutor;

#[cfg(not(feature = "http"))]
#[async_trait::async_trait]
impl TokenRequestExecutor for NoExecutor {
    async fn refresh(
        &self,
        _request: &RefreshRequest,
    ) -> Result<TokenResponse, crate::error::ServiceError> {
        Err(crate::error::ServiceError::transport(
            "no token request executor configured",
        ))
    }
}

/// A public client application with a token cache
///
/// The in-memory cache is locked for the duration of each cache access,
/// with the cache hook invoked before and after. The lock is released while
/// a refresh request is in flight.
pub struct ClientApplication<C = System> {
    client_id: ClientId,
    authority: Authority,
    config: ApplicationConfig,
    hook: Option<Arc<dyn CacheAccessHook>>,
    discovery: Arc<DiscoveryCache>,
    executor: Arc<dyn TokenRequestExecutor>,
    cache: Mutex<TokenCache>,
    clock: C,
}

impl ClientApplication<System> {
    /// Starts building an application for `client_id` signing in through
    /// `authority`
    pub fn builder(client_id: impl Into<ClientId>, authority: Authority) -> ClientApplicationBuilder<System> {
        ClientApplicationBuilder {
            client_id: client_id.into(),
            authority,
            config: ApplicationConfig::default(),
            hook: None,
            discovery: None,
            executor: None,
            clock: System,
        }
    }
}

struct RefreshPlan {
    reason: RefreshReason,
    refresh_token: RefreshToken,
    cached: Option<AuthenticationResult>,
}

enum Lookup {
    Hit(AuthenticationResult),
    Refresh(RefreshPlan),
}

impl<C> ClientApplication<C> {
    /// The application's client ID
    #[inline]
    pub fn client_id(&self) -> &ClientIdRef {
        &self.client_id
    }

    /// The authority tokens are requested from
    #[inline]
    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// The discovery cache used to resolve environment aliases
    #[inline]
    pub fn discovery_cache(&self) -> &Arc<DiscoveryCache> {
        &self.discovery
    }

    /// The in-memory token cache
    ///
    /// Holding the lock blocks every cache access of this application.
    #[inline]
    pub fn token_cache(&self) -> &Mutex<TokenCache> {
        &self.cache
    }

    async fn with_cache<R>(
        &self,
        account: Option<&Account>,
        access: impl FnOnce(&mut TokenCache) -> R,
    ) -> Result<R> {
        let mut cache = self.cache.lock().await;
        let mut context = CacheAccessContext::new(&mut cache, &self.client_id, account);

        if let Some(hook) = &self.hook {
            hook.before_access(&mut context)
                .await
                .map_err(Error::from_hook)?;
        }

        let output = access(context.cache_mut());

        if let Some(hook) = &self.hook {
            hook.after_access(&mut context)
                .await
                .map_err(Error::from_hook)?;
        }

        Ok(output)
    }

    async fn resolve(&self, authority: &Authority) -> Result<Arc<DiscoveryMetadata>> {
        self.discovery
            .resolve(authority, self.config.validate_authority)
            .await
    }
}

impl<C: Clock> ClientApplication<C> {
    /// Acquires a token from the cache, refreshing it if needed
    #[tracing::instrument(skip(self, request), fields(client_id = %self.client_id, scopes = %request.scopes()))]
    pub async fn acquire_token_silently(
        &self,
        request: SilentRequest,
    ) -> Result<AuthenticationResult> {
        match request {
            SilentRequest::App { scopes } => self.acquire_app_token(&scopes).await,
            SilentRequest::Account {
                account,
                scopes,
                force_refresh,
            } => {
                self.acquire_account_token(account, &scopes, force_refresh)
                    .await
            }
        }
    }

    async fn acquire_app_token(&self, scopes: &Scopes) -> Result<AuthenticationResult> {
        let metadata = self.resolve(&self.authority).await?;
        let now = self.clock.now();
        let buffer = self.config.expiry_buffer;
        let realm = self.authority.tenant().to_owned();

        let found = self
            .with_cache(None, |cache| {
                let query = AccessTokenQuery {
                    home_account_id: None,
                    realm: &realm,
                    client_id: &self.client_id,
                    scopes,
                    aliases: &metadata.aliases,
                    now,
                    buffer,
                };
                cache
                    .store()
                    .find_access_token(&query)
                    .map(|at| AuthenticationResult::from_cache(at, None, None))
            })
            .await?;

        match found {
            Some(result) => {
                tracing::debug!("application token served from cache");
                Ok(result)
            }
            None => Err(Error::CacheMiss(CacheMissReason::NoAppToken)),
        }
    }

    async fn acquire_account_token(
        &self,
        account: Account,
        scopes: &Scopes,
        force_refresh: bool,
    ) -> Result<AuthenticationResult> {
        let authority = if self.authority.is_tenantless() && !account.tenant_id().is_empty() {
            self.authority.with_tenant(account.tenant_id())?
        } else {
            self.authority.clone()
        };

        let metadata = self.resolve(&authority).await?;
        let aliases = if metadata.has_alias(account.environment()) {
            metadata.aliases.clone()
        } else {
            self.discovery.aliases_for(account.environment())
        };

        let now = self.clock.now();
        let buffer = self.config.expiry_buffer;
        let realm = authority.tenant().to_owned();
        let account_realm = if account.tenant_id().is_empty() {
            realm.as_str()
        } else {
            account.tenant_id()
        };

        let lookup = self
            .with_cache(Some(&account), |cache| -> Result<Lookup> {
                let store = cache.store();
                let home = account.home_account_id();

                let entry = store
                    .find_account(home, Some(account_realm), &aliases)
                    .ok_or(Error::CacheMiss(CacheMissReason::NoAccount))?;
                let known = Account::from(entry);
                let known_realm = known.tenant_id().to_owned();

                let query = AccessTokenQuery {
                    home_account_id: Some(home),
                    realm: &realm,
                    client_id: &self.client_id,
                    scopes,
                    aliases: &aliases,
                    now,
                    buffer,
                };
                let at = store.find_latest_access_token(&query);
                let id_token = store
                    .find_id_token(home, &known_realm, &self.client_id, &aliases)
                    .map(|e| e.secret.clone());

                let reason = match silent::decide(at, force_refresh, now, buffer) {
                    Decision::CacheHit(at) => {
                        return Ok(Lookup::Hit(AuthenticationResult::from_cache(
                            at,
                            id_token,
                            Some(known),
                        )));
                    }
                    Decision::NeedsRefresh(reason) => reason,
                };
                let cached = at.map(|at| AuthenticationResult::from_cache(at, id_token, Some(known)));

                let refresh_token = silent::select_refresh_token(store, home, &self.client_id, &aliases)
                    .map(|e| e.secret.clone())
                    .ok_or(Error::CacheMiss(CacheMissReason::NoRefreshToken))?;

                Ok(Lookup::Refresh(RefreshPlan {
                    reason,
                    refresh_token,
                    cached: cached.filter(|_| reason.is_soft()),
                }))
            })
            .await??;

        let plan = match lookup {
            Lookup::Hit(result) => {
                tracing::debug!("access token served from cache");
                return Ok(result);
            }
            Lookup::Refresh(plan) => plan,
        };

        tracing::debug!(reason = ?plan.reason, "refreshing access token");

        let request = RefreshRequest {
            authority: authority.clone(),
            client_id: self.client_id.clone(),
            refresh_token: plan.refresh_token,
            scopes: scopes.without_reserved(),
        };

        let refreshed = match self.executor.refresh(&request).await {
            Ok(response) => Ok(self
                .save_response(&authority, &metadata, scopes, Some(&account), &response)
                .await?),
            Err(error) => Err(error),
        };

        match silent::conclude_refresh(plan.reason, plan.cached, refreshed)? {
            RefreshOutcome::Refreshed(result) => Ok(result),
            RefreshOutcome::Degraded { cached, error } => {
                tracing::warn!(
                    error = (&error as &dyn std::error::Error),
                    "proactive refresh failed, returning cached access token"
                );
                Ok(cached)
            }
        }
    }

    /// Redeems a refresh token obtained elsewhere and caches the result
    ///
    /// This is the migration path for refresh tokens held outside the cache.
    #[tracing::instrument(skip(self, refresh_token, scopes), fields(client_id = %self.client_id, scopes = %scopes))]
    pub async fn acquire_token_by_refresh_token(
        &self,
        refresh_token: RefreshToken,
        scopes: &Scopes,
    ) -> Result<AuthenticationResult> {
        let metadata = self.resolve(&self.authority).await?;

        let request = RefreshRequest {
            authority: self.authority.clone(),
            client_id: self.client_id.clone(),
            refresh_token,
            scopes: scopes.without_reserved(),
        };

        let response = self.executor.refresh(&request).await?;
        self.save_response(&self.authority, &metadata, scopes, None, &response)
            .await
    }

    async fn save_response(
        &self,
        authority: &Authority,
        metadata: &DiscoveryMetadata,
        scopes: &Scopes,
        account: Option<&Account>,
        response: &TokenResponse,
    ) -> Result<AuthenticationResult> {
        let now = self.clock.now();

        let saved = self
            .with_cache(account, |cache| {
                let context = TokenResponseContext {
                    authority,
                    environment: &metadata.preferred_cache,
                    aliases: &metadata.aliases,
                    client_id: &self.client_id,
                    requested_scopes: scopes,
                    account,
                    now,
                };
                cache.store_mut().save_token_response(&context, response)
            })
            .await?;

        tracing::info!(
            expires_on = response.expires_on.0,
            has_account = saved.is_some(),
            "new tokens cached"
        );

        Ok(AuthenticationResult {
            access_token: response.access_token.clone(),
            id_token: response.id_token.clone(),
            expires_on: response.expires_on,
            scopes: if response.scopes.is_empty() {
                scopes.without_reserved()
            } else {
                response.scopes.without_reserved()
            },
            account: saved.or_else(|| account.cloned()),
            source: TokenSource::IdentityProvider,
        })
    }
}

impl<C> ClientApplication<C> {
    /// The accounts cached for this application's authority
    pub async fn accounts(&self) -> Result<Vec<Account>> {
        let metadata = self.resolve(&self.authority).await?;

        self.with_cache(None, |cache| {
            cache
                .store()
                .accounts()
                .filter(|e| metadata.has_alias(&e.environment))
                .map(Account::from)
                .collect()
        })
        .await
    }

    /// Removes every cached credential of `account`
    ///
    /// Returns the number of cache entries removed.
    #[tracing::instrument(skip(self, account), fields(client_id = %self.client_id))]
    pub async fn remove_account(&self, account: &Account) -> Result<usize> {
        self.resolve(&self.authority).await?;
        let aliases = self.discovery.aliases_for(account.environment());

        let removed = self
            .with_cache(Some(account), |cache| {
                cache
                    .store_mut()
                    .remove_account(account.home_account_id(), &aliases)
            })
            .await?;

        tracing::debug!(removed, "account removed from cache");
        Ok(removed)
    }
}

impl<C> std::fmt::Debug for ClientApplication<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ClientApplication")
            .field("client_id", &self.client_id)
            .field("authority", &self.authority)
            .field("config", &self.config)
            .field("discovery", &self.discovery)
            .field("has_hook", &self.hook.is_some())
            .finish()
    }
}
