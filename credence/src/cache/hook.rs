//! Hooks that load and store the token cache around each access

use std::{error, sync::Arc};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::TokenCache;
use crate::{account::Account, braids::ClientIdRef};

/// The cache and the operation it is being accessed for
#[derive(Debug)]
pub struct CacheAccessContext<'a> {
    cache: &'a mut TokenCache,
    client_id: &'a ClientIdRef,
    account: Option<&'a Account>,
}

impl<'a> CacheAccessContext<'a> {
    pub(crate) fn new(
        cache: &'a mut TokenCache,
        client_id: &'a ClientIdRef,
        account: Option<&'a Account>,
    ) -> Self {
        Self {
            cache,
            client_id,
            account,
        }
    }

    /// The cache being accessed
    #[inline]
    pub fn cache(&self) -> &TokenCache {
        self.cache
    }

    /// Mutable access to the cache, for loading persisted state
    #[inline]
    pub fn cache_mut(&mut self) -> &mut TokenCache {
        self.cache
    }

    /// The client whose cache is being accessed
    #[inline]
    pub fn client_id(&self) -> &ClientIdRef {
        self.client_id
    }

    /// The account the access is for, if any
    #[inline]
    pub fn account(&self) -> Option<&Account> {
        self.account
    }

    /// Whether the access modified the cache
    #[inline]
    pub fn has_cache_changed(&self) -> bool {
        self.cache.has_state_changed()
    }
}

/// Persists the token cache around every access
///
/// `before_access` is called before the cache is read or written and
/// should load persisted state with [`TokenCache::deserialize`].
/// `after_access` is called once the access is complete and should store
/// [`TokenCache::serialize`] output if the cache changed. Errors that are
/// a [`crate::Error`] keep their kind when surfaced to the caller.
#[async_trait]
pub trait CacheAccessHook: Send + Sync {
    /// Called before the cache is accessed
    async fn before_access(
        &self,
        context: &mut CacheAccessContext<'_>,
    ) -> Result<(), Box<dyn error::Error + Send + Sync + 'static>>;

    /// Called after the cache has been accessed
    async fn after_access(
        &self,
        context: &mut CacheAccessContext<'_>,
    ) -> Result<(), Box<dyn error::Error + Send + Sync + 'static>>;
}

#[async_trait]
impl<T: CacheAccessHook + ?Sized> CacheAccessHook for Arc<T> {
    async fn before_access(
        &self,
        context: &mut CacheAccessContext<'_>,
    ) -> Result<(), Box<dyn error::Error + Send + Sync + 'static>> {
        T::before_access(self, context).await
    }

    async fn after_access(
        &self,
        context: &mut CacheAccessContext<'_>,
    ) -> Result<(), Box<dyn error::Error + Send + Sync + 'static>> {
        T::after_access(self, context).await
    }
}

/// A cache hook that keeps the persisted text in shared memory
///
/// Clones share the same text, so clones handed to several applications
/// behave like processes sharing one cache file.
#[derive(Clone, Debug, Default)]
pub struct InMemoryCacheHook {
    text: Arc<Mutex<Option<String>>>,
}

impl InMemoryCacheHook {
    /// Constructs a hook with nothing persisted
    pub fn new() -> Self {
        Self::default()
    }

    /// Constructs a hook that starts out holding `text`
    pub fn with_contents(text: impl Into<String>) -> Self {
        Self {
            text: Arc::new(Mutex::new(Some(text.into()))),
        }
    }

    /// The text currently persisted
    pub async fn contents(&self) -> Option<String> {
        self.text.lock().await.clone()
    }
}

#[async_trait]
impl CacheAccessHook for InMemoryCacheHook {
    async fn before_access(
        &self,
        context: &mut CacheAccessContext<'_>,
    ) -> Result<(), Box<dyn error::Error + Send + Sync + 'static>> {
        if let Some(text) = self.text.lock().await.as_deref() {
            context.cache_mut().deserialize(text)?;
        }
        Ok(())
    }

    async fn after_access(
        &self,
        context: &mut CacheAccessContext<'_>,
    ) -> Result<(), Box<dyn error::Error + Send + Sync + 'static>> {
        if context.has_cache_changed() {
            let text = context.cache_mut().serialize()?;
            *self.text.lock().await = Some(text);
        }
        Ok(())
    }
}

#[cfg(feature = "file")]
pub use file::FileCacheHook;

#[cfg(feature = "file")]
mod file {
    use std::{error, io, path::PathBuf};

    use async_trait::async_trait;
    use tokio::fs::OpenOptions;

    use super::{CacheAccessContext, CacheAccessHook};

    /// A cache hook that persists the cache to a local file
    ///
    /// The file is created readable only by its owner on Unix. A missing
    /// file loads as an empty cache.
    #[derive(Clone, Debug)]
    pub struct FileCacheHook {
        path: PathBuf,
    }

    impl FileCacheHook {
        /// Constructs a new file cache hook
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }

        async fn read_text(&self) -> Result<Option<String>, io::Error> {
            use tokio::io::AsyncReadExt;

            let mut file = match OpenOptions::new().read(true).open(&self.path).await {
                Ok(file) => file,
                Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(err) => return Err(err),
            };
            let mut data = String::new();
            file.read_to_string(&mut data).await?;
            Ok(Some(data))
        }

        async fn write_text(&self, text: &str) -> Result<(), io::Error> {
            use tokio::io::AsyncWriteExt;

            let mut file_opts = OpenOptions::new();

            file_opts.create(true).truncate(true).write(true);

            #[cfg(unix)]
            file_opts.mode(0o600);

            let mut file = file_opts.open(&self.path).await?;
            file.write_all(text.as_bytes()).await?;
            file.flush().await?;
            Ok(())
        }
    }

    #[async_trait]
    impl CacheAccessHook for FileCacheHook {
        async fn before_access(
            &self,
            context: &mut CacheAccessContext<'_>,
        ) -> Result<(), Box<dyn error::Error + Send + Sync + 'static>> {
            match self.read_text().await? {
                Some(text) => {
                    tracing::trace!(path = %self.path.display(), "loading token cache from file");
                    context.cache_mut().deserialize(&text)?;
                }
                None => {
                    tracing::trace!(path = %self.path.display(), "no token cache file present");
                }
            }
            Ok(())
        }

        async fn after_access(
            &self,
            context: &mut CacheAccessContext<'_>,
        ) -> Result<(), Box<dyn error::Error + Send + Sync + 'static>> {
            if !context.has_cache_changed() {
                return Ok(());
            }
            let text = context.cache_mut().serialize()?;
            self.write_text(&text).await?;
            tracing::debug!(path = %self.path.display(), "token cache written to file");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;

    use super::*;
    use crate::{braids::ClientId, cache::AppMetadataEntry, cache::ExtraFields, Error};

    fn metadata() -> AppMetadataEntry {
        AppMetadataEntry {
            client_id: ClientId::from("client"),
            environment: "login.windows.net".into(),
            family_id: None,
            extra: ExtraFields::new(),
        }
    }

    async fn write_through(hook: &dyn CacheAccessHook) -> Result<()> {
        let client = ClientId::from("client");
        let mut cache = TokenCache::new();
        let mut context = CacheAccessContext::new(&mut cache, &client, None);
        hook.before_access(&mut context).await.map_err(Error::from_hook)?;
        context.cache_mut().store_mut().put_app_metadata(metadata());
        hook.after_access(&mut context).await.map_err(Error::from_hook)?;
        Ok(())
    }

    async fn load(hook: &dyn CacheAccessHook) -> Result<TokenCache> {
        let client = ClientId::from("client");
        let mut cache = TokenCache::new();
        let mut context = CacheAccessContext::new(&mut cache, &client, None);
        hook.before_access(&mut context).await.map_err(Error::from_hook)?;
        hook.after_access(&mut context).await.map_err(Error::from_hook)?;
        Ok(cache)
    }

    #[tokio::test]
    async fn in_memory_hook_shares_text_between_clones() -> Result<()> {
        let hook = InMemoryCacheHook::new();
        write_through(&hook.clone()).await?;

        assert!(hook.contents().await.is_some());
        let cache = load(&hook).await?;
        assert_eq!(cache.store().app_metadata.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn unchanged_cache_is_not_written() -> Result<()> {
        let hook = InMemoryCacheHook::new();
        load(&hook).await?;
        assert_eq!(hook.contents().await, None);
        Ok(())
    }

    #[tokio::test]
    async fn malformed_persisted_text_keeps_its_kind() -> Result<()> {
        let hook = InMemoryCacheHook::with_contents("[[[");
        let client = ClientId::from("client");
        let mut cache = TokenCache::new();
        let mut context = CacheAccessContext::new(&mut cache, &client, None);
        let err = hook
            .before_access(&mut context)
            .await
            .map_err(Error::from_hook)
            .unwrap_err();
        assert!(matches!(err, Error::MalformedCacheData(_)));
        Ok(())
    }

    #[cfg(feature = "file")]
    #[tokio::test]
    async fn file_hook_round_trips() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("cache.json");
        let hook = FileCacheHook::new(&path);

        let empty = load(&hook).await?;
        assert!(empty.store().is_empty());
        assert!(!path.exists());

        write_through(&hook).await?;
        let cache = load(&hook).await?;
        assert_eq!(cache.store().app_metadata.len(), 1);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path)?.permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        Ok(())
    }
}
