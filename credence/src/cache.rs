//! The token cache and its persistence protocol
//!
//! A [`TokenCache`] holds the in-memory [`CredentialStore`] of one
//! application. Persistence is left to a [`CacheAccessHook`], which loads
//! text with [`TokenCache::deserialize`] before each access and stores the
//! text produced by [`TokenCache::serialize`] after it.
//!
//! The text last loaded is kept as a baseline. Serializing merges the
//! in-memory state into that baseline, so that entries written by another
//! process between the load and the store survive, and entries removed in
//! this process stay removed.

use crate::error::{Error, Result};

mod entities;
mod hook;
mod key;
mod merge;
mod save;
mod store;
mod time;

pub use entities::{
    AccessTokenEntry, AccountEntry, AppMetadataEntry, ExtraFields, IdTokenEntry, Merge,
    RefreshTokenEntry,
};
#[cfg(feature = "file")]
pub use hook::FileCacheHook;
pub use hook::{CacheAccessContext, CacheAccessHook, InMemoryCacheHook};
pub use key::{
    access_token_key, account_key, app_metadata_key, escape_segment, id_token_key,
    refresh_token_key, CredentialType,
};
pub use merge::{merge, merge_bucket};
pub use save::TokenResponseContext;
pub use store::{AccessTokenQuery, Bucket, CredentialStore};

/// The in-memory token cache of an application
#[derive(Clone, Debug, Default)]
pub struct TokenCache {
    store: CredentialStore,
    baseline: Option<CredentialStore>,
    changed: bool,
}

impl TokenCache {
    /// Constructs an empty cache with no baseline
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the in-memory state with the persisted `text`
    ///
    /// Empty or whitespace-only text loads as an empty cache. If `text` cannot
    /// be parsed, the in-memory state is left untouched.
    pub fn deserialize(&mut self, text: &str) -> Result<()> {
        let store = if text.trim().is_empty() {
            CredentialStore::new()
        } else {
            serde_json::from_str::<CredentialStore>(text).map_err(Error::MalformedCacheData)?
        };

        tracing::trace!(
            access_tokens = store.access_tokens.len(),
            refresh_tokens = store.refresh_tokens.len(),
            accounts = store.accounts.len(),
            "loaded token cache"
        );

        self.baseline = Some(store.clone());
        self.store = store;
        self.changed = false;
        Ok(())
    }

    /// Produces the text to persist
    ///
    /// With a baseline, the in-memory state is merged into it first. The
    /// merged result becomes both the in-memory state and the new baseline.
    pub fn serialize(&mut self) -> Result<String> {
        let document = match self.baseline.take() {
            Some(baseline) => merge::merge(baseline, self.store.clone()),
            None => self.store.clone(),
        };

        let text = serde_json::to_string(&document).map_err(Error::MalformedCacheData)?;

        self.store = document.clone();
        self.baseline = Some(document);
        self.changed = false;
        Ok(text)
    }

    /// The credentials held in memory
    #[inline]
    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Mutable access to the credentials held in memory
    ///
    /// Marks the cache as changed.
    #[inline]
    pub fn store_mut(&mut self) -> &mut CredentialStore {
        self.changed = true;
        &mut self.store
    }

    /// Whether the in-memory state was modified since it was last loaded or
    /// serialized
    #[inline]
    pub fn has_state_changed(&self) -> bool {
        self.changed
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;
    use serde_json::{json, Value};

    use super::*;
    use crate::braids::ClientId;

    fn metadata(client: &str) -> AppMetadataEntry {
        AppMetadataEntry {
            client_id: ClientId::from(client),
            environment: "login.windows.net".into(),
            family_id: None,
            extra: ExtraFields::new(),
        }
    }

    const PERSISTED: &str = r#"{
        "AccessToken": {},
        "RefreshToken": {},
        "IdToken": {},
        "Account": {
            "uid.utid-login.windows.net-utid": {
                "home_account_id": "uid.utid",
                "environment": "login.windows.net",
                "realm": "utid",
                "username": "user@contoso.com",
                "last_modification_app": "other"
            }
        },
        "AppMetadata": {},
        "Vendor": { "setting": true }
    }"#;

    #[test]
    fn load_then_save_preserves_document() -> Result<()> {
        let mut cache = TokenCache::new();
        cache.deserialize(PERSISTED)?;
        assert!(!cache.has_state_changed());

        let saved: Value = serde_json::from_str(&cache.serialize()?)?;
        let original: Value = serde_json::from_str(PERSISTED)?;
        assert_eq!(saved, original);
        Ok(())
    }

    #[test]
    fn serialize_is_idempotent() -> Result<()> {
        let mut cache = TokenCache::new();
        cache.deserialize(PERSISTED)?;
        cache.store_mut().put_app_metadata(metadata("c"));

        let first = cache.serialize()?;
        let second = cache.serialize()?;
        assert_eq!(first, second);

        let mut reloaded = TokenCache::new();
        reloaded.deserialize(&first)?;
        assert_eq!(reloaded.serialize()?, first);
        Ok(())
    }

    #[test]
    fn malformed_text_leaves_state_untouched() -> Result<()> {
        let mut cache = TokenCache::new();
        cache.store_mut().put_app_metadata(metadata("c"));

        let err = cache.deserialize("{ not json").unwrap_err();
        assert!(matches!(err, Error::MalformedCacheData(_)));
        assert_eq!(cache.store().app_metadata.len(), 1);
        assert!(cache.has_state_changed());
        Ok(())
    }

    #[test]
    fn removal_survives_stale_baseline() -> Result<()> {
        let mut cache = TokenCache::new();
        cache.deserialize(PERSISTED)?;
        let aliases = vec!["login.windows.net".to_owned()];
        assert_eq!(cache.store_mut().remove_account("uid.utid", &aliases), 1);

        let saved: Value = serde_json::from_str(&cache.serialize()?)?;
        assert_eq!(saved["Account"], json!({}));
        assert_eq!(saved["Vendor"], json!({ "setting": true }));
        Ok(())
    }

    #[test]
    fn empty_text_is_an_empty_cache() -> Result<()> {
        let mut cache = TokenCache::new();
        cache.deserialize("   ")?;
        assert!(cache.store().is_empty());
        Ok(())
    }

    #[test]
    fn store_mut_marks_changed_and_serialize_resets() -> Result<()> {
        let mut cache = TokenCache::new();
        assert!(!cache.has_state_changed());
        cache.store_mut();
        assert!(cache.has_state_changed());
        cache.serialize()?;
        assert!(!cache.has_state_changed());
        Ok(())
    }
}
