//! The five credential buckets and the lookups over them
//!
//! Buckets are keyed by derived key strings but lookups never parse keys; they
//! scan records and compare fields. Every lookup takes the alias set of the
//! environment being searched, so records cached under any equivalent host are
//! found. No referential integrity is kept between buckets.

use std::collections::BTreeMap;

use credence_clock::{DurationSecs, UnixTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::entities::{
    AccessTokenEntry, AccountEntry, AppMetadataEntry, IdTokenEntry, RefreshTokenEntry,
};
use crate::{braids::ClientIdRef, scope::Scopes};

/// Records of one kind, keyed by their derived key
pub type Bucket<T> = BTreeMap<String, T>;

/// The complete set of cached credentials
///
/// This is also the shape of the persisted cache document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CredentialStore {
    /// Access tokens
    #[serde(rename = "AccessToken", default)]
    pub access_tokens: Bucket<AccessTokenEntry>,
    /// Refresh tokens
    #[serde(rename = "RefreshToken", default)]
    pub refresh_tokens: Bucket<RefreshTokenEntry>,
    /// ID tokens
    #[serde(rename = "IdToken", default)]
    pub id_tokens: Bucket<IdTokenEntry>,
    /// Accounts
    #[serde(rename = "Account", default)]
    pub accounts: Bucket<AccountEntry>,
    /// Application metadata
    #[serde(rename = "AppMetadata", default)]
    pub app_metadata: Bucket<AppMetadataEntry>,
    /// Unrecognized top-level sections
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

/// Criteria for finding a usable access token
#[derive(Clone, Copy, Debug)]
pub struct AccessTokenQuery<'a> {
    /// Home account, or `None` for application tokens
    pub home_account_id: Option<&'a str>,
    /// Tenant the token must have been issued in
    pub realm: &'a str,
    /// Client the token must have been issued to
    pub client_id: &'a ClientIdRef,
    /// Scopes the token must grant
    pub scopes: &'a Scopes,
    /// Environments to search
    pub aliases: &'a [String],
    /// The current time
    pub now: UnixTime,
    /// How long the token must remain valid past `now`
    pub buffer: DurationSecs,
}

pub(crate) fn in_aliases(environment: &str, aliases: &[String]) -> bool {
    aliases.iter().any(|a| a.eq_ignore_ascii_case(environment))
}

/// Inserts `entry`, first dropping records that derive the same key
///
/// Records written by other libraries may sit under keys derived differently
/// from ours, so the key each record derives is compared, not the stored one.
fn put<T>(bucket: &mut Bucket<T>, entry: T, key_of: fn(&T) -> String) -> String {
    let key = key_of(&entry);
    bucket.retain(|stored, existing| *stored != key && key_of(existing) != key);
    bucket.insert(key.clone(), entry);
    key
}

fn same(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

impl AccessTokenQuery<'_> {
    fn matches(&self, entry: &AccessTokenEntry, scopes: &Scopes) -> bool {
        same(&entry.home_account_id, self.home_account_id.unwrap_or(""))
            && in_aliases(&entry.environment, self.aliases)
            && same(&entry.realm, self.realm)
            && same(entry.client_id.as_str(), self.client_id.as_str())
            && entry.target.contains_all(scopes)
    }
}

impl CredentialStore {
    /// Constructs an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether all five buckets are empty
    pub fn is_empty(&self) -> bool {
        self.access_tokens.is_empty()
            && self.refresh_tokens.is_empty()
            && self.id_tokens.is_empty()
            && self.accounts.is_empty()
            && self.app_metadata.is_empty()
    }

    /// Stores an access token, replacing any entry with the same identity
    pub fn put_access_token(&mut self, entry: AccessTokenEntry) -> String {
        put(&mut self.access_tokens, entry, AccessTokenEntry::key)
    }

    /// Stores a refresh token, replacing any entry with the same identity
    pub fn put_refresh_token(&mut self, entry: RefreshTokenEntry) -> String {
        put(&mut self.refresh_tokens, entry, RefreshTokenEntry::key)
    }

    /// Stores an ID token, replacing any entry with the same identity
    pub fn put_id_token(&mut self, entry: IdTokenEntry) -> String {
        put(&mut self.id_tokens, entry, IdTokenEntry::key)
    }

    /// Stores an account, replacing any entry with the same identity
    pub fn put_account(&mut self, entry: AccountEntry) -> String {
        put(&mut self.accounts, entry, AccountEntry::key)
    }

    /// Stores application metadata, replacing any entry with the same identity
    pub fn put_app_metadata(&mut self, entry: AppMetadataEntry) -> String {
        put(&mut self.app_metadata, entry, AppMetadataEntry::key)
    }

    /// Removes every credential and account entry of an account
    ///
    /// Entries cached under any of `aliases` are removed. Returns the number of
    /// entries removed.
    pub fn remove_account(&mut self, home_account_id: &str, aliases: &[String]) -> usize {
        let before = self.access_tokens.len()
            + self.refresh_tokens.len()
            + self.id_tokens.len()
            + self.accounts.len();

        let keep = |home: &str, env: &str| !(same(home, home_account_id) && in_aliases(env, aliases));

        self.access_tokens
            .retain(|_, e| keep(&e.home_account_id, &e.environment));
        self.refresh_tokens
            .retain(|_, e| keep(&e.home_account_id, &e.environment));
        self.id_tokens
            .retain(|_, e| keep(&e.home_account_id, &e.environment));
        self.accounts
            .retain(|_, e| keep(&e.home_account_id, &e.environment));

        let after = self.access_tokens.len()
            + self.refresh_tokens.len()
            + self.id_tokens.len()
            + self.accounts.len();

        before - after
    }

    /// Finds an access token that satisfies the query
    ///
    /// When several cached tokens grant a superset of the requested scopes,
    /// any one of them may be returned.
    pub fn find_access_token(&self, query: &AccessTokenQuery<'_>) -> Option<&AccessTokenEntry> {
        let scopes = query.scopes.without_reserved();
        let usable_past = query.now + query.buffer;
        self.access_tokens
            .values()
            .find(|e| query.matches(e, &scopes) && e.is_valid_at(usable_past))
    }

    /// Finds the longest-lived access token matching the query, usable or not
    ///
    /// `now` and `buffer` are ignored, so an expired token is still returned.
    /// Callers deciding whether to refresh use this to tell an expired token
    /// from a missing one.
    pub fn find_latest_access_token(
        &self,
        query: &AccessTokenQuery<'_>,
    ) -> Option<&AccessTokenEntry> {
        let scopes = query.scopes.without_reserved();
        self.access_tokens
            .values()
            .filter(|e| query.matches(e, &scopes))
            .max_by_key(|e| e.expires_on)
    }

    /// Finds the refresh token issued to a specific client
    pub fn find_refresh_token(
        &self,
        home_account_id: &str,
        client_id: &ClientIdRef,
        aliases: &[String],
    ) -> Option<&RefreshTokenEntry> {
        self.refresh_tokens.values().find(|e| {
            same(&e.home_account_id, home_account_id)
                && in_aliases(&e.environment, aliases)
                && same(e.client_id.as_str(), client_id.as_str())
        })
    }

    /// Finds the refresh token shared by a specific client family
    pub fn find_family_refresh_token(
        &self,
        home_account_id: &str,
        family_id: &str,
        aliases: &[String],
    ) -> Option<&RefreshTokenEntry> {
        self.refresh_tokens.values().find(|e| {
            same(&e.home_account_id, home_account_id)
                && in_aliases(&e.environment, aliases)
                && e.family().map_or(false, |f| same(f, family_id))
        })
    }

    /// Finds a refresh token of any client family
    pub fn find_any_family_refresh_token(
        &self,
        home_account_id: &str,
        aliases: &[String],
    ) -> Option<&RefreshTokenEntry> {
        self.refresh_tokens.values().find(|e| {
            same(&e.home_account_id, home_account_id)
                && in_aliases(&e.environment, aliases)
                && e.family().is_some()
        })
    }

    /// Finds an account entry
    ///
    /// An entry for `realm` is preferred when one is given; otherwise any
    /// entry of the account is returned.
    pub fn find_account(
        &self,
        home_account_id: &str,
        realm: Option<&str>,
        aliases: &[String],
    ) -> Option<&AccountEntry> {
        let mut candidates = self.accounts.values().filter(|e| {
            same(&e.home_account_id, home_account_id) && in_aliases(&e.environment, aliases)
        });

        match realm {
            Some(realm) => {
                let all: Vec<_> = candidates.collect();
                all.iter()
                    .find(|e| same(&e.realm, realm))
                    .or_else(|| all.first())
                    .copied()
            }
            None => candidates.next(),
        }
    }

    /// Finds the ID token issued to a client for an account in a tenant
    pub fn find_id_token(
        &self,
        home_account_id: &str,
        realm: &str,
        client_id: &ClientIdRef,
        aliases: &[String],
    ) -> Option<&IdTokenEntry> {
        self.id_tokens.values().find(|e| {
            same(&e.home_account_id, home_account_id)
                && in_aliases(&e.environment, aliases)
                && same(&e.realm, realm)
                && same(e.client_id.as_str(), client_id.as_str())
        })
    }

    /// The client family an application belongs to, if known
    pub fn family_id_for(&self, client_id: &ClientIdRef, aliases: &[String]) -> Option<&str> {
        self.app_metadata
            .values()
            .filter(|e| {
                same(e.client_id.as_str(), client_id.as_str()) && in_aliases(&e.environment, aliases)
            })
            .find_map(|e| e.family_id.as_deref().filter(|f| !f.is_empty()))
    }

    /// All cached accounts
    pub fn accounts(&self) -> impl Iterator<Item = &AccountEntry> {
        self.accounts.values()
    }
}
