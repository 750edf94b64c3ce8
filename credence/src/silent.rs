//! Deciding between a cached token and a refresh
//!
//! The decisions here are pure functions of cache contents and the current
//! time. [`ClientApplication`][crate::ClientApplication] drives them and
//! performs the cache access and network calls around them.

use credence_clock::{DurationSecs, UnixTime};
use serde::{Deserialize, Serialize};

use crate::{
    account::Account,
    braids::{AccessToken, ClientIdRef, IdToken},
    cache::{AccessTokenEntry, CredentialStore, RefreshTokenEntry},
    error::{Error, ServiceError},
    scope::Scopes,
};

/// A request to acquire a token without user interaction
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SilentRequest {
    /// A token for the application itself, served only from the cache
    App {
        /// Scopes the token must grant
        scopes: Scopes,
    },
    /// A token on behalf of a signed-in account
    Account {
        /// The account to acquire a token for
        account: Account,
        /// Scopes the token must grant
        scopes: Scopes,
        /// Refresh even if a usable token is cached
        force_refresh: bool,
    },
}

impl SilentRequest {
    /// A request for an application token
    pub fn for_app(scopes: Scopes) -> Self {
        Self::App { scopes }
    }

    /// A request for a token on behalf of `account`
    pub fn for_account(account: Account, scopes: Scopes) -> Self {
        Self::Account {
            account,
            scopes,
            force_refresh: false,
        }
    }

    /// Requires a refresh even if a usable token is cached
    ///
    /// Has no effect on application requests, which are never refreshed.
    pub fn with_force_refresh(mut self) -> Self {
        if let Self::Account { force_refresh, .. } = &mut self {
            *force_refresh = true;
        }
        self
    }

    /// The scopes requested
    pub fn scopes(&self) -> &Scopes {
        match self {
            Self::App { scopes } | Self::Account { scopes, .. } => scopes,
        }
    }
}

/// Why a refresh is needed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RefreshReason {
    /// The caller asked for a refresh
    Forced,
    /// No matching access token is cached
    Missing,
    /// The cached access token is expired or expires within the buffer
    Expired,
    /// The cached token is still usable but its refresh marker has elapsed
    RefreshOn,
}

impl RefreshReason {
    /// Whether a failed refresh may fall back to the cached token
    #[inline]
    pub fn is_soft(self) -> bool {
        self == Self::RefreshOn
    }
}

/// What to do with a cached access token
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision<'a> {
    /// Return the cached token
    CacheHit(&'a AccessTokenEntry),
    /// Acquire a new token with a refresh token
    NeedsRefresh(RefreshReason),
}

/// Decides whether the cached access token can be returned
///
/// An expired token always needs a refresh. Otherwise a forced refresh
/// takes precedence over an elapsed refresh marker.
pub fn decide(
    access_token: Option<&AccessTokenEntry>,
    force_refresh: bool,
    now: UnixTime,
    buffer: DurationSecs,
) -> Decision<'_> {
    let at = match access_token {
        Some(at) if !at.secret.as_str().is_empty() => at,
        _ => return Decision::NeedsRefresh(RefreshReason::Missing),
    };

    if !at.is_valid_at(now + buffer) {
        Decision::NeedsRefresh(RefreshReason::Expired)
    } else if force_refresh {
        Decision::NeedsRefresh(RefreshReason::Forced)
    } else if at.is_refresh_due_at(now) {
        Decision::NeedsRefresh(RefreshReason::RefreshOn)
    } else {
        Decision::CacheHit(at)
    }
}

/// Picks the refresh token to redeem for a client
///
/// A client known to belong to a family prefers the family token and falls
/// back to its own. Any other client prefers its own token and falls back to
/// a token of any family.
pub fn select_refresh_token<'a>(
    store: &'a CredentialStore,
    home_account_id: &str,
    client_id: &ClientIdRef,
    aliases: &[String],
) -> Option<&'a RefreshTokenEntry> {
    match store.family_id_for(client_id, aliases) {
        Some(family) => store
            .find_family_refresh_token(home_account_id, family, aliases)
            .or_else(|| store.find_refresh_token(home_account_id, client_id, aliases)),
        None => store
            .find_refresh_token(home_account_id, client_id, aliases)
            .or_else(|| store.find_any_family_refresh_token(home_account_id, aliases)),
    }
}

/// Where the returned token came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenSource {
    /// The token cache
    Cache,
    /// A token request to the identity provider
    IdentityProvider,
}

/// The result of a successful acquisition
#[derive(Clone, Debug)]
pub struct AuthenticationResult {
    /// The access token
    pub access_token: AccessToken,
    /// The ID token, if one is cached or was issued
    pub id_token: Option<IdToken>,
    /// When the access token expires
    pub expires_on: UnixTime,
    /// Scopes the access token grants
    pub scopes: Scopes,
    /// The account the token was issued to, if any
    pub account: Option<Account>,
    /// Where the token came from
    pub source: TokenSource,
}

impl AuthenticationResult {
    pub(crate) fn from_cache(
        entry: &AccessTokenEntry,
        id_token: Option<IdToken>,
        account: Option<Account>,
    ) -> Self {
        Self {
            access_token: entry.secret.clone(),
            id_token,
            expires_on: entry.expires_on,
            scopes: entry.target.clone(),
            account,
            source: TokenSource::Cache,
        }
    }
}

/// How a refresh attempt concluded
#[derive(Debug)]
pub enum RefreshOutcome {
    /// New tokens were issued
    Refreshed(AuthenticationResult),
    /// A proactive refresh failed and the still-valid cached token was kept
    Degraded {
        /// The cached result returned to the caller
        cached: AuthenticationResult,
        /// The failure that was suppressed
        error: ServiceError,
    },
}

impl RefreshOutcome {
    /// The result to hand back to the caller
    pub fn into_result(self) -> AuthenticationResult {
        match self {
            Self::Refreshed(result) | Self::Degraded { cached: result, .. } => result,
        }
    }
}

/// Classifies the result of a refresh
///
/// A service error is suppressed only when the refresh was proactive and a
/// cached token is available; every other failure is returned.
pub fn conclude_refresh(
    reason: RefreshReason,
    cached: Option<AuthenticationResult>,
    refreshed: Result<AuthenticationResult, ServiceError>,
) -> Result<RefreshOutcome, Error> {
    match (refreshed, cached) {
        (Ok(result), _) => Ok(RefreshOutcome::Refreshed(result)),
        (Err(error), Some(cached)) if reason.is_soft() => {
            Ok(RefreshOutcome::Degraded { cached, error })
        }
        (Err(error), _) => Err(Error::Service(error)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        braids::{ClientId, RefreshToken},
        cache::{AppMetadataEntry, CredentialType, ExtraFields},
    };

    const NOW: UnixTime = UnixTime(1_700_000_000);
    const BUFFER: DurationSecs = DurationSecs(300);

    fn at(expires_in: u64, refresh_on: Option<UnixTime>) -> AccessTokenEntry {
        AccessTokenEntry {
            home_account_id: "uid.utid".into(),
            environment: "login.windows.net".into(),
            credential_type: CredentialType::AccessToken,
            client_id: ClientId::from("client"),
            secret: AccessToken::from("at"),
            realm: "utid".into(),
            target: Scopes::from_space_delimited("read"),
            cached_at: NOW,
            expires_on: NOW + DurationSecs(expires_in),
            extended_expires_on: None,
            refresh_on,
            extra: ExtraFields::new(),
        }
    }

    #[test]
    fn refresh_decision_table() {
        use RefreshReason::*;

        // (force, refresh_on elapsed, expired) => refresh reason, or none for a hit
        let table = [
            ((false, false, false), None),
            ((false, false, true), Some(Expired)),
            ((false, true, false), Some(RefreshOn)),
            ((false, true, true), Some(Expired)),
            ((true, false, false), Some(Forced)),
            ((true, false, true), Some(Expired)),
            ((true, true, false), Some(Forced)),
            ((true, true, true), Some(Expired)),
        ];

        for ((force, refresh_due, expired), expected) in table {
            let refresh_on = if refresh_due {
                NOW - DurationSecs(1)
            } else {
                NOW + DurationSecs(60)
            };
            let lifetime = if expired { 299 } else { 3600 };
            let entry = at(lifetime, Some(refresh_on));
            let expected = match expected {
                Some(reason) => Decision::NeedsRefresh(reason),
                None => Decision::CacheHit(&entry),
            };

            assert_eq!(
                decide(Some(&entry), force, NOW, BUFFER),
                expected,
                "force={} refresh_due={} expired={}",
                force,
                refresh_due,
                expired
            );
        }
    }

    #[test]
    fn missing_or_blank_token_needs_refresh() {
        assert_eq!(
            decide(None, false, NOW, BUFFER),
            Decision::NeedsRefresh(RefreshReason::Missing)
        );

        let mut blank = at(3600, None);
        blank.secret = AccessToken::from("");
        assert_eq!(
            decide(Some(&blank), false, NOW, BUFFER),
            Decision::NeedsRefresh(RefreshReason::Missing)
        );
    }

    #[test]
    fn unset_refresh_marker_is_a_hit() {
        let entry = at(3600, None);
        assert_eq!(
            decide(Some(&entry), false, NOW, BUFFER),
            Decision::CacheHit(&entry)
        );
    }

    fn rt(client: &str, family: Option<&str>) -> RefreshTokenEntry {
        RefreshTokenEntry {
            home_account_id: "uid.utid".into(),
            environment: "login.windows.net".into(),
            credential_type: CredentialType::RefreshToken,
            client_id: ClientId::from(client),
            secret: RefreshToken::from(format!("rt-{}", client)),
            family_id: family.map(Into::into),
            extra: ExtraFields::new(),
        }
    }

    fn selected(store: &CredentialStore) -> Option<&str> {
        let aliases = vec!["login.windows.net".to_owned()];
        let client = ClientId::from("client");
        select_refresh_token(store, "uid.utid", &client, &aliases).map(|e| e.secret.as_str())
    }

    #[test]
    fn family_member_prefers_family_token() {
        let mut store = CredentialStore::new();
        store.put_refresh_token(rt("client", None));
        store.put_refresh_token(rt("sibling", Some("1")));
        store.put_app_metadata(AppMetadataEntry {
            client_id: ClientId::from("client"),
            environment: "login.windows.net".into(),
            family_id: Some("1".into()),
            extra: ExtraFields::new(),
        });

        assert_eq!(selected(&store), Some("rt-sibling"));
    }

    #[test]
    fn family_member_falls_back_to_own_token() {
        let mut store = CredentialStore::new();
        store.put_refresh_token(rt("client", None));
        store.put_app_metadata(AppMetadataEntry {
            client_id: ClientId::from("client"),
            environment: "login.windows.net".into(),
            family_id: Some("1".into()),
            extra: ExtraFields::new(),
        });

        assert_eq!(selected(&store), Some("rt-client"));
    }

    #[test]
    fn unknown_membership_prefers_own_token() {
        let mut store = CredentialStore::new();
        store.put_refresh_token(rt("client", None));
        store.put_refresh_token(rt("sibling", Some("1")));
        assert_eq!(selected(&store), Some("rt-client"));

        let mut store = CredentialStore::new();
        store.put_refresh_token(rt("sibling", Some("1")));
        assert_eq!(selected(&store), Some("rt-sibling"));
    }

    fn result(token: &str) -> AuthenticationResult {
        AuthenticationResult {
            access_token: AccessToken::from(token),
            id_token: None,
            expires_on: NOW + DurationSecs(600),
            scopes: Scopes::from_space_delimited("read"),
            account: None,
            source: TokenSource::Cache,
        }
    }

    #[test]
    fn only_proactive_refresh_degrades() {
        let failure = || Err(ServiceError::with_status(503));

        let outcome = conclude_refresh(RefreshReason::RefreshOn, Some(result("cached")), failure());
        match outcome {
            Ok(RefreshOutcome::Degraded { cached, error }) => {
                assert_eq!(cached.access_token.as_str(), "cached");
                assert_eq!(error.status, Some(503));
            }
            other => panic!("expected degraded outcome, got {:?}", other),
        }

        for reason in [RefreshReason::Forced, RefreshReason::Expired, RefreshReason::Missing] {
            let outcome = conclude_refresh(reason, Some(result("cached")), failure());
            assert!(matches!(outcome, Err(Error::Service(_))), "{:?}", reason);
        }
    }

    #[test]
    fn success_is_refreshed() {
        let outcome = conclude_refresh(RefreshReason::Forced, None, Ok(result("new"))).unwrap();
        assert_eq!(outcome.into_result().access_token.as_str(), "new");
    }
}
