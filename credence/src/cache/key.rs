//! Derivation of the string keys that index each cache bucket
//!
//! A key is its lowercased segments joined by `-`. Segment values are escaped
//! before joining (`%` becomes `%25` and `-` becomes `%2d`), so a value that
//! contains the separator can never shift a segment boundary and collide with
//! a different entity's key.

use std::borrow::Cow;

use crate::braids::ClientIdRef;

const SEPARATOR: char = '-';

/// The credential type names recorded in the cache
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum CredentialType {
    /// An access token
    AccessToken,
    /// A refresh token
    RefreshToken,
    /// An ID token
    IdToken,
}

impl CredentialType {
    /// The name of the credential type as used in keys and records
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AccessToken => "AccessToken",
            Self::RefreshToken => "RefreshToken",
            Self::IdToken => "IdToken",
        }
    }
}

/// Escapes a single key segment and lowercases it
pub fn escape_segment(segment: &str) -> Cow<'_, str> {
    let needs_escape = segment.contains(SEPARATOR) || segment.contains('%');
    let needs_lower = segment.chars().any(|c| c.is_ascii_uppercase());

    if !needs_escape && !needs_lower {
        return Cow::Borrowed(segment);
    }

    let mut out = String::with_capacity(segment.len() + 4);
    for c in segment.chars() {
        match c {
            '%' => out.push_str("%25"),
            SEPARATOR => out.push_str("%2d"),
            c => out.push(c.to_ascii_lowercase()),
        }
    }
    Cow::Owned(out)
}

fn join(segments: &[&str]) -> String {
    let mut key = String::new();
    for (idx, segment) in segments.iter().enumerate() {
        if idx > 0 {
            key.push(SEPARATOR);
        }
        key.push_str(&escape_segment(segment));
    }
    key
}

/// Key of an access token entry
pub fn access_token_key(
    home_account_id: &str,
    environment: &str,
    client_id: &ClientIdRef,
    realm: &str,
    target: &str,
) -> String {
    join(&[
        home_account_id,
        environment,
        CredentialType::AccessToken.as_str(),
        client_id.as_str(),
        realm,
        target,
    ])
}

/// Key of a refresh token entry
///
/// Family refresh tokens are keyed by family ID in place of the client ID, so
/// all members of a family share one entry per account.
pub fn refresh_token_key(
    home_account_id: &str,
    environment: &str,
    client_id: &ClientIdRef,
    family_id: Option<&str>,
) -> String {
    let owner = family_id
        .filter(|f| !f.is_empty())
        .unwrap_or_else(|| client_id.as_str());
    join(&[
        home_account_id,
        environment,
        CredentialType::RefreshToken.as_str(),
        owner,
        "",
        "",
    ])
}

/// Key of an ID token entry
pub fn id_token_key(
    home_account_id: &str,
    environment: &str,
    client_id: &ClientIdRef,
    realm: &str,
) -> String {
    join(&[
        home_account_id,
        environment,
        CredentialType::IdToken.as_str(),
        client_id.as_str(),
        realm,
        "",
    ])
}

/// Key of an account entry
pub fn account_key(home_account_id: &str, environment: &str, realm: &str) -> String {
    join(&[home_account_id, environment, realm])
}

/// Key of an app metadata entry
pub fn app_metadata_key(environment: &str, client_id: &ClientIdRef) -> String {
    join(&["appmetadata", environment, client_id.as_str()])
}
