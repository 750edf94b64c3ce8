//! The records held in each cache bucket
//!
//! Records keep any fields they do not recognize in `extra`, so that a cache
//! file shared with other libraries survives a load and save unchanged.

use std::collections::BTreeMap;

use credence_clock::UnixTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::key::{self, CredentialType};
use crate::{
    braids::{AccessToken, ClientId, IdToken, RefreshToken},
    scope::Scopes,
};

/// Unrecognized fields carried through from a persisted record
pub type ExtraFields = BTreeMap<String, Value>;

/// Combines a record with a newer copy of itself
///
/// Every recognized field is taken from `update`, including optional fields
/// it leaves unset. Unrecognized fields are merged key by key, so those only
/// the existing record carries are kept.
pub trait Merge {
    /// Merges `update` into `self`
    fn merge_from(&mut self, update: Self);
}

macro_rules! merge_record {
    ($ty:ty { $($field:ident),* $(,)? }) => {
        impl Merge for $ty {
            fn merge_from(&mut self, update: Self) {
                $(self.$field = update.$field;)*
                merge_extra(&mut self.extra, update.extra);
            }
        }
    };
}

/// Key-wise merge of unrecognized fields, recursing into nested objects
pub(crate) fn merge_extra(existing: &mut ExtraFields, update: ExtraFields) {
    for (name, value) in update {
        match existing.get_mut(&name) {
            Some(current) => merge_value(current, value),
            None => {
                existing.insert(name, value);
            }
        }
    }
}

pub(crate) fn merge_value(existing: &mut Value, update: Value) {
    match (existing, update) {
        (Value::Object(current), Value::Object(update)) => {
            for (name, value) in update {
                match current.get_mut(&name) {
                    Some(slot) => merge_value(slot, value),
                    None => {
                        current.insert(name, value);
                    }
                }
            }
        }
        (slot, update) => *slot = update,
    }
}

/// A cached access token
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTokenEntry {
    /// Home account the token was issued to, empty for application tokens
    #[serde(default)]
    pub home_account_id: String,
    /// Host the token was issued by
    pub environment: String,
    /// Always [`CredentialType::AccessToken`]
    pub credential_type: CredentialType,
    /// Client the token was issued to
    pub client_id: ClientId,
    /// The token itself
    pub secret: AccessToken,
    /// Tenant the token was issued in
    #[serde(default)]
    pub realm: String,
    /// Scopes the token grants
    pub target: Scopes,
    /// When the token was cached
    #[serde(with = "super::time")]
    pub cached_at: UnixTime,
    /// When the token stops being valid
    #[serde(with = "super::time")]
    pub expires_on: UnixTime,
    /// Extended validity for use while the service is degraded
    #[serde(default, with = "super::time::option", skip_serializing_if = "Option::is_none")]
    pub extended_expires_on: Option<UnixTime>,
    /// When a proactive refresh should be attempted
    #[serde(default, with = "super::time::option", skip_serializing_if = "Option::is_none")]
    pub refresh_on: Option<UnixTime>,
    /// Unrecognized fields
    #[serde(flatten)]
    pub extra: ExtraFields,
}

merge_record!(AccessTokenEntry {
    home_account_id, environment, credential_type, client_id, secret, realm, target,
    cached_at, expires_on, extended_expires_on, refresh_on,
});

impl AccessTokenEntry {
    /// The key this entry is stored under
    pub fn key(&self) -> String {
        key::access_token_key(
            &self.home_account_id,
            &self.environment,
            &self.client_id,
            &self.realm,
            &self.target.to_string(),
        )
    }

    /// Whether the token is still valid at `time`
    #[inline]
    pub fn is_valid_at(&self, time: UnixTime) -> bool {
        time < self.expires_on
    }

    /// Whether a proactive refresh is due at `time`
    #[inline]
    pub fn is_refresh_due_at(&self, time: UnixTime) -> bool {
        self.refresh_on.map_or(false, |r| r <= time)
    }
}

/// A cached refresh token
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTokenEntry {
    /// Home account the token was issued to
    pub home_account_id: String,
    /// Host the token was issued by
    pub environment: String,
    /// Always [`CredentialType::RefreshToken`]
    pub credential_type: CredentialType,
    /// Client the token was issued to
    pub client_id: ClientId,
    /// The token itself
    pub secret: RefreshToken,
    /// The client family that shares this token, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_id: Option<String>,
    /// Unrecognized fields
    #[serde(flatten)]
    pub extra: ExtraFields,
}

merge_record!(RefreshTokenEntry {
    home_account_id, environment, credential_type, client_id, secret, family_id,
});

impl RefreshTokenEntry {
    /// The key this entry is stored under
    pub fn key(&self) -> String {
        key::refresh_token_key(
            &self.home_account_id,
            &self.environment,
            &self.client_id,
            self.family_id.as_deref(),
        )
    }

    /// The family this token belongs to, if it is a family token
    pub fn family(&self) -> Option<&str> {
        self.family_id.as_deref().filter(|f| !f.is_empty())
    }
}

/// A cached ID token
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdTokenEntry {
    /// Home account the token was issued to
    pub home_account_id: String,
    /// Host the token was issued by
    pub environment: String,
    /// Always [`CredentialType::IdToken`]
    pub credential_type: CredentialType,
    /// Client the token was issued to
    pub client_id: ClientId,
    /// The raw token
    pub secret: IdToken,
    /// Tenant the token was issued in
    #[serde(default)]
    pub realm: String,
    /// Unrecognized fields
    #[serde(flatten)]
    pub extra: ExtraFields,
}

merge_record!(IdTokenEntry {
    home_account_id, environment, credential_type, client_id, secret, realm,
});

impl IdTokenEntry {
    /// The key this entry is stored under
    pub fn key(&self) -> String {
        key::id_token_key(
            &self.home_account_id,
            &self.environment,
            &self.client_id,
            &self.realm,
        )
    }
}

/// A cached account
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountEntry {
    /// Identifier of the account in its home tenant
    pub home_account_id: String,
    /// Host the account was signed in through
    pub environment: String,
    /// Tenant this entry describes
    #[serde(default)]
    pub realm: String,
    /// Identifier of the account within `realm`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_account_id: Option<String>,
    /// Sign-in name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Kind of authority that issued the account's tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authority_type: Option<String>,
    /// Opaque client info blob returned by the service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_info: Option<String>,
    /// Unrecognized fields
    #[serde(flatten)]
    pub extra: ExtraFields,
}

merge_record!(AccountEntry {
    home_account_id, environment, realm, local_account_id, username, name,
    authority_type, client_info,
});

impl AccountEntry {
    /// The key this entry is stored under
    pub fn key(&self) -> String {
        key::account_key(&self.home_account_id, &self.environment, &self.realm)
    }
}

/// Per-application metadata
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMetadataEntry {
    /// The application
    pub client_id: ClientId,
    /// Host the metadata was learned from
    pub environment: String,
    /// The client family the application belongs to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_id: Option<String>,
    /// Unrecognized fields
    #[serde(flatten)]
    pub extra: ExtraFields,
}

merge_record!(AppMetadataEntry {
    client_id, environment, family_id,
});

impl AppMetadataEntry {
    /// The key this entry is stored under
    pub fn key(&self) -> String {
        key::app_metadata_key(&self.environment, &self.client_id)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn account(username: Option<&str>) -> AccountEntry {
        AccountEntry {
            home_account_id: "uid.utid".into(),
            environment: "login.windows.net".into(),
            realm: "utid".into(),
            local_account_id: Some("uid".into()),
            username: username.map(Into::into),
            name: None,
            authority_type: Some("MSSTS".into()),
            client_info: None,
            extra: ExtraFields::new(),
        }
    }

    #[test]
    fn merge_replaces_known_fields_and_keeps_unknown_ones() {
        let mut old = account(Some("old@contoso.com"));
        old.name = Some("Old Name".into());
        old.extra.insert("vendor".into(), json!({"a": 1, "b": 2}));

        let mut update = account(Some("new@contoso.com"));
        update.extra.insert("vendor".into(), json!({"b": 3}));

        old.merge_from(update);

        assert_eq!(old.username.as_deref(), Some("new@contoso.com"));
        assert_eq!(old.name, None);
        assert_eq!(old.extra["vendor"], json!({"a": 1, "b": 3}));
    }

    #[test]
    fn unset_refresh_marker_clears_the_old_one() {
        let entry = |secret: &str, refresh_on: Option<UnixTime>| AccessTokenEntry {
            home_account_id: "uid.utid".into(),
            environment: "login.windows.net".into(),
            credential_type: CredentialType::AccessToken,
            client_id: ClientId::from("c"),
            secret: AccessToken::from(secret),
            realm: "utid".into(),
            target: Scopes::from_space_delimited("read"),
            cached_at: UnixTime(100),
            expires_on: UnixTime(700),
            extended_expires_on: None,
            refresh_on,
            extra: ExtraFields::new(),
        };

        let mut old = entry("old", Some(UnixTime(40)));
        old.merge_from(entry("new", None));

        assert_eq!(old.secret.as_str(), "new");
        assert_eq!(old.refresh_on, None);
    }

    #[test]
    fn unknown_fields_round_trip() {
        let text = r#"{
            "home_account_id": "uid.utid",
            "environment": "login.windows.net",
            "credential_type": "RefreshToken",
            "client_id": "c",
            "secret": "rt",
            "last_modification_time": "1600000000"
        }"#;
        let entry: RefreshTokenEntry = serde_json::from_str(text).unwrap();
        assert_eq!(entry.family(), None);
        assert_eq!(entry.extra["last_modification_time"], json!("1600000000"));

        let back = serde_json::to_value(&entry).unwrap();
        assert_eq!(back["last_modification_time"], json!("1600000000"));
        assert!(back.get("family_id").is_none());
    }

    #[test]
    fn empty_family_is_no_family() {
        let entry = RefreshTokenEntry {
            home_account_id: "h".into(),
            environment: "e".into(),
            credential_type: CredentialType::RefreshToken,
            client_id: ClientId::from("c"),
            secret: RefreshToken::from("s"),
            family_id: Some(String::new()),
            extra: ExtraFields::new(),
        };
        assert_eq!(entry.family(), None);
        assert_eq!(entry.key(), "h-e-refreshtoken-c--");
    }
}
