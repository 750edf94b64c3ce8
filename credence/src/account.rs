//! Accounts and the identity claims they are derived from

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::cache::AccountEntry;

/// A signed-in account, as returned from and passed to the cache
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    home_account_id: String,
    environment: String,
    tenant_id: String,
    username: Option<String>,
    name: Option<String>,
}

impl Account {
    /// Constructs an account handle
    pub fn new(
        home_account_id: impl Into<String>,
        environment: impl Into<String>,
        tenant_id: impl Into<String>,
    ) -> Self {
        Self {
            home_account_id: home_account_id.into(),
            environment: environment.into(),
            tenant_id: tenant_id.into(),
            username: None,
            name: None,
        }
    }

    /// Sets the sign-in name
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// The account's identifier in its home tenant, `uid.utid`
    #[inline]
    pub fn home_account_id(&self) -> &str {
        &self.home_account_id
    }

    /// Host the account signed in through
    #[inline]
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// The tenant this handle refers to
    #[inline]
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Sign-in name, if known
    #[inline]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Display name, if known
    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl From<&AccountEntry> for Account {
    fn from(entry: &AccountEntry) -> Self {
        Self {
            home_account_id: entry.home_account_id.clone(),
            environment: entry.environment.clone(),
            tenant_id: entry.realm.clone(),
            username: entry.username.clone(),
            name: entry.name.clone(),
        }
    }
}

/// The `client_info` blob returned alongside user tokens
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub(crate) struct ClientInfo {
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub utid: Option<String>,
}

impl ClientInfo {
    pub(crate) fn decode(raw: &str) -> Option<Self> {
        decode_json(raw)
    }

    pub(crate) fn home_account_id(&self) -> Option<String> {
        match (&self.uid, &self.utid) {
            (Some(uid), Some(utid)) => Some(format!("{}.{}", uid, utid)),
            _ => None,
        }
    }
}

/// The identity claims read from an ID token
///
/// The token was received directly from the token endpoint over TLS, so its
/// signature is not verified here.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub(crate) struct IdTokenClaims {
    #[serde(default)]
    pub oid: Option<String>,
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub tid: Option<String>,
    #[serde(default)]
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub upn: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl IdTokenClaims {
    pub(crate) fn decode(token: &str) -> Option<Self> {
        let payload = token.split('.').nth(1)?;
        decode_json(payload)
    }

    pub(crate) fn local_account_id(&self) -> Option<&str> {
        self.oid.as_deref().or(self.sub.as_deref())
    }

    pub(crate) fn username(&self) -> Option<&str> {
        self.preferred_username
            .as_deref()
            .or(self.upn.as_deref())
            .or(self.email.as_deref())
    }
}

fn decode_json<T: DeserializeOwned>(raw: &str) -> Option<T> {
    let bytes = match URL_SAFE_NO_PAD.decode(raw.trim_end_matches('=')) {
        Ok(bytes) => bytes,
        Err(error) => {
            tracing::debug!(error = (&error as &dyn std::error::Error), "unable to decode base64 payload");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(error) => {
            tracing::debug!(error = (&error as &dyn std::error::Error), "unable to parse identity payload");
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

    /// Builds an unsigned ID token carrying `claims`
    pub(crate) fn id_token(claims: serde_json::Value) -> String {
        format!(
            "{}.{}.sig",
            URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#),
            URL_SAFE_NO_PAD.encode(claims.to_string())
        )
    }

    /// Builds a `client_info` blob
    pub(crate) fn client_info(uid: &str, utid: &str) -> String {
        URL_SAFE_NO_PAD.encode(serde_json::json!({ "uid": uid, "utid": utid }).to_string())
    }
}
