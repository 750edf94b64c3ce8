//! Scope sets as requested from and granted by the identity provider

use std::{collections::btree_set, collections::BTreeSet, fmt, iter::FromIterator};

use serde::{Deserialize, Serialize};

/// Scopes the library adds to every user token request
///
/// These are OpenID Connect scopes and never appear in an access token's
/// target, so they are ignored when matching cached tokens.
pub const RESERVED_SCOPES: [&str; 3] = ["openid", "profile", "offline_access"];

/// A set of OAuth2 scopes
///
/// Iteration and the space-delimited [`Display`][fmt::Display] form are in a
/// stable, sorted order so that the cache key derived from a scope set is
/// deterministic.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Scopes(BTreeSet<String>);

impl Scopes {
    /// Produces an empty scope set
    #[inline]
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Parses a space-delimited scope string
    pub fn from_space_delimited(s: &str) -> Self {
        s.split_whitespace().map(str::to_owned).collect()
    }

    /// Adds a scope to the scope set
    #[inline]
    pub fn insert(&mut self, scope: impl Into<String>) {
        self.0.insert(scope.into());
    }

    /// Whether the set holds no scopes
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Produces an iterator of the scopes in this set
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Checks to see whether this set of scopes contains all of
    /// the scopes required
    ///
    /// Scopes compare ASCII case-insensitively.
    pub fn contains_all(&self, required: &Scopes) -> bool {
        required
            .iter()
            .all(|r| self.iter().any(|s| s.eq_ignore_ascii_case(r)))
    }

    /// Whether any scope appears in both sets
    pub fn intersects(&self, other: &Scopes) -> bool {
        other
            .iter()
            .any(|o| self.iter().any(|s| s.eq_ignore_ascii_case(o)))
    }

    /// A copy of this set without the reserved OpenID Connect scopes
    pub fn without_reserved(&self) -> Self {
        self.iter()
            .filter(|s| !RESERVED_SCOPES.iter().any(|r| r.eq_ignore_ascii_case(s)))
            .map(str::to_owned)
            .collect()
    }

    /// A copy of this set with the reserved OpenID Connect scopes added
    pub fn with_reserved(&self) -> Self {
        let mut out = self.clone();
        out.extend(RESERVED_SCOPES.iter().map(|s| (*s).to_owned()));
        out
    }
}

impl fmt::Display for Scopes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for scope in &self.0 {
            if !first {
                f.write_str(" ")?;
            }
            f.write_str(scope)?;
            first = false;
        }
        Ok(())
    }
}

impl From<String> for Scopes {
    fn from(s: String) -> Self {
        Self::from_space_delimited(&s)
    }
}

impl From<Scopes> for String {
    fn from(s: Scopes) -> Self {
        s.to_string()
    }
}

impl<S: Into<String>> FromIterator<S> for Scopes {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl<S: Into<String>> Extend<S> for Scopes {
    #[inline]
    fn extend<I: IntoIterator<Item = S>>(&mut self, iter: I) {
        self.0.extend(iter.into_iter().map(Into::into))
    }
}

impl IntoIterator for Scopes {
    type Item = String;
    type IntoIter = btree_set::IntoIter<String>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_sorted_and_space_joined() {
        let scopes: Scopes = ["write", "read"].into_iter().collect();
        assert_eq!(scopes.to_string(), "read write");
    }

    #[test]
    fn superset_matching_ignores_case() {
        let granted = Scopes::from_space_delimited("User.Read Mail.Send");
        let requested = Scopes::from_space_delimited("user.read");
        assert!(granted.contains_all(&requested));
        assert!(!requested.contains_all(&granted));
    }

    #[test]
    fn empty_request_is_always_satisfied() {
        assert!(Scopes::from_space_delimited("a").contains_all(&Scopes::new()));
    }

    #[test]
    fn reserved_scopes_are_stripped() {
        let scopes = Scopes::from_space_delimited("openid read Profile offline_access");
        assert_eq!(scopes.without_reserved().to_string(), "read");
        assert_eq!(
            Scopes::from_space_delimited("read").with_reserved().to_string(),
            "offline_access openid profile read"
        );
    }

    #[test]
    fn serializes_as_a_string() {
        let scopes = Scopes::from_space_delimited("b a");
        let json = serde_json::to_string(&scopes).unwrap();
        assert_eq!(json, "\"a b\"");
        let back: Scopes = serde_json::from_str(&json).unwrap();
        assert_eq!(back, scopes);
    }
}
