//! Parsing and classification of authority URLs

use std::fmt;

use url::Url;

use crate::error::InvalidAuthority;

/// Path segment that marks an ADFS authority
const ADFS_SEGMENT: &str = "adfs";

/// Path segment that marks a B2C authority
const B2C_SEGMENT: &str = "tfp";

/// Tenants that do not name a specific directory
const TENANTLESS: [&str; 3] = ["common", "organizations", "consumers"];

/// The family of identity provider an authority belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AuthorityKind {
    /// A multi-tenant directory authority that supports instance discovery
    Aad,
    /// An on-premises federation service
    Adfs,
    /// A consumer identity authority with user-flow policies
    B2c,
}

impl AuthorityKind {
    /// The name recorded as an account's authority type in the cache
    pub fn cache_name(self) -> &'static str {
        match self {
            Self::Aad => "MSSTS",
            Self::Adfs => "ADFS",
            Self::B2c => "B2C",
        }
    }
}

/// An issuer that the application trusts to issue tokens
///
/// ```
/// use credence::{Authority, AuthorityKind};
///
/// let authority = Authority::parse("https://login.microsoftonline.com/contoso.onmicrosoft.com")?;
/// assert_eq!(authority.host(), "login.microsoftonline.com");
/// assert_eq!(authority.tenant(), "contoso.onmicrosoft.com");
/// assert_eq!(authority.kind(), AuthorityKind::Aad);
/// # Ok::<(), credence::InvalidAuthority>(())
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct Authority {
    kind: AuthorityKind,
    host: String,
    tenant: String,
    policy: Option<String>,
    canonical: Url,
    token_endpoint: Url,
    authorize_endpoint: Url,
}

impl Authority {
    /// Parses and validates an authority URL
    ///
    /// The URL must use `https`, carry neither query nor fragment, and have at
    /// least one path segment naming the tenant.
    pub fn parse(authority: &str) -> Result<Self, InvalidAuthority> {
        let url = Url::parse(authority)?;

        if url.scheme() != "https" {
            return Err(InvalidAuthority::InsecureScheme(url.scheme().to_owned()));
        }
        if url.query().is_some() {
            return Err(InvalidAuthority::HasQuery);
        }
        if url.fragment().is_some() {
            return Err(InvalidAuthority::HasFragment);
        }

        let host = match (url.host_str(), url.port()) {
            (Some(h), Some(port)) => format!("{}:{}", h.to_ascii_lowercase(), port),
            (Some(h), None) => h.to_ascii_lowercase(),
            (None, _) => return Err(InvalidAuthority::MissingHost),
        };

        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|p| !p.is_empty()).collect())
            .unwrap_or_default();

        let first = segments.first().ok_or(InvalidAuthority::MissingPath)?;

        let (kind, tenant, policy) = if first.eq_ignore_ascii_case(ADFS_SEGMENT) {
            (AuthorityKind::Adfs, ADFS_SEGMENT.to_owned(), None)
        } else if first.eq_ignore_ascii_case(B2C_SEGMENT) {
            match (segments.get(1), segments.get(2)) {
                (Some(tenant), Some(policy)) => (
                    AuthorityKind::B2c,
                    (*tenant).to_owned(),
                    Some((*policy).to_owned()),
                ),
                _ => return Err(InvalidAuthority::UnsupportedB2c),
            }
        } else {
            (AuthorityKind::Aad, (*first).to_owned(), None)
        };

        Self::from_parts(kind, host, tenant, policy)
    }

    fn from_parts(
        kind: AuthorityKind,
        host: String,
        tenant: String,
        policy: Option<String>,
    ) -> Result<Self, InvalidAuthority> {
        let base = match (&kind, &policy) {
            (AuthorityKind::Adfs, _) => format!("https://{}/{}/", host, ADFS_SEGMENT),
            (AuthorityKind::B2c, Some(policy)) => {
                format!("https://{}/{}/{}/{}/", host, B2C_SEGMENT, tenant, policy)
            }
            (AuthorityKind::B2c, None) => return Err(InvalidAuthority::UnsupportedB2c),
            (AuthorityKind::Aad, _) => format!("https://{}/{}/", host, tenant),
        };

        let canonical = Url::parse(&base)?;
        let (token_endpoint, authorize_endpoint) = match kind {
            AuthorityKind::Adfs => (
                canonical.join("oauth2/token")?,
                canonical.join("oauth2/authorize")?,
            ),
            AuthorityKind::Aad | AuthorityKind::B2c => (
                canonical.join("oauth2/v2.0/token")?,
                canonical.join("oauth2/v2.0/authorize")?,
            ),
        };

        Ok(Self {
            kind,
            host,
            tenant,
            policy,
            canonical,
            token_endpoint,
            authorize_endpoint,
        })
    }

    /// The kind of authority
    #[inline]
    pub fn kind(&self) -> AuthorityKind {
        self.kind
    }

    /// The lowercased host, including a non-default port
    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The tenant named by the authority
    #[inline]
    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// The B2C user-flow policy, for B2C authorities
    #[inline]
    pub fn policy(&self) -> Option<&str> {
        self.policy.as_deref()
    }

    /// Whether the tenant is a multi-tenant alias rather than a directory
    pub fn is_tenantless(&self) -> bool {
        self.kind == AuthorityKind::Aad
            && TENANTLESS
                .iter()
                .any(|t| t.eq_ignore_ascii_case(&self.tenant))
    }

    /// The canonical form of the authority URL, with a trailing slash
    #[inline]
    pub fn canonical(&self) -> &Url {
        &self.canonical
    }

    /// The token endpoint of this authority
    #[inline]
    pub fn token_endpoint(&self) -> &Url {
        &self.token_endpoint
    }

    /// The authorization endpoint of this authority
    #[inline]
    pub fn authorize_endpoint(&self) -> &Url {
        &self.authorize_endpoint
    }

    /// Targets the same host at a different tenant
    ///
    /// Only directory authorities can change tenant; others are returned as is.
    pub fn with_tenant(&self, tenant: &str) -> Result<Self, InvalidAuthority> {
        if self.kind != AuthorityKind::Aad || self.tenant.eq_ignore_ascii_case(tenant) {
            return Ok(self.clone());
        }
        if tenant.is_empty() || tenant.contains('/') {
            return Err(InvalidAuthority::MissingPath);
        }
        Self::from_parts(self.kind, self.host.clone(), tenant.to_owned(), None)
    }
}

impl fmt::Debug for Authority {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Authority")
            .field("kind", &self.kind)
            .field("url", &self.canonical.as_str())
            .finish()
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.canonical.as_str())
    }
}
