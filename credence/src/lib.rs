//! A token cache and silent token acquisition for OAuth2/OpenID Connect public clients
//!
//! This crate keeps the tokens an application has obtained from a Microsoft
//! identity platform style authority (Azure AD, B2C, or ADFS) and answers
//! later token requests from that cache, redeeming a refresh token only when
//! the cached access token is missing, expiring, or due for a proactive
//! refresh.
//!
//! The same credentials may be known under several equivalent hostnames of a
//! cloud instance. Instance discovery resolves these aliases once per host
//! and every cache lookup searches all of them, so tokens cached under one
//! alias are found through another.
//!
//! The cache can be shared between processes through a
//! [`CacheAccessHook`][cache::CacheAccessHook], which loads persisted text
//! before each access and stores it afterwards. Saving merges the in-memory
//! state into the most recently loaded text so that concurrent writers do not
//! clobber each other.
//!
//! ```no_run
//! use credence::{cache::FileCacheHook, Authority, ClientApplication, Scopes, SilentRequest};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let authority = Authority::parse("https://login.microsoftonline.com/common")?;
//!
//! let app = ClientApplication::builder("00000000-0000-0000-0000-000000000000", authority)
//!     .with_cache_hook(FileCacheHook::new("token_cache.json"))
//!     .build();
//!
//! let scopes = Scopes::from_space_delimited("User.Read");
//! for account in app.accounts().await? {
//!     let result = app
//!         .acquire_token_silently(SilentRequest::for_account(account, scopes.clone()))
//!         .await?;
//!
//!     tracing::info!(
//!         token = format_args!("{:#?}", result.access_token),
//!         source = ?result.source,
//!         "acquired access token"
//!     );
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! The following features are supported by this crate, all of which are enabled by default:
//!
//! * `http`: Provides implementations of instance discovery and refresh token redemption
//!   over HTTPS using [reqwest].
//! * `file`: Provides a cache hook that persists the token cache to the local filesystem.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod account;
mod application;
pub mod authority;
mod braids;
pub mod cache;
pub mod discovery;
mod error;
pub mod executor;
pub mod scope;
pub mod silent;

pub use account::Account;
pub use application::{ApplicationConfig, ClientApplication, ClientApplicationBuilder};
pub use authority::{Authority, AuthorityKind};
pub use braids::*;
pub use error::{CacheMissReason, DiscoveryError, Error, InvalidAuthority, Result, ServiceError};
pub use scope::Scopes;
pub use silent::{AuthenticationResult, SilentRequest, TokenSource};
