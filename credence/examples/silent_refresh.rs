use std::{path::PathBuf, time::Duration};

use clap::Parser;
use credence::{
    cache::FileCacheHook, Authority, ClientApplication, RefreshToken, Scopes, SilentRequest,
};
use tokio::time;

#[derive(Debug, Parser)]
struct Opts {
    /// The authority to acquire tokens from
    #[clap(short, long, env, default_value = "https://login.microsoftonline.com/common")]
    authority: String,

    /// The client ID of the application
    #[clap(short, long, env)]
    client_id: String,

    /// Space-delimited scopes to request
    #[clap(short, long, env, default_value = "User.Read")]
    scopes: String,

    /// A refresh token obtained elsewhere, redeemed once to seed the cache
    #[clap(short, long, env, hide_env_values = true)]
    refresh_token: Option<String>,

    /// The local file used to cache tokens
    #[clap(short = 'f', long, env, default_value = ".token_cache.json")]
    cache_file: PathBuf,

    /// Seconds between silent acquisitions
    #[clap(short, long, env, default_value_t = 30)]
    interval: u64,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let authority = Authority::parse(&opts.authority)?;
    let scopes = Scopes::from_space_delimited(&opts.scopes);

    let app = ClientApplication::builder(opts.client_id, authority)
        .with_cache_hook(FileCacheHook::new(opts.cache_file))
        .build();

    if let Some(refresh_token) = opts.refresh_token {
        let result = app
            .acquire_token_by_refresh_token(RefreshToken::from(refresh_token), &scopes)
            .await?;
        tracing::info!(
            token = format_args!("{:#?}", result.access_token),
            account = ?result.account.as_ref().map(|a| a.home_account_id()),
            "redeemed refresh token"
        );
    }

    let mut interval = time::interval(Duration::from_secs(opts.interval));
    loop {
        interval.tick().await;

        let accounts = app.accounts().await?;
        if accounts.is_empty() {
            tracing::warn!("no accounts in cache; pass a refresh token to seed it");
            return Ok(());
        }

        for account in accounts {
            let username = account.username().unwrap_or("<unknown>").to_owned();
            let request = SilentRequest::for_account(account, scopes.clone());
            match app.acquire_token_silently(request).await {
                Ok(result) => tracing::info!(
                    %username,
                    token = format_args!("{:#?}", result.access_token),
                    expires_on = result.expires_on.0,
                    source = ?result.source,
                    "acquired access token"
                ),
                Err(error) if error.is_cache_miss() => tracing::warn!(
                    %username,
                    error = (&error as &dyn std::error::Error),
                    "interactive sign-in required"
                ),
                Err(error) => tracing::error!(
                    %username,
                    error = (&error as &dyn std::error::Error),
                    "silent acquisition failed"
                ),
            }
        }
    }
}
