//! Writing the tokens of a token response into the store

use credence_clock::UnixTime;

use super::{
    entities::{
        AccessTokenEntry, AccountEntry, AppMetadataEntry, ExtraFields, IdTokenEntry, Merge,
        RefreshTokenEntry,
    },
    key::CredentialType,
    store::{in_aliases, CredentialStore},
};
use crate::{
    account::{Account, ClientInfo, IdTokenClaims},
    authority::Authority,
    braids::ClientIdRef,
    executor::TokenResponse,
    scope::Scopes,
};

/// What a token response was issued for
#[derive(Clone, Copy, Debug)]
pub struct TokenResponseContext<'a> {
    /// Authority the tokens were requested from
    pub authority: &'a Authority,
    /// Environment to record the tokens under
    ///
    /// This is the preferred cache host of the authority's alias set.
    pub environment: &'a str,
    /// Every host equivalent to `environment`
    pub aliases: &'a [String],
    /// Client the tokens were issued to
    pub client_id: &'a ClientIdRef,
    /// Scopes that were requested
    pub requested_scopes: &'a Scopes,
    /// Account the request was made on behalf of, if known
    pub account: Option<&'a Account>,
    /// When the response was received
    pub now: UnixTime,
}

impl CredentialStore {
    /// Stores every credential carried by a token response
    ///
    /// Access tokens of the same account, client, and tenant whose scopes
    /// overlap the new token's scopes are replaced. Returns the account the
    /// tokens belong to, if the response or the context identifies one.
    pub fn save_token_response(
        &mut self,
        context: &TokenResponseContext<'_>,
        response: &TokenResponse,
    ) -> Option<Account> {
        let claims = response
            .id_token
            .as_ref()
            .and_then(|t| IdTokenClaims::decode(t.as_str()))
            .unwrap_or_default();
        let client_info = response
            .client_info
            .as_deref()
            .and_then(ClientInfo::decode)
            .unwrap_or_default();

        let home_account_id = client_info
            .home_account_id()
            .or_else(|| context.account.map(|a| a.home_account_id().to_owned()))
            .unwrap_or_default();

        let tenantless = context.authority.is_tenantless();
        let account_tenant = context
            .account
            .map(|a| a.tenant_id())
            .filter(|t| !t.is_empty());

        // ID tokens and accounts record the tenant the user signed in to
        let realm = claims
            .tid
            .clone()
            .or_else(|| account_tenant.filter(|_| tenantless).map(str::to_owned))
            .unwrap_or_else(|| context.authority.tenant().to_owned());

        // Access tokens are found by the tenant they were requested from
        let token_realm = if tenantless {
            account_tenant
                .map(str::to_owned)
                .or_else(|| claims.tid.clone())
                .unwrap_or_else(|| context.authority.tenant().to_owned())
        } else {
            context.authority.tenant().to_owned()
        };

        let granted = if response.scopes.is_empty() {
            context.requested_scopes
        } else {
            &response.scopes
        };
        let target = granted.without_reserved();
        let environment = context.environment.to_ascii_lowercase();
        let client_id = context.client_id.to_owned();
        let family_id = response.family_id.clone().filter(|f| !f.is_empty());

        self.access_tokens.retain(|_, e| {
            !(e.home_account_id.eq_ignore_ascii_case(&home_account_id)
                && (e.environment.eq_ignore_ascii_case(&environment)
                    || in_aliases(&e.environment, context.aliases))
                && e.realm.eq_ignore_ascii_case(&token_realm)
                && e.client_id.as_str().eq_ignore_ascii_case(client_id.as_str())
                && e.target.intersects(&target))
        });

        self.put_access_token(AccessTokenEntry {
            home_account_id: home_account_id.clone(),
            environment: environment.clone(),
            credential_type: CredentialType::AccessToken,
            client_id: client_id.clone(),
            secret: response.access_token.clone(),
            realm: token_realm,
            target,
            cached_at: context.now,
            expires_on: response.expires_on,
            extended_expires_on: response.ext_expires_on,
            refresh_on: response.refresh_on,
            extra: ExtraFields::new(),
        });

        if let Some(refresh_token) = &response.refresh_token {
            self.put_refresh_token(RefreshTokenEntry {
                home_account_id: home_account_id.clone(),
                environment: environment.clone(),
                credential_type: CredentialType::RefreshToken,
                client_id: client_id.clone(),
                secret: refresh_token.clone(),
                family_id: family_id.clone(),
                extra: ExtraFields::new(),
            });
        }

        if let Some(id_token) = &response.id_token {
            self.put_id_token(IdTokenEntry {
                home_account_id: home_account_id.clone(),
                environment: environment.clone(),
                credential_type: CredentialType::IdToken,
                client_id: client_id.clone(),
                secret: id_token.clone(),
                realm: realm.clone(),
                extra: ExtraFields::new(),
            });
        }

        self.put_app_metadata(AppMetadataEntry {
            client_id,
            environment: environment.clone(),
            family_id,
            extra: ExtraFields::new(),
        });

        if home_account_id.is_empty() {
            return None;
        }

        let account = AccountEntry {
            home_account_id,
            environment,
            realm,
            local_account_id: claims
                .local_account_id()
                .map(str::to_owned)
                .or_else(|| client_info.uid.clone()),
            username: claims
                .username()
                .map(str::to_owned)
                .or_else(|| context.account.and_then(|a| a.username().map(str::to_owned))),
            name: claims.name.clone(),
            authority_type: Some(context.authority.kind().cache_name().to_owned()),
            client_info: response.client_info.clone(),
            extra: ExtraFields::new(),
        };

        let handle = Account::from(&account);
        let key = account.key();
        match self.accounts.get_mut(&key) {
            Some(existing) => existing.merge_from(account),
            None => {
                self.accounts.insert(key, account);
            }
        }

        Some(handle)
    }
}
