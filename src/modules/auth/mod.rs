pub mod oauth;
pub mod oauth_server;

use crate::models::{Account, Credential};

// Turn a completed OAuth flow into a pool account: the userinfo endpoint
// supplies the unique email key, the refresh token becomes the composite
// credential (project segments are discovered later by the resolver).
pub async fn account_from_token_response(
    tokens: &oauth::TokenResponse,
) -> Result<Account, String> {
    let refresh = tokens
        .refresh_token
        .clone()
        .ok_or_else(|| "authorization returned no refresh_token".to_string())?;
    let info = oauth::get_user_info(&tokens.access_token).await?;
    Ok(Account::new(
        info.email,
        Credential::OauthRefresh { value: refresh },
    ))
}
