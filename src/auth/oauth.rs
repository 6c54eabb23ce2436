// Token exchange against the identity provider

use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::Client;

use super::types::{ClientCredentialsRequest, OauthInfo, RefreshRequest, TokenResponse};

/// Assumed token lifetime when the provider omits expires_in
const DEFAULT_EXPIRES_IN_SECONDS: u64 = 3600;

/// Build the token endpoint URL for an identity provider host.
/// A bare host gets https; an explicit scheme is used as-is.
fn token_endpoint(host: &str) -> String {
    if host.contains("://") {
        format!("{}/oauth/token", host.trim_end_matches('/'))
    } else {
        format!("https://{}/oauth/token", host)
    }
}

/// Exchange client credentials for an initial token set.
/// The target service host is sent as the token audience.
pub async fn exchange_client_credentials(
    client: &Client,
    idp_host: &str,
    service_host: &str,
    client_id: &str,
    client_secret: &str,
) -> Result<OauthInfo> {
    tracing::info!("Authenticating via client credentials grant...");

    let url = token_endpoint(idp_host);
    let request = ClientCredentialsRequest {
        grant_type: "client_credentials".to_string(),
        audience: service_host.to_string(),
        client_id: client_id.to_string(),
        client_secret: client_secret.to_string(),
    };

    let response = client
        .post(&url)
        .json(&request)
        .send()
        .await
        .context("Failed to send client credentials request")?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        anyhow::bail!(
            "Client credentials exchange failed: {} - {}",
            status,
            error_text
        );
    }

    let data: TokenResponse = response
        .json()
        .await
        .context("Failed to parse token response")?;

    let info = token_info(data, None)?;
    tracing::info!("Access token issued, expiry: {}", info.expiry);
    Ok(info)
}

/// Exchange a refresh token for a new token set.
pub async fn refresh(
    client: &Client,
    idp_host: &str,
    refresh_token: &str,
    client_id: &str,
) -> Result<OauthInfo> {
    tracing::info!("Refreshing access token via refresh token grant...");

    let url = token_endpoint(idp_host);
    let request = RefreshRequest {
        grant_type: "refresh_token".to_string(),
        client_id: client_id.to_string(),
        refresh_token: refresh_token.to_string(),
    };

    let response = client
        .post(&url)
        .json(&request)
        .send()
        .await
        .context("Failed to send token refresh request")?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        anyhow::bail!("Token refresh failed: {} - {}", status, error_text);
    }

    let data: TokenResponse = response
        .json()
        .await
        .context("Failed to parse token refresh response")?;

    let info = token_info(data, Some(refresh_token))?;
    tracing::info!("Access token refreshed, expiry: {}", info.expiry);
    Ok(info)
}

/// Assemble token info from a token endpoint response.
/// When the provider does not rotate the refresh token, the previous one is
/// carried forward.
fn token_info(data: TokenResponse, previous_refresh_token: Option<&str>) -> Result<OauthInfo> {
    if data.access_token.is_empty() {
        anyhow::bail!("Token response does not contain an access token");
    }

    let refresh_token = data
        .refresh_token
        .or_else(|| previous_refresh_token.map(str::to_string))
        .context("Token response does not contain a refresh token")?;

    let expires_in = data.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECONDS);

    Ok(OauthInfo {
        access_token: data.access_token,
        refresh_token,
        expiry: Utc::now().timestamp() + expires_in as i64,
    })
}
