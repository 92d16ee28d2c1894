//! OAuth token refresh against the upstream authorization server.

use serde::Deserialize;
use tracing::debug;

use crate::error::{AuthError, Result};
use crate::store::OAuthCredential;

const TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
const CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

/// Refresh an access token. Returns the rotated credential; the refresh
/// token is carried over when the server does not rotate it.
pub async fn refresh_access_token(
    client: &reqwest::Client,
    current: &OAuthCredential,
) -> Result<OAuthCredential> {
    let refresh_token = current
        .refresh_token
        .as_deref()
        .ok_or_else(|| AuthError::RefreshFailed {
            status: 0,
            message: "credential has no refresh token".into(),
        })?;

    let body = serde_json::json!({
        "grant_type": "refresh_token",
        "refresh_token": refresh_token,
        "client_id": CLIENT_ID,
    });

    let resp = client
        .post(TOKEN_URL)
        .header("Content-Type", "application/json")
        .json(&body)
        .send()
        .await?;

    let status = resp.status().as_u16();
    if !resp.status().is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(AuthError::RefreshFailed {
            status,
            message: braid_core::mask::mask(&text),
        });
    }

    let token: TokenResponse = resp
        .json()
        .await
        .map_err(|e| AuthError::Parse(e.to_string()))?;

    let now = chrono::Utc::now().timestamp_millis();
    debug!(expires_in = token.expires_in, "access token refreshed");

    Ok(OAuthCredential {
        access_token: token.access_token,
        refresh_token: token
            .refresh_token
            .or_else(|| current.refresh_token.clone()),
        expires_at: now + token.expires_in as i64 * 1000,
    })
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: u64,
}
