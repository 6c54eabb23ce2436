// Authentication state and wire types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Token set issued by the identity provider.
/// Superseded wholesale on refresh, never mutated field by field.
#[derive(Debug, Clone)]
pub struct OauthInfo {
    pub access_token: String,
    pub refresh_token: String,
    /// Access token expiry, seconds since the Unix epoch
    pub expiry: i64,
}

impl OauthInfo {
    /// True while the access token expiry is strictly in the future
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry > now.timestamp()
    }
}

/// AWS credentials produced by federation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederatedCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    /// Absent when not federating; static credentials do not expire
    pub expiration: Option<DateTime<Utc>>,
}

impl FederatedCredentials {
    /// True while the credentials have no expiration or it is strictly in the future
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        match self.expiration {
            None => true,
            Some(expiration) => expiration > now,
        }
    }
}

/// Authentication lifecycle state.
/// The manager holds exactly one value at a time and every transition
/// replaces the whole value.
#[derive(Debug, Clone)]
pub enum AuthState {
    /// Initial state, before the first authentication attempt
    Unauthenticated,

    /// Usable credentials; may or may not still be fresh
    Authenticated {
        oauth: OauthInfo,
        credentials: FederatedCredentials,
    },

    /// Credentials known to be expired. Nothing in this crate produces this
    /// state; an embedding may set it from a local expiry check. The refresh
    /// loop consumes it by refreshing immediately.
    Expired { oauth: OauthInfo },

    /// Last attempt failed; no usable credentials
    Failed { error: String },
}

/// Client-credentials grant request
#[derive(Serialize)]
pub struct ClientCredentialsRequest {
    pub grant_type: String,
    pub audience: String,
    pub client_id: String,
    pub client_secret: String,
}

/// Refresh-token grant request
#[derive(Serialize)]
pub struct RefreshRequest {
    pub grant_type: String,
    pub client_id: String,
    pub refresh_token: String,
}

/// Token endpoint response (both grants)
#[derive(Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
}

/// STS AssumeRoleWithWebIdentity response envelope (JSON form)
#[derive(Deserialize)]
pub struct AssumeRoleResponse {
    #[serde(rename = "AssumeRoleWithWebIdentityResponse")]
    pub response: AssumeRoleBody,
}

#[derive(Deserialize)]
pub struct AssumeRoleBody {
    #[serde(rename = "AssumeRoleWithWebIdentityResult")]
    pub result: AssumeRoleResult,
}

#[derive(Deserialize)]
pub struct AssumeRoleResult {
    #[serde(rename = "Credentials")]
    pub credentials: StsCredentials,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    /// Seconds since the Unix epoch, fractional in the STS JSON encoding
    pub expiration: f64,
}
