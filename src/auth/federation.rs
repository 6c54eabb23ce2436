// Federation of an access token into AWS credentials

use anyhow::{Context, Result};
use chrono::DateTime;
use reqwest::Client;

use super::types::{AssumeRoleResponse, FederatedCredentials};
use crate::config::AwsCredentials;

const STS_API_VERSION: &str = "2011-06-15";
const ROLE_SESSION_NAME: &str = "m2m-auth";

/// Get the STS endpoint for a region
fn sts_endpoint(region: &str) -> String {
    format!("https://sts.{}.amazonaws.com/", region)
}

/// Derive AWS credentials for the key-management service.
///
/// Static keys pass through untouched with no expiration; a federation role
/// exchanges the access token for short-lived credentials via STS.
pub async fn federate(
    client: &Client,
    aws_credentials: &AwsCredentials,
    access_token: &str,
) -> Result<FederatedCredentials> {
    match aws_credentials {
        AwsCredentials::Explicit {
            access_key_id,
            secret_access_key,
            ..
        } => {
            tracing::debug!("Using static AWS credentials (not federating)");
            Ok(FederatedCredentials {
                access_key_id: access_key_id.clone(),
                secret_access_key: secret_access_key.clone(),
                session_token: None,
                expiration: None,
            })
        }
        AwsCredentials::Federated {
            role_arn,
            region,
            endpoint,
        } => {
            assume_role_with_web_identity(client, role_arn, region, endpoint.as_deref(), access_token)
                .await
        }
    }
}

/// Exchange the access token for temporary credentials via
/// STS AssumeRoleWithWebIdentity
async fn assume_role_with_web_identity(
    client: &Client,
    role_arn: &str,
    region: &str,
    endpoint: Option<&str>,
    access_token: &str,
) -> Result<FederatedCredentials> {
    tracing::info!("Federating access token via STS AssumeRoleWithWebIdentity...");

    let url = endpoint
        .map(str::to_string)
        .unwrap_or_else(|| sts_endpoint(region));

    let form = [
        ("Action", "AssumeRoleWithWebIdentity"),
        ("Version", STS_API_VERSION),
        ("RoleArn", role_arn),
        ("RoleSessionName", ROLE_SESSION_NAME),
        ("WebIdentityToken", access_token),
    ];

    let response = client
        .post(&url)
        .header("Accept", "application/json")
        .form(&form)
        .send()
        .await
        .context("Failed to send STS federation request")?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        anyhow::bail!("STS federation failed: {} - {}", status, error_text);
    }

    let data: AssumeRoleResponse = response
        .json()
        .await
        .context("Failed to parse STS federation response")?;

    let credentials = data.response.result.credentials;
    let expiration = DateTime::from_timestamp(credentials.expiration as i64, 0)
        .context("STS credential expiration is out of range")?;

    tracing::info!(
        "Federated AWS credentials issued, expire: {}",
        expiration.to_rfc3339()
    );

    Ok(FederatedCredentials {
        access_key_id: credentials.access_key_id,
        secret_access_key: credentials.secret_access_key,
        session_token: Some(credentials.session_token),
        expiration: Some(expiration),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sts_endpoint() {
        assert_eq!(
            sts_endpoint("us-east-1"),
            "https://sts.us-east-1.amazonaws.com/"
        );
        assert_eq!(
            sts_endpoint("ap-southeast-2"),
            "https://sts.ap-southeast-2.amazonaws.com/"
        );
    }

    #[tokio::test]
    async fn test_explicit_credentials_do_not_expire() {
        let client = Client::new();
        let creds = federate(
            &client,
            &AwsCredentials::Explicit {
                access_key_id: "AKIAEXAMPLE".to_string(),
                secret_access_key: "secret".to_string(),
                region: "us-east-1".to_string(),
            },
            "tok1",
        )
        .await
        .unwrap();

        assert_eq!(creds.access_key_id, "AKIAEXAMPLE");
        assert!(creds.session_token.is_none());
        assert!(creds.expiration.is_none());
    }
}
