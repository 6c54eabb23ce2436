use anyhow::{Context, Result};
use serde::Deserialize;

/// Full profile for one machine identity.
///
/// One profile serves one identity against one target service; a process
/// talking to several services constructs several managers.
#[derive(Clone, Debug, Deserialize)]
pub struct Profile {
    /// OAuth2 identity provider issuing the client-credentials tokens
    pub identity_provider: IdentityProvider,

    /// Target service; its host is the token audience
    pub service: Service,

    /// Key-management settings forwarded to credential federation
    pub key_management: KeyManagement,
}

/// Identity provider endpoint and client credentials
#[derive(Clone, Debug, Deserialize)]
pub struct IdentityProvider {
    /// Host of the token endpoint. A bare host gets `https://` prepended;
    /// a value with an explicit scheme is used as-is.
    pub host: String,
    pub client_id: String,
    pub client_secret: String,
}

/// Target service settings
#[derive(Clone, Debug, Deserialize)]
pub struct Service {
    pub host: String,
}

/// Key-management settings
#[derive(Clone, Debug, Deserialize)]
pub struct KeyManagement {
    pub aws_credentials: AwsCredentials,
}

/// How AWS credentials are obtained for the key-management service
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AwsCredentials {
    /// Federate the access token into short-lived credentials via STS
    Federated {
        role_arn: String,
        region: String,
        /// Override for the STS endpoint (points tests at a local server)
        #[serde(default)]
        endpoint: Option<String>,
    },

    /// Long-lived static keys; no federation, credentials never expire
    Explicit {
        access_key_id: String,
        secret_access_key: String,
        region: String,
    },
}

impl Profile {
    /// Load a profile from environment variables, with priority ENV > .env file
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let identity_provider = IdentityProvider {
            host: require_env("IDP_HOST")?,
            client_id: require_env("IDP_CLIENT_ID")?,
            client_secret: require_env("IDP_CLIENT_SECRET")?,
        };

        let service = Service {
            host: require_env("SERVICE_HOST")?,
        };

        // A federation role selects federated mode; otherwise static keys
        let aws_credentials = if let Ok(role_arn) = std::env::var("AWS_FEDERATION_ROLE_ARN") {
            AwsCredentials::Federated {
                role_arn,
                region: env_or("AWS_REGION", "us-east-1"),
                endpoint: std::env::var("AWS_STS_ENDPOINT").ok(),
            }
        } else {
            AwsCredentials::Explicit {
                access_key_id: require_env("AWS_ACCESS_KEY_ID")?,
                secret_access_key: require_env("AWS_SECRET_ACCESS_KEY")?,
                region: env_or("AWS_REGION", "us-east-1"),
            }
        };

        let profile = Profile {
            identity_provider,
            service,
            key_management: KeyManagement { aws_credentials },
        };

        profile.validate()?;
        Ok(profile)
    }

    /// Validate profile contents
    pub fn validate(&self) -> Result<()> {
        if self.identity_provider.host.is_empty() {
            anyhow::bail!("identity provider host must not be empty");
        }
        if self.identity_provider.client_id.is_empty() {
            anyhow::bail!("identity provider client_id must not be empty");
        }
        if self.service.host.is_empty() {
            anyhow::bail!("service host must not be empty");
        }

        if let AwsCredentials::Federated { role_arn, .. } = &self.key_management.aws_credentials {
            if !role_arn.starts_with("arn:") {
                anyhow::bail!("federation role_arn is not an ARN: {}", role_arn);
            }
        }

        Ok(())
    }
}

/// Read a required environment variable
fn require_env(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("{} is required", name))
}

/// Read an environment variable with a default
fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}
