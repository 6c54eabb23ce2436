use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::Client;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use super::federation;
use super::oauth;
use super::types::{AuthState, FederatedCredentials};
use crate::config::Profile;
use crate::error::AuthError;

/* Refresh tokens before the expiry so in-flight requests never race a
 * just-expired token. Buffer is in seconds. */
const EXPIRY_BUFFER_SECONDS: i64 = 20;

/// Credentials handed to the caller's work inside
/// [`AuthManager::with_authentication`]
#[derive(Debug, Clone)]
pub struct AuthDetails {
    pub auth_token: String,
    pub credentials: FederatedCredentials,
}

/// Credential lifecycle manager
/// Owns the authentication state, drives token exchange and federation, and
/// keeps both fresh from a background refresh task.
pub struct AuthManager {
    inner: Arc<Inner>,

    /// Handle of the background refresh task, aborted on drop
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    /// Profile this manager authenticates as
    profile: Profile,

    /// HTTP client shared by token exchange and federation
    client: Client,

    /// The single source of truth; every write replaces the whole value
    state: RwLock<AuthState>,
}

impl AuthManager {
    /// Create a manager for a profile. No network calls are made until
    /// [`initialise`](Self::initialise) or
    /// [`with_authentication`](Self::with_authentication).
    pub fn new(profile: Profile) -> Result<Self> {
        profile.validate()?;

        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            inner: Arc::new(Inner {
                profile,
                client,
                state: RwLock::new(AuthState::Unauthenticated),
            }),
            refresh_task: Mutex::new(None),
        })
    }

    /// Create a manager seeded with a given state, without authenticating.
    /// Available in test builds and integration tests.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn new_with_state(profile: Profile, state: AuthState) -> Result<Self> {
        let manager = Self::new(profile)?;
        *manager
            .inner
            .state
            .try_write()
            .expect("state lock is uncontended at construction") = state;
        Ok(manager)
    }

    /// Snapshot of the current authentication state.
    /// Available in test builds and integration tests.
    #[cfg(any(test, feature = "test-utils"))]
    pub async fn current_state(&self) -> AuthState {
        self.inner.state.read().await.clone()
    }

    /// Arm the background refresh loop.
    /// Available in test builds and integration tests.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn arm_refresh_for_testing(&self) {
        self.arm_refresh_loop();
    }

    /// Perform the first authentication and arm the refresh loop.
    /// Call once per manager instance, before first use. Failure is captured
    /// in state and surfaced by the next
    /// [`with_authentication`](Self::with_authentication) call.
    pub async fn initialise(&self) {
        self.inner.authenticate().await;
        self.arm_refresh_loop();
    }

    /// Whether the current credentials are authenticated and both expiries
    /// (access token, federated credentials) are strictly in the future
    pub async fn is_fresh(&self) -> bool {
        match &*self.inner.state.read().await {
            AuthState::Authenticated { oauth, credentials } => {
                let now = Utc::now();
                credentials.is_fresh_at(now) && oauth.is_fresh_at(now)
            }
            _ => false,
        }
    }

    /// Run the caller's work with the current credentials, authenticating
    /// first if necessary.
    ///
    /// Any `Authenticated` state is treated as usable, even a stale one;
    /// keeping credentials fresh is the refresh loop's job. Two overlapping
    /// calls on a non-authenticated manager may each trigger a token
    /// exchange; the last completed state transition wins and both callers
    /// proceed against the final state.
    pub async fn with_authentication<F, Fut, R>(&self, callback: F) -> Result<R, AuthError>
    where
        F: FnOnce(AuthDetails) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let needs_auth = !matches!(
            &*self.inner.state.read().await,
            AuthState::Authenticated { .. }
        );
        if needs_auth {
            self.inner.authenticate().await;
        }

        let details = match &*self.inner.state.read().await {
            AuthState::Authenticated { oauth, credentials } => AuthDetails {
                auth_token: oauth.access_token.clone(),
                credentials: credentials.clone(),
            },
            AuthState::Failed { error } => {
                return Err(AuthError::Authentication(error.clone()));
            }
            state => {
                tracing::error!("Unexpected authentication state: {:?}", state);
                return Err(AuthError::UnreachableState);
            }
        };

        // A successful re-authentication re-arms the dormant refresh loop
        if needs_auth {
            self.arm_refresh_loop();
        }

        callback(details)
            .await
            .map_err(|err| AuthError::ApiCall(format!("{err:#}")))
    }

    /// Spawn the refresh loop unless one is already running
    fn arm_refresh_loop(&self) {
        let Ok(mut task) = self.refresh_task.lock() else {
            return;
        };
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(async move {
            inner.run_refresh_loop().await;
        }));
    }
}

impl Drop for AuthManager {
    fn drop(&mut self) {
        // Background refresh is advisory maintenance; it must not outlive
        // the manager or keep the process alive
        if let Ok(mut task) = self.refresh_task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}

/// What the refresh loop should do next, decided from the current state
enum RefreshStep {
    Sleep {
        delay: Duration,
        refresh_token: String,
    },
    Immediate {
        refresh_token: String,
    },
    Dormant,
}

impl Inner {
    /// Authenticate from scratch: client-credentials exchange, then
    /// federation. Never raises; every outcome is captured in state.
    async fn authenticate(&self) {
        let idp = &self.profile.identity_provider;

        let oauth = match oauth::exchange_client_credentials(
            &self.client,
            &idp.host,
            &self.profile.service.host,
            &idp.client_id,
            &idp.client_secret,
        )
        .await
        {
            Ok(oauth) => oauth,
            Err(err) => {
                tracing::error!("Client credentials exchange failed: {:#}", err);
                *self.state.write().await = AuthState::Failed {
                    error: format!("Oauth failure: {err:#}"),
                };
                return;
            }
        };

        match federation::federate(
            &self.client,
            &self.profile.key_management.aws_credentials,
            &oauth.access_token,
        )
        .await
        {
            Ok(credentials) => {
                tracing::info!("Authenticated");
                *self.state.write().await = AuthState::Authenticated { oauth, credentials };
            }
            Err(err) => {
                tracing::error!("Token federation failed: {:#}", err);
                *self.state.write().await = AuthState::Failed {
                    error: format!("Token federation failure: {err:#}"),
                };
            }
        }
    }

    /// Refresh the token set and replace the state.
    ///
    /// If the state left `Authenticated`/`Expired` while the refresh
    /// exchange was in flight, the result is discarded rather than clobber
    /// whatever transition happened meanwhile. Never raises; failures land
    /// in `Failed` state and surface on the next credential access.
    async fn refresh_and_update(&self, refresh_token: &str) {
        let idp = &self.profile.identity_provider;

        let oauth = match oauth::refresh(&self.client, &idp.host, refresh_token, &idp.client_id)
            .await
        {
            Ok(oauth) => oauth,
            Err(err) => {
                tracing::error!("Token refresh failed: {:#}", err);
                *self.state.write().await = AuthState::Failed {
                    error: format!("{err:#}"),
                };
                return;
            }
        };

        let refreshable = matches!(
            &*self.state.read().await,
            AuthState::Authenticated { .. } | AuthState::Expired { .. }
        );
        if !refreshable {
            tracing::debug!("Discarding refreshed token; state changed during refresh");
            return;
        }

        match federation::federate(
            &self.client,
            &self.profile.key_management.aws_credentials,
            &oauth.access_token,
        )
        .await
        {
            Ok(credentials) => {
                tracing::debug!("Token refresh complete");
                *self.state.write().await = AuthState::Authenticated { oauth, credentials };
            }
            Err(err) => {
                tracing::error!("Federation during refresh failed: {:#}", err);
                *self.state.write().await = AuthState::Failed {
                    error: format!("{err:#}"),
                };
            }
        }
    }

    /// Background maintenance loop. Re-evaluates the state each cycle and
    /// either sleeps until the next refresh deadline, refreshes immediately,
    /// or goes dormant. A failed refresh re-evaluates the new state rather
    /// than kill the loop; the loop only ends on a non-refreshable state.
    async fn run_refresh_loop(&self) {
        loop {
            let step = match &*self.state.read().await {
                AuthState::Authenticated { oauth, .. } => RefreshStep::Sleep {
                    delay: refresh_delay(oauth.expiry, Utc::now().timestamp()),
                    refresh_token: oauth.refresh_token.clone(),
                },
                AuthState::Expired { oauth } => RefreshStep::Immediate {
                    refresh_token: oauth.refresh_token.clone(),
                },
                _ => RefreshStep::Dormant,
            };

            match step {
                RefreshStep::Sleep {
                    delay,
                    refresh_token,
                } => {
                    tracing::debug!("Next token refresh in {}s", delay.as_secs());
                    tokio::time::sleep(delay).await;
                    self.refresh_and_update(&refresh_token).await;
                }
                RefreshStep::Immediate { refresh_token } => {
                    self.refresh_and_update(&refresh_token).await;
                }
                RefreshStep::Dormant => {
                    tracing::debug!("Refresh loop going dormant");
                    break;
                }
            }
        }
    }
}

/// Delay until the refresh for a token expiring at `expiry` should fire,
/// clamped at zero for deadlines already behind us
fn refresh_delay(expiry: i64, now: i64) -> Duration {
    let fire_at = expiry - EXPIRY_BUFFER_SECONDS;
    Duration::from_secs((fire_at - now).max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::types::OauthInfo;
    use crate::config::{AwsCredentials, IdentityProvider, KeyManagement, Service};

    fn test_profile() -> Profile {
        Profile {
            identity_provider: IdentityProvider {
                // Unroutable: re-authentication attempts fail fast
                host: "http://127.0.0.1:9".to_string(),
                client_id: "c1".to_string(),
                client_secret: "s1".to_string(),
            },
            service: Service {
                host: "api.example".to_string(),
            },
            key_management: KeyManagement {
                aws_credentials: AwsCredentials::Explicit {
                    access_key_id: "AKIAEXAMPLE".to_string(),
                    secret_access_key: "secret".to_string(),
                    region: "us-east-1".to_string(),
                },
            },
        }
    }

    fn static_credentials() -> FederatedCredentials {
        FederatedCredentials {
            access_key_id: "AKIAEXAMPLE".to_string(),
            secret_access_key: "secret".to_string(),
            session_token: None,
            expiration: None,
        }
    }

    fn oauth_info(expiry: i64) -> OauthInfo {
        OauthInfo {
            access_token: "tok1".to_string(),
            refresh_token: "r1".to_string(),
            expiry,
        }
    }

    #[test]
    fn test_refresh_delay_honors_buffer() {
        let now = Utc::now().timestamp();

        // Token expiring in 100s refreshes at ~80s, not at 100s
        assert_eq!(refresh_delay(now + 100, now), Duration::from_secs(80));
    }

    #[test]
    fn test_refresh_delay_clamps_at_zero() {
        let now = Utc::now().timestamp();

        // Inside the buffer or already expired: fire immediately
        assert_eq!(refresh_delay(now + 10, now), Duration::ZERO);
        assert_eq!(refresh_delay(now - 5, now), Duration::ZERO);
    }

    #[test]
    fn test_starts_unauthenticated_and_not_fresh() {
        tokio_test::block_on(async {
            let manager = AuthManager::new(test_profile()).unwrap();
            assert!(matches!(
                manager.current_state().await,
                AuthState::Unauthenticated
            ));
            assert!(!manager.is_fresh().await);
        });
    }

    #[tokio::test]
    async fn test_is_fresh_requires_both_expiries_in_future() {
        let now = Utc::now();

        // Fresh token, non-expiring credentials
        let manager = AuthManager::new_with_state(
            test_profile(),
            AuthState::Authenticated {
                oauth: oauth_info(now.timestamp() + 3600),
                credentials: static_credentials(),
            },
        )
        .unwrap();
        assert!(manager.is_fresh().await);

        // Expired token
        let manager = AuthManager::new_with_state(
            test_profile(),
            AuthState::Authenticated {
                oauth: oauth_info(now.timestamp() - 1),
                credentials: static_credentials(),
            },
        )
        .unwrap();
        assert!(!manager.is_fresh().await);

        // Fresh token, expired federated credentials
        let mut credentials = static_credentials();
        credentials.expiration = Some(now - chrono::Duration::seconds(1));
        let manager = AuthManager::new_with_state(
            test_profile(),
            AuthState::Authenticated {
                oauth: oauth_info(now.timestamp() + 3600),
                credentials,
            },
        )
        .unwrap();
        assert!(!manager.is_fresh().await);
    }

    #[tokio::test]
    async fn test_expired_state_is_not_fresh() {
        let manager = AuthManager::new_with_state(
            test_profile(),
            AuthState::Expired {
                oauth: oauth_info(Utc::now().timestamp() - 60),
            },
        )
        .unwrap();
        assert!(!manager.is_fresh().await);
    }

    #[tokio::test]
    async fn test_stale_authenticated_state_is_still_usable() {
        // with_authentication deliberately does not consult is_fresh
        let manager = AuthManager::new_with_state(
            test_profile(),
            AuthState::Authenticated {
                oauth: oauth_info(Utc::now().timestamp() - 60),
                credentials: static_credentials(),
            },
        )
        .unwrap();

        assert!(!manager.is_fresh().await);
        let token = manager
            .with_authentication(|details| async move { Ok(details.auth_token) })
            .await
            .unwrap();
        assert_eq!(token, "tok1");
    }

    #[tokio::test]
    async fn test_failed_state_surfaces_as_authentication_error() {
        let manager = AuthManager::new_with_state(
            test_profile(),
            AuthState::Failed {
                error: "Oauth failure: bad secret".to_string(),
            },
        )
        .unwrap();

        // Re-authentication against an unreachable host leaves Failed state;
        // the accessor surfaces it rather than raising from authenticate
        let result = manager
            .with_authentication(|_| async move { Ok(()) })
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err, AuthError::Authentication(_)));
        assert!(err.to_string().starts_with("Authentication failure: "));

        // Exactly one state variant is observable afterwards
        assert!(matches!(
            manager.current_state().await,
            AuthState::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn test_callback_error_is_wrapped() {
        let manager = AuthManager::new_with_state(
            test_profile(),
            AuthState::Authenticated {
                oauth: oauth_info(Utc::now().timestamp() + 3600),
                credentials: static_credentials(),
            },
        )
        .unwrap();

        let result = manager
            .with_authentication(|_| async move {
                Err::<(), _>(anyhow::anyhow!("boom"))
            })
            .await;

        assert_eq!(result.unwrap_err().to_string(), "API call failed: boom");

        // Caller-supplied work failures do not touch the state
        assert!(matches!(
            manager.current_state().await,
            AuthState::Authenticated { .. }
        ));
    }
}
