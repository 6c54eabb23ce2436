// Authentication module
// Manages the credential lifecycle: token exchange, federation and refresh

mod federation;
mod manager;
mod oauth;
mod types;

pub use manager::{AuthDetails, AuthManager};
pub use types::{AuthState, FederatedCredentials, OauthInfo};
