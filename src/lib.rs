// m2m-auth - Machine-to-machine credential lifecycle manager

pub mod auth;
pub mod config;
pub mod error;

pub use auth::{AuthDetails, AuthManager, AuthState, FederatedCredentials, OauthInfo};
pub use config::{AwsCredentials, Profile};
pub use error::AuthError;
