mod models;

pub use models::{Credentials, HostType, OAuthTokens, TokenGrant, AUTH_URL, TOKEN_URL};
