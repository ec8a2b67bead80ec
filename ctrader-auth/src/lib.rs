// Types shared by the client pieces
pub mod common;

mod client;
mod error;

pub use client::{
    load_credentials, ExchangeError, Settings, TokenExchange, TokenExchanger,
    TokenLifecycleManager, TokenStore,
};
pub use common::{Credentials, HostType, OAuthTokens, TokenGrant};
pub use error::{AuthError, RefreshError};

// Always exposed so downstream crates can script the token endpoint in their tests
pub mod testing;
