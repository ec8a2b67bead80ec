use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt::Display;
use std::str::FromStr;

/// Error code the broker reports when an unsubscribe races a server-side auto-unsubscribe.
pub const INVALID_REQUEST: &str = "INVALID_REQUEST";

const NON_SUBSCRIBED_PATTERN: &str = "unsubscribe to a non-subscribed period";
const ALREADY_SUBSCRIBED: &str = "ALREADY_SUBSCRIBED";

/// Broker error codes with a known meaning.
///
/// Anything outside the table is kept verbatim in [`BrokerErrorCode::Unknown`] so the
/// raw value can still be surfaced next to its (absent) name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BrokerErrorCode {
    OaAuthTokenExpired,
    AccountNotAuthorized,
    ChClientAuthFailure,
    ChClientNotAuthenticated,
    ChClientAlreadyAuthenticated,
    ChAccessTokenInvalid,
    Unknown(String),
}

impl BrokerErrorCode {
    /// Parse a raw code. Only numeric codes map onto the table; anything else is `Unknown`.
    pub fn parse(code: &str) -> Self {
        match code.trim().parse::<i64>() {
            Ok(value) => Self::from_value(value),
            Err(_) => Self::Unknown(code.to_string()),
        }
    }

    pub fn from_value(value: i64) -> Self {
        match value {
            1 => Self::OaAuthTokenExpired,
            2 => Self::AccountNotAuthorized,
            101 => Self::ChClientAuthFailure,
            102 => Self::ChClientNotAuthenticated,
            103 => Self::ChClientAlreadyAuthenticated,
            104 => Self::ChAccessTokenInvalid,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn value(&self) -> Option<i64> {
        match self {
            Self::OaAuthTokenExpired => Some(1),
            Self::AccountNotAuthorized => Some(2),
            Self::ChClientAuthFailure => Some(101),
            Self::ChClientNotAuthenticated => Some(102),
            Self::ChClientAlreadyAuthenticated => Some(103),
            Self::ChAccessTokenInvalid => Some(104),
            Self::Unknown(_) => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::OaAuthTokenExpired => "OA_AUTH_TOKEN_EXPIRED",
            Self::AccountNotAuthorized => "ACCOUNT_NOT_AUTHORIZED",
            Self::ChClientAuthFailure => "CH_CLIENT_AUTH_FAILURE",
            Self::ChClientNotAuthenticated => "CH_CLIENT_NOT_AUTHENTICATED",
            Self::ChClientAlreadyAuthenticated => "CH_CLIENT_ALREADY_AUTHENTICATED",
            Self::ChAccessTokenInvalid => "CH_ACCESS_TOKEN_INVALID",
            Self::Unknown(_) => "UNKNOWN_ERROR_CODE",
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }

    /// Token expired, account not authorized, or access token invalid.
    pub fn is_invalid_token(&self) -> bool {
        matches!(
            self,
            Self::OaAuthTokenExpired | Self::AccountNotAuthorized | Self::ChAccessTokenInvalid
        )
    }
}

impl FromStr for BrokerErrorCode {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl From<&str> for BrokerErrorCode {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl From<i64> for BrokerErrorCode {
    fn from(value: i64) -> Self {
        Self::from_value(value)
    }
}

impl Display for BrokerErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.value() {
            Some(value) => write!(f, "{}", value),
            None => f.write_str(self.name()),
        }
    }
}

/// Symbolic name for a raw code, or `None` when the code is not in the table.
pub fn describe(code: &str) -> Option<&'static str> {
    let code = BrokerErrorCode::parse(code);
    code.is_known().then(|| code.name())
}

pub fn is_invalid_token_error(code: &str) -> bool {
    BrokerErrorCode::parse(code).is_invalid_token()
}

/// Unsubscribing a stream the server has already dropped.
pub fn is_benign_unsubscribe_error(error_code: &str, message: &str) -> bool {
    error_code.trim() == INVALID_REQUEST
        && message.to_lowercase().contains(NON_SUBSCRIBED_PATTERN)
}

pub fn is_already_subscribed(error_code: &str, description: &str) -> bool {
    error_code.contains(ALREADY_SUBSCRIBED) || description.contains(ALREADY_SUBSCRIBED)
}

/// `error {code} ({NAME}): {description}` when the code is known.
pub fn format_error(error_code: &str, description: &str) -> String {
    match describe(error_code) {
        Some(name) => format!("error {} ({}): {}", error_code.trim(), name, description),
        None => format!("error {}: {}", error_code.trim(), description),
    }
}

/// How the session reacts to a broker error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Teardown races that are never surfaced.
    Benign,
    /// Requires a token refresh and a new account handshake.
    InvalidToken,
    Generic,
}

/// Error message returned by the broker for a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerError {
    pub error_code: String,
    pub description: String,
    pub account_id: Option<i64>,
}

impl BrokerError {
    pub fn new(error_code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            error_code: error_code.into(),
            description: description.into(),
            account_id: None,
        }
    }

    pub fn for_account(mut self, account_id: i64) -> Self {
        self.account_id = Some(account_id);
        self
    }

    pub fn code(&self) -> BrokerErrorCode {
        BrokerErrorCode::parse(&self.error_code)
    }

    pub fn classify(&self) -> ErrorClass {
        if is_benign_unsubscribe_error(&self.error_code, &self.description)
            || is_already_subscribed(&self.error_code, &self.description)
        {
            ErrorClass::Benign
        } else if is_invalid_token_error(&self.error_code) {
            ErrorClass::InvalidToken
        } else {
            ErrorClass::Generic
        }
    }
}

impl Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format_error(&self.error_code, &self.description))
    }
}

impl std::error::Error for BrokerError {}
