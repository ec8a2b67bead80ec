//! Message model and error classification for the cTrader Open API.
//!
//! The wire encoding is left to the transport; this crate only describes what is sent
//! and received over an authenticated session.

pub mod error;
mod macros;
pub mod messages;

pub use crate::error::{
    BrokerError, BrokerErrorCode, ErrorClass, describe, format_error, is_already_subscribed,
    is_benign_unsubscribe_error, is_invalid_token_error,
};
pub use crate::messages::{AccountId, Request, Response, SymbolId};

