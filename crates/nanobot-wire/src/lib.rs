//! ATP transport: the duplex Wire, the outbound Client, and the OAuth
//! machinery both need.
//!
//! A [`Wire`] is one channel to one peer: POST for outbound messages, a
//! long-lived SSE GET for inbound ones, a pending-request table correlating
//! responses by id, and reconnect handling. A [`Client`] layers the
//! initialize contract, OAuth 2.1 discovery, and RFC 8693 token exchange on
//! top of a Wire.

mod callback;
mod client;
mod error;
mod oauth;
mod pending;
mod sse;
mod state;
mod wire;

pub use callback::{CallbackOutcome, CallbackResult, CallbackState, OAuthCoordinates};
pub use client::{Client, ClientConfig, ClientOAuth};
pub use error::WireError;
pub use oauth::{
    authorize_url, client_credentials_token, discover_auth_server, exchange_code,
    parse_www_authenticate, pkce_pair, random_state, subject_token_type, token_exchange,
    AuthServerMetadata, TokenExchangeConfig, TokenResponse,
};
pub use pending::PendingRequests;
pub use sse::{SseEvent, SseParser};
pub use state::SessionState;
pub use wire::{MessageHandlerFn, Wire};
