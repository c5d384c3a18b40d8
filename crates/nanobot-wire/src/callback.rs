//! OAuth redirect capture: the state map behind `/oauth/callback`.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::error::WireError;
use crate::oauth::random_state;

/// Token-endpoint coordinates stored with each pending state.
#[derive(Debug, Clone)]
pub struct OAuthCoordinates {
    pub token_endpoint: String,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

/// What the authorization server sent back through the redirect.
#[derive(Debug, Clone, Default)]
pub struct CallbackResult {
    pub code: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

struct Entry {
    oauth: OAuthCoordinates,
    redirect_url: Option<String>,
    verifier: String,
    tx: oneshot::Sender<CallbackResult>,
    created: Instant,
}

/// How the callback endpoint should proceed after a state resolves.
pub enum CallbackOutcome {
    /// A waiter was still listening; it received the result.
    Delivered,
    /// No waiter remains: the endpoint performs the code exchange itself
    /// and redirects the browser to `redirect_url`.
    ExchangeInline {
        oauth: OAuthCoordinates,
        verifier: String,
        redirect_url: Option<String>,
        result: CallbackResult,
    },
}

/// Map of outstanding `state` values to their completion channels.
///
/// Every state is single-use: the first callback pops the entry, a second
/// callback with the same state fails.
#[derive(Default)]
pub struct CallbackState {
    entries: DashMap<String, Entry>,
}

impl CallbackState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh state and a one-shot channel the initiating flow waits
    /// on. The PKCE verifier travels with the entry so whichever side does
    /// the code exchange has it.
    pub fn new_state(
        &self,
        oauth: OAuthCoordinates,
        redirect_url: Option<String>,
        verifier: String,
    ) -> (String, oneshot::Receiver<CallbackResult>) {
        let state = random_state();
        let (tx, rx) = oneshot::channel();
        self.entries.insert(
            state.clone(),
            Entry {
                oauth,
                redirect_url,
                verifier,
                tx,
                created: Instant::now(),
            },
        );
        (state, rx)
    }

    /// Resolve a redirect. Unknown or already-consumed state is an error the
    /// HTTP layer maps to 400.
    pub fn resolve(&self, state: &str, result: CallbackResult) -> Result<CallbackOutcome, WireError> {
        let (_, entry) = self
            .entries
            .remove(state)
            .ok_or_else(|| WireError::transport(format!("unknown or consumed state {:?}", state)))?;
        match entry.tx.send(result.clone()) {
            Ok(()) => Ok(CallbackOutcome::Delivered),
            // Receiver abandoned the wait; fall back to an inline exchange.
            Err(_) => Ok(CallbackOutcome::ExchangeInline {
                oauth: entry.oauth,
                verifier: entry.verifier,
                redirect_url: entry.redirect_url,
                result,
            }),
        }
    }

    /// Drop entries older than `max_age`. Abandoned interactive flows leak
    /// their state until this runs.
    pub fn purge_older_than(&self, max_age: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.created.elapsed() < max_age);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coords() -> OAuthCoordinates {
        OAuthCoordinates {
            token_endpoint: "https://as.example/token".into(),
            client_id: "cid".into(),
            client_secret: "sec".into(),
            redirect_uri: "http://localhost:8099/oauth/callback".into(),
        }
    }

    #[tokio::test]
    async fn test_state_delivers_to_waiter() {
        let cb = CallbackState::new();
        let (state, rx) = cb.new_state(coords(), None, "ver".into());
        let outcome = cb
            .resolve(
                &state,
                CallbackResult {
                    code: Some("authcode".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(matches!(outcome, CallbackOutcome::Delivered));
        assert_eq!(rx.await.unwrap().code.as_deref(), Some("authcode"));
    }

    #[tokio::test]
    async fn test_state_is_single_use() {
        let cb = CallbackState::new();
        let (state, _rx) = cb.new_state(coords(), None, "ver".into());
        cb.resolve(&state, CallbackResult::default()).unwrap();
        assert!(cb.resolve(&state, CallbackResult::default()).is_err());
    }

    #[tokio::test]
    async fn test_unknown_state_rejected() {
        let cb = CallbackState::new();
        assert!(cb.resolve("nope", CallbackResult::default()).is_err());
    }

    #[tokio::test]
    async fn test_abandoned_waiter_falls_back_to_inline_exchange() {
        let cb = CallbackState::new();
        let (state, rx) = cb.new_state(coords(), Some("https://ui/done".into()), "ver".into());
        drop(rx);
        let outcome = cb
            .resolve(
                &state,
                CallbackResult {
                    code: Some("c".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        match outcome {
            CallbackOutcome::ExchangeInline {
                verifier,
                redirect_url,
                result,
                ..
            } => {
                assert_eq!(verifier, "ver");
                assert_eq!(redirect_url.as_deref(), Some("https://ui/done"));
                assert_eq!(result.code.as_deref(), Some("c"));
            }
            CallbackOutcome::Delivered => panic!("expected inline exchange"),
        }
    }

    #[tokio::test]
    async fn test_purge_drops_stale_entries() {
        let cb = CallbackState::new();
        let (_state, _rx) = cb.new_state(coords(), None, "v".into());
        assert_eq!(cb.purge_older_than(Duration::from_secs(3600)), 0);
        assert_eq!(cb.purge_older_than(Duration::ZERO), 1);
        assert!(cb.is_empty());
    }
}
