//! OAuth redirect target.

use std::collections::HashMap;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use nanobot_wire::{exchange_code, CallbackOutcome, CallbackResult};
use tracing::warn;

use crate::state::GatewayState;

const DONE_PAGE: &str = "Authorization complete. You can close this window.";

pub async fn oauth_callback(
    State(state): State<GatewayState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(oauth_state) = params.get("state") else {
        return (StatusCode::BAD_REQUEST, "missing state").into_response();
    };
    let result = CallbackResult {
        code: params.get("code").cloned(),
        error: params.get("error").cloned(),
        error_description: params.get("error_description").cloned(),
    };

    match state.callbacks.resolve(oauth_state, result) {
        Err(_) => (StatusCode::BAD_REQUEST, "unknown or consumed state").into_response(),
        Ok(CallbackOutcome::Delivered) => (StatusCode::OK, DONE_PAGE).into_response(),
        Ok(CallbackOutcome::ExchangeInline {
            oauth,
            verifier,
            redirect_url,
            result,
        }) => {
            // Nobody is waiting any more; finish the exchange here and hand
            // the browser a cookie before redirecting.
            let Some(code) = result.code else {
                return (
                    StatusCode::BAD_REQUEST,
                    format!(
                        "authorization failed: {}",
                        result.error.unwrap_or_default()
                    ),
                )
                    .into_response();
            };
            let http = reqwest_client();
            let token = match exchange_code(
                &http,
                &oauth.token_endpoint,
                &oauth.client_id,
                &oauth.client_secret,
                &code,
                &oauth.redirect_uri,
                &verifier,
            )
            .await
            {
                Ok(token) => token,
                Err(err) => {
                    warn!(error = %err, "inline code exchange failed");
                    return (StatusCode::BAD_GATEWAY, "code exchange failed").into_response();
                }
            };
            let cookie = format!(
                "nanobot-token={}; Path=/; HttpOnly; SameSite=Lax",
                token.access_token
            );
            match redirect_url {
                Some(url) => {
                    ([("Set-Cookie", cookie)], Redirect::temporary(&url)).into_response()
                }
                None => ([("Set-Cookie", cookie)], DONE_PAGE).into_response(),
            }
        }
    }
}

fn reqwest_client() -> reqwest::Client {
    reqwest::Client::new()
}
