//! POST/GET/DELETE on the single ATP endpoint.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use futures_util::Stream;
use nanobot_session::{extract_session_id, Session, StoreError};
use nanobot_tools::SUBJECT_TOKEN_ATTR;
use nanobot_types::{parse_message, CoreError, Message, SESSION_ID_HEADER};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;

use crate::audit::{masked_headers, redact_authorization, AuditRecord};
use crate::challenge::challenge_header;
use crate::sse::EventRing;
use crate::state::GatewayState;

fn bearer_of(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// `uri` for resource reads, `name` for tool and prompt calls.
fn call_identifier(msg: &Message) -> String {
    let params = msg.params.as_ref();
    match msg.method_name() {
        "resources/read" | "resources/subscribe" | "resources/unsubscribe" => params
            .and_then(|p| p.get("uri"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        "tools/call" | "prompts/get" => params
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    }
}

enum Outcome {
    Reply(Message),
    Accepted,
    AuthRequired,
    NotFound,
}

pub async fn atp_post(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    let msg = match parse_message(&body) {
        Ok(msg) => msg,
        Err(error_response) => {
            return (StatusCode::BAD_REQUEST, Json(error_response)).into_response();
        }
    };
    let method = msg.method_name().to_string();
    let call_id = call_identifier(&msg);
    let request_id = msg.id.clone();
    let bearer = bearer_of(&headers);
    let session_header = headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok());
    let session_id = extract_session_id(session_header, None);

    let mut record = AuditRecord {
        start: Utc::now().to_rfc3339(),
        client_ip: client_ip(&headers),
        authorization: redact_authorization(
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default(),
        ),
        headers: masked_headers(&headers),
        subject: bearer.as_deref().map(|_| "bearer").unwrap_or("anonymous").to_string(),
        method: method.clone(),
        call_id,
        ..Default::default()
    };

    let (outcome, effective_id) = match session_id {
        None => {
            if method != "initialize" {
                let error = Message::error_response(
                    request_id.clone(),
                    CoreError::invalid_params("initialize is the only method without a session")
                        .to_rpc_error(),
                );
                record.status = StatusCode::BAD_REQUEST.as_u16();
                record.elapsed_ms = started.elapsed().as_millis() as u64;
                state.audit.record(record);
                return (StatusCode::BAD_REQUEST, Json(error)).into_response();
            }
            let fresh_id = uuid::Uuid::new_v4().to_string();
            let session = Arc::new(Session::new(
                fresh_id.clone(),
                state.store.progress_floor(),
            ));
            state.wire_session(&session);
            if let Some(bearer) = &bearer {
                session.with_attrs(|attrs| attrs.set(&SUBJECT_TOKEN_ATTR, bearer.clone()));
            }
            let outcome = dispatch(&session, msg).await;
            if matches!(outcome, Outcome::Reply(_)) {
                if let Err(err) = state.store.store(&session).await {
                    debug!(error = %err, "failed to persist fresh session");
                }
            }
            (outcome, Some(fresh_id))
        }
        Some(id) => match state.store.acquire(&id).await {
            Ok(Some(session)) => {
                state.wire_session(&session);
                if let Some(bearer) = &bearer {
                    session.with_attrs(|attrs| attrs.set(&SUBJECT_TOKEN_ATTR, bearer.clone()));
                }
                let outcome = dispatch(&session, msg).await;
                if let Err(err) = state.store.release(&session).await {
                    debug!(error = %err, "release failed");
                }
                (outcome, Some(id))
            }
            Ok(None) => (Outcome::NotFound, None),
            Err(err) => {
                let error = Message::error_response(
                    request_id.clone(),
                    CoreError::from(err).to_rpc_error(),
                );
                (Outcome::Reply(error), Some(id))
            }
        },
    };

    let mut response = match &outcome {
        Outcome::Reply(message) => (StatusCode::OK, Json(message.clone())).into_response(),
        Outcome::Accepted => StatusCode::ACCEPTED.into_response(),
        Outcome::AuthRequired => {
            let challenge = challenge_header(&headers, &state.endpoint_path);
            (
                StatusCode::UNAUTHORIZED,
                [("WWW-Authenticate", challenge)],
            )
                .into_response()
        }
        Outcome::NotFound => StatusCode::NOT_FOUND.into_response(),
    };
    if let Some(id) = effective_id {
        if !matches!(outcome, Outcome::NotFound) {
            if let Ok(value) = id.parse() {
                response.headers_mut().insert(SESSION_ID_HEADER, value);
            }
        }
    }

    record.status = response.status().as_u16();
    record.elapsed_ms = started.elapsed().as_millis() as u64;
    state.audit.record(record);
    response
}

async fn dispatch(session: &Arc<Session>, msg: Message) -> Outcome {
    let request_id = msg.id.clone();
    match Session::dispatch(session, msg).await {
        Ok(Some(response)) => Outcome::Reply(response),
        Ok(None) => Outcome::Accepted,
        Err(CoreError::AuthRequired { .. }) => Outcome::AuthRequired,
        Err(CoreError::SessionNotFound { .. }) => Outcome::NotFound,
        Err(err) => Outcome::Reply(Message::error_response(request_id, err.to_rpc_error())),
    }
}

/// The server-to-client stream: replay from the ring, then live mailbox
/// frames, each carrying a monotonically increasing event id.
pub async fn atp_get(State(state): State<GatewayState>, headers: HeaderMap) -> Response {
    let session_header = headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok());
    let Some(session_id) = extract_session_id(session_header, None) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let session = match state.store.acquire(&session_id).await {
        Ok(Some(session)) => session,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(_) => return StatusCode::CONFLICT.into_response(),
    };
    state.wire_session(&session);

    // One live reader per session.
    if !state.sse_readers.insert(session_id.clone()) {
        let _ = state.store.release(&session).await;
        return StatusCode::CONFLICT.into_response();
    }
    let Some(mailbox) = session.take_mailbox() else {
        state.sse_readers.remove(&session_id);
        let _ = state.store.release(&session).await;
        return StatusCode::CONFLICT.into_response();
    };
    // The stream outlives the exclusive hold; release before streaming.
    let _ = state.store.release(&session).await;

    let ring = state.ring_for(&session_id);
    let last_seen = headers
        .get("Last-Event-ID")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    let replay = ring.replay_after(last_seen);

    let live = MailboxStream {
        session,
        mailbox: Some(mailbox),
        ring,
        readers: state.sse_readers.clone(),
        session_id,
    };
    let replayed = futures_util::stream::iter(
        replay
            .into_iter()
            .map(|(id, data)| Ok::<_, Infallible>(Event::default().id(id.to_string()).data(data))),
    );
    let stream = futures_util::StreamExt::chain(replayed, live);
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

struct MailboxStream {
    session: Arc<Session>,
    mailbox: Option<UnboundedReceiver<Message>>,
    ring: Arc<EventRing>,
    readers: Arc<dashmap::DashSet<String>>,
    session_id: String,
}

impl Stream for MailboxStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let Some(mailbox) = self.mailbox.as_mut() else {
            return Poll::Ready(None);
        };
        match mailbox.poll_recv(cx) {
            Poll::Ready(Some(msg)) => {
                let data = serde_json::to_string(&msg).unwrap_or_default();
                let id = self.ring.push(data.clone());
                Poll::Ready(Some(Ok(Event::default().id(id.to_string()).data(data))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for MailboxStream {
    fn drop(&mut self) {
        if let Some(mailbox) = self.mailbox.take() {
            self.session.return_mailbox(mailbox);
        }
        self.readers.remove(&self.session_id);
    }
}

pub async fn atp_delete(State(state): State<GatewayState>, headers: HeaderMap) -> Response {
    let session_header = headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok());
    let Some(session_id) = extract_session_id(session_header, None) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    match state.store.load_and_delete(&session_id).await {
        Ok(Some(_)) => {
            state.rings.remove(&session_id);
            StatusCode::OK.into_response()
        }
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(StoreError::Busy(_)) => StatusCode::CONFLICT.into_response(),
        Err(err) => {
            debug!(error = %err, "delete failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
