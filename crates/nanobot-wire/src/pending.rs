//! Correlation table for in-flight requests.

use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use nanobot_types::{Message, RequestId};
use tokio::sync::oneshot;

use crate::error::WireError;

struct Pending {
    /// The request as sent, kept so it can be re-issued after a reconnect.
    request: Message,
    tx: oneshot::Sender<Message>,
}

/// Outbound request table: id to one-shot response channel.
///
/// Ids allocated here are numeric and strictly increasing. Registering an id
/// that is already pending is an error; the table never silently replaces a
/// waiter.
#[derive(Default)]
pub struct PendingRequests {
    next_id: AtomicI64,
    inflight: DashMap<RequestId, Pending>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            inflight: DashMap::new(),
        }
    }

    /// Allocate a fresh numeric id.
    pub fn allocate(&self) -> RequestId {
        RequestId::Num(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a waiter for the request's id.
    pub fn register(&self, request: Message) -> Result<oneshot::Receiver<Message>, WireError> {
        let id = request
            .id
            .clone()
            .ok_or_else(|| WireError::transport("cannot register a notification"))?;
        let (tx, rx) = oneshot::channel();
        match self.inflight.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(WireError::DuplicateId(id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Pending { request, tx });
                Ok(rx)
            }
        }
    }

    /// Route an inbound response to its waiter. Returns false when the id is
    /// unknown (already resolved, or regenerated after a reconnect).
    pub fn resolve(&self, response: Message) -> bool {
        let Some(id) = response.id.clone() else {
            return false;
        };
        match self.inflight.remove(&id) {
            Some((_, pending)) => pending.tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Drop a waiter without resolving it.
    pub fn forget(&self, id: &RequestId) {
        self.inflight.remove(id);
    }

    /// Re-key every in-flight request under a freshly allocated id and return
    /// the re-addressed requests for re-sending. Responses addressed to the
    /// old ids are no longer routable, which disambiguates duplicates after
    /// an SSE reconnect.
    pub fn regenerate_ids(&self) -> Vec<Message> {
        let old_ids: Vec<RequestId> = self.inflight.iter().map(|e| e.key().clone()).collect();
        let mut resend = Vec::new();
        for old in old_ids {
            if let Some((_, mut pending)) = self.inflight.remove(&old) {
                let fresh = self.allocate();
                pending.request.id = Some(fresh.clone());
                resend.push(pending.request.clone());
                self.inflight.insert(fresh, pending);
            }
        }
        resend
    }

    /// Drop every waiter; their receivers observe closure.
    pub fn close(&self) {
        self.inflight.clear();
    }

    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn req(id: i64) -> Message {
        Message::request(id, "ping", json!({}))
    }

    #[tokio::test]
    async fn test_resolve_routes_by_id() {
        let table = PendingRequests::new();
        let rx1 = table.register(req(1)).unwrap();
        let rx2 = table.register(req(2)).unwrap();

        assert!(table.resolve(Message::response(RequestId::Num(2), json!("two"))));
        assert!(table.resolve(Message::response(RequestId::Num(1), json!("one"))));

        assert_eq!(rx1.await.unwrap().result, Some(json!("one")));
        assert_eq!(rx2.await.unwrap().result, Some(json!("two")));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let table = PendingRequests::new();
        let _rx = table.register(req(7)).unwrap();
        match table.register(req(7)) {
            Err(WireError::DuplicateId(RequestId::Num(7))) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_response_ignored() {
        let table = PendingRequests::new();
        assert!(!table.resolve(Message::response(RequestId::Num(99), json!(null))));
    }

    #[test]
    fn test_notification_never_routed() {
        let table = PendingRequests::new();
        let _rx = table.register(req(1)).unwrap();
        let note = Message::notification("notifications/progress", None);
        assert!(!table.resolve(note));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_close_drops_waiters() {
        let table = PendingRequests::new();
        let rx = table.register(req(1)).unwrap();
        table.close();
        assert!(rx.await.is_err());
    }

    #[test]
    fn test_regenerate_ids_rekeys_inflight() {
        let table = PendingRequests::new();
        let _rx = table.register(req(1)).unwrap();
        let resend = table.regenerate_ids();
        assert_eq!(resend.len(), 1);
        let fresh = resend[0].id.clone().unwrap();
        assert_ne!(fresh, RequestId::Num(1));
        // The old id no longer routes; the fresh one does.
        assert!(!table.resolve(Message::response(RequestId::Num(1), json!(null))));
        assert!(table.resolve(Message::response(fresh, json!(null))));
    }
}
