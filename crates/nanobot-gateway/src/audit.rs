//! Buffered audit collection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tracing::info;

const QUEUE_CAP: usize = 1024;
const FLUSH_BATCH: usize = 32;
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// One self-contained call record.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub start: String,
    pub client_ip: String,
    /// Redacted; only the scheme survives.
    pub authorization: String,
    pub headers: Vec<(String, String)>,
    pub subject: String,
    pub method: String,
    /// `uri` for resource reads, `name` for tool and prompt calls.
    pub call_id: String,
    pub status: u16,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Receives flushed batches.
pub trait AuditSink: Send + Sync {
    fn write(&self, batch: &[AuditRecord]);
}

/// Default sink: one structured log line per record.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn write(&self, batch: &[AuditRecord]) {
        for record in batch {
            info!(
                target: "audit",
                method = %record.method,
                call_id = %record.call_id,
                client_ip = %record.client_ip,
                subject = %record.subject,
                status = record.status,
                elapsed_ms = record.elapsed_ms,
                "atp call"
            );
        }
    }
}

/// Bounded queue flushed on batch size or interval. Under backpressure the
/// oldest records are dropped and counted; audit never blocks serving.
pub struct AuditCollector {
    queue: Mutex<VecDeque<AuditRecord>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl AuditCollector {
    /// Create the collector and its background flusher.
    pub fn start(sink: Arc<dyn AuditSink>) -> Arc<Self> {
        let collector = Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        });
        let worker = collector.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(FLUSH_INTERVAL);
            loop {
                tokio::select! {
                    _ = worker.notify.notified() => {}
                    _ = interval.tick() => {}
                }
                let batch = worker.drain();
                if !batch.is_empty() {
                    sink.write(&batch);
                }
            }
        });
        collector
    }

    pub fn record(&self, record: AuditRecord) {
        let should_flush = {
            let mut queue = self.queue.lock().expect("lock");
            if queue.len() >= QUEUE_CAP {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(record);
            queue.len() >= FLUSH_BATCH
        };
        if should_flush {
            self.notify.notify_one();
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn drain(&self) -> Vec<AuditRecord> {
        self.queue.lock().expect("lock").drain(..).collect()
    }
}

/// Keep the auth scheme, hide the credential.
pub fn redact_authorization(value: &str) -> String {
    match value.split_once(' ') {
        Some((scheme, _)) => format!("{} ******", scheme),
        None if value.is_empty() => String::new(),
        None => "******".to_string(),
    }
}

/// Copy headers with sensitive values masked.
pub fn masked_headers(headers: &axum::http::HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let name_str = name.as_str().to_ascii_lowercase();
            let rendered = if matches!(
                name_str.as_str(),
                "authorization" | "cookie" | "x-api-key" | "proxy-authorization"
            ) {
                "******".to_string()
            } else {
                value.to_str().unwrap_or("<binary>").to_string()
            };
            (name_str, rendered)
        })
        .collect()
}
