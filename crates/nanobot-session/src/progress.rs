//! Strictly monotonic progress normalisation.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use serde_json::Value;

const DEFAULT_CAPACITY: usize = 1024;

/// Last-seen progress per `(session, token)`, bounded so abandoned tokens
/// age out instead of accumulating for the life of the process.
pub struct ProgressFloor {
    floors: Mutex<LruCache<(String, String), f64>>,
}

impl Default for ProgressFloor {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl ProgressFloor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            floors: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).expect("non-zero"),
            )),
        }
    }

    /// Normalise one observation so the sequence under a token is strictly
    /// increasing: a value at or below the floor is bumped just past it, by
    /// 1 when the emitter reports no total and by 0.01 when it does.
    pub fn normalize(&self, session_id: &str, token: &Value, progress: f64, total: Option<f64>) -> f64 {
        let key = (session_id.to_string(), token_key(token));
        let mut floors = self.floors.lock().expect("lock");
        let value = match floors.get(&key) {
            Some(last) if progress <= *last => {
                last + if total.is_some() { 0.01 } else { 1.0 }
            }
            _ => progress,
        };
        floors.put(key, value);
        value
    }
}

fn token_key(token: &Value) -> String {
    match token {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
