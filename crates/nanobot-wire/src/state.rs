//! Snapshot of an established client session, for resumption.

use nanobot_types::InitializeResult;
use serde::{Deserialize, Serialize};

/// Everything needed to reattach to a live peer session without another
/// initialize round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub initialize_result: InitializeResult,
    /// Legacy-mode POST endpoint, when the peer announced one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_override: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_state_roundtrip() {
        let state = SessionState {
            session_id: "s-1".into(),
            initialize_result: InitializeResult {
                protocol_version: "2025-06-18".into(),
                ..Default::default()
            },
            endpoint_override: None,
        };
        let raw = serde_json::to_string(&state).unwrap();
        let back: SessionState = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.session_id, "s-1");
        assert!(!raw.contains("endpoint_override"));
    }
}
