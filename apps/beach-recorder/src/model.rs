use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

pub use recorder_sdk::types::{Callout, EventKind, NavigationEvent};

/// Who is recording which co-browsing session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionIdentity {
    pub user_code: String,
    pub session_code: String,
}

impl SessionIdentity {
    pub fn new(user_code: &str, session_code: &str) -> Self {
        Self {
            user_code: normalize_user_code(user_code),
            session_code: session_code.trim().to_string(),
        }
    }
}

pub fn normalize_user_code(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// Session codes arrive as JSON strings or numbers; both map to the string form.
pub fn normalize_session_code(raw: &Value) -> Option<String> {
    let code = match raw {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!code.is_empty()).then_some(code)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSession {
    pub user_code: String,
    pub session_code: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub events: Vec<NavigationEvent>,
}

impl RecordingSession {
    pub fn new(identity: &SessionIdentity) -> Self {
        Self {
            user_code: identity.user_code.clone(),
            session_code: identity.session_code.clone(),
            started_at: Utc::now(),
            ended_at: None,
            events: Vec::new(),
        }
    }

    pub fn identity(&self) -> SessionIdentity {
        SessionIdentity {
            user_code: self.user_code.clone(),
            session_code: self.session_code.clone(),
        }
    }

    /// Events that came from page activity, excluding lifecycle markers.
    pub fn captured_count(&self) -> usize {
        self.events
            .iter()
            .filter(|event| !event.kind.is_lifecycle_marker())
            .count()
    }
}

/// Projection of the uploader for status surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub in_flight: bool,
    pub pending_count: usize,
    pub retry_count: u32,
    pub backend_available: bool,
    pub spilled_batches: usize,
}
