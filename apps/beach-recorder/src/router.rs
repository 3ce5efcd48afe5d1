//! Action-tagged requests from UI surfaces and their JSON answers.

use recorder_sdk::types::string_or_number;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::clip::ClipInput;
use crate::engine::Engine;
use crate::error::{RecorderError, RecorderResult};
use crate::metrics;
use crate::model::EventKind;
use crate::send::{ScopeKind, SendDestination};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecorderRequest {
    #[serde(rename_all = "camelCase")]
    StartRecording {
        user_code: String,
        session_code: Value,
    },
    StopRecording,
    GetRecordingData,
    #[serde(rename_all = "camelCase")]
    RecordEvent {
        event_type: String,
        #[serde(default)]
        payload: Map<String, Value>,
    },
    GetSyncStatus,
    #[serde(rename_all = "camelCase")]
    CreateCallout {
        #[serde(default)]
        user_code: Option<String>,
        #[serde(default)]
        session_code: Option<Value>,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    AcknowledgeCallout {
        #[serde(deserialize_with = "string_or_number")]
        callout_id: String,
        #[serde(default)]
        actor_name: Option<String>,
    },
    SetPendingClip(ClipInput),
    GetPendingClip,
    OpenSendFromPage,
    #[serde(rename_all = "camelCase")]
    ListPages {
        scope: ScopeKind,
        #[serde(default)]
        user_code: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    CreatePage {
        scope: ScopeKind,
        #[serde(default)]
        user_code: Option<String>,
        title: String,
    },
    SendPendingClip {
        destination: SendDestination,
    },
}

impl RecorderRequest {
    pub fn action(&self) -> &'static str {
        match self {
            RecorderRequest::StartRecording { .. } => "START_RECORDING",
            RecorderRequest::StopRecording => "STOP_RECORDING",
            RecorderRequest::GetRecordingData => "GET_RECORDING_DATA",
            RecorderRequest::RecordEvent { .. } => "RECORD_EVENT",
            RecorderRequest::GetSyncStatus => "GET_SYNC_STATUS",
            RecorderRequest::CreateCallout { .. } => "CREATE_CALLOUT",
            RecorderRequest::AcknowledgeCallout { .. } => "ACKNOWLEDGE_CALLOUT",
            RecorderRequest::SetPendingClip(_) => "SET_PENDING_CLIP",
            RecorderRequest::GetPendingClip => "GET_PENDING_CLIP",
            RecorderRequest::OpenSendFromPage => "OPEN_SEND_FROM_PAGE",
            RecorderRequest::ListPages { .. } => "LIST_PAGES",
            RecorderRequest::CreatePage { .. } => "CREATE_PAGE",
            RecorderRequest::SendPendingClip { .. } => "SEND_PENDING_CLIP",
        }
    }
}

/// Single entry point for mutations. Every request waits for restoration.
#[derive(Clone)]
pub struct MessageRouter {
    engine: Engine,
}

impl MessageRouter {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Parses a raw message. Anything unparseable is answered, not dropped.
    pub async fn handle_json(&self, message: Value) -> Value {
        match serde_json::from_value::<RecorderRequest>(message) {
            Ok(request) => self.dispatch(request).await,
            Err(err) => {
                metrics::ROUTER_REQUESTS
                    .with_label_values(&["UNKNOWN", "rejected"])
                    .inc();
                warn!(target: "recorder.router", error = %err, "unreadable message");
                failure(&RecorderError::InvalidRequest(err.to_string()))
            }
        }
    }

    pub async fn dispatch(&self, request: RecorderRequest) -> Value {
        self.engine.ready().await;
        let action = request.action();
        debug!(target: "recorder.router", action, "handling message");
        match self.handle(request).await {
            Ok(answer) => {
                metrics::ROUTER_REQUESTS
                    .with_label_values(&[action, "ok"])
                    .inc();
                answer
            }
            Err(err) => {
                metrics::ROUTER_REQUESTS
                    .with_label_values(&[action, "error"])
                    .inc();
                debug!(target: "recorder.router", action, error = %err, "message failed");
                failure(&err)
            }
        }
    }

    async fn handle(&self, request: RecorderRequest) -> RecorderResult<Value> {
        let engine = &self.engine;
        Ok(match request {
            RecorderRequest::StartRecording {
                user_code,
                session_code,
            } => {
                let backend_connected = engine.start(&user_code, &session_code).await?;
                json!({ "success": true, "backendConnected": backend_connected })
            }
            RecorderRequest::StopRecording => {
                let event_count = engine.stop().await?;
                json!({ "success": true, "eventCount": event_count })
            }
            RecorderRequest::GetRecordingData => {
                json!({ "success": true, "data": engine.snapshot() })
            }
            RecorderRequest::RecordEvent {
                event_type,
                payload,
            } => {
                if event_type.trim().is_empty() {
                    return Err(RecorderError::InvalidRequest("eventType is required".into()));
                }
                let kind = EventKind::from(event_type);
                if kind.is_lifecycle_marker() {
                    return Err(RecorderError::InvalidRequest(format!(
                        "{} is recorded by the engine only",
                        kind.as_str()
                    )));
                }
                engine.add_event(kind, payload)?;
                json!({ "success": true })
            }
            RecorderRequest::GetSyncStatus => {
                json!({ "success": true, "status": engine.sync_status() })
            }
            RecorderRequest::CreateCallout {
                user_code,
                session_code,
                message,
            } => {
                let data = engine
                    .create_callout(user_code.as_deref(), session_code.as_ref(), &message)
                    .await?;
                json!({ "success": true, "data": data })
            }
            RecorderRequest::AcknowledgeCallout {
                callout_id,
                actor_name,
            } => {
                let data = engine
                    .acknowledge_callout(&callout_id, actor_name.as_deref())
                    .await?;
                json!({ "success": true, "data": data })
            }
            RecorderRequest::SetPendingClip(input) => {
                engine.set_pending_clip(input).await?;
                json!({ "success": true })
            }
            RecorderRequest::GetPendingClip => {
                json!({ "success": true, "data": engine.pending_clip().await? })
            }
            RecorderRequest::OpenSendFromPage => {
                engine.open_send_from_page().await;
                json!({ "success": true })
            }
            RecorderRequest::ListPages { scope, user_code } => {
                let scope = engine.page_scope(scope, user_code.as_deref())?;
                json!({ "success": true, "pages": engine.list_pages(&scope).await? })
            }
            RecorderRequest::CreatePage {
                scope,
                user_code,
                title,
            } => {
                let scope = engine.page_scope(scope, user_code.as_deref())?;
                json!({ "success": true, "page": engine.create_page(&scope, &title).await? })
            }
            RecorderRequest::SendPendingClip { destination } => {
                let data = engine.send_pending_clip(&destination).await?;
                json!({ "success": true, "data": data })
            }
        })
    }
}

fn failure(err: &RecorderError) -> Value {
    json!({ "success": false, "error": err.user_message(), "code": err.code() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_actions_with_wire_field_names() {
        let request: RecorderRequest = serde_json::from_value(json!({
            "action": "START_RECORDING",
            "userCode": "ab12",
            "sessionCode": 99
        }))
        .unwrap();
        assert_eq!(request.action(), "START_RECORDING");

        let request: RecorderRequest = serde_json::from_value(json!({
            "action": "ACKNOWLEDGE_CALLOUT",
            "calloutId": 17
        }))
        .unwrap();
        match request {
            RecorderRequest::AcknowledgeCallout { callout_id, .. } => assert_eq!(callout_id, "17"),
            other => panic!("unexpected {other:?}"),
        }

        let request: RecorderRequest = serde_json::from_value(json!({
            "action": "SET_PENDING_CLIP",
            "text": "quote",
            "sourceUrl": "https://example.test"
        }))
        .unwrap();
        assert_eq!(request.action(), "SET_PENDING_CLIP");

        let request: RecorderRequest = serde_json::from_value(json!({
            "action": "STOP_RECORDING",
            "requestId": "ignored"
        }))
        .unwrap();
        assert_eq!(request.action(), "STOP_RECORDING");
    }

    #[test]
    fn unknown_actions_do_not_parse() {
        assert!(serde_json::from_value::<RecorderRequest>(json!({ "action": "FORMAT_DISK" })).is_err());
    }
}
