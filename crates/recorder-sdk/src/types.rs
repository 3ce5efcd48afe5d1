use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Kind tag attached to every recorded event.
///
/// Known kinds map to fixed wire names; anything else a capture surface sends
/// is carried through verbatim as [`EventKind::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    ExtensionLoaded,
    ExtensionResumed,
    PageVisit,
    TabActivated,
    Click,
    FormSubmit,
    Copy,
    Custom(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::ExtensionLoaded => "EXTENSION_LOADED",
            EventKind::ExtensionResumed => "EXTENSION_RESUMED",
            EventKind::PageVisit => "PAGE_VISIT",
            EventKind::TabActivated => "TAB_ACTIVATED",
            EventKind::Click => "CLICK",
            EventKind::FormSubmit => "FORM_SUBMIT",
            EventKind::Copy => "COPY",
            EventKind::Custom(name) => name.as_str(),
        }
    }

    /// Markers the recorder inserts itself rather than capturing from a page.
    pub fn is_lifecycle_marker(&self) -> bool {
        matches!(
            self,
            EventKind::ExtensionLoaded | EventKind::ExtensionResumed
        )
    }
}

impl From<String> for EventKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "EXTENSION_LOADED" => EventKind::ExtensionLoaded,
            "EXTENSION_RESUMED" => EventKind::ExtensionResumed,
            "PAGE_VISIT" => EventKind::PageVisit,
            "TAB_ACTIVATED" => EventKind::TabActivated,
            "CLICK" => EventKind::Click,
            "FORM_SUBMIT" => EventKind::FormSubmit,
            "COPY" => EventKind::Copy,
            _ => EventKind::Custom(value),
        }
    }
}

impl From<EventKind> for String {
    fn from(value: EventKind) -> Self {
        match value {
            EventKind::Custom(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single captured event. Never mutated once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub payload: Map<String, Value>,
    pub captured_at: DateTime<Utc>,
}

impl NavigationEvent {
    pub fn new(kind: EventKind, payload: Map<String, Value>) -> Self {
        Self {
            kind,
            payload,
            captured_at: Utc::now(),
        }
    }
}

/// One logical save. Retries of the same batch reuse `batch_id` so the
/// backend can drop duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBatch {
    pub batch_id: Uuid,
    pub user_code: String,
    pub session_code: String,
    pub events: Vec<NavigationEvent>,
}

impl EventBatch {
    pub fn new(user_code: &str, session_code: &str, events: Vec<NavigationEvent>) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            user_code: user_code.to_string(),
            session_code: session_code.to_string(),
            events,
        }
    }
}

/// Server-issued notification for the participants of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Callout {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub author_code: Option<String>,
    #[serde(default)]
    pub author_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalloutQuery {
    pub user_code: String,
    pub session_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCallout {
    pub user_code: String,
    pub session_code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalloutAck {
    pub callout_id: String,
    pub actor_code: String,
    pub actor_name: String,
}

/// Where a page lives: the shared team space or one user's private space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageScope {
    Team,
    Private { user_code: String },
}

impl PageScope {
    pub fn path(&self) -> String {
        match self {
            PageScope::Team => "team".to_string(),
            PageScope::Private { user_code } => format!("private/{user_code}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Content appended to a page by the send workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageAppend {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_title: Option<String>,
    pub captured_at: DateTime<Utc>,
}

/// Backends return page lists either bare or wrapped in `{ "pages": [...] }`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum PageList {
    Bare(Vec<Page>),
    Wrapped { pages: Vec<Page> },
}

impl From<PageList> for Vec<Page> {
    fn from(value: PageList) -> Self {
        match value {
            PageList::Bare(pages) => pages,
            PageList::Wrapped { pages } => pages,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum CalloutList {
    Bare(Vec<Callout>),
    Wrapped { callouts: Vec<Callout> },
}

impl From<CalloutList> for Vec<Callout> {
    fn from(value: CalloutList) -> Self {
        match value {
            CalloutList::Bare(callouts) => callouts,
            CalloutList::Wrapped { callouts } => callouts,
        }
    }
}

/// Identifiers arrive as strings or numbers depending on the backend table.
pub fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number identifier, got {other}"
        ))),
    }
}
