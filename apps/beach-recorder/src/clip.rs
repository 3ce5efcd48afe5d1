//! Single-slot handoff of a captured selection or image to the send window.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use recorder_sdk::kv_store::{KvStore, StoreError};
use recorder_sdk::types::PageAppend;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{RecorderError, RecorderResult};

pub const PENDING_CLIP_KEY: &str = "pending_clip";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PendingClip {
    #[serde(rename_all = "camelCase")]
    Text {
        text: String,
        source_url: Option<String>,
        source_title: Option<String>,
        captured_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Image {
        image_url: String,
        source_url: Option<String>,
        source_title: Option<String>,
        captured_at: DateTime<Utc>,
    },
}

/// Clip fields as a capture surface sends them.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipInput {
    pub text: Option<String>,
    pub image_url: Option<String>,
    pub source_url: Option<String>,
    pub source_title: Option<String>,
    pub captured_at: Option<DateTime<Utc>>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl PendingClip {
    /// Text wins when a surface sends both text and an image.
    pub fn from_input(input: ClipInput) -> RecorderResult<Self> {
        let captured_at = input.captured_at.unwrap_or_else(Utc::now);
        let source_url = non_blank(input.source_url);
        let source_title = non_blank(input.source_title);
        if let Some(text) = non_blank(input.text) {
            return Ok(PendingClip::Text {
                text,
                source_url,
                source_title,
                captured_at,
            });
        }
        if let Some(image_url) = non_blank(input.image_url) {
            return Ok(PendingClip::Image {
                image_url,
                source_url,
                source_title,
                captured_at,
            });
        }
        Err(RecorderError::MalformedClip("text or imageUrl"))
    }

    /// Rejects clips whose content became empty, e.g. a hand-edited store.
    pub fn validate(&self) -> RecorderResult<()> {
        match self {
            PendingClip::Text { text, .. } if text.trim().is_empty() => {
                Err(RecorderError::MalformedClip("text"))
            }
            PendingClip::Image { image_url, .. } if image_url.trim().is_empty() => {
                Err(RecorderError::MalformedClip("imageUrl"))
            }
            _ => Ok(()),
        }
    }

    pub fn to_page_append(&self) -> PageAppend {
        match self.clone() {
            PendingClip::Text {
                text,
                source_url,
                source_title,
                captured_at,
            } => PageAppend {
                text: Some(text),
                image_url: None,
                source_url,
                source_title,
                captured_at,
            },
            PendingClip::Image {
                image_url,
                source_url,
                source_title,
                captured_at,
            } => PageAppend {
                text: None,
                image_url: Some(image_url),
                source_url,
                source_title,
                captured_at,
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PendingClip::Text { .. } => "text",
            PendingClip::Image { .. } => "image",
        }
    }
}

/// Last write wins. The session-scoped area is tried first, the persistent
/// area only when it fails.
pub struct ClipMailbox {
    session: Arc<dyn KvStore>,
    persistent: Arc<dyn KvStore>,
}

impl ClipMailbox {
    pub fn new(session: Arc<dyn KvStore>, persistent: Arc<dyn KvStore>) -> Self {
        Self {
            session,
            persistent,
        }
    }

    pub async fn set(&self, clip: &PendingClip) -> RecorderResult<()> {
        let value = serde_json::to_value(clip).map_err(StoreError::from)?;
        match self.session.set(PENDING_CLIP_KEY, value.clone()).await {
            Ok(()) => {
                // An older fallback copy must not outlive the new clip.
                if let Err(err) = self.persistent.remove(&[PENDING_CLIP_KEY]).await {
                    debug!(target: "recorder.clip", error = %err, "stale fallback clip not removed");
                }
                debug!(target: "recorder.clip", kind = clip.kind(), "pending clip stored");
                Ok(())
            }
            Err(session_err) => {
                warn!(
                    target: "recorder.clip",
                    error = %session_err,
                    "session store rejected clip; falling back to persistent store"
                );
                self.persistent.set(PENDING_CLIP_KEY, value).await?;
                if let Err(err) = self.session.remove(&[PENDING_CLIP_KEY]).await {
                    debug!(target: "recorder.clip", error = %err, "stale session clip not removed");
                }
                Ok(())
            }
        }
    }

    pub async fn read(&self) -> RecorderResult<Option<PendingClip>> {
        let session_failed = match self.session.get(PENDING_CLIP_KEY).await {
            Ok(Some(value)) => {
                if let Some(clip) = decode(value) {
                    return Ok(Some(clip));
                }
                false
            }
            Ok(None) => false,
            Err(err) => {
                warn!(target: "recorder.clip", error = %err, "session store unreadable");
                true
            }
        };
        match self.persistent.get(PENDING_CLIP_KEY).await {
            Ok(value) => Ok(value.and_then(decode)),
            Err(err) if session_failed => Err(err.into()),
            Err(err) => {
                warn!(target: "recorder.clip", error = %err, "persistent store unreadable");
                Ok(None)
            }
        }
    }

    /// Empties the slot in both areas. Fails only when neither could be cleared.
    pub async fn clear(&self) -> RecorderResult<()> {
        let session = self.session.remove(&[PENDING_CLIP_KEY]).await;
        let persistent = self.persistent.remove(&[PENDING_CLIP_KEY]).await;
        match (session, persistent) {
            (Err(_), Err(err)) => Err(err.into()),
            _ => Ok(()),
        }
    }
}

fn decode(value: serde_json::Value) -> Option<PendingClip> {
    match serde_json::from_value(value) {
        Ok(clip) => Some(clip),
        Err(err) => {
            warn!(target: "recorder.clip", error = %err, "ignoring unreadable pending clip");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::UnavailableStore;
    use recorder_sdk::kv_store::MemoryKvStore;
    use serde_json::json;

    fn text_clip(text: &str) -> PendingClip {
        PendingClip::from_input(ClipInput {
            text: Some(text.into()),
            source_url: Some("https://example.test/a".into()),
            captured_at: Some("2024-05-01T12:00:00Z".parse().unwrap()),
            ..ClipInput::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn last_write_wins() {
        let mailbox = ClipMailbox::new(MemoryKvStore::new(), MemoryKvStore::new());
        mailbox.set(&text_clip("A")).await.unwrap();
        mailbox.set(&text_clip("B")).await.unwrap();
        assert_eq!(mailbox.read().await.unwrap(), Some(text_clip("B")));
    }

    #[tokio::test]
    async fn falls_back_to_persistent_store() {
        let persistent = MemoryKvStore::new();
        let mailbox = ClipMailbox::new(Arc::new(UnavailableStore), persistent.clone());
        let clip = text_clip("copied");
        mailbox.set(&clip).await.unwrap();

        assert!(persistent.get(PENDING_CLIP_KEY).await.unwrap().is_some());
        assert_eq!(mailbox.read().await.unwrap(), Some(clip));
    }

    #[tokio::test]
    async fn both_stores_failing_is_storage_unavailable() {
        let mailbox = ClipMailbox::new(Arc::new(UnavailableStore), Arc::new(UnavailableStore));
        let err = mailbox.set(&text_clip("x")).await.unwrap_err();
        assert_eq!(err.code(), "storage_unavailable");
        assert_eq!(mailbox.read().await.unwrap_err().code(), "storage_unavailable");
    }

    #[tokio::test]
    async fn session_copy_replaces_fallback_copy() {
        let persistent = MemoryKvStore::new();
        persistent
            .set(PENDING_CLIP_KEY, serde_json::to_value(text_clip("old")).unwrap())
            .await
            .unwrap();
        let mailbox = ClipMailbox::new(MemoryKvStore::new(), persistent.clone());
        mailbox.set(&text_clip("new")).await.unwrap();
        mailbox.clear().await.unwrap();
        assert_eq!(mailbox.read().await.unwrap(), None);
    }

    #[test]
    fn image_clips_and_wire_shape() {
        let clip = PendingClip::from_input(ClipInput {
            image_url: Some("https://example.test/i.png".into()),
            ..ClipInput::default()
        })
        .unwrap();
        let encoded = serde_json::to_value(&clip).unwrap();
        assert_eq!(encoded["kind"], "image");
        assert_eq!(encoded["imageUrl"], "https://example.test/i.png");

        let append = clip.to_page_append();
        assert_eq!(append.text, None);
        assert_eq!(append.image_url.as_deref(), Some("https://example.test/i.png"));
    }

    #[test]
    fn empty_clips_are_malformed() {
        let err = PendingClip::from_input(ClipInput {
            text: Some("   ".into()),
            ..ClipInput::default()
        })
        .unwrap_err();
        assert_eq!(err.code(), "malformed_clip");

        let stored: PendingClip = serde_json::from_value(json!({
            "kind": "text",
            "text": "",
            "capturedAt": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(stored.validate().unwrap_err().code(), "malformed_clip");
    }
}
