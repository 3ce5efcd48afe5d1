//! Page listing and the copy-to-send workflow.

use std::sync::Arc;

use recorder_sdk::RecorderApi;
use recorder_sdk::types::{Page, PageScope};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::info;

use crate::clip::ClipMailbox;
use crate::error::{RecorderError, RecorderResult};
use crate::model::normalize_user_code;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    Team,
    Private,
}

/// Where a clip should be appended.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendDestination {
    pub scope: ScopeKind,
    #[serde(default)]
    pub page_id: Option<String>,
    #[serde(default)]
    pub user_code: Option<String>,
}

/// Resolves a scope. Private pages belong to the explicit user code, or to the
/// recording user when none is given.
pub fn resolve_scope(
    kind: ScopeKind,
    explicit: Option<&str>,
    recording: Option<&str>,
) -> RecorderResult<PageScope> {
    match kind {
        ScopeKind::Team => Ok(PageScope::Team),
        ScopeKind::Private => explicit
            .filter(|code| !code.trim().is_empty())
            .or(recording)
            .map(|code| PageScope::Private {
                user_code: normalize_user_code(code),
            })
            .ok_or_else(|| {
                RecorderError::InvalidRequest("private pages need a user code".into())
            }),
    }
}

pub struct SendService {
    api: Arc<dyn RecorderApi>,
    clips: Arc<ClipMailbox>,
    sending: Mutex<()>,
}

impl SendService {
    pub fn new(api: Arc<dyn RecorderApi>, clips: Arc<ClipMailbox>) -> Self {
        Self {
            api,
            clips,
            sending: Mutex::new(()),
        }
    }

    pub async fn list_pages(&self, scope: &PageScope) -> RecorderResult<Vec<Page>> {
        Ok(self.api.list_pages(scope).await?)
    }

    pub async fn create_page(&self, scope: &PageScope, title: &str) -> RecorderResult<Page> {
        let title = title.trim();
        if title.is_empty() {
            return Err(RecorderError::InvalidRequest("page title is empty".into()));
        }
        let page = self.api.create_page(scope, title).await?;
        info!(target: "recorder.clip", page_id = %page.id, scope = %scope.path(), "page created");
        Ok(page)
    }

    /// Appends the pending clip to a page and empties the mailbox once the
    /// backend accepted it. A failed send leaves the clip in place.
    pub async fn send_pending(
        &self,
        scope: &PageScope,
        page_id: Option<&str>,
    ) -> RecorderResult<Value> {
        let _sending = self.sending.lock().await;
        let clip = self.clips.read().await?.ok_or(RecorderError::NoPendingClip)?;
        let page_id = page_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or(RecorderError::NoPageSelected)?;
        clip.validate()?;

        let result = self
            .api
            .append_to_page(scope, page_id, &clip.to_page_append())
            .await?;
        info!(
            target: "recorder.clip",
            page_id,
            scope = %scope.path(),
            kind = clip.kind(),
            "clip sent"
        );
        self.clips.clear().await?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::{ClipInput, PendingClip};
    use crate::testing::ScriptedApi;
    use recorder_sdk::kv_store::MemoryKvStore;

    fn service(api: Arc<ScriptedApi>) -> (SendService, Arc<ClipMailbox>) {
        let clips = Arc::new(ClipMailbox::new(MemoryKvStore::new(), MemoryKvStore::new()));
        (SendService::new(api, clips.clone()), clips)
    }

    async fn put_text(clips: &ClipMailbox, text: &str) {
        let clip = PendingClip::from_input(ClipInput {
            text: Some(text.into()),
            source_title: Some("Docs".into()),
            ..ClipInput::default()
        })
        .unwrap();
        clips.set(&clip).await.unwrap();
    }

    #[test]
    fn private_scope_falls_back_to_recording_user() {
        assert_eq!(
            resolve_scope(ScopeKind::Private, None, Some("AB12")).unwrap(),
            PageScope::Private {
                user_code: "AB12".into()
            }
        );
        assert_eq!(
            resolve_scope(ScopeKind::Private, Some("cd34"), Some("AB12")).unwrap(),
            PageScope::Private {
                user_code: "CD34".into()
            }
        );
        assert!(resolve_scope(ScopeKind::Private, None, None).is_err());
        assert_eq!(
            resolve_scope(ScopeKind::Team, None, None).unwrap(),
            PageScope::Team
        );
    }

    #[tokio::test]
    async fn send_appends_and_clears_the_clip() {
        let api = ScriptedApi::new();
        let (service, clips) = service(api.clone());
        put_text(&clips, "hello").await;

        service.send_pending(&PageScope::Team, Some("42")).await.unwrap();

        let appended = api.appended();
        assert_eq!(appended.len(), 1);
        assert_eq!(appended[0].1, "42");
        assert_eq!(appended[0].2.text.as_deref(), Some("hello"));
        assert_eq!(appended[0].2.source_title.as_deref(), Some("Docs"));
        assert_eq!(clips.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn send_errors_leave_the_clip_in_place() {
        let api = ScriptedApi::new();
        let (service, clips) = service(api.clone());

        let err = service.send_pending(&PageScope::Team, Some("42")).await.unwrap_err();
        assert_eq!(err.user_message(), "no clip found");

        put_text(&clips, "hello").await;
        let err = service.send_pending(&PageScope::Team, Some(" ")).await.unwrap_err();
        assert_eq!(err.user_message(), "no page selected");

        api.fail_next_appends(1);
        let err = service.send_pending(&PageScope::Team, Some("42")).await.unwrap_err();
        assert_eq!(err.user_message(), "request failed (404): page not found");
        assert!(clips.read().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn create_page_rejects_blank_titles() {
        let api = ScriptedApi::new();
        let (service, _clips) = service(api.clone());
        assert_eq!(
            service
                .create_page(&PageScope::Team, "  ")
                .await
                .unwrap_err()
                .code(),
            "invalid_request"
        );
        let page = service.create_page(&PageScope::Team, "Notes").await.unwrap();
        let pages = service.list_pages(&PageScope::Team).await.unwrap();
        assert_eq!(pages, vec![page]);
    }
}
