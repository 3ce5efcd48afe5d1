use serde::Serialize;
use tokio::sync::broadcast;

use crate::clip::PendingClip;
use crate::model::Callout;

const NOTICE_CHANNEL_DEPTH: usize = 64;

/// Things UI surfaces are told about without asking.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UiNotice {
    Callout {
        callout: Callout,
    },
    #[serde(rename_all = "camelCase")]
    BackendStatus {
        backend_available: bool,
    },
    /// The send window should open, preloaded with the clip if one is waiting.
    OpenSend {
        clip: Option<PendingClip>,
    },
}

impl UiNotice {
    pub fn event_name(&self) -> &'static str {
        match self {
            UiNotice::Callout { .. } => "callout",
            UiNotice::BackendStatus { .. } => "backend_status",
            UiNotice::OpenSend { .. } => "open_send",
        }
    }
}

/// Fan-out of [`UiNotice`]s. Publishing with nobody listening is not an error.
#[derive(Debug, Clone)]
pub struct NoticeBus {
    sender: broadcast::Sender<UiNotice>,
}

impl Default for NoticeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl NoticeBus {
    pub fn new() -> Self {
        Self {
            sender: broadcast::channel(NOTICE_CHANNEL_DEPTH).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiNotice> {
        self.sender.subscribe()
    }

    /// Returns how many subscribers received the notice.
    pub fn publish(&self, notice: UiNotice) -> usize {
        self.sender.send(notice).unwrap_or(0)
    }
}
