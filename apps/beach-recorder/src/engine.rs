//! The recording session state machine and everything it owns.

use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::Mutex;
use recorder_sdk::RecorderApi;
use recorder_sdk::kv_store::KvStore;
use recorder_sdk::types::{CalloutAck, NewCallout, Page, PageScope};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{OnceCell, broadcast};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::autosave::AutosaveScheduler;
use crate::clip::{ClipInput, ClipMailbox, PendingClip};
use crate::config::EngineSettings;
use crate::durable::{self, SpillStore};
use crate::error::{RecorderError, RecorderResult};
use crate::metrics;
use crate::model::{
    EventKind, NavigationEvent, RecordingSession, SessionIdentity, SyncStatus,
    normalize_session_code,
};
use crate::notice::{NoticeBus, UiNotice};
use crate::poller::CalloutPoller;
use crate::send::{ScopeKind, SendDestination, SendService, resolve_scope};
use crate::uploader::{UploadSettings, Uploader};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Idle,
    /// Durable triple is being written; the session is not yet authoritative.
    Starting,
    Recording,
    Stopping,
    Restoring,
}

struct Core {
    phase: Phase,
    session: Option<RecordingSession>,
    /// Events captured since the last flush.
    buffer: Vec<NavigationEvent>,
    oldest_unflushed: Option<Instant>,
    /// Bumped whenever a session begins or ends so stale timers can tell.
    generation: u64,
}

struct EngineInner {
    api: Arc<dyn RecorderApi>,
    persistent: Arc<dyn KvStore>,
    settings: EngineSettings,
    core: Mutex<Core>,
    uploader: Arc<Uploader>,
    autosave: AutosaveScheduler,
    poller: Arc<CalloutPoller>,
    clips: Arc<ClipMailbox>,
    send: SendService,
    notices: NoticeBus,
    restored: OnceCell<()>,
}

/// Process-wide recorder. Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(
        api: Arc<dyn RecorderApi>,
        persistent: Arc<dyn KvStore>,
        session_scoped: Arc<dyn KvStore>,
        settings: EngineSettings,
    ) -> Self {
        let notices = NoticeBus::new();
        let uploader = Uploader::new(
            api.clone(),
            SpillStore::new(persistent.clone()),
            UploadSettings::from(&settings),
            notices.clone(),
        );
        let poller = CalloutPoller::new(
            api.clone(),
            notices.clone(),
            settings.callout_poll_interval,
        );
        let clips = Arc::new(ClipMailbox::new(session_scoped, persistent.clone()));
        let send = SendService::new(api.clone(), clips.clone());
        let autosave = AutosaveScheduler::new(settings.autosave_debounce, settings.autosave_max_age);
        Self {
            inner: Arc::new(EngineInner {
                api,
                persistent,
                settings,
                core: Mutex::new(Core {
                    phase: Phase::Idle,
                    session: None,
                    buffer: Vec::new(),
                    oldest_unflushed: None,
                    generation: 0,
                }),
                uploader,
                autosave,
                poller,
                clips,
                send,
                notices,
                restored: OnceCell::new(),
            }),
        }
    }

    /// Runs restoration the first time it is awaited; later callers wait for
    /// that run to finish.
    pub async fn ready(&self) {
        self.inner.restored.get_or_init(|| self.restore()).await;
    }

    async fn restore(&self) {
        {
            let mut core = self.inner.core.lock();
            if core.phase != Phase::Idle {
                return;
            }
            core.phase = Phase::Restoring;
        }

        self.inner.uploader.load_spill().await;

        let identity = match durable::load_recording(self.inner.persistent.as_ref()).await {
            Ok(identity) => identity,
            Err(err) => {
                warn!(target: "recorder.session", error = %err, "persistent store unreadable; starting idle");
                None
            }
        };

        match identity {
            Some(identity) => {
                info!(
                    target: "recorder.session",
                    user_code = %identity.user_code,
                    session_code = %identity.session_code,
                    "resuming recording after restart"
                );
                self.begin_session(identity, EventKind::ExtensionResumed);
            }
            None => {
                self.inner.core.lock().phase = Phase::Idle;
                debug!(target: "recorder.session", "no active recording to restore");
            }
        }

        if self.inner.uploader.status().spilled_batches > 0 {
            let uploader = self.inner.uploader.clone();
            tokio::spawn(async move { uploader.drive().await });
        }
    }

    /// Makes a freshly created session authoritative and seeds it with a
    /// lifecycle marker.
    fn begin_session(&self, identity: SessionIdentity, marker: EventKind) {
        let marker = NavigationEvent::new(marker, Map::new());
        let oldest = Instant::now();
        let generation = {
            let mut core = self.inner.core.lock();
            let mut session = RecordingSession::new(&identity);
            session.events.push(marker.clone());
            core.session = Some(session);
            core.buffer = vec![marker];
            core.oldest_unflushed = Some(oldest);
            core.generation += 1;
            core.phase = Phase::Recording;
            core.generation
        };
        metrics::EVENTS_CAPTURED
            .with_label_values(&["lifecycle"])
            .inc();
        self.inner.uploader.begin(identity.clone());
        self.inner.poller.start(identity);
        self.arm_autosave(oldest, generation);
    }

    /// Returns whether the backend answered the reachability check.
    pub async fn start(&self, user_code: &str, session_code: &Value) -> RecorderResult<bool> {
        let session_code = normalize_session_code(session_code)
            .ok_or_else(|| RecorderError::InvalidRequest("sessionCode is required".into()))?;
        if user_code.trim().is_empty() {
            return Err(RecorderError::InvalidRequest("userCode is required".into()));
        }
        let identity = SessionIdentity::new(user_code, &session_code);

        {
            let mut core = self.inner.core.lock();
            match core.phase {
                Phase::Idle => core.phase = Phase::Starting,
                Phase::Stopping => {
                    return Err(RecorderError::InvalidRequest(
                        "previous recording is still stopping".into(),
                    ));
                }
                _ => return Err(RecorderError::AlreadyRecording),
            }
        }

        if let Err(err) = durable::persist_recording(self.inner.persistent.as_ref(), &identity).await
        {
            self.inner.core.lock().phase = Phase::Idle;
            warn!(target: "recorder.session", error = %err, "could not persist recording state");
            return Err(err.into());
        }

        info!(
            target: "recorder.session",
            user_code = %identity.user_code,
            session_code = %identity.session_code,
            "recording started"
        );
        self.begin_session(identity, EventKind::ExtensionLoaded);

        let backend_connected = match self.inner.api.ping().await {
            Ok(()) => true,
            Err(err) => {
                debug!(target: "recorder.session", error = %err, "backend ping failed");
                false
            }
        };
        Ok(backend_connected)
    }

    /// Ends the recording and returns how many page events it captured.
    pub async fn stop(&self) -> RecorderResult<usize> {
        let (remaining, event_count) = {
            let mut core = self.inner.core.lock();
            if core.phase != Phase::Recording {
                return Err(RecorderError::NotRecording);
            }
            core.phase = Phase::Stopping;
            core.generation += 1;
            core.oldest_unflushed = None;
            let remaining = std::mem::take(&mut core.buffer);
            let event_count = match core.session.as_mut() {
                Some(session) => {
                    session.ended_at = Some(Utc::now());
                    session.captured_count()
                }
                None => 0,
            };
            (remaining, event_count)
        };
        self.inner.autosave.cancel();
        self.inner.poller.stop();

        let flush = self.inner.uploader.submit(remaining);
        if tokio::time::timeout(self.inner.settings.stop_flush_timeout, flush)
            .await
            .is_err()
        {
            warn!(
                target: "recorder.session",
                timeout_ms = self.inner.settings.stop_flush_timeout.as_millis() as u64,
                "final flush timed out; keeping unsent events in persistent storage"
            );
        }
        self.inner.uploader.halt().await;

        let mut cleared = durable::clear_recording(self.inner.persistent.as_ref()).await;
        if let Err(err) = &cleared {
            debug!(target: "recorder.session", error = %err, "clearing persisted state failed; retrying once");
            cleared = durable::clear_recording(self.inner.persistent.as_ref()).await;
        }
        {
            let mut core = self.inner.core.lock();
            core.session = None;
            core.phase = Phase::Idle;
        }
        match cleared {
            Ok(()) => {
                info!(target: "recorder.session", event_count, "recording stopped");
                Ok(event_count)
            }
            Err(err) => {
                warn!(
                    target: "recorder.session",
                    error = %err,
                    "recording stopped but persisted state could not be cleared"
                );
                Err(err.into())
            }
        }
    }

    pub fn snapshot(&self) -> Option<RecordingSession> {
        self.inner.core.lock().session.clone()
    }

    pub fn phase(&self) -> Phase {
        self.inner.core.lock().phase
    }

    pub fn add_event(&self, kind: EventKind, payload: Map<String, Value>) -> RecorderResult<()> {
        let event = NavigationEvent::new(kind, payload);
        let (oldest, generation) = {
            let mut core = self.inner.core.lock();
            if core.phase != Phase::Recording {
                return Err(RecorderError::NotRecording);
            }
            let Some(session) = core.session.as_mut() else {
                return Err(RecorderError::NotRecording);
            };
            session.events.push(event.clone());
            core.buffer.push(event);
            let oldest = *core.oldest_unflushed.get_or_insert_with(Instant::now);
            (oldest, core.generation)
        };
        metrics::EVENTS_CAPTURED.with_label_values(&["page"]).inc();
        self.arm_autosave(oldest, generation);
        Ok(())
    }

    fn arm_autosave(&self, oldest: Instant, generation: u64) {
        let engine: Weak<EngineInner> = Arc::downgrade(&self.inner);
        self.inner.autosave.arm(oldest, move || async move {
            if let Some(inner) = engine.upgrade() {
                Engine { inner }.autosave_fired(generation).await;
            }
        });
    }

    async fn autosave_fired(&self, generation: u64) {
        {
            let core = self.inner.core.lock();
            if core.generation != generation || core.phase != Phase::Recording {
                return;
            }
        }
        debug!(target: "recorder.session", "autosave fired");
        self.flush().await;
    }

    /// Moves the buffer into the uploader. Also the natural trigger that
    /// retries a batch held after exhausted retries.
    pub async fn flush(&self) {
        let events = {
            let mut core = self.inner.core.lock();
            core.oldest_unflushed = None;
            std::mem::take(&mut core.buffer)
        };
        self.inner.uploader.submit(events).await;
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.inner.uploader.status()
    }

    fn recording_identity(&self) -> Option<SessionIdentity> {
        let core = self.inner.core.lock();
        match core.phase {
            Phase::Recording => core.session.as_ref().map(RecordingSession::identity),
            _ => None,
        }
    }

    /// Codes default to the active recording when the caller leaves them out.
    pub async fn create_callout(
        &self,
        user_code: Option<&str>,
        session_code: Option<&Value>,
        message: &str,
    ) -> RecorderResult<Value> {
        let active = self.recording_identity();
        let user_code = user_code
            .filter(|code| !code.trim().is_empty())
            .map(str::to_string)
            .or_else(|| active.as_ref().map(|identity| identity.user_code.clone()))
            .ok_or_else(|| RecorderError::InvalidRequest("userCode is required".into()))?;
        let session_code = session_code
            .and_then(normalize_session_code)
            .or_else(|| active.as_ref().map(|identity| identity.session_code.clone()))
            .ok_or_else(|| RecorderError::InvalidRequest("sessionCode is required".into()))?;
        if message.trim().is_empty() {
            return Err(RecorderError::InvalidRequest("message is empty".into()));
        }
        let identity = SessionIdentity::new(&user_code, &session_code);
        let result = self
            .inner
            .api
            .create_callout(&NewCallout {
                user_code: identity.user_code,
                session_code: identity.session_code,
                message: message.trim().to_string(),
            })
            .await?;
        Ok(result)
    }

    pub async fn acknowledge_callout(
        &self,
        callout_id: &str,
        actor_name: Option<&str>,
    ) -> RecorderResult<Value> {
        let identity = self
            .recording_identity()
            .ok_or(RecorderError::NotRecording)?;
        let ack = CalloutAck {
            callout_id: callout_id.to_string(),
            actor_name: actor_name
                .filter(|name| !name.trim().is_empty())
                .unwrap_or(identity.user_code.as_str())
                .to_string(),
            actor_code: identity.user_code,
        };
        let result = self.inner.api.acknowledge_callout(&ack).await?;
        debug!(target: "recorder.callouts", callout_id, "callout acknowledged");
        Ok(result)
    }

    pub async fn set_pending_clip(&self, input: ClipInput) -> RecorderResult<()> {
        let clip = PendingClip::from_input(input)?;
        self.inner.clips.set(&clip).await
    }

    pub async fn pending_clip(&self) -> RecorderResult<Option<PendingClip>> {
        self.inner.clips.read().await
    }

    /// Asks UI surfaces to open the send window. Returns how many listened.
    pub async fn open_send_from_page(&self) -> usize {
        let clip = match self.inner.clips.read().await {
            Ok(clip) => clip,
            Err(err) => {
                warn!(target: "recorder.clip", error = %err, "opening send window without a clip");
                None
            }
        };
        self.inner.notices.publish(UiNotice::OpenSend { clip })
    }

    pub fn page_scope(&self, kind: ScopeKind, user_code: Option<&str>) -> RecorderResult<PageScope> {
        let active = self.recording_identity();
        resolve_scope(
            kind,
            user_code,
            active.as_ref().map(|identity| identity.user_code.as_str()),
        )
    }

    pub async fn list_pages(&self, scope: &PageScope) -> RecorderResult<Vec<Page>> {
        self.inner.send.list_pages(scope).await
    }

    pub async fn create_page(&self, scope: &PageScope, title: &str) -> RecorderResult<Page> {
        self.inner.send.create_page(scope, title).await
    }

    pub async fn send_pending_clip(&self, destination: &SendDestination) -> RecorderResult<Value> {
        let scope = self.page_scope(destination.scope, destination.user_code.as_deref())?;
        self.inner
            .send
            .send_pending(&scope, destination.page_id.as_deref())
            .await
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<UiNotice> {
        self.inner.notices.subscribe()
    }

    pub fn backend_available(&self) -> bool {
        self.inner.uploader.backend_available()
    }
}
