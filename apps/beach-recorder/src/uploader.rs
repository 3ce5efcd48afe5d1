use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use recorder_sdk::RecorderApi;
use recorder_sdk::types::EventBatch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::EngineSettings;
use crate::durable::SpillStore;
use crate::metrics;
use crate::model::{NavigationEvent, SessionIdentity, SyncStatus};
use crate::notice::{NoticeBus, UiNotice};

#[derive(Debug, Clone)]
pub struct UploadSettings {
    /// Backoff retries after the first failed attempt before a batch waits
    /// for the next flush.
    pub max_retries: u32,
    pub base_retry_delay: Duration,
    pub retry_ceiling: Duration,
    /// Unacknowledged events kept in memory before queued ones are spilled.
    pub max_pending_events: usize,
}

impl From<&EngineSettings> for UploadSettings {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_retry_delay: settings.base_retry_delay,
            retry_ceiling: settings.retry_ceiling,
            max_pending_events: settings.max_pending_events,
        }
    }
}

/// `base * 2^(retry_count - 1)`, capped at the ceiling.
pub fn backoff_delay(settings: &UploadSettings, retry_count: u32) -> Duration {
    let exponent = retry_count.saturating_sub(1).min(16);
    settings
        .base_retry_delay
        .saturating_mul(1u32 << exponent)
        .min(settings.retry_ceiling)
}

#[derive(Default)]
struct UploadState {
    identity: Option<SessionIdentity>,
    in_flight: bool,
    /// Batch being delivered or waiting on a retry. Its id never changes.
    held: Option<EventBatch>,
    held_from_spill: bool,
    /// Batches that could not be spilled when the session ended.
    parked: VecDeque<EventBatch>,
    queued: Vec<NavigationEvent>,
    retry_count: u32,
    backend_available: bool,
    spilled_batches: usize,
    retry_timer: Option<JoinHandle<()>>,
}

impl UploadState {
    fn pending_count(&self) -> usize {
        self.held.as_ref().map_or(0, |b| b.events.len())
            + self.parked.iter().map(|b| b.events.len()).sum::<usize>()
            + self.queued.len()
    }

    fn has_work(&self) -> bool {
        self.held.is_some()
            || !self.parked.is_empty()
            || !self.queued.is_empty()
            || self.spilled_batches > 0
    }
}

/// Single-flight delivery of event batches with bounded exponential backoff.
pub struct Uploader {
    api: Arc<dyn RecorderApi>,
    spill: SpillStore,
    settings: UploadSettings,
    notices: NoticeBus,
    state: Mutex<UploadState>,
}

struct InFlightGuard<'a> {
    uploader: &'a Uploader,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.uploader.state.lock().in_flight = false;
    }
}

impl Uploader {
    pub fn new(
        api: Arc<dyn RecorderApi>,
        spill: SpillStore,
        settings: UploadSettings,
        notices: NoticeBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            api,
            spill,
            settings,
            notices,
            state: Mutex::new(UploadState {
                backend_available: true,
                ..UploadState::default()
            }),
        })
    }

    /// Picks up batches a previous process left in the persistent area.
    pub async fn load_spill(&self) {
        match self.spill.len().await {
            Ok(count) => {
                if count > 0 {
                    info!(
                        target: "recorder.upload",
                        spilled_batches = count,
                        "found spilled batches from a previous run"
                    );
                }
                self.state.lock().spilled_batches = count;
            }
            Err(err) => {
                warn!(target: "recorder.upload", error = %err, "failed to read spilled batches")
            }
        }
    }

    /// Attributes subsequently queued events to `identity`.
    pub fn begin(&self, identity: SessionIdentity) {
        self.state.lock().identity = Some(identity);
    }

    pub fn status(&self) -> SyncStatus {
        let state = self.state.lock();
        SyncStatus {
            in_flight: state.in_flight,
            pending_count: state.pending_count(),
            retry_count: state.retry_count,
            backend_available: state.backend_available,
            spilled_batches: state.spilled_batches,
        }
    }

    pub fn backend_available(&self) -> bool {
        self.state.lock().backend_available
    }

    /// Hands events over for delivery. Returns once the resulting attempt
    /// finishes, or immediately when another upload is already in flight.
    pub async fn submit(self: &Arc<Self>, events: Vec<NavigationEvent>) {
        let overflow = {
            let mut state = self.state.lock();
            state.queued.extend(events);
            let over_cap = state.pending_count() > self.settings.max_pending_events;
            match state.identity.clone() {
                Some(identity) if over_cap && !state.queued.is_empty() => {
                    let events = std::mem::take(&mut state.queued);
                    Some(EventBatch::new(
                        &identity.user_code,
                        &identity.session_code,
                        events,
                    ))
                }
                _ => None,
            }
        };
        if let Some(batch) = overflow {
            if let Err(batch) = self.spill_batch(batch).await {
                let mut state = self.state.lock();
                let newer = std::mem::replace(&mut state.queued, batch.events);
                state.queued.extend(newer);
            }
        }
        self.drive().await;
    }

    /// Delivers batches until nothing is left or an attempt fails.
    pub async fn drive(self: &Arc<Self>) {
        loop {
            {
                let mut state = self.state.lock();
                if state.in_flight {
                    debug!(target: "recorder.upload", "upload already in flight; merged into pending");
                    return;
                }
                state.in_flight = true;
                if let Some(timer) = state.retry_timer.take() {
                    timer.abort();
                }
            }
            let guard = InFlightGuard {
                uploader: self.as_ref(),
            };

            let Some((batch, from_spill)) = self.next_batch().await else {
                return;
            };

            let result = self.api.save_events(&batch).await;
            match result {
                Ok(()) => {
                    metrics::UPLOAD_ATTEMPTS
                        .with_label_values(&["success"])
                        .inc();
                    self.on_success(&batch, from_spill).await;
                    drop(guard);
                    if !self.state.lock().has_work() {
                        return;
                    }
                }
                Err(err) => {
                    metrics::UPLOAD_ATTEMPTS
                        .with_label_values(&["failure"])
                        .inc();
                    drop(guard);
                    self.on_failure(&batch, &err.to_string());
                    return;
                }
            }
        }
    }

    async fn next_batch(&self) -> Option<(EventBatch, bool)> {
        {
            let state = self.state.lock();
            if let Some(batch) = &state.held {
                return Some((batch.clone(), state.held_from_spill));
            }
        }

        // Spilled batches are older than anything still in memory.
        if self.state.lock().spilled_batches > 0 {
            match self.spill.front().await {
                Ok(Some(batch)) => {
                    let mut state = self.state.lock();
                    state.held = Some(batch.clone());
                    state.held_from_spill = true;
                    return Some((batch, true));
                }
                Ok(None) => self.state.lock().spilled_batches = 0,
                Err(err) => warn!(
                    target: "recorder.upload",
                    error = %err,
                    "spilled batches unreadable; sending in-memory events first"
                ),
            }
        }

        let mut state = self.state.lock();
        let batch = if let Some(batch) = state.parked.pop_front() {
            batch
        } else {
            if state.queued.is_empty() {
                return None;
            }
            let identity = state.identity.clone()?;
            let events = std::mem::take(&mut state.queued);
            EventBatch::new(&identity.user_code, &identity.session_code, events)
        };
        state.held = Some(batch.clone());
        state.held_from_spill = false;
        Some((batch, false))
    }

    async fn on_success(&self, batch: &EventBatch, from_spill: bool) {
        let became_available = {
            let mut state = self.state.lock();
            if state.held.as_ref().map(|b| b.batch_id) == Some(batch.batch_id) {
                state.held = None;
                state.held_from_spill = false;
            }
            state.retry_count = 0;
            !std::mem::replace(&mut state.backend_available, true)
        };
        debug!(
            target: "recorder.upload",
            batch_id = %batch.batch_id,
            events = batch.events.len(),
            "batch acknowledged"
        );
        if from_spill {
            match self.spill.acknowledge_front(batch.batch_id).await {
                Ok(remaining) => self.state.lock().spilled_batches = remaining,
                Err(err) => warn!(
                    target: "recorder.upload",
                    batch_id = %batch.batch_id,
                    error = %err,
                    "failed to drop delivered batch from spill; it will be resent"
                ),
            }
        }
        if became_available {
            info!(target: "recorder.upload", "backend reachable again");
            self.notices.publish(UiNotice::BackendStatus {
                backend_available: true,
            });
        }
    }

    fn on_failure(self: &Arc<Self>, batch: &EventBatch, reason: &str) {
        let (retry_in, became_unavailable, attempts) = {
            let mut state = self.state.lock();
            let became_unavailable = std::mem::replace(&mut state.backend_available, false);
            if state.held.as_ref().map(|b| b.batch_id) != Some(batch.batch_id) {
                // The session ended while this attempt was in flight.
                return;
            }
            state.retry_count += 1;
            let attempts = state.retry_count;
            let retry_in = if attempts <= self.settings.max_retries {
                Some(backoff_delay(&self.settings, attempts))
            } else {
                state.retry_count = 0;
                None
            };
            (retry_in, became_unavailable, attempts)
        };

        if became_unavailable {
            self.notices.publish(UiNotice::BackendStatus {
                backend_available: false,
            });
        }

        match retry_in {
            Some(delay) => {
                warn!(
                    target: "recorder.upload",
                    batch_id = %batch.batch_id,
                    attempt = attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %reason,
                    "batch upload failed; retrying"
                );
                self.schedule_retry(delay);
            }
            None => warn!(
                target: "recorder.upload",
                batch_id = %batch.batch_id,
                attempt = attempts,
                events = batch.events.len(),
                error = %reason,
                "batch upload failed; holding until next flush"
            ),
        }
    }

    fn schedule_retry(self: &Arc<Self>, delay: Duration) {
        let uploader = Arc::clone(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tokio::spawn(async move { uploader.drive().await });
        });
        if let Some(previous) = self.state.lock().retry_timer.replace(timer) {
            previous.abort();
        }
    }

    async fn spill_batch(&self, batch: EventBatch) -> Result<(), EventBatch> {
        let events = batch.events.len();
        match self.spill.append(batch.clone()).await {
            Ok(total) => {
                metrics::EVENTS_SPILLED.inc_by(events as u64);
                self.state.lock().spilled_batches = total;
                info!(
                    target: "recorder.upload",
                    batch_id = %batch.batch_id,
                    events,
                    spilled_batches = total,
                    "spilled unacknowledged events to persistent storage"
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    target: "recorder.upload",
                    batch_id = %batch.batch_id,
                    events,
                    error = %err,
                    "failed to spill events; keeping them in memory"
                );
                Err(batch)
            }
        }
    }

    /// Cancels any pending retry and moves everything unacknowledged to the
    /// persistent area. Used when a session ends.
    pub async fn halt(&self) {
        let leftovers = {
            let mut state = self.state.lock();
            if let Some(timer) = state.retry_timer.take() {
                timer.abort();
            }
            state.retry_count = 0;
            let mut leftovers = Vec::new();
            if let Some(held) = state.held.take() {
                if !state.held_from_spill {
                    leftovers.push(held);
                }
            }
            state.held_from_spill = false;
            leftovers.extend(state.parked.drain(..));
            if let Some(identity) = state.identity.take() {
                if !state.queued.is_empty() {
                    let events = std::mem::take(&mut state.queued);
                    leftovers.push(EventBatch::new(
                        &identity.user_code,
                        &identity.session_code,
                        events,
                    ));
                }
            }
            leftovers
        };
        for batch in leftovers {
            if let Err(batch) = self.spill_batch(batch).await {
                self.state.lock().parked.push_back(batch);
            }
        }
    }
}
