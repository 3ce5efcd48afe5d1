use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use recorder_sdk::RecorderApi;
use recorder_sdk::types::CalloutQuery;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::metrics;
use crate::model::{Callout, SessionIdentity};
use crate::notice::{NoticeBus, UiNotice};

#[derive(Default)]
struct PollState {
    identity: Option<SessionIdentity>,
    /// Newest `created_at` seen for the current session.
    watermark: Option<DateTime<Utc>>,
    /// Ids surfaced since the process started.
    seen: HashSet<String>,
    task: Option<JoinHandle<()>>,
}

/// Fetches callouts for the active session on a fixed interval and surfaces
/// each id at most once.
pub struct CalloutPoller {
    api: Arc<dyn RecorderApi>,
    notices: NoticeBus,
    interval: Duration,
    state: Mutex<PollState>,
}

impl CalloutPoller {
    pub fn new(api: Arc<dyn RecorderApi>, notices: NoticeBus, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            api,
            notices,
            interval,
            state: Mutex::new(PollState::default()),
        })
    }

    pub fn start(self: &Arc<Self>, identity: SessionIdentity) {
        let poller = Arc::downgrade(self);
        let period = self.interval;
        let mut state = self.state.lock();
        if let Some(previous) = state.task.take() {
            previous.abort();
        }
        info!(
            target: "recorder.callouts",
            user_code = %identity.user_code,
            session_code = %identity.session_code,
            interval_ms = period.as_millis() as u64,
            "callout polling started"
        );
        state.identity = Some(identity);
        state.watermark = None;
        state.task = Some(tokio::spawn(poll_loop(poller, period)));
    }

    pub fn stop(&self) {
        let mut state = self.state.lock();
        if let Some(task) = state.task.take() {
            task.abort();
            debug!(target: "recorder.callouts", "callout polling stopped");
        }
        state.identity = None;
    }

    pub fn is_running(&self) -> bool {
        self.state
            .lock()
            .task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.state.lock().watermark
    }

    /// One fetch. Returns the callouts surfaced for the first time.
    pub async fn tick(&self) -> Vec<Callout> {
        let Some(query) = ({
            let state = self.state.lock();
            state.identity.as_ref().map(|identity| CalloutQuery {
                user_code: identity.user_code.clone(),
                session_code: identity.session_code.clone(),
                since: state.watermark,
            })
        }) else {
            return Vec::new();
        };

        let mut fetched = match self.api.fetch_callouts(&query).await {
            Ok(callouts) => callouts,
            Err(err) => {
                warn!(target: "recorder.callouts", error = %err, "callout fetch failed");
                return Vec::new();
            }
        };
        fetched.sort_by_key(|callout| callout.created_at);

        let surfaced: Vec<Callout> = {
            let mut state = self.state.lock();
            let same_session = state.identity.as_ref().is_some_and(|identity| {
                identity.user_code == query.user_code
                    && identity.session_code == query.session_code
            });
            if !same_session {
                return Vec::new();
            }
            let newest = fetched.iter().map(|callout| callout.created_at).max();
            if let Some(newest) = newest {
                state.watermark = Some(state.watermark.map_or(newest, |mark| mark.max(newest)));
            }
            fetched
                .into_iter()
                .filter(|callout| state.seen.insert(callout.id.clone()))
                .collect()
        };

        for callout in &surfaced {
            info!(
                target: "recorder.callouts",
                callout_id = %callout.id,
                author = callout.author_name.as_deref().unwrap_or("unknown"),
                "callout received"
            );
            metrics::CALLOUTS_SURFACED.inc();
            self.notices.publish(UiNotice::Callout {
                callout: callout.clone(),
            });
        }
        surfaced
    }
}

impl Drop for CalloutPoller {
    fn drop(&mut self) {
        if let Some(task) = self.state.get_mut().task.take() {
            task.abort();
        }
    }
}

async fn poll_loop(poller: Weak<CalloutPoller>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(poller) = poller.upgrade() else {
            break;
        };
        poller.tick().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedApi;

    fn callout(id: &str, at: &str) -> Callout {
        Callout {
            id: id.into(),
            message: format!("look at {id}"),
            created_at: at.parse().unwrap(),
            author_code: Some("CD34".into()),
            author_name: Some("Dana".into()),
        }
    }

    fn poller(api: Arc<ScriptedApi>) -> (Arc<CalloutPoller>, NoticeBus) {
        let notices = NoticeBus::new();
        let poller = CalloutPoller::new(api, notices.clone(), Duration::from_secs(5));
        (poller, notices)
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_ids_surface_once_and_watermark_never_regresses() {
        let api = ScriptedApi::new();
        api.push_callouts(vec![callout("1", "2024-05-01T10:00:00Z")]);
        api.push_callouts(vec![
            callout("1", "2024-05-01T10:00:00Z"),
            callout("2", "2024-05-01T10:05:00Z"),
        ]);
        api.push_callouts(vec![callout("3", "2024-05-01T09:00:00Z")]);
        let (poller, notices) = poller(api.clone());
        let mut rx = notices.subscribe();
        poller.start(SessionIdentity::new("ab12", "99"));

        let first = poller.tick().await;
        assert_eq!(first.len(), 1);
        let second = poller.tick().await;
        assert_eq!(second.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(), ["2"]);
        let mark = poller.watermark();
        assert_eq!(mark, Some("2024-05-01T10:05:00Z".parse().unwrap()));

        // A late callout older than the watermark is surfaced but does not move it back.
        let third = poller.tick().await;
        assert_eq!(third.len(), 1);
        assert_eq!(poller.watermark(), mark);

        let queries = api.callout_queries();
        assert_eq!(queries[0].since, None);
        assert_eq!(queries[2].since, mark);

        let mut delivered = Vec::new();
        while let Ok(UiNotice::Callout { callout }) = rx.try_recv() {
            delivered.push(callout.id);
        }
        assert_eq!(delivered, ["1", "2", "3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn polls_on_interval_until_stopped() {
        let api = ScriptedApi::new();
        let (poller, _notices) = poller(api.clone());
        poller.start(SessionIdentity::new("ab12", "99"));
        assert!(poller.is_running());

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert_eq!(api.callout_queries().len(), 2);

        poller.stop();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(api.callout_queries().len(), 2);
        assert!(!poller.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetch_surfaces_nothing_and_keeps_polling() {
        let api = ScriptedApi::new();
        api.push_callout_failure("gateway timeout");
        api.push_callouts(vec![callout("7", "2024-05-01T10:00:00Z")]);
        let (poller, _notices) = poller(api.clone());
        poller.start(SessionIdentity::new("ab12", "99"));

        assert!(poller.tick().await.is_empty());
        assert_eq!(poller.watermark(), None);
        assert_eq!(poller.tick().await.len(), 1);
    }

    #[tokio::test]
    async fn idle_poller_does_not_fetch() {
        let api = ScriptedApi::new();
        let (poller, _notices) = poller(api.clone());
        assert!(poller.tick().await.is_empty());
        assert!(api.callout_queries().is_empty());
    }
}
