//! In-memory backend for tests and offline wiring.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use recorder_sdk::types::{
    Callout, CalloutAck, CalloutQuery, EventBatch, NewCallout, Page, PageAppend, PageScope,
};
use recorder_sdk::kv_store::{KvStore, MemoryKvStore, StoreError};
use recorder_sdk::{ApiError, RecorderApi, StatusCode};
use serde_json::{Value, json};
use uuid::Uuid;

#[derive(Default)]
struct Script {
    reachable: bool,
    save_failures: u32,
    save_latency: Option<Duration>,
    attempted: Vec<Uuid>,
    saved: Vec<EventBatch>,
    callout_responses: VecDeque<Result<Vec<Callout>, String>>,
    callout_queries: Vec<CalloutQuery>,
    created_callouts: Vec<NewCallout>,
    acknowledgements: Vec<CalloutAck>,
    pages: Vec<(PageScope, Page)>,
    appended: Vec<(PageScope, String, PageAppend)>,
    append_failures: u32,
}

/// Backend whose answers are scripted by the test.
pub struct ScriptedApi {
    script: Mutex<Script>,
    saves_in_flight: AtomicUsize,
    max_concurrent_saves: AtomicUsize,
}

impl ScriptedApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(Script {
                reachable: true,
                ..Script::default()
            }),
            saves_in_flight: AtomicUsize::new(0),
            max_concurrent_saves: AtomicUsize::new(0),
        })
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.script.lock().reachable = reachable;
    }

    pub fn fail_next_saves(&self, count: u32) {
        self.script.lock().save_failures = count;
    }

    pub fn set_save_latency(&self, latency: Duration) {
        self.script.lock().save_latency = Some(latency);
    }

    pub fn save_attempts(&self) -> usize {
        self.script.lock().attempted.len()
    }

    pub fn attempted_batch_ids(&self) -> Vec<Uuid> {
        self.script.lock().attempted.clone()
    }

    pub fn saved_batches(&self) -> Vec<EventBatch> {
        self.script.lock().saved.clone()
    }

    pub fn max_concurrent_saves(&self) -> usize {
        self.max_concurrent_saves.load(Ordering::SeqCst)
    }

    /// Queues the answer for one future callout fetch. Once the queue is
    /// empty fetches return no callouts.
    pub fn push_callouts(&self, callouts: Vec<Callout>) {
        self.script.lock().callout_responses.push_back(Ok(callouts));
    }

    pub fn push_callout_failure(&self, message: &str) {
        self.script
            .lock()
            .callout_responses
            .push_back(Err(message.to_string()));
    }

    pub fn callout_queries(&self) -> Vec<CalloutQuery> {
        self.script.lock().callout_queries.clone()
    }

    pub fn created_callouts(&self) -> Vec<NewCallout> {
        self.script.lock().created_callouts.clone()
    }

    pub fn acknowledgements(&self) -> Vec<CalloutAck> {
        self.script.lock().acknowledgements.clone()
    }

    pub fn add_page(&self, scope: PageScope, id: &str, title: &str) {
        self.script.lock().pages.push((
            scope,
            Page {
                id: id.to_string(),
                title: title.to_string(),
                updated_at: None,
            },
        ));
    }

    pub fn appended(&self) -> Vec<(PageScope, String, PageAppend)> {
        self.script.lock().appended.clone()
    }

    pub fn fail_next_appends(&self, count: u32) {
        self.script.lock().append_failures = count;
    }
}

fn unavailable(message: &str) -> ApiError {
    ApiError::UnexpectedStatus {
        status: StatusCode::SERVICE_UNAVAILABLE,
        message: message.to_string(),
    }
}

#[async_trait]
impl RecorderApi for ScriptedApi {
    async fn ping(&self) -> Result<(), ApiError> {
        if self.script.lock().reachable {
            Ok(())
        } else {
            Err(unavailable("backend offline"))
        }
    }

    async fn save_events(&self, batch: &EventBatch) -> Result<(), ApiError> {
        let now = self.saves_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_saves.fetch_max(now, Ordering::SeqCst);

        let latency = {
            let mut script = self.script.lock();
            script.attempted.push(batch.batch_id);
            script.save_latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let result = {
            let mut script = self.script.lock();
            if script.save_failures > 0 {
                script.save_failures -= 1;
                Err(unavailable("save rejected"))
            } else {
                script.saved.push(batch.clone());
                Ok(())
            }
        };
        self.saves_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn fetch_callouts(&self, query: &CalloutQuery) -> Result<Vec<Callout>, ApiError> {
        let mut script = self.script.lock();
        script.callout_queries.push(query.clone());
        match script.callout_responses.pop_front() {
            Some(Ok(callouts)) => Ok(callouts),
            Some(Err(message)) => Err(unavailable(&message)),
            None => Ok(Vec::new()),
        }
    }

    async fn create_callout(&self, callout: &NewCallout) -> Result<Value, ApiError> {
        let mut script = self.script.lock();
        script.created_callouts.push(callout.clone());
        Ok(json!({ "id": script.created_callouts.len().to_string() }))
    }

    async fn acknowledge_callout(&self, ack: &CalloutAck) -> Result<Value, ApiError> {
        self.script.lock().acknowledgements.push(ack.clone());
        Ok(json!({ "acknowledged": ack.callout_id }))
    }

    async fn list_pages(&self, scope: &PageScope) -> Result<Vec<Page>, ApiError> {
        Ok(self
            .script
            .lock()
            .pages
            .iter()
            .filter(|(page_scope, _)| page_scope == scope)
            .map(|(_, page)| page.clone())
            .collect())
    }

    async fn create_page(&self, scope: &PageScope, title: &str) -> Result<Page, ApiError> {
        let mut script = self.script.lock();
        let page = Page {
            id: format!("page-{}", script.pages.len() + 1),
            title: title.to_string(),
            updated_at: None,
        };
        script.pages.push((scope.clone(), page.clone()));
        Ok(page)
    }

    async fn append_to_page(
        &self,
        scope: &PageScope,
        page_id: &str,
        entry: &PageAppend,
    ) -> Result<Value, ApiError> {
        let mut script = self.script.lock();
        if script.append_failures > 0 {
            script.append_failures -= 1;
            return Err(ApiError::UnexpectedStatus {
                status: StatusCode::NOT_FOUND,
                message: "page not found".into(),
            });
        }
        script
            .appended
            .push((scope.clone(), page_id.to_string(), entry.clone()));
        Ok(json!({ "ok": true }))
    }
}

/// Key-value area that rejects every operation.
pub struct UnavailableStore;

#[async_trait]
impl KvStore for UnavailableStore {
    async fn get(&self, _key: &str) -> Result<Option<Value>, StoreError> {
        Err(StoreError::Unavailable("store offline".into()))
    }

    async fn set_many(&self, _entries: Vec<(String, Value)>) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("store offline".into()))
    }

    async fn remove(&self, _keys: &[&str]) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("store offline".into()))
    }
}

/// Memory area whose removals can be made to fail a set number of times.
pub struct FlakyStore {
    inner: Arc<MemoryKvStore>,
    remove_failures: Mutex<u32>,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryKvStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            remove_failures: Mutex::new(0),
        })
    }

    pub fn fail_next_removes(&self, count: u32) {
        *self.remove_failures.lock() = count;
    }
}

#[async_trait]
impl KvStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.inner.get(key).await
    }

    async fn set_many(&self, entries: Vec<(String, Value)>) -> Result<(), StoreError> {
        self.inner.set_many(entries).await
    }

    async fn remove(&self, keys: &[&str]) -> Result<(), StoreError> {
        {
            let mut failures = self.remove_failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(StoreError::Unavailable("remove rejected".into()));
            }
        }
        self.inner.remove(keys).await
    }
}
