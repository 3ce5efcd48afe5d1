//! What the recorder writes to the persistent area: the recording triple and
//! the spill of unacknowledged event batches.

use std::sync::Arc;

use recorder_sdk::kv_store::{KvStore, StoreError};
use recorder_sdk::types::EventBatch;
use serde_json::Value;
use tracing::warn;

use crate::model::SessionIdentity;

pub const USER_CODE_KEY: &str = "user_code";
pub const SESSION_CODE_KEY: &str = "session_code";
pub const IS_RECORDING_KEY: &str = "is_recording";
pub const SPILLED_BATCHES_KEY: &str = "spilled_events";

/// Reads the triple. Returns the identity only when every field is present
/// and `is_recording` is true.
pub async fn load_recording(store: &dyn KvStore) -> Result<Option<SessionIdentity>, StoreError> {
    let is_recording = match store.get(IS_RECORDING_KEY).await? {
        Some(Value::Bool(flag)) => flag,
        Some(Value::String(flag)) => flag == "true",
        _ => false,
    };
    if !is_recording {
        return Ok(None);
    }
    let user_code = store
        .get(USER_CODE_KEY)
        .await?
        .and_then(|v| v.as_str().map(str::to_string))
        .filter(|v| !v.is_empty());
    let session_code = store
        .get(SESSION_CODE_KEY)
        .await?
        .and_then(|v| crate::model::normalize_session_code(&v));
    match (user_code, session_code) {
        (Some(user_code), Some(session_code)) => {
            Ok(Some(SessionIdentity::new(&user_code, &session_code)))
        }
        _ => {
            warn!(
                target: "recorder.session",
                "recording flag set without user or session code; ignoring"
            );
            Ok(None)
        }
    }
}

pub async fn persist_recording(
    store: &dyn KvStore,
    identity: &SessionIdentity,
) -> Result<(), StoreError> {
    store
        .set_many(vec![
            (
                USER_CODE_KEY.to_string(),
                Value::String(identity.user_code.clone()),
            ),
            (
                SESSION_CODE_KEY.to_string(),
                Value::String(identity.session_code.clone()),
            ),
            (IS_RECORDING_KEY.to_string(), Value::Bool(true)),
        ])
        .await
}

pub async fn clear_recording(store: &dyn KvStore) -> Result<(), StoreError> {
    store
        .remove(&[USER_CODE_KEY, SESSION_CODE_KEY, IS_RECORDING_KEY])
        .await
}

/// Ordered list of batches parked in the persistent area. Oldest first.
#[derive(Clone)]
pub struct SpillStore {
    store: Arc<dyn KvStore>,
}

impl SpillStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    async fn load(&self) -> Result<Vec<EventBatch>, StoreError> {
        match self.store.get(SPILLED_BATCHES_KEY).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Vec::new()),
        }
    }

    async fn save(&self, batches: &[EventBatch]) -> Result<(), StoreError> {
        if batches.is_empty() {
            self.store.remove(&[SPILLED_BATCHES_KEY]).await
        } else {
            self.store
                .set(SPILLED_BATCHES_KEY, serde_json::to_value(batches)?)
                .await
        }
    }

    pub async fn append(&self, batch: EventBatch) -> Result<usize, StoreError> {
        let mut batches = self.load().await?;
        batches.push(batch);
        self.save(&batches).await?;
        Ok(batches.len())
    }

    /// Returns the oldest batch without removing it.
    pub async fn front(&self) -> Result<Option<EventBatch>, StoreError> {
        Ok(self.load().await?.into_iter().next())
    }

    /// Drops the oldest batch if it is still the one identified by `batch_id`.
    pub async fn acknowledge_front(&self, batch_id: uuid::Uuid) -> Result<usize, StoreError> {
        let mut batches = self.load().await?;
        if batches.first().map(|b| b.batch_id) == Some(batch_id) {
            batches.remove(0);
            self.save(&batches).await?;
        }
        Ok(batches.len())
    }

    pub async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.load().await?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recorder_sdk::kv_store::MemoryKvStore;
    use recorder_sdk::types::{EventKind, NavigationEvent};
    use serde_json::json;

    #[tokio::test]
    async fn triple_round_trips_and_clears() {
        let store = MemoryKvStore::new();
        let identity = SessionIdentity::new("ab12", "99");
        persist_recording(store.as_ref(), &identity).await.unwrap();
        assert_eq!(
            load_recording(store.as_ref()).await.unwrap(),
            Some(identity)
        );

        clear_recording(store.as_ref()).await.unwrap();
        assert_eq!(load_recording(store.as_ref()).await.unwrap(), None);
        assert_eq!(store.get(USER_CODE_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn incomplete_triple_is_ignored() {
        let store = MemoryKvStore::new();
        store.set(IS_RECORDING_KEY, json!(true)).await.unwrap();
        store.set(SESSION_CODE_KEY, json!(99)).await.unwrap();
        assert_eq!(load_recording(store.as_ref()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn spill_acknowledges_only_the_matching_front() {
        let store = MemoryKvStore::new();
        let spill = SpillStore::new(store);
        let first = EventBatch::new(
            "AB12",
            "99",
            vec![NavigationEvent::new(EventKind::Click, Default::default())],
        );
        let second = EventBatch::new("AB12", "99", Vec::new());
        spill.append(first.clone()).await.unwrap();
        spill.append(second.clone()).await.unwrap();

        assert_eq!(spill.acknowledge_front(second.batch_id).await.unwrap(), 2);
        assert_eq!(spill.front().await.unwrap(), Some(first.clone()));
        assert_eq!(spill.acknowledge_front(first.batch_id).await.unwrap(), 1);
        assert_eq!(spill.front().await.unwrap(), Some(second));
    }
}
