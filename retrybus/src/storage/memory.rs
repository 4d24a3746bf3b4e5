use super::Storage;
use crate::error::{BusError, BusResult as Result};
use crate::event::{Event, EventId};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

/// 内存暂存存储
///
/// ID 生成器与事件表由同一把锁保护，ID 作用域限于本实例。
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    last_id: EventId,
    events: BTreeMap<EventId, Event>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().map(|s| s.events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: EventId) -> bool {
        self.lock()
            .map(|s| s.events.contains_key(&id))
            .unwrap_or(false)
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| BusError::storage("in-memory storage lock poisoned"))
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn sink(&self, _topic: &str, event: &Event) -> Result<EventId> {
        let mut state = self.lock()?;
        state.last_id += 1;
        let id = state.last_id;
        state.events.insert(id, event.clone().with_id(id));
        Ok(id)
    }

    async fn fetch(&self) -> Result<Vec<Event>> {
        let state = self.lock()?;
        Ok(state.events.values().cloned().collect())
    }

    async fn delete(&self, id: EventId) -> Result<()> {
        let mut state = self.lock()?;
        state.events.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[tokio::test]
    async fn sink_records_event_under_assigned_id() {
        let s = InMemoryStorage::new();
        let id = s
            .sink("hello", &Event::new("hello", Value::from("world")))
            .await
            .unwrap();
        assert_eq!(id, 1);
        assert!(s.contains(id));

        let staged = s.fetch().await.unwrap();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].id(), id);
        assert_eq!(staged[0].data(), &Value::from("world"));

        s.delete(id).await.unwrap();
        assert!(!s.contains(id));
        assert!(s.is_empty());
    }

    #[tokio::test]
    async fn delete_unknown_id_is_noop() {
        let s = InMemoryStorage::new();
        s.sink("t", &Event::new("t", Value::Null)).await.unwrap();
        s.delete(999).await.unwrap();
        assert_eq!(s.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sink_yields_unique_increasing_ids() {
        let s = Arc::new(InMemoryStorage::new());
        let mut tasks = Vec::new();
        for t in 0..8 {
            let s = s.clone();
            tasks.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                for i in 0..100 {
                    let ev = Event::new("t", Value::from(t * 100 + i));
                    ids.push(s.sink("t", &ev).await.unwrap());
                }
                ids
            }));
        }

        let mut all = HashSet::new();
        for t in tasks {
            let ids = t.await.unwrap();
            // 单个发布者观察到的 ID 严格递增
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
            all.extend(ids);
        }
        assert_eq!(all.len(), 800);
        assert_eq!(all, (1..=800).collect::<HashSet<_>>());
        assert_eq!(s.len(), 800);
    }

    #[tokio::test]
    async fn ids_are_scoped_to_instance() {
        let a = InMemoryStorage::new();
        let b = InMemoryStorage::new();
        let ev = Event::new("t", Value::Null);
        assert_eq!(a.sink("t", &ev).await.unwrap(), 1);
        assert_eq!(a.sink("t", &ev).await.unwrap(), 2);
        assert_eq!(b.sink("t", &ev).await.unwrap(), 1);
    }
}
