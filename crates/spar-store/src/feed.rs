//! Cursor-paged event delivery with long-poll waits
//!
//! Readers hold a cursor and ask for everything after it. When nothing is
//! there yet, [`EventFeed::wait_for_events`] parks on the store's notifier
//! and backs off between re-reads so a quiet conversation costs little.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;

use spar_core::config::EventsConfig;
use spar_core::{ConversationId, Event, Result};

use crate::store::Store;

/// One page of events plus the cursor to resume from
#[derive(Debug, Clone)]
pub struct EventBatch {
    pub events: Vec<Event>,
    pub next_cursor: u64,
    pub has_more: bool,
}

/// Shared reader over the store's per-conversation event log
#[derive(Clone)]
pub struct EventFeed {
    store: Arc<dyn Store>,
    batch: usize,
    poll_min: Duration,
    poll_max: Duration,
}

impl EventFeed {
    pub fn new(store: Arc<dyn Store>, config: &EventsConfig) -> Self {
        Self {
            store,
            batch: config.pull_batch.max(1),
            poll_min: Duration::from_millis(config.poll_min_ms.max(1)),
            poll_max: Duration::from_millis(config.poll_max_ms.max(config.poll_min_ms).max(1)),
        }
    }

    /// Read the next page after `cursor` without waiting.
    pub async fn fetch(&self, conversation_id: ConversationId, cursor: u64) -> Result<EventBatch> {
        let mut events = self
            .store
            .events_after(conversation_id, cursor, self.batch + 1)
            .await?;
        let has_more = events.len() > self.batch;
        events.truncate(self.batch);
        let next_cursor = events.last().map(|e| e.cursor).unwrap_or(cursor);
        Ok(EventBatch {
            events,
            next_cursor,
            has_more,
        })
    }

    /// Read the next page, waiting up to `max_wait` for one to appear.
    ///
    /// Returns an empty batch with the caller's cursor when the deadline
    /// passes with nothing new. Subscribes before the first read so an
    /// append racing the check still wakes the wait.
    pub async fn wait_for_events(
        &self,
        conversation_id: ConversationId,
        cursor: u64,
        max_wait: Duration,
    ) -> Result<EventBatch> {
        let deadline = Instant::now() + max_wait;
        let mut notices = self.store.subscribe();
        let mut poll_wait = self.poll_min;

        loop {
            let batch = self.fetch(conversation_id, cursor).await?;
            if !batch.events.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(batch);
            }
            let nap = poll_wait.min(deadline - now);

            tokio::select! {
                notice = notices.recv() => match notice {
                    // A relevant notice or a lagged channel both mean the
                    // log may have moved; re-read right away.
                    Ok(n) if n.conversation_id == conversation_id && n.cursor > cursor => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        tokio::time::sleep(nap).await;
                        poll_wait = (poll_wait * 2).min(self.poll_max);
                    }
                },
                _ = tokio::time::sleep(nap) => {
                    poll_wait = (poll_wait * 2).min(self.poll_max);
                }
            }
        }
    }
}

/// Iterator-style pages for server handlers
impl EventFeed {
    pub async fn latest_cursor(&self, conversation_id: ConversationId) -> Result<u64> {
        self.store.latest_cursor(conversation_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::store::NewEvent;
    use spar_core::{Conversation, EventType};

    fn feed_with_batch(store: Arc<MemoryStore>, batch: usize) -> EventFeed {
        let config = EventsConfig {
            pull_batch: batch,
            poll_min_ms: 10,
            poll_max_ms: 40,
            ..EventsConfig::default()
        };
        EventFeed::new(store, &config)
    }

    async fn conversation(store: &MemoryStore) -> ConversationId {
        store
            .create_conversation(Conversation::new("objections", 10))
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_quiet_wait_returns_empty_at_deadline() {
        let store = Arc::new(MemoryStore::new());
        let id = conversation(&store).await;
        let feed = feed_with_batch(store, 50);

        let started = std::time::Instant::now();
        let batch = feed
            .wait_for_events(id, 0, Duration::from_millis(60))
            .await
            .unwrap();

        assert!(batch.events.is_empty());
        assert_eq!(batch.next_cursor, 0);
        assert!(!batch.has_more);
        assert!(started.elapsed() >= Duration::from_millis(55));
    }

    #[tokio::test]
    async fn test_append_wakes_a_parked_wait() {
        let store = Arc::new(MemoryStore::new());
        let id = conversation(&store).await;
        let feed = feed_with_batch(store.clone(), 50);

        let waiter = tokio::spawn({
            let feed = feed.clone();
            async move { feed.wait_for_events(id, 0, Duration::from_secs(10)).await }
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        let started = std::time::Instant::now();
        store
            .append_event(NewEvent::new(id, EventType::TurnAccepted))
            .await
            .unwrap();

        let batch = waiter.await.unwrap().unwrap();
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.next_cursor, 1);
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "wake should beat the deadline by a wide margin"
        );
    }

    #[tokio::test]
    async fn test_pending_events_return_without_waiting() {
        let store = Arc::new(MemoryStore::new());
        let id = conversation(&store).await;
        store
            .append_event(NewEvent::new(id, EventType::TurnAccepted))
            .await
            .unwrap();
        let feed = feed_with_batch(store, 50);

        let started = std::time::Instant::now();
        let batch = feed
            .wait_for_events(id, 0, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(batch.events.len(), 1);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_batch_cap_pages_without_gaps() {
        let store = Arc::new(MemoryStore::new());
        let id = conversation(&store).await;
        for _ in 0..5 {
            store
                .append_event(NewEvent::new(id, EventType::AsrReady))
                .await
                .unwrap();
        }
        let feed = feed_with_batch(store, 2);

        let first = feed.fetch(id, 0).await.unwrap();
        assert_eq!(
            first.events.iter().map(|e| e.cursor).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(first.has_more);

        let second = feed.fetch(id, first.next_cursor).await.unwrap();
        assert_eq!(
            second.events.iter().map(|e| e.cursor).collect::<Vec<_>>(),
            vec![3, 4]
        );
        assert!(second.has_more);

        let last = feed.fetch(id, second.next_cursor).await.unwrap();
        assert_eq!(
            last.events.iter().map(|e| e.cursor).collect::<Vec<_>>(),
            vec![5]
        );
        assert!(!last.has_more);
        assert_eq!(last.next_cursor, 5);
    }
}
