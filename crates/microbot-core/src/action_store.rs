//! Persistence contract for the durable, chained action queue.
//!
//! `microbot-core` only depends on this trait and the [`Action`] type
//! from `microbot-types`; `microbot-store` provides the concrete
//! SQLite-backed implementation, the same split as [`crate::pairstore`].

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use microbot_types::{Action, DeviceUid};
use time::OffsetDateTime;

use crate::error::Result;

/// Durable storage for queued [`Action`]s.
///
/// Implementations must give each mutation transactional atomicity; the
/// scheduler calls these one at a time per step and does not itself
/// coordinate across calls.
#[async_trait]
pub trait ActionStore: Send + Sync {
    /// Actions with no predecessor and a due `scheduled_at`, ordered by
    /// id ascending.
    async fn ready_actions(&self, now: OffsetDateTime) -> Result<Vec<Action>>;

    /// Overwrite `scheduled_at` for `action_id`. Used both to push a
    /// same-turn duplicate forward by a second and to back off a retry.
    async fn reschedule(&self, action_id: i64, at: OffsetDateTime) -> Result<()>;

    /// Decrement `retries_left` by one, returning the new value.
    async fn decrement_retries(&self, action_id: i64) -> Result<i32>;

    /// Mark `action_id` complete: reparent its direct successor, if any
    /// (null out its `prev_action_id`, set its `scheduled_at` to `now +
    /// prev_action_delay_seconds`), then delete the `action_id` row.
    async fn complete(&self, action_id: i64, now: OffsetDateTime) -> Result<()>;

    /// Delete `action_id` and every action chained after it,
    /// transitively.
    async fn delete_chain(&self, action_id: i64) -> Result<()>;

    /// Record the most recent dispatch failure observed for `uid`.
    async fn record_error(&self, uid: DeviceUid, message: &str) -> Result<()>;

    /// The earliest `scheduled_at` among actions with no predecessor, if
    /// any are queued at all.
    async fn next_scheduled_at(&self) -> Result<Option<OffsetDateTime>>;
}

/// A non-persistent [`ActionStore`] for tests.
#[derive(Default)]
pub struct InMemoryActionStore {
    actions: StdMutex<HashMap<i64, Action>>,
    next_id: StdMutex<i64>,
}

impl InMemoryActionStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `action`, assigning it a fresh id and returning it.
    pub fn enqueue(&self, mut action: Action) -> i64 {
        let mut next_id = self.next_id.lock().expect("lock poisoned");
        *next_id += 1;
        action.id = *next_id;
        let id = action.id;
        self.actions.lock().expect("lock poisoned").insert(id, action);
        id
    }

    /// Snapshot the current row for `action_id`, for test assertions.
    pub fn get(&self, action_id: i64) -> Option<Action> {
        self.actions.lock().expect("lock poisoned").get(&action_id).cloned()
    }

    /// Number of rows currently stored.
    pub fn len(&self) -> usize {
        self.actions.lock().expect("lock poisoned").len()
    }

    /// Whether the store holds no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ActionStore for InMemoryActionStore {
    async fn ready_actions(&self, now: OffsetDateTime) -> Result<Vec<Action>> {
        let mut ready: Vec<Action> = self
            .actions
            .lock()
            .expect("lock poisoned")
            .values()
            .filter(|a| a.prev_action_id.is_none() && a.scheduled_at <= now)
            .cloned()
            .collect();
        ready.sort_by_key(|a| a.id);
        Ok(ready)
    }

    async fn reschedule(&self, action_id: i64, at: OffsetDateTime) -> Result<()> {
        if let Some(action) = self.actions.lock().expect("lock poisoned").get_mut(&action_id) {
            action.scheduled_at = at;
        }
        Ok(())
    }

    async fn decrement_retries(&self, action_id: i64) -> Result<i32> {
        let mut actions = self.actions.lock().expect("lock poisoned");
        let action = actions.get_mut(&action_id).expect("decrement of unknown action");
        action.retries_left -= 1;
        Ok(action.retries_left)
    }

    async fn complete(&self, action_id: i64, now: OffsetDateTime) -> Result<()> {
        let mut actions = self.actions.lock().expect("lock poisoned");
        let completed = actions.remove(&action_id);
        if let Some(completed) = completed {
            if let Some(successor) = actions
                .values_mut()
                .find(|a| a.prev_action_id == Some(action_id))
            {
                successor.prev_action_id = None;
                successor.scheduled_at = now + time::Duration::seconds_f64(completed.prev_action_delay_seconds);
            }
        }
        Ok(())
    }

    async fn delete_chain(&self, action_id: i64) -> Result<()> {
        let mut actions = self.actions.lock().expect("lock poisoned");
        let mut stack = vec![action_id];
        while let Some(id) = stack.pop() {
            if actions.remove(&id).is_some() {
                stack.extend(
                    actions
                        .values()
                        .filter(|a| a.prev_action_id == Some(id))
                        .map(|a| a.id)
                        .collect::<Vec<_>>(),
                );
            }
        }
        Ok(())
    }

    async fn record_error(&self, _uid: DeviceUid, _message: &str) -> Result<()> {
        Ok(())
    }

    async fn next_scheduled_at(&self) -> Result<Option<OffsetDateTime>> {
        Ok(self
            .actions
            .lock()
            .expect("lock poisoned")
            .values()
            .filter(|a| a.prev_action_id.is_none())
            .map(|a| a.scheduled_at)
            .min())
    }
}
