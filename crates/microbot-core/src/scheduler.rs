//! Durable, chained action dispatch and opportunistic reconnection.
//!
//! [`ActionScheduler`] owns two background loops: [`ActionScheduler::run`]
//! drains due [`Action`]s against the fleet one step at a time, and
//! [`ActionScheduler::run_reconnector`] periodically reattempts BLE
//! connections to paired-but-disconnected microbots so a queued action
//! finds them already connected when its turn comes.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration as StdDuration, Instant};

use microbot_types::{Action, ActionKind, ButtonMode, DeviceUid};
use time::OffsetDateTime;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::action_store::ActionStore;
use crate::error::Result;
use crate::hub::Hub;

/// Once a retry count hits a multiple of this, the scheduler force
/// disconnects the microbot before the next attempt, on the theory that
/// a wedged connection is more likely than a wedged device.
const DISCONNECT_EVERY_X_RETRIES: i32 = 5;

/// How often the reconnector sweeps the fleet for disconnected, paired
/// microbots worth reattempting.
const RECONNECT_POLL_INTERVAL: StdDuration = StdDuration::from_secs(5);

/// Minimum spacing between reconnect attempts against the same microbot.
const RECONNECT_BACKOFF: StdDuration = StdDuration::from_secs(60);

/// No action is queued at all; poll again on this cadence.
const IDLE_POLL_INTERVAL: StdDuration = StdDuration::from_secs(30);

/// Lower bound the dispatch loop's poll wait is clamped to when actions
/// are queued for the near future.
const MIN_POLL_INTERVAL: StdDuration = StdDuration::from_secs(1);

/// Upper bound the dispatch loop's poll wait is clamped to.
const MAX_POLL_INTERVAL: StdDuration = StdDuration::from_secs(10);

/// Tunables for [`ActionScheduler`]'s dispatch and reconnector loops,
/// mirroring the `Duration`-struct-plus-`Default` shape the rest of
/// this lineage uses for its manager-level configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Once a retry count hits a multiple of this, force-disconnect the
    /// microbot before the next attempt.
    pub disconnect_every_x_retries: i32,
    /// How often the reconnector sweeps the fleet for disconnected,
    /// paired microbots worth reattempting.
    pub reconnect_poll_interval: StdDuration,
    /// Minimum spacing between reconnect attempts against the same
    /// microbot.
    pub reconnect_backoff: StdDuration,
    /// How long the dispatch loop waits when no action is queued at all.
    pub idle_poll_interval: StdDuration,
    /// Lower bound the dispatch loop's poll wait is clamped to.
    pub min_poll_interval: StdDuration,
    /// Upper bound the dispatch loop's poll wait is clamped to.
    pub max_poll_interval: StdDuration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            disconnect_every_x_retries: DISCONNECT_EVERY_X_RETRIES,
            reconnect_poll_interval: RECONNECT_POLL_INTERVAL,
            reconnect_backoff: RECONNECT_BACKOFF,
            idle_poll_interval: IDLE_POLL_INTERVAL,
            min_poll_interval: MIN_POLL_INTERVAL,
            max_poll_interval: MAX_POLL_INTERVAL,
        }
    }
}

impl SchedulerConfig {
    /// Override how many consecutive retries trigger a force-disconnect.
    pub fn with_disconnect_every_x_retries(mut self, n: i32) -> Self {
        self.disconnect_every_x_retries = n;
        self
    }

    /// Override the reconnector's sweep interval.
    pub fn with_reconnect_poll_interval(mut self, interval: StdDuration) -> Self {
        self.reconnect_poll_interval = interval;
        self
    }

    /// Override the minimum per-microbot reconnect spacing.
    pub fn with_reconnect_backoff(mut self, backoff: StdDuration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    /// Override the idle dispatch-loop poll interval.
    pub fn with_idle_poll_interval(mut self, interval: StdDuration) -> Self {
        self.idle_poll_interval = interval;
        self
    }
}

/// Outcome of attempting to dispatch one action.
enum DispatchOutcome {
    Success,
    RetryIn(f64),
}

/// Drives queued actions against a [`Hub`]'s fleet and keeps paired
/// devices reconnected between commands.
pub struct ActionScheduler {
    store: Arc<dyn ActionStore>,
    hub: Arc<Hub>,
    config: SchedulerConfig,
    notify: Notify,
    min_reconnect_time: StdMutex<HashMap<DeviceUid, Instant>>,
}

impl ActionScheduler {
    /// Build a scheduler around `store` and `hub` using the default
    /// tunables. Does not start either background loop; call
    /// [`spawn`](Self::spawn) and [`spawn_reconnector`](Self::spawn_reconnector).
    pub fn new(store: Arc<dyn ActionStore>, hub: Arc<Hub>) -> Arc<Self> {
        Self::with_config(store, hub, SchedulerConfig::default())
    }

    /// Build a scheduler with full control over its dispatch/reconnect
    /// tunables.
    pub fn with_config(store: Arc<dyn ActionStore>, hub: Arc<Hub>, config: SchedulerConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            hub,
            config,
            notify: Notify::new(),
            min_reconnect_time: StdMutex::new(HashMap::new()),
        })
    }

    /// Wake the dispatch loop immediately, e.g. right after enqueuing a
    /// new action rather than waiting out its current poll interval.
    pub fn notify_new_action(&self) {
        self.notify.notify_one();
    }

    /// Spawn the dispatch loop.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.run().await })
    }

    /// Spawn the reconnector loop.
    pub fn spawn_reconnector(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.run_reconnector().await })
    }

    async fn run(&self) {
        loop {
            let wait = match self.step().await {
                Ok(wait) => wait,
                Err(err) => {
                    warn!(error = %err, "action dispatch step failed");
                    self.config.idle_poll_interval
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.notify.notified() => {}
            }
        }
    }

    /// Run one dispatch pass: resolve ready actions, attempt each,
    /// reparent or delete completed/exhausted chains, and return how
    /// long to wait before the next pass.
    async fn step(&self) -> Result<StdDuration> {
        let now = OffsetDateTime::now_utc();
        let ready = self.store.ready_actions(now).await?;

        let mut commanded_this_turn: HashSet<DeviceUid> = HashSet::new();
        let mut completed = Vec::new();
        let mut chains_to_remove = Vec::new();

        for action in ready {
            if !commanded_this_turn.insert(action.microbot_uid) {
                self.store.reschedule(action.id, now + time::Duration::seconds(1)).await?;
                continue;
            }

            match self.dispatch(&action).await {
                Ok(DispatchOutcome::Success) => completed.push(action.id),
                Ok(DispatchOutcome::RetryIn(seconds)) => {
                    self.back_off(&action, seconds, &mut chains_to_remove).await?;
                }
                Err(err) => {
                    self.store.record_error(action.microbot_uid, &err.to_string()).await?;
                    self.back_off(&action, 60.0, &mut chains_to_remove).await?;
                }
            }
        }

        let completion_time = OffsetDateTime::now_utc();
        for id in completed {
            self.store.complete(id, completion_time).await?;
        }
        for id in chains_to_remove {
            self.store.delete_chain(id).await?;
        }

        let next = self.store.next_scheduled_at().await?;
        Ok(self.next_wait(next))
    }

    async fn back_off(&self, action: &Action, seconds: f64, chains_to_remove: &mut Vec<i64>) -> Result<()> {
        let retries_left = self.store.decrement_retries(action.id).await?;
        if retries_left <= 0 {
            debug!(action_id = action.id, "action exhausted its retries, dropping its chain");
            chains_to_remove.push(action.id);
            return Ok(());
        }

        let at = OffsetDateTime::now_utc() + time::Duration::seconds_f64(seconds.max(1.0));
        self.store.reschedule(action.id, at).await?;

        if self.config.disconnect_every_x_retries > 0 && retries_left % self.config.disconnect_every_x_retries == 0 {
            if let Ok(mb) = self.hub.get_microbot(&action.microbot_uid.to_canonical_string(), StdDuration::ZERO).await {
                let _ = mb.disconnect().await;
            }
        }
        Ok(())
    }

    fn next_wait(&self, next: Option<OffsetDateTime>) -> StdDuration {
        let Some(at) = next else {
            return self.config.idle_poll_interval;
        };
        let now = OffsetDateTime::now_utc();
        if at <= now {
            return StdDuration::ZERO;
        }
        let min = self.config.min_poll_interval.as_secs_f64();
        let max = self.config.max_poll_interval.as_secs_f64();
        let seconds = (at - now).as_seconds_f64().clamp(min, max);
        StdDuration::from_secs_f64(seconds)
    }

    async fn dispatch(&self, action: &Action) -> Result<DispatchOutcome> {
        let mb = match self
            .hub
            .get_microbot(&action.microbot_uid.to_canonical_string(), StdDuration::ZERO)
            .await
        {
            Ok(mb) => mb,
            Err(_) => return Ok(DispatchOutcome::RetryIn(30.0)),
        };

        if mb.is_connected() {
            if action.kind == ActionKind::Pair {
                return Ok(DispatchOutcome::Success);
            }
        } else if action.kind != ActionKind::Pair {
            return Ok(DispatchOutcome::RetryIn(60.0));
        }

        match action.kind {
            ActionKind::Pair => mb.pair(|_, _, _| {}).await?,
            ActionKind::Blink => {
                let duration_secs = action
                    .args
                    .get("duration_secs")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(1) as u8;
                mb.device_blink(duration_secs).await?
            }
            ActionKind::Extend => mb.extend().await?,
            ActionKind::Retract => mb.retract().await?,
            ActionKind::Calibrate => {
                let percent = action.args.get("percent").and_then(|v| v.as_u64()).unwrap_or(100) as u8;
                mb.calibrate(percent).await?
            }
            ActionKind::ChangeButtonMode => {
                let mode = match action.args.get("mode").and_then(|v| v.as_str()) {
                    Some(m) if m.eq_ignore_ascii_case("inverted") => ButtonMode::Inverted,
                    _ => ButtonMode::Default,
                };
                mb.set_button_mode(mode).await?
            }
        }
        Ok(DispatchOutcome::Success)
    }

    async fn run_reconnector(&self) {
        let mut ticker = tokio::time::interval(self.config.reconnect_poll_interval);
        loop {
            ticker.tick().await;
            let now = Instant::now();
            for mb in self.hub.all_microbots() {
                if mb.is_connected() {
                    continue;
                }
                match mb.is_paired().await {
                    Ok(true) => {}
                    _ => continue,
                }

                let uid = mb.uid();
                let due = {
                    let map = self.min_reconnect_time.lock().expect("lock poisoned");
                    map.get(&uid).map(|&at| now >= at).unwrap_or(true)
                };
                if !due {
                    continue;
                }

                if let Err(err) = mb.connect().await {
                    debug!(%uid, error = %err, "opportunistic reconnect failed");
                }
                self.min_reconnect_time
                    .lock()
                    .expect("lock poisoned")
                    .insert(uid, now + self.config.reconnect_backoff);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action_store::InMemoryActionStore;
    use crate::mock::MockTransport;
    use crate::pairstore::InMemoryPairKeyStore;
    use crate::registry::Sighting;

    fn action(kind: ActionKind, uid: DeviceUid, retries_left: i32) -> Action {
        Action {
            id: 0,
            microbot_uid: uid,
            kind,
            args: serde_json::json!({}),
            retries_left,
            scheduled_at: OffsetDateTime::UNIX_EPOCH,
            prev_action_id: None,
            prev_action_delay_seconds: 0.0,
        }
    }

    fn scheduler() -> (Arc<ActionScheduler>, Arc<InMemoryActionStore>, Arc<Hub>) {
        let hub = Arc::new(Hub::new(
            Arc::new(MockTransport::new([0; 6])),
            Arc::new(InMemoryPairKeyStore::new()),
            StdDuration::from_secs(60),
        ));
        let store = Arc::new(InMemoryActionStore::new());
        let scheduler = ActionScheduler::new(store.clone(), Arc::clone(&hub));
        (scheduler, store, hub)
    }

    #[tokio::test]
    async fn dispatch_retries_thirty_seconds_when_microbot_unknown() {
        let (scheduler, _store, _hub) = scheduler();
        let uid = DeviceUid::from_bytes([1, 1, 1, 1, 1, 1]);
        let outcome = scheduler.dispatch(&action(ActionKind::Extend, uid, 5)).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::RetryIn(seconds) if seconds == 30.0));
    }

    #[tokio::test]
    async fn dispatch_retries_sixty_seconds_when_known_but_disconnected() {
        let (scheduler, _store, hub) = scheduler();
        let uid = DeviceUid::from_bytes([2, 2, 2, 2, 2, 2]);
        hub.registry().on_sighting(Sighting { uid, name: None });

        let outcome = scheduler.dispatch(&action(ActionKind::Extend, uid, 5)).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::RetryIn(seconds) if seconds == 60.0));
    }

    #[tokio::test]
    async fn step_exhausts_retries_and_drops_the_chain() {
        let (scheduler, store, hub) = scheduler();
        let uid = DeviceUid::from_bytes([3, 3, 3, 3, 3, 3]);
        hub.registry().on_sighting(Sighting { uid, name: None });

        let first = store.enqueue(action(ActionKind::Extend, uid, 1));
        let second = store.enqueue({
            let mut a = action(ActionKind::Retract, uid, 15);
            a.prev_action_id = Some(first);
            a
        });

        scheduler.step().await.unwrap();

        assert!(store.get(first).is_none());
        assert!(store.get(second).is_none());
    }

    #[tokio::test]
    async fn next_wait_is_idle_interval_when_queue_is_empty() {
        let (scheduler, _store, _hub) = scheduler();
        assert_eq!(scheduler.next_wait(None), IDLE_POLL_INTERVAL);
    }

    #[tokio::test]
    async fn next_wait_is_zero_for_overdue_actions() {
        let (scheduler, _store, _hub) = scheduler();
        let wait = scheduler.next_wait(Some(OffsetDateTime::UNIX_EPOCH));
        assert_eq!(wait, StdDuration::ZERO);
    }

    #[tokio::test]
    async fn next_wait_is_clamped_between_one_and_ten_seconds() {
        let (scheduler, _store, _hub) = scheduler();
        let soon = OffsetDateTime::now_utc() + time::Duration::milliseconds(100);
        let wait = scheduler.next_wait(Some(soon));
        assert_eq!(wait, StdDuration::from_secs(1));

        let later = OffsetDateTime::now_utc() + time::Duration::minutes(5);
        let wait = scheduler.next_wait(Some(later));
        assert_eq!(wait, StdDuration::from_secs(10));
    }
}
