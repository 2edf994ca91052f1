//! One-shot timers delivered as channel messages.
//!
//! Components arm a timer with a client channel and receive the timer id
//! on that channel when the interval elapses. A timer fires at most once
//! per arm; [`OneShot::reset`] restarts the interval from now, and
//! [`OneShot::disarm`] guarantees the id is never delivered afterwards.
//!
//! The armed-timer registry is the one piece of shared state in the
//! crate: timers are armed from constructors and destructors that may
//! run off the event loop, so the registry sits behind a concurrent map
//! rather than loop-local storage.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};
use tracing::trace;

/// Identifies an armed timer. Ids are unique among currently armed
/// timers and never zero.
pub type TimerId = u32;

/// Sending half of a timer client channel.
pub type TimerSender = mpsc::UnboundedSender<TimerId>;
/// Receiving half of a timer client channel.
pub type TimerReceiver = mpsc::UnboundedReceiver<TimerId>;

/// Builds the channel a timer client listens on.
#[must_use]
pub fn timer_channel() -> (TimerSender, TimerReceiver) {
    mpsc::unbounded_channel()
}

/// Longest nap the driver takes before re-checking the registry. Keeps
/// the driver responsive to registry churn and lets it notice that the
/// last handle was dropped.
const DRIVER_NAP: Duration = Duration::from_millis(500);

struct Armed {
    client: TimerSender,
    interval: Duration,
    deadline: Instant,
}

struct Registry {
    timers: DashMap<TimerId, Armed>,
    last_id: AtomicU32,
    changed: Notify,
}

/// Shared one-shot timer service.
#[derive(Clone)]
pub struct OneShot {
    registry: Arc<Registry>,
}

impl OneShot {
    /// Creates the timer service and spawns its driver task on the
    /// current runtime.
    #[must_use]
    pub fn new() -> Self {
        let registry = Arc::new(Registry {
            timers: DashMap::new(),
            last_id: AtomicU32::new(0),
            changed: Notify::new(),
        });
        tokio::spawn(drive(Arc::downgrade(&registry)));
        Self { registry }
    }

    /// Arms a timer that delivers `id` on `client` after `delay_ms`
    /// milliseconds, then disarms itself.
    pub fn arm(&self, client: &TimerSender, delay_ms: u64) -> TimerId {
        let interval = Duration::from_millis(delay_ms);
        let id = self.allocate_id();
        self.registry.timers.insert(
            id,
            Armed {
                client: client.clone(),
                interval,
                deadline: Instant::now() + interval,
            },
        );
        self.registry.changed.notify_one();
        trace!(id, delay_ms, "timer armed");
        id
    }

    /// Cancels an armed timer. Safe to call with an id that already
    /// fired or was never armed.
    pub fn disarm(&self, id: TimerId) {
        if self.registry.timers.remove(&id).is_some() {
            self.registry.changed.notify_one();
            trace!(id, "timer disarmed");
        }
    }

    /// Restarts an armed timer's interval from now. Ignored when the id
    /// is no longer armed.
    pub fn reset(&self, id: TimerId) {
        if let Some(mut armed) = self.registry.timers.get_mut(&id) {
            armed.deadline = Instant::now() + armed.interval;
            self.registry.changed.notify_one();
        }
    }

    /// True when the id refers to an armed timer.
    #[must_use]
    pub fn is_armed(&self, id: TimerId) -> bool {
        self.registry.timers.contains_key(&id)
    }

    fn allocate_id(&self) -> TimerId {
        loop {
            let id = self.registry.last_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != 0 && !self.registry.timers.contains_key(&id) {
                return id;
            }
        }
    }
}

impl Default for OneShot {
    fn default() -> Self {
        Self::new()
    }
}

async fn drive(registry: Weak<Registry>) {
    loop {
        let Some(registry) = registry.upgrade() else {
            return;
        };
        let now = Instant::now();
        let mut due = Vec::new();
        let mut earliest: Option<Instant> = None;
        for entry in registry.timers.iter() {
            if entry.deadline <= now {
                due.push(*entry.key());
            } else if earliest.map_or(true, |current| entry.deadline < current) {
                earliest = Some(entry.deadline);
            }
        }
        for id in due {
            if let Some((_, armed)) = registry.timers.remove(&id) {
                // The receiver may be gone; a fired timer for a dropped
                // client is a no-op.
                let _ = armed.client.send(id);
                trace!(id, "timer fired");
            }
        }
        let wake_at = earliest
            .map(|deadline| deadline.min(now + DRIVER_NAP))
            .unwrap_or(now + DRIVER_NAP);
        tokio::select! {
            () = registry.changed.notified() => {}
            () = tokio::time::sleep_until(wake_at) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn timer_fires_after_interval() {
        let timer = OneShot::new();
        let (tx, mut rx) = timer_channel();
        let id = timer.arm(&tx, 250);
        let fired = rx.recv().await.unwrap();
        assert_eq!(fired, id);
        assert!(!timer.is_armed(id));
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_prevents_delivery() {
        let timer = OneShot::new();
        let (tx, mut rx) = timer_channel();
        let id = timer.arm(&tx, 100);
        timer.disarm(id);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_restarts_interval() {
        let timer = OneShot::new();
        let (tx, mut rx) = timer_channel();
        let id = timer.arm(&tx, 200);
        tokio::time::sleep(Duration::from_millis(150)).await;
        timer.reset(id);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err(), "timer fired before the reset interval elapsed");
        let fired = rx.recv().await.unwrap();
        assert_eq!(fired, id);
    }

    #[tokio::test(start_paused = true)]
    async fn ids_are_unique_while_armed() {
        let timer = OneShot::new();
        let (tx, _rx) = timer_channel();
        let first = timer.arm(&tx, 60_000);
        let second = timer.arm(&tx, 60_000);
        assert_ne!(first, second);
    }
}
