//! Periodic schedules on top of the one-shot timer.
//!
//! A schedule fires at `base + k * interval` for increasing `k`. The
//! scheduler arms a single one-shot for the nearest firing across all
//! schedules and re-evaluates on every fire. System time is treated as
//! non-monotonic here and nowhere else: when the clock regresses past
//! the configured window, every schedule is rebased and its client told
//! so through a distinct event.

use crate::stamp::{Stamp, NSEC_PER_MIN, NSEC_PER_MSEC};
use crate::timer::{timer_channel, OneShot, TimerId, TimerSender};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Identifies a started schedule. Unique while the schedule is active
/// and never zero.
pub type ScheduleId = u32;

/// Events delivered to a schedule's client channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleEvent {
    /// The schedule's next time arrived.
    Fired(ScheduleId),
    /// The system clock regressed and the schedule was rebased.
    Regressed(ScheduleId),
}

/// Sending half of a schedule client channel.
pub type ScheduleSender = mpsc::UnboundedSender<ScheduleEvent>;
/// Receiving half of a schedule client channel.
pub type ScheduleReceiver = mpsc::UnboundedReceiver<ScheduleEvent>;

/// Builds the channel a schedule client listens on.
#[must_use]
pub fn schedule_channel() -> (ScheduleSender, ScheduleReceiver) {
    mpsc::unbounded_channel()
}

/// Default clock-regression window: five minutes.
pub const DEFAULT_REGRESSION_WINDOW: i64 = 5 * NSEC_PER_MIN;

/// Upper bound on how long the scheduler naps between evaluations.
const MAX_WAIT_MS: u64 = 10_000;

struct Schedule {
    client: ScheduleSender,
    base: Stamp,
    interval: i64,
    next: Stamp,
}

struct Core {
    schedules: HashMap<ScheduleId, Schedule>,
    last_schedule_id: ScheduleId,
    current_wait: TimerId,
    last_checked: Stamp,
    regression_window: i64,
}

impl Core {
    /// Fires due schedules and reports the wait, in milliseconds, until
    /// the nearest future firing.
    fn advance(&mut self, now: Stamp) -> (Vec<(ScheduleSender, ScheduleEvent)>, u64) {
        let mut events = Vec::new();

        // Clock regression: rebase everything before looking for due
        // schedules so nothing fires off a stale next time.
        if self.last_checked > now && self.last_checked - now > self.regression_window {
            warn!(
                regressed_ms = (self.last_checked - now) / NSEC_PER_MSEC,
                "system clock regressed; rebasing schedules"
            );
            for (id, schedule) in &mut self.schedules {
                let passed = (now - schedule.base).div_euclid(schedule.interval) + 1;
                schedule.next = schedule.base + passed * schedule.interval;
                events.push((schedule.client.clone(), ScheduleEvent::Regressed(*id)));
            }
        }
        self.last_checked = now;

        let mut least_wait = MAX_WAIT_MS as i64 * NSEC_PER_MSEC;
        let mut dead = Vec::new();
        for (id, schedule) in &mut self.schedules {
            if now >= schedule.next {
                // The firing may have been held up longer than one
                // interval; land the next time strictly in the future.
                let passed = (now - schedule.next).div_euclid(schedule.interval);
                schedule.next += schedule.interval * (passed + 1);
                debug_assert!(schedule.next > now);
                if schedule.client.send(ScheduleEvent::Fired(*id)).is_err() {
                    dead.push(*id);
                    continue;
                }
            }
            least_wait = least_wait.min(schedule.next - now);
        }
        for id in dead {
            self.schedules.remove(&id);
        }
        let wait_ms = (least_wait.max(NSEC_PER_MSEC) / NSEC_PER_MSEC) as u64;
        (events, wait_ms)
    }

    fn allocate_id(&mut self) -> ScheduleId {
        let mut id = self.last_schedule_id.wrapping_add(1);
        loop {
            if id == 0 {
                id = 1;
            }
            if !self.schedules.contains_key(&id) {
                self.last_schedule_id = id;
                return id;
            }
            id = id.wrapping_add(1);
        }
    }
}

/// Computes the first firing for a schedule started now. Firings land
/// on `base + k * interval`; a start in the past rounds up to the next
/// boundary, and `ignore_past` skips one further interval.
fn first_time(base: Stamp, interval: i64, ignore_past: bool, now: Stamp) -> Stamp {
    if base >= now {
        return base;
    }
    let intervals = (now - base).div_euclid(interval)
        + i64::from((now - base).rem_euclid(interval) != 0);
    let mut next = base + intervals * interval;
    if ignore_past {
        next += interval;
    }
    next
}

/// Shared periodic scheduler.
#[derive(Clone)]
pub struct Scheduler {
    core: Arc<Mutex<Core>>,
    timer: OneShot,
    timer_tx: TimerSender,
}

impl Scheduler {
    /// Creates a scheduler driven by the given one-shot timer.
    #[must_use]
    pub fn new(timer: OneShot) -> Self {
        Self::with_regression_window(timer, DEFAULT_REGRESSION_WINDOW)
    }

    /// Creates a scheduler with a custom clock-regression window.
    #[must_use]
    pub fn with_regression_window(timer: OneShot, regression_window: i64) -> Self {
        let (timer_tx, timer_rx) = timer_channel();
        let core = Arc::new(Mutex::new(Core {
            schedules: HashMap::new(),
            last_schedule_id: 0,
            current_wait: 0,
            last_checked: Stamp::now(),
            regression_window,
        }));
        let scheduler = Self {
            core,
            timer,
            timer_tx,
        };
        tokio::spawn(drive(
            Arc::downgrade(&scheduler.core),
            scheduler.timer.clone(),
            scheduler.timer_tx.clone(),
            timer_rx,
        ));
        scheduler
    }

    /// Starts a schedule. Events arrive on `client` until the schedule
    /// is cancelled or the client channel is dropped.
    pub fn start(
        &self,
        client: &ScheduleSender,
        base: Stamp,
        interval_ms: u32,
        ignore_past: bool,
    ) -> ScheduleId {
        assert!(interval_ms > 0, "schedule started with an invalid interval");
        let interval = i64::from(interval_ms) * NSEC_PER_MSEC;
        let now = Stamp::now();
        let mut core = self.core.lock().expect("scheduler poisoned");
        let id = core.allocate_id();
        core.schedules.insert(
            id,
            Schedule {
                client: client.clone(),
                base,
                interval,
                next: first_time(base, interval, ignore_past, now),
            },
        );
        debug!(id, interval_ms, "schedule started");
        self.rearm_soon(&mut core);
        id
    }

    /// Cancels a schedule. Safe with ids that are already gone.
    pub fn cancel(&self, id: ScheduleId) {
        let mut core = self.core.lock().expect("scheduler poisoned");
        if core.schedules.remove(&id).is_some() {
            debug!(id, "schedule cancelled");
            self.rearm_soon(&mut core);
        }
    }

    /// The next firing time of a schedule, if it is active.
    #[must_use]
    pub fn next_time(&self, id: ScheduleId) -> Option<Stamp> {
        let core = self.core.lock().expect("scheduler poisoned");
        core.schedules.get(&id).map(|schedule| schedule.next)
    }

    /// True while the scheduler has a pending evaluation armed for its
    /// active schedules.
    #[must_use]
    pub fn check_status(&self) -> bool {
        let core = self.core.lock().expect("scheduler poisoned");
        core.schedules.is_empty() || self.timer.is_armed(core.current_wait)
    }

    fn rearm_soon(&self, core: &mut Core) {
        if core.current_wait != 0 {
            self.timer.disarm(core.current_wait);
        }
        core.current_wait = self.timer.arm(&self.timer_tx, 10);
    }
}

async fn drive(
    core: Weak<Mutex<Core>>,
    timer: OneShot,
    timer_tx: TimerSender,
    mut timer_rx: crate::timer::TimerReceiver,
) {
    while let Some(fired) = timer_rx.recv().await {
        let Some(core) = core.upgrade() else {
            return;
        };
        let events = {
            let mut core = core.lock().expect("scheduler poisoned");
            if fired != core.current_wait {
                // A stale fire from a disarm race; the replacement
                // timer is already armed.
                continue;
            }
            let (events, wait_ms) = core.advance(Stamp::now());
            core.current_wait = timer.arm(&timer_tx, wait_ms);
            events
        };
        for (client, event) in events {
            let _ = client.send(event);
        }
    }
}
