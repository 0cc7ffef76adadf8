//! Poll scheduler
//!
//! Two independent repeating timers, short and long cadence. Their periods
//! come from the authoritative snapshot (or an explicit `polls` message) and
//! a timer is only re-armed when its period actually changes.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::events::{EventBus, SessionEvent};

/// Longest period a timer is armed with; larger requests tick at this rate
const MAX_PERIOD_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PollClass {
    Short,
    Long,
}

impl fmt::Display for PollClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollClass::Short => f.write_str("shortPoll"),
            PollClass::Long => f.write_str("longPoll"),
        }
    }
}

#[derive(Debug)]
struct ArmedTimer {
    period_secs: u64,
    task: JoinHandle<()>,
}

#[derive(Debug)]
pub struct PollScheduler {
    timers: HashMap<PollClass, ArmedTimer>,
    events: EventBus,
    shutdown: CancellationToken,
}

impl PollScheduler {
    pub fn new(events: EventBus, shutdown: CancellationToken) -> Self {
        Self {
            timers: HashMap::new(),
            events,
            shutdown,
        }
    }

    /// Currently armed period for `class`, if any
    pub fn period(&self, class: PollClass) -> Option<u64> {
        self.timers.get(&class).map(|t| t.period_secs)
    }

    /// Sets the period of `class`; returns true when a timer was (re)armed
    ///
    /// Zero or `None` disarms the class.
    pub fn set_period(&mut self, class: PollClass, seconds: Option<u64>) -> bool {
        let seconds = seconds.filter(|s| *s > 0);
        if self.period(class) == seconds {
            trace!("{} period unchanged ({:?})", class, seconds);
            return false;
        }

        if let Some(previous) = self.timers.remove(&class) {
            debug!("Cancelling {} timer ({}s)", class, previous.period_secs);
            previous.task.abort();
        }

        let Some(period_secs) = seconds else {
            info!("{} disabled", class);
            return false;
        };

        if self.shutdown.is_cancelled() {
            debug!("Not arming {} timer while shutting down", class);
            return false;
        }

        if period_secs > MAX_PERIOD_SECS {
            warn!(
                "{} period {}s capped at {}s",
                class, period_secs, MAX_PERIOD_SECS
            );
        }
        let period = Duration::from_secs(period_secs.min(MAX_PERIOD_SECS));
        let events = self.events.clone();
        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if shutdown.is_cancelled() {
                            break;
                        }
                        trace!("{} tick", class);
                        events.emit(SessionEvent::Poll(class));
                    }
                }
            }
        });

        info!("{} armed every {}s", class, period_secs);
        self.timers.insert(class, ArmedTimer { period_secs, task });
        true
    }

    /// Cancels every armed timer
    pub fn shutdown(&mut self) {
        for (class, timer) in self.timers.drain() {
            debug!("Cancelling {} timer on shutdown", class);
            timer.task.abort();
        }
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
