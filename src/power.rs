//! Delayed screen-off state machine.
//!
//! A disconnect turns the display off right away and arms one wake timer.
//! The timer turns it back on when it elapses; a reconnect cancels it and
//! turns the display on immediately. At most one timer is outstanding, and
//! every timer carries a generation number so a superseded one that already
//! woke up does nothing.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::{ActivityLog, CompletionCallback};
use crate::platform::display_power::{DisplayPowerDriver, PowerAction};
use crate::tasks::TaskScope;

#[derive(Clone)]
pub struct DisplayPowerController {
    shared: Arc<PowerShared>,
    scope: TaskScope,
}

struct PowerShared {
    driver: Arc<dyn DisplayPowerDriver>,
    activity: ActivityLog,
    schedule: Mutex<ScheduleState>,
}

#[derive(Default)]
struct ScheduleState {
    next_generation: u64,
    outstanding: Option<PendingWake>,
}

struct PendingWake {
    generation: u64,
    cancel: CancellationToken,
}

impl DisplayPowerController {
    pub fn new(driver: Arc<dyn DisplayPowerDriver>, activity: ActivityLog, scope: TaskScope) -> Self {
        Self {
            shared: Arc::new(PowerShared {
                driver,
                activity,
                schedule: Mutex::new(ScheduleState::default()),
            }),
            scope,
        }
    }

    pub fn turn_on(&self) -> bool {
        let ok = self.shared.drive(PowerAction::Wake);
        self.shared.report(PowerAction::Wake, ok);
        ok
    }

    pub fn turn_off(&self) -> bool {
        let ok = self.shared.drive(PowerAction::Sleep);
        self.shared.report(PowerAction::Sleep, ok);
        ok
    }

    /// Turns the display off now and back on after `delay`, replacing any
    /// wake already pending. Returns `false` when the display refused to
    /// turn off; `on_complete(false)` has then already been called.
    pub fn schedule_off(&self, delay: Duration, on_complete: Option<CompletionCallback>) -> bool {
        let mut schedule = self.shared.schedule();
        if let Some(previous) = schedule.outstanding.take() {
            previous.cancel.cancel();
            debug!(generation = previous.generation, "replaced pending wake");
        }

        let ok = self.shared.drive(PowerAction::Sleep);
        if !ok {
            drop(schedule);
            self.shared.report(PowerAction::Sleep, false);
            if let Some(on_complete) = on_complete {
                on_complete(false);
            }
            return false;
        }

        let generation = schedule.next_generation;
        schedule.next_generation += 1;
        let cancel = self.scope.child_token();
        schedule.outstanding = Some(PendingWake {
            generation,
            cancel: cancel.clone(),
        });
        drop(schedule);

        self.shared.report(PowerAction::Sleep, true);
        info!(generation, delay = ?delay, "screen off; wake scheduled");
        (self.shared.activity)(&format!(
            "Screen will turn back on in {}",
            humantime::format_duration(delay)
        ));

        let shared = self.shared.clone();
        self.scope.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(generation, "pending wake cancelled");
                    return;
                }
                _ = sleep(delay) => {}
            }
            match tokio::task::spawn_blocking(move || shared.fire(generation)).await {
                Ok(Some(result)) => {
                    if let Some(on_complete) = on_complete {
                        on_complete(result);
                    }
                }
                Ok(None) => debug!(generation, "superseded wake ignored"),
                Err(err) => error!(generation, "wake task failed: {err}"),
            }
        });
        true
    }

    /// Drops the pending wake without touching the display.
    pub fn cancel_scheduled(&self) -> bool {
        let Some(pending) = self.shared.schedule().outstanding.take() else {
            return false;
        };
        pending.cancel.cancel();
        info!(generation = pending.generation, "pending wake cancelled");
        (self.shared.activity)("Scheduled screen wake cancelled");
        true
    }

    /// Reconnect while a wake is pending: cancel it and wake now. `None`
    /// when nothing was pending.
    pub fn on_device_reconnected(&self) -> Option<bool> {
        let ok = {
            let mut schedule = self.shared.schedule();
            let pending = schedule.outstanding.take()?;
            pending.cancel.cancel();
            debug!(generation = pending.generation, "device back before timeout");
            self.shared.drive(PowerAction::Wake)
        };
        self.shared.report(PowerAction::Wake, ok);
        (self.shared.activity)("Device reconnected; screen timer cancelled");
        Some(ok)
    }

    pub fn is_off_pending(&self) -> bool {
        self.shared.schedule().outstanding.is_some()
    }

    /// Power state as reported by the driver; `None` when it cannot tell.
    pub fn is_display_on(&self) -> Option<bool> {
        self.shared.driver.is_on()
    }
}

impl PowerShared {
    fn drive(&self, action: PowerAction) -> bool {
        let ok = self.driver.set_power(action == PowerAction::Wake);
        if ok {
            info!(%action, "display power changed");
        } else {
            warn!(%action, "display driver refused power change");
        }
        ok
    }

    fn report(&self, action: PowerAction, ok: bool) {
        let message = match (action, ok) {
            (PowerAction::Sleep, true) => "Screen turned off",
            (PowerAction::Sleep, false) => "Failed to turn off screen",
            (PowerAction::Wake, true) => "Screen turned on",
            (PowerAction::Wake, false) => "Failed to turn on screen",
        };
        (self.activity)(message);
    }

    /// Timer elapsed: wake only if this generation is still the pending one.
    fn fire(&self, generation: u64) -> Option<bool> {
        let ok = {
            let mut schedule = self.schedule();
            match &schedule.outstanding {
                Some(pending) if pending.generation == generation => {}
                _ => return None,
            }
            schedule.outstanding = None;
            self.drive(PowerAction::Wake)
        };
        info!(generation, ok, "delay elapsed; screen wake attempted");
        self.report(PowerAction::Wake, ok);
        Some(ok)
    }

    fn schedule(&self) -> MutexGuard<'_, ScheduleState> {
        self.schedule.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
