use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher, recommended_watcher};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{DeviceDescriptor, DeviceEnumerator, DeviceIdentity, DeviceSnapshot, diff};
use crate::error::{Error, Result};
use crate::events::{ActivityLog, DeviceCallback, DeviceEvent};
use crate::tasks::TaskScope;

/// What wakes the monitor up to re-enumerate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerSource {
    /// Re-enumerate on a fixed period.
    Poll { interval: Duration },
    /// Re-enumerate when the device node tree under `path` changes, after
    /// `settle` has passed without further changes. A slow poll at
    /// `fallback_interval` catches anything the watcher missed.
    Watch {
        path: PathBuf,
        settle: Duration,
        fallback_interval: Duration,
    },
    /// No background loop; the owner calls [`DeviceMonitor::handle_trigger`].
    Manual,
}

impl TriggerSource {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
}

impl Default for TriggerSource {
    fn default() -> Self {
        Self::Poll {
            interval: Self::DEFAULT_POLL_INTERVAL,
        }
    }
}

/// How a failed enumeration is folded into the snapshot history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnumerationFailurePolicy {
    /// Keep the last good snapshot and emit nothing.
    #[default]
    RetainPrevious,
    /// Treat the failure as "nothing connected", which reports every known
    /// device as vanished and later as reconnected.
    TreatAsEmpty,
}

#[derive(Debug, Clone, Default)]
pub struct MonitorOptions {
    pub trigger: TriggerSource,
    pub on_enumeration_error: EnumerationFailurePolicy,
}

pub struct DeviceMonitor {
    shared: Arc<MonitorShared>,
    trigger: TriggerSource,
    scope: TaskScope,
    lifecycle: Mutex<Lifecycle>,
}

struct MonitorShared {
    enumerator: Arc<dyn DeviceEnumerator>,
    policy: EnumerationFailurePolicy,
    // `None` until one enumeration has succeeded.
    baseline: Mutex<Option<DeviceSnapshot>>,
    monitoring: AtomicBool,
    on_connected: RwLock<Option<DeviceCallback>>,
    on_disconnected: RwLock<Option<DeviceCallback>>,
    activity: ActivityLog,
}

#[derive(Default)]
struct Lifecycle {
    initialized: bool,
    subscription: Option<Subscription>,
    running: Option<CancellationToken>,
}

struct Subscription {
    _watcher: RecommendedWatcher,
    changes: mpsc::Receiver<()>,
}

impl DeviceMonitor {
    pub fn new(
        enumerator: Arc<dyn DeviceEnumerator>,
        options: MonitorOptions,
        scope: TaskScope,
        activity: ActivityLog,
    ) -> Self {
        Self {
            shared: Arc::new(MonitorShared {
                enumerator,
                policy: options.on_enumeration_error,
                baseline: Mutex::new(None),
                monitoring: AtomicBool::new(false),
                on_connected: RwLock::new(None),
                on_disconnected: RwLock::new(None),
                activity,
            }),
            trigger: options.trigger,
            scope,
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    pub fn set_on_device_connected(&self, callback: DeviceCallback) {
        *self
            .shared
            .on_connected
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    pub fn set_on_device_disconnected(&self, callback: DeviceCallback) {
        *self
            .shared
            .on_disconnected
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    /// Acquires the change subscription when the trigger needs one. Does not
    /// start observing.
    pub fn initialize(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle();
        if let TriggerSource::Watch { path, .. } = &self.trigger {
            if lifecycle.subscription.is_none() {
                lifecycle.subscription = Some(Subscription::open(path)?);
            }
        }
        lifecycle.initialized = true;
        info!(trigger = ?self.trigger, "device monitor initialized");
        Ok(())
    }

    /// Records the devices present right now as the baseline, without
    /// reporting them, and starts the trigger loop.
    pub fn start_monitoring(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle();
        if lifecycle.running.is_some() {
            return Err(Error::AlreadyMonitoring);
        }
        if !lifecycle.initialized {
            return Err(Error::NotInitialized);
        }

        let subscription = match &self.trigger {
            TriggerSource::Watch { path, .. } => Some(match lifecycle.subscription.take() {
                Some(subscription) => subscription,
                None => Subscription::open(path)?,
            }),
            _ => None,
        };

        self.shared.capture_baseline();
        self.shared.monitoring.store(true, Ordering::SeqCst);

        let cancel = self.scope.child_token();
        match (&self.trigger, subscription) {
            (TriggerSource::Poll { interval }, _) => {
                self.scope
                    .spawn(poll_loop(self.shared.clone(), *interval, cancel.clone()));
            }
            (
                TriggerSource::Watch {
                    settle,
                    fallback_interval,
                    ..
                },
                Some(subscription),
            ) => {
                self.scope.spawn(watch_loop(
                    self.shared.clone(),
                    subscription,
                    *settle,
                    *fallback_interval,
                    cancel.clone(),
                ));
            }
            _ => {}
        }
        lifecycle.running = Some(cancel);
        drop(lifecycle);

        info!(trigger = ?self.trigger, "device monitoring started");
        (self.shared.activity)("USB device monitoring started");
        Ok(())
    }

    /// Stops the trigger loop and releases the change subscription. Safe to
    /// call repeatedly; registered callbacks are kept.
    pub fn stop_monitoring(&self) {
        let running = {
            let mut lifecycle = self.lifecycle();
            lifecycle.subscription = None;
            self.shared.monitoring.store(false, Ordering::SeqCst);
            lifecycle.running.take()
        };
        if let Some(cancel) = running {
            cancel.cancel();
            info!("device monitoring stopped");
            (self.shared.activity)("USB device monitoring stopped");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.shared.monitoring.load(Ordering::SeqCst)
    }

    /// Re-enumerates, reports changes against the baseline and replaces it.
    /// Returns the number of events delivered; zero when not monitoring.
    pub fn handle_trigger(&self) -> usize {
        self.shared.refresh()
    }

    /// Fresh enumeration; does not consult or touch the baseline.
    pub fn enumerate_now(&self) -> Result<Vec<DeviceDescriptor>> {
        self.shared.enumerator.enumerate()
    }

    pub fn connected_devices(&self) -> Vec<DeviceDescriptor> {
        self.enumerate_now().unwrap_or_else(|err| {
            warn!(error = %err, "failed to list connected devices");
            Vec::new()
        })
    }

    pub fn is_device_connected(&self, id: &DeviceIdentity) -> bool {
        match self.enumerate_now() {
            Ok(devices) => DeviceSnapshot::from_devices(devices).contains(id),
            Err(err) => {
                warn!(device = %id, error = %err, "presence check failed; assuming disconnected");
                false
            }
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for DeviceMonitor {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}

impl MonitorShared {
    fn capture_baseline(&self) {
        let snapshot = match self.enumerator.enumerate() {
            Ok(devices) => Some(DeviceSnapshot::from_devices(devices)),
            Err(err) => match self.policy {
                EnumerationFailurePolicy::RetainPrevious => {
                    warn!(error = %err, "initial enumeration failed; baseline deferred");
                    None
                }
                EnumerationFailurePolicy::TreatAsEmpty => {
                    warn!(error = %err, "initial enumeration failed; starting from empty baseline");
                    Some(DeviceSnapshot::default())
                }
            },
        };
        if let Some(snapshot) = &snapshot {
            debug!(count = snapshot.len(), "captured baseline snapshot");
        }
        *self.baseline() = snapshot;
    }

    fn refresh(&self) -> usize {
        if !self.monitoring.load(Ordering::SeqCst) {
            return 0;
        }

        // Held across enumerate-diff-swap so concurrent triggers serialize
        // and nobody sees a half-updated baseline.
        let mut failure_note = None;
        let events = {
            let mut baseline = self.baseline();
            let current = match self.enumerator.enumerate() {
                Ok(devices) => Some(DeviceSnapshot::from_devices(devices)),
                Err(err) => match self.policy {
                    EnumerationFailurePolicy::RetainPrevious => {
                        warn!(error = %err, "device enumeration failed; keeping previous snapshot");
                        failure_note = Some("USB enumeration failed; keeping last known devices");
                        None
                    }
                    EnumerationFailurePolicy::TreatAsEmpty => {
                        warn!(error = %err, "device enumeration failed; treating as no devices");
                        failure_note =
                            Some("USB enumeration failed; treating all devices as removed");
                        Some(DeviceSnapshot::default())
                    }
                },
            };

            match (current, baseline.as_ref()) {
                (None, _) => Vec::new(),
                (Some(current), None) => {
                    debug!(count = current.len(), "adopted first successful snapshot as baseline");
                    *baseline = Some(current);
                    Vec::new()
                }
                (Some(current), Some(previous)) => {
                    let changes = diff(previous.identities(), current.identities());
                    let mut events =
                        Vec::with_capacity(changes.appeared.len() + changes.vanished.len());
                    events.extend(
                        current
                            .iter()
                            .filter(|device| changes.appeared.contains(&device.identity))
                            .cloned()
                            .map(DeviceEvent::Connected),
                    );
                    events.extend(
                        previous
                            .iter()
                            .filter(|device| changes.vanished.contains(&device.identity))
                            .cloned()
                            .map(DeviceEvent::Disconnected),
                    );
                    *baseline = Some(current);
                    events
                }
            }
        };

        if let Some(note) = failure_note {
            (self.activity)(note);
        }
        for event in &events {
            self.dispatch(event);
        }
        events.len()
    }

    fn dispatch(&self, event: &DeviceEvent) {
        let slot = match event {
            DeviceEvent::Connected(device) => {
                info!(device = %device.identity, name = %device.display_name, "device connected");
                &self.on_connected
            }
            DeviceEvent::Disconnected(device) => {
                info!(device = %device.identity, name = %device.display_name, "device disconnected");
                &self.on_disconnected
            }
        };
        let callback = slot.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(callback) = callback {
            callback(event.descriptor());
        }
    }

    fn baseline(&self) -> MutexGuard<'_, Option<DeviceSnapshot>> {
        self.baseline.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Subscription {
    fn open(path: &Path) -> Result<Self> {
        let (tx, changes) = mpsc::channel::<()>(16);
        let mut watcher = recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if is_device_node_change(&event.kind) => {
                // A full channel already guarantees a pending trigger.
                let _ = tx.try_send(());
            }
            Ok(_) => {}
            Err(err) => warn!("device watch error: {err}"),
        })
        .map_err(|err| Error::Initialization(format!("failed to create device watcher: {err}")))?;
        watcher
            .watch(path, RecursiveMode::Recursive)
            .map_err(|err| {
                Error::Initialization(format!("failed to watch {}: {err}", path.display()))
            })?;
        info!(watching = %path.display(), "device node watcher initialized (recursive)");
        Ok(Self {
            _watcher: watcher,
            changes,
        })
    }
}

fn is_device_node_change(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Remove(_))
}

async fn run_trigger(shared: &Arc<MonitorShared>) {
    let shared = shared.clone();
    match tokio::task::spawn_blocking(move || shared.refresh()).await {
        Ok(0) => {}
        Ok(count) => debug!(count, "device trigger delivered events"),
        Err(err) => error!("device trigger task failed: {err}"),
    }
}

async fn poll_loop(shared: Arc<MonitorShared>, period: Duration, cancel: CancellationToken) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick is immediate and the baseline is already fresh.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => run_trigger(&shared).await,
        }
    }
    debug!("poll loop exited");
}

async fn watch_loop(
    shared: Arc<MonitorShared>,
    mut subscription: Subscription,
    settle: Duration,
    fallback_period: Duration,
    cancel: CancellationToken,
) {
    let mut fallback = interval(fallback_period);
    fallback.set_missed_tick_behavior(MissedTickBehavior::Delay);
    fallback.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(()) = subscription.changes.recv() => {
                sleep(settle).await;
                let mut drained = 0usize;
                while subscription.changes.try_recv().is_ok() {
                    drained += 1;
                }
                debug!(drained, "device node change settled");
                run_trigger(&shared).await;
            }
            _ = fallback.tick() => run_trigger(&shared).await,
        }
    }
    debug!("watch loop exited");
}
