//! Monitoring coordinator: ties device events to the display controller and
//! owns the persisted user settings.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use config_model::AppConfig;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::device::{
    DeviceDescriptor, DeviceEnumerator, DeviceIdentity, DeviceMonitor, MonitorOptions,
};
use crate::error::{Error, Result};
use crate::events::{ActivityLog, CompletionCallback};
use crate::platform::autostart::Autostart;
use crate::platform::display_power::{DisplayPowerDriver, PowerAction};
use crate::power::DisplayPowerController;
use crate::storage::SettingsStore;
use crate::tasks::TaskScope;

/// Platform implementations chosen by the embedding binary.
pub struct Collaborators {
    pub enumerator: Arc<dyn DeviceEnumerator>,
    pub monitor: MonitorOptions,
    pub display: Arc<dyn DisplayPowerDriver>,
    pub store: Arc<dyn SettingsStore>,
    pub autostart: Arc<dyn Autostart>,
}

#[derive(Debug, Clone)]
pub struct AppOptions {
    pub screen_test_interval: Duration,
    /// Program registered for login autostart.
    pub program_path: PathBuf,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            screen_test_interval: Duration::from_secs(1),
            program_path: std::env::current_exe()
                .unwrap_or_else(|_| PathBuf::from(env!("CARGO_PKG_NAME"))),
        }
    }
}

pub struct Application {
    inner: Arc<AppInner>,
}

struct AppInner {
    monitor: DeviceMonitor,
    power: DisplayPowerController,
    store: Arc<dyn SettingsStore>,
    autostart: Arc<dyn Autostart>,
    activity: ActivityLog,
    scope: TaskScope,
    options: AppOptions,
    state: Mutex<CoordinatorState>,
}

#[derive(Default)]
struct CoordinatorState {
    config: AppConfig,
    selected_connected: bool,
}

impl Application {
    pub fn new(
        collaborators: Collaborators,
        options: AppOptions,
        activity: ActivityLog,
        scope: TaskScope,
    ) -> Self {
        let Collaborators {
            enumerator,
            monitor,
            display,
            store,
            autostart,
        } = collaborators;
        let monitor = DeviceMonitor::new(enumerator, monitor, scope.clone(), activity.clone());
        let power = DisplayPowerController::new(display, activity.clone(), scope.clone());
        Self {
            inner: Arc::new(AppInner {
                monitor,
                power,
                store,
                autostart,
                activity,
                scope,
                options,
                state: Mutex::new(CoordinatorState::default()),
            }),
        }
    }

    /// Prepares storage, subscribes to device events and starts monitoring.
    pub fn initialize(&self) -> Result<()> {
        let inner = &self.inner;
        inner
            .store
            .initialize()
            .map_err(|err| Error::Initialization(format!("settings storage: {err}")))?;
        inner.monitor.initialize()?;

        let weak = Arc::downgrade(inner);
        inner
            .monitor
            .set_on_device_connected(Arc::new(move |device: &DeviceDescriptor| {
                with_inner(&weak, |inner| inner.on_device_connected(device));
            }));
        let weak = Arc::downgrade(inner);
        inner
            .monitor
            .set_on_device_disconnected(Arc::new(move |device: &DeviceDescriptor| {
                with_inner(&weak, |inner| inner.on_device_disconnected(device));
            }));

        inner.monitor.start_monitoring()?;
        info!("application initialized");
        Ok(())
    }

    /// Loads persisted settings, falling back to defaults, and refreshes the
    /// selected device's connection state.
    pub fn start_configuration(&self) {
        let config = self.inner.store.load().unwrap_or_else(|err| {
            warn!(error = %err, "failed to load settings; using defaults");
            (self.inner.activity)("Could not load settings; using defaults");
            AppConfig::default()
        });
        self.inner.adopt(config);
    }

    /// Re-reads persisted settings. The current settings stay in place when
    /// the files cannot be read.
    pub fn reload_configuration(&self) -> Result<()> {
        let config = self.inner.store.load()?;
        self.inner.adopt(config);
        (self.inner.activity)("Settings reloaded");
        Ok(())
    }

    pub fn set_selected_device(&self, id: impl Into<DeviceIdentity>) {
        let id = id.into();
        let connected = self.inner.monitor.is_device_connected(&id);
        let config = {
            let mut state = self.inner.state();
            state.config.selected_device_id = Some(id.to_string());
            state.config.remember_device(id.as_str());
            state.selected_connected = connected;
            state.config.clone()
        };
        info!(device = %id, connected, "selected device changed");
        (self.inner.activity)(&format!("Selected device: {id}"));
        self.inner.persist(&config);
    }

    pub fn selected_device(&self) -> Option<DeviceIdentity> {
        self.inner.selected_device()
    }

    pub fn is_selected_device_connected(&self) -> bool {
        self.inner.state().selected_connected
    }

    /// Takes effect at the next disconnect; a pending wake keeps its delay.
    pub fn set_screen_delay(&self, secs: u64) -> Result<()> {
        if secs == 0 {
            return Err(Error::InvalidDelay);
        }
        let config = {
            let mut state = self.inner.state();
            state.config.screen_off_delay_secs = secs;
            state.config.clone()
        };
        info!(delay_secs = secs, "screen-off delay changed");
        (self.inner.activity)(&format!("Screen-off delay set to {secs}s"));
        self.inner.persist(&config);
        Ok(())
    }

    pub fn screen_delay(&self) -> u64 {
        self.inner.state().config.screen_off_delay_secs
    }

    pub fn set_autostart(&self, enable: bool) -> Result<()> {
        if enable {
            self.inner.autostart.enable(&self.inner.options.program_path)?;
        } else {
            self.inner.autostart.disable()?;
        }
        let config = {
            let mut state = self.inner.state();
            state.config.start_on_boot = enable;
            state.config.clone()
        };
        (self.inner.activity)(if enable {
            "Start on login enabled"
        } else {
            "Start on login disabled"
        });
        self.inner.persist(&config);
        Ok(())
    }

    pub fn is_autostart_enabled(&self) -> bool {
        self.inner.autostart.is_enabled()
    }

    pub fn set_start_minimized(&self, minimized: bool) {
        let config = {
            let mut state = self.inner.state();
            state.config.start_minimized = minimized;
            state.config.clone()
        };
        (self.inner.activity)(if minimized {
            "Start minimized enabled"
        } else {
            "Start minimized disabled"
        });
        self.inner.persist(&config);
    }

    pub fn is_start_minimized(&self) -> bool {
        self.inner.state().config.start_minimized
    }

    /// Drops `id` from the known devices. Forgetting the selected device also
    /// clears the selection; a pending wake still runs out on its own.
    /// Returns `false` when `id` was neither known nor selected.
    pub fn forget_device(&self, id: &DeviceIdentity) -> bool {
        let (config, was_selected) = {
            let mut state = self.inner.state();
            let known = state.config.forget_device(id.as_str());
            let was_selected = state.config.selected_device_id.as_deref() == Some(id.as_str());
            if !known && !was_selected {
                return false;
            }
            if was_selected {
                state.config.selected_device_id = None;
                state.selected_connected = false;
            }
            (state.config.clone(), was_selected)
        };
        info!(device = %id, was_selected, "device forgotten");
        (self.inner.activity)(&format!("Forgot device: {id}"));
        self.inner.persist(&config);
        true
    }

    pub fn connected_devices(&self) -> Vec<DeviceDescriptor> {
        self.inner.monitor.connected_devices()
    }

    pub fn known_devices(&self) -> Vec<DeviceIdentity> {
        self.inner
            .state()
            .config
            .known_devices
            .iter()
            .map(|id| DeviceIdentity::from(id.as_str()))
            .collect()
    }

    pub fn settings(&self) -> AppConfig {
        self.inner.state().config.clone()
    }

    pub fn is_off_pending(&self) -> bool {
        self.inner.power.is_off_pending()
    }

    pub fn is_display_on(&self) -> Option<bool> {
        self.inner.power.is_display_on()
    }

    pub fn device_monitor(&self) -> &DeviceMonitor {
        &self.inner.monitor
    }

    /// Turns the screen off, waits the test interval and turns it back on,
    /// in the background. Independent of any pending disconnect wake.
    pub fn test_screen_control(&self, on_complete: Option<CompletionCallback>) {
        let power = self.inner.power.clone();
        let interval = self.inner.options.screen_test_interval;
        self.inner.scope.spawn(async move {
            let result = screen_test(power, interval).await;
            if let Err(err) = &result {
                warn!(error = %err, "screen test failed");
            }
            if let Some(on_complete) = on_complete {
                on_complete(result.is_ok());
            }
        });
    }

    /// Same sequence as [`Self::test_screen_control`], awaited in place.
    pub async fn run_screen_test(&self) -> Result<()> {
        screen_test(
            self.inner.power.clone(),
            self.inner.options.screen_test_interval,
        )
        .await
    }

    /// Saves settings, stops monitoring and joins all background work. A
    /// display left off by a pending wake is turned back on.
    pub async fn shutdown(&self) {
        let config = self.inner.state().config.clone();
        self.inner.persist(&config);
        self.inner.monitor.stop_monitoring();
        // Joining first lets a trigger already in flight finish; any wake it
        // scheduled is still outstanding below.
        self.inner.scope.shutdown().await;
        if self.inner.power.cancel_scheduled() {
            let power = self.inner.power.clone();
            if let Err(err) = tokio::task::spawn_blocking(move || power.turn_on()).await {
                warn!("failed to wake display during shutdown: {err}");
            }
        }
        info!("application shut down");
    }
}

impl AppInner {
    fn on_device_connected(&self, device: &DeviceDescriptor) {
        (self.activity)(&format!("Device connected: {device}"));
        if !self.is_selected(&device.identity) {
            return;
        }
        (self.activity)(&format!(
            "Selected device reconnected: {}",
            device.display_name
        ));
        self.state().selected_connected = true;
        match self.power.on_device_reconnected() {
            Some(true) => info!(device = %device.identity, "display restored on reconnect"),
            Some(false) => warn!(device = %device.identity, "display did not turn back on"),
            None => debug!(device = %device.identity, "no pending screen-off to cancel"),
        }
    }

    fn on_device_disconnected(&self, device: &DeviceDescriptor) {
        (self.activity)(&format!("Device disconnected: {device}"));
        if !self.is_selected(&device.identity) {
            return;
        }
        let delay_secs = {
            let mut state = self.state();
            state.selected_connected = false;
            state.config.screen_off_delay_secs
        };
        (self.activity)(&format!(
            "Selected device disconnected: {}",
            device.display_name
        ));
        info!(device = %device.identity, delay_secs, "selected device gone; screen off");

        let activity = self.activity.clone();
        self.power.schedule_off(
            Duration::from_secs(delay_secs),
            Some(Box::new(move |ok: bool| {
                activity(if ok {
                    "Display turned back on (timeout reached)"
                } else {
                    "Screen control sequence failed"
                });
            })),
        );
    }

    // Selection is read once per event.
    fn is_selected(&self, id: &DeviceIdentity) -> bool {
        self.state().config.selected_device_id.as_deref() == Some(id.as_str())
    }

    fn selected_device(&self) -> Option<DeviceIdentity> {
        self.state()
            .config
            .selected_device_id
            .as_deref()
            .map(DeviceIdentity::from)
    }

    fn adopt(&self, config: AppConfig) {
        let connected = config
            .selected_device_id
            .as_deref()
            .is_some_and(|id| self.monitor.is_device_connected(&DeviceIdentity::from(id)));
        info!(
            start_on_boot = config.start_on_boot,
            selected = config.selected_device_id.as_deref().unwrap_or("none"),
            delay_secs = config.screen_off_delay_secs,
            known = config.known_devices.len(),
            connected,
            "settings applied"
        );
        let mut state = self.state();
        state.config = config;
        state.selected_connected = connected;
    }

    fn persist(&self, config: &AppConfig) {
        if let Err(err) = self.store.save(config) {
            warn!(error = %err, "failed to save settings; keeping in-memory change");
            (self.activity)("Failed to save settings");
        }
    }

    fn state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn with_inner(weak: &Weak<AppInner>, f: impl FnOnce(&AppInner)) {
    if let Some(inner) = weak.upgrade() {
        f(&inner);
    }
}

async fn screen_test(power: DisplayPowerController, interval: Duration) -> Result<()> {
    info!(interval = ?interval, "screen test started");
    let off = {
        let power = power.clone();
        tokio::task::spawn_blocking(move || power.turn_off())
            .await
            .unwrap_or(false)
    };
    if !off {
        return Err(Error::DisplayControl(PowerAction::Sleep));
    }
    sleep(interval).await;
    let on = tokio::task::spawn_blocking(move || power.turn_on())
        .await
        .unwrap_or(false);
    if !on {
        return Err(Error::DisplayControl(PowerAction::Wake));
    }
    info!("screen test completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::TriggerSource;
    use crate::events::silent_activity;
    use crate::storage::FileSettingsStore;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StaticBus(Vec<DeviceDescriptor>);

    impl DeviceEnumerator for StaticBus {
        fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        saved: Mutex<Option<AppConfig>>,
        fail_load: AtomicBool,
    }

    impl SettingsStore for MemoryStore {
        fn initialize(&self) -> Result<()> {
            Ok(())
        }

        fn load(&self) -> Result<AppConfig> {
            if self.fail_load.load(Ordering::SeqCst) {
                return Err(Error::Persistence(anyhow::anyhow!("disk on fire")));
            }
            Ok(self.saved.lock().unwrap().clone().unwrap_or_default())
        }

        fn save(&self, config: &AppConfig) -> Result<()> {
            *self.saved.lock().unwrap() = Some(config.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FlagAutostart(AtomicBool);

    impl Autostart for FlagAutostart {
        fn enable(&self, _program: &Path) -> Result<()> {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn disable(&self) -> Result<()> {
            self.0.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_enabled(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct AlwaysOk;

    impl DisplayPowerDriver for AlwaysOk {
        fn set_power(&self, _on: bool) -> bool {
            true
        }
    }

    fn recording_activity() -> (ActivityLog, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let log: ActivityLog = Arc::new(move |message: &str| {
            sink.lock().unwrap().push(message.to_string());
        });
        (log, lines)
    }

    fn app(store: Arc<MemoryStore>) -> Application {
        app_with_activity(store, silent_activity())
    }

    fn app_with_activity(store: Arc<MemoryStore>, activity: ActivityLog) -> Application {
        let keyboard = DeviceDescriptor::new("USB_VID_1&PID_1", "Keyboard", "1", "1");
        Application::new(
            Collaborators {
                enumerator: Arc::new(StaticBus(vec![keyboard])),
                monitor: MonitorOptions {
                    trigger: TriggerSource::Manual,
                    ..MonitorOptions::default()
                },
                display: Arc::new(AlwaysOk),
                store,
                autostart: Arc::new(FlagAutostart::default()),
            },
            AppOptions::default(),
            activity,
            TaskScope::from_current().unwrap(),
        )
    }

    #[tokio::test]
    async fn selection_is_persisted_and_remembered() {
        let store = Arc::new(MemoryStore::default());
        let app = app(store.clone());
        app.initialize().unwrap();
        app.start_configuration();

        app.set_selected_device("USB_VID_1&PID_1");
        assert!(app.is_selected_device_connected());
        app.set_selected_device("USB_VID_9&PID_9");
        assert!(!app.is_selected_device_connected());

        let saved = store.saved.lock().unwrap().clone().unwrap();
        assert_eq!(saved.selected_device_id.as_deref(), Some("USB_VID_9&PID_9"));
        assert_eq!(saved.known_devices, ["USB_VID_1&PID_1", "USB_VID_9&PID_9"]);
        assert_eq!(app.known_devices().len(), 2);
    }

    #[tokio::test]
    async fn zero_delay_is_rejected() {
        let (activity, lines) = recording_activity();
        let app = app_with_activity(Arc::new(MemoryStore::default()), activity);
        assert!(matches!(app.set_screen_delay(0), Err(Error::InvalidDelay)));
        assert!(lines.lock().unwrap().is_empty());
        app.set_screen_delay(30).unwrap();
        assert_eq!(app.screen_delay(), 30);
        assert_eq!(*lines.lock().unwrap(), ["Screen-off delay set to 30s"]);
    }

    #[tokio::test]
    async fn zero_delay_on_disk_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileSettingsStore::new(dir.path().to_path_buf()));
        store.initialize().unwrap();
        std::fs::write(store.config_path(), "screenOffDelay=0\nstartMinimized=true\n").unwrap();

        let app = Application::new(
            Collaborators {
                enumerator: Arc::new(StaticBus(Vec::new())),
                monitor: MonitorOptions {
                    trigger: TriggerSource::Manual,
                    ..MonitorOptions::default()
                },
                display: Arc::new(AlwaysOk),
                store,
                autostart: Arc::new(FlagAutostart::default()),
            },
            AppOptions::default(),
            silent_activity(),
            TaskScope::from_current().unwrap(),
        );
        app.start_configuration();
        assert_eq!(app.screen_delay(), AppConfig::default_screen_off_delay_secs());
        assert!(app.reload_configuration().is_err());
        assert_eq!(app.settings(), AppConfig::default());
    }

    #[tokio::test]
    async fn forgetting_the_selected_device_clears_the_selection() {
        let (activity, lines) = recording_activity();
        let store = Arc::new(MemoryStore::default());
        let app = app_with_activity(store.clone(), activity);
        app.initialize().unwrap();
        app.set_selected_device("USB_VID_1&PID_1");
        app.set_selected_device("USB_VID_9&PID_9");

        assert!(app.forget_device(&DeviceIdentity::from("USB_VID_1&PID_1")));
        assert_eq!(app.selected_device(), Some(DeviceIdentity::from("USB_VID_9&PID_9")));
        assert!(app.forget_device(&DeviceIdentity::from("USB_VID_9&PID_9")));
        assert_eq!(app.selected_device(), None);
        assert!(!app.is_selected_device_connected());
        assert!(!app.forget_device(&DeviceIdentity::from("USB_VID_9&PID_9")));

        let saved = store.saved.lock().unwrap().clone().unwrap();
        assert!(saved.known_devices.is_empty());
        assert_eq!(saved.selected_device_id, None);
        assert!(lines.lock().unwrap().iter().any(|line| line == "Forgot device: USB_VID_9&PID_9"));
        app.shutdown().await;
    }

    #[tokio::test]
    async fn load_failure_falls_back_to_defaults_but_reload_keeps_current() {
        let store = Arc::new(MemoryStore::default());
        let app = app(store.clone());
        store.fail_load.store(true, Ordering::SeqCst);
        app.start_configuration();
        assert_eq!(app.settings(), AppConfig::default());

        app.set_screen_delay(42).unwrap();
        assert!(app.reload_configuration().is_err());
        assert_eq!(app.screen_delay(), 42);
    }

    #[tokio::test]
    async fn autostart_and_minimized_flags_are_persisted() {
        let (activity, lines) = recording_activity();
        let store = Arc::new(MemoryStore::default());
        let app = app_with_activity(store.clone(), activity);
        app.set_autostart(false).unwrap();
        assert!(!app.is_autostart_enabled());
        app.set_autostart(true).unwrap();
        assert!(app.is_autostart_enabled());
        app.set_start_minimized(true);
        assert!(app.is_start_minimized());

        app.set_start_minimized(false);
        assert!(!app.is_start_minimized());

        let saved = store.saved.lock().unwrap().clone().unwrap();
        assert!(saved.start_on_boot);
        assert!(!saved.start_minimized);
        assert_eq!(
            *lines.lock().unwrap(),
            [
                "Start on login disabled",
                "Start on login enabled",
                "Start minimized enabled",
                "Start minimized disabled",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn screen_test_turns_display_off_then_on() {
        let app = app(Arc::new(MemoryStore::default()));
        app.run_screen_test().await.unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel::<bool>();
        app.test_screen_control(Some(Box::new(move |ok: bool| {
            let _ = tx.send(ok);
        })));
        assert!(rx.await.unwrap());
        app.shutdown().await;
    }
}
