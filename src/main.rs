//! Binary entrypoint for monitor-switch.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use monitor_switch::config::Configuration;
use monitor_switch::device::{DeviceDescriptor, DeviceIdentity};
use monitor_switch::events::ActivityLog;
use monitor_switch::platform::{CommandDisplayDriver, XdgAutostart};
use monitor_switch::storage::FileSettingsStore;
use monitor_switch::tasks::TaskScope;
use monitor_switch::{AppOptions, Application, Collaborators};
use serde::Serialize;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "monitor-switch",
    version,
    about = "Turn the display off while a chosen USB device is unplugged."
)]
struct Cli {
    /// Path to YAML configuration file.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch USB devices and drive the display until interrupted.
    Run,
    /// List connected USB devices.
    Devices {
        #[arg(long)]
        json: bool,
    },
    /// Choose the device whose removal turns the screen off.
    Select { id: String },
    /// Drop a device from the known list, clearing it if selected.
    Forget { id: String },
    /// Show or change the screen-off delay.
    Delay { seconds: Option<u64> },
    /// Manage starting at login.
    Autostart {
        #[arg(value_enum, default_value_t = AutostartAction::Status)]
        action: AutostartAction,
    },
    /// Record whether front ends should start minimized.
    StartMinimized {
        #[arg(action = ArgAction::Set)]
        enabled: bool,
    },
    /// Turn the screen off and back on once.
    TestScreen,
    /// Show settings and device state.
    Status {
        #[arg(long)]
        json: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum AutostartAction {
    Enable,
    Disable,
    Status,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct StatusReport {
    selected_device: Option<DeviceIdentity>,
    selected_connected: bool,
    screen_off_delay_secs: u64,
    start_on_boot: bool,
    autostart_enabled: bool,
    start_minimized: bool,
    off_pending: bool,
    display_on: Option<bool>,
    known_devices: Vec<DeviceIdentity>,
    connected_devices: Vec<DeviceDescriptor>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = init_tracing(&cli.log_level) {
        eprintln!("{err:#}");
        std::process::exit(2);
    }
    if let Err(err) = try_main(cli).await {
        error!(error = ?err, "monitor-switch exited with error");
        std::process::exit(1);
    }
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::builder()
            .parse(level)
            .with_context(|| format!("invalid log level '{level}'"))?,
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

async fn try_main(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Configuration::from_yaml_file(path)?,
        None => Configuration::default(),
    }
    .validated()
    .context("validating configuration")?;

    let app = build_application(&config)?;
    app.start_configuration();

    match cli.command {
        Commands::Run => run(&app).await?,
        Commands::Devices { json } => {
            let devices = app.connected_devices();
            if json {
                println!("{}", serde_json::to_string_pretty(&devices)?);
            } else {
                let selected = app.selected_device();
                for device in &devices {
                    let marker = if selected.as_ref() == Some(&device.identity) {
                        '*'
                    } else {
                        ' '
                    };
                    println!("{marker} {device}");
                }
            }
        }
        Commands::Select { id } => {
            app.set_selected_device(id.as_str());
            if app.is_selected_device_connected() {
                println!("selected {id} (connected)");
            } else {
                println!("selected {id} (not connected)");
            }
        }
        Commands::Forget { id } => {
            if app.forget_device(&DeviceIdentity::from(id.as_str())) {
                println!("forgot {id}");
            } else {
                println!("{id} was not a known device");
            }
        }
        Commands::Delay { seconds } => {
            if let Some(seconds) = seconds {
                app.set_screen_delay(seconds)?;
            }
            let delay = Duration::from_secs(app.screen_delay());
            println!("{}", humantime::format_duration(delay));
        }
        Commands::Autostart { action } => {
            match action {
                AutostartAction::Enable => app.set_autostart(true)?,
                AutostartAction::Disable => app.set_autostart(false)?,
                AutostartAction::Status => {}
            }
            let state = if app.is_autostart_enabled() {
                "enabled"
            } else {
                "disabled"
            };
            println!("autostart {state}");
        }
        Commands::StartMinimized { enabled } => {
            app.set_start_minimized(enabled);
            println!("start minimized: {}", app.is_start_minimized());
        }
        Commands::TestScreen => {
            app.run_screen_test().await.context("screen test failed")?;
            println!("screen test passed");
        }
        Commands::Status { json } => print_status(&app, json)?,
    }
    Ok(())
}

fn build_application(config: &Configuration) -> Result<Application> {
    let data_dir = match &config.data_dir {
        Some(dir) => dir.clone(),
        None => FileSettingsStore::default_dir()?,
    };
    let desktop_file = match &config.autostart.desktop_file {
        Some(path) => path.clone(),
        None => XdgAutostart::default_path()?,
    };
    let display = CommandDisplayDriver::new(config.display_power.clone())
        .context("configuring display power")?;

    let activity: ActivityLog = Arc::new(|message: &str| {
        info!(target: "activity", "{message}");
    });
    let collaborators = Collaborators {
        enumerator: Arc::new(config.monitor.enumerator()),
        monitor: config.monitor.options(),
        display: Arc::new(display),
        store: Arc::new(FileSettingsStore::new(data_dir)),
        autostart: Arc::new(XdgAutostart::new(desktop_file)),
    };
    let options = AppOptions {
        screen_test_interval: config.screen_test_interval,
        ..AppOptions::default()
    };
    Ok(Application::new(
        collaborators,
        options,
        activity,
        TaskScope::from_current()?,
    ))
}

async fn run(app: &Application) -> Result<()> {
    app.initialize().context("initializing monitor-switch")?;
    let selected = app
        .selected_device()
        .map(|id| id.to_string())
        .unwrap_or_else(|| "none".to_string());
    info!(
        selected,
        connected = app.is_selected_device_connected(),
        delay_secs = app.screen_delay(),
        "monitoring USB devices"
    );

    let waited = wait_for_shutdown(app).await;
    app.shutdown().await;
    waited
}

async fn wait_for_shutdown(app: &Application) -> Result<()> {
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?;
    let mut hangup = signal(SignalKind::hangup()).context("failed to register SIGHUP handler")?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    warn!("ctrl-c handler failed: {err}");
                }
                info!("ctrl-c received; shutting down");
                break;
            }
            _ = terminate.recv() => {
                info!("SIGTERM received; shutting down");
                break;
            }
            _ = hangup.recv() => {
                info!("SIGHUP received; reloading settings");
                if let Err(err) = app.reload_configuration() {
                    warn!(error = %err, "settings reload failed; keeping current settings");
                }
            }
        }
    }
    Ok(())
}

fn print_status(app: &Application, json: bool) -> Result<()> {
    let settings = app.settings();
    let report = StatusReport {
        selected_device: app.selected_device(),
        selected_connected: app.is_selected_device_connected(),
        screen_off_delay_secs: settings.screen_off_delay_secs,
        start_on_boot: settings.start_on_boot,
        autostart_enabled: app.is_autostart_enabled(),
        start_minimized: settings.start_minimized,
        off_pending: app.is_off_pending(),
        display_on: app.is_display_on(),
        known_devices: app.known_devices(),
        connected_devices: app.connected_devices(),
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    match &report.selected_device {
        Some(id) => println!(
            "selected device: {id} ({})",
            if report.selected_connected {
                "connected"
            } else {
                "not connected"
            }
        ),
        None => println!("selected device: none"),
    }
    println!("screen-off delay: {}s", report.screen_off_delay_secs);
    println!(
        "start on boot: {} (autostart entry {})",
        report.start_on_boot,
        if report.autostart_enabled {
            "present"
        } else {
            "absent"
        }
    );
    println!("start minimized: {}", report.start_minimized);
    println!(
        "display: {}",
        match report.display_on {
            Some(true) => "on",
            Some(false) => "off",
            None => "unknown",
        }
    );
    println!("known devices: {}", report.known_devices.len());
    for id in &report.known_devices {
        println!("  {id}");
    }
    println!("connected devices: {}", report.connected_devices.len());
    for device in &report.connected_devices {
        println!("  {device}");
    }
    Ok(())
}
