use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::Command;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Something that can put the display to sleep and wake it up again.
pub trait DisplayPowerDriver: Send + Sync {
    /// Returns `true` when the display accepted the request.
    fn set_power(&self, on: bool) -> bool;

    /// Current power state, when the platform can report one.
    fn is_on(&self) -> Option<bool> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Sleep,
    Wake,
}

impl PowerAction {
    pub fn for_state(on: bool) -> Self {
        if on { Self::Wake } else { Self::Sleep }
    }
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sleep => "sleep",
            Self::Wake => "wake",
        })
    }
}

/// How to toggle the display. Commands run through `sh -c`; `@OUTPUT@` is
/// replaced with the first connected wlr-randr output. `query-command` is
/// expected to print an `xset q` style `Monitor is On` line.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DisplayPowerPlan {
    pub sysfs: Option<BacklightSysfs>,
    pub sleep_command: Option<String>,
    pub wake_command: Option<String>,
    pub query_command: Option<String>,
}

impl Default for DisplayPowerPlan {
    fn default() -> Self {
        Self {
            sysfs: None,
            sleep_command: Some("xset dpms force off".to_string()),
            wake_command: Some("xset dpms force on".to_string()),
            query_command: Some("xset q".to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BacklightSysfs {
    pub path: PathBuf,
    pub sleep_value: String,
    pub wake_value: String,
}

/// Outcome of one sleep or wake request, step by step.
#[derive(Debug, Clone)]
pub struct PowerAttempt {
    pub action: PowerAction,
    pub output: Option<String>,
    pub steps: Vec<PowerStep>,
}

impl PowerAttempt {
    /// Any step landing is enough; sysfs and the command are alternatives.
    pub fn succeeded(&self) -> bool {
        self.steps.iter().any(|step| step.success)
    }
}

#[derive(Debug, Clone)]
pub struct PowerStep {
    pub target: String,
    pub success: bool,
    pub detail: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

pub type CommandRunner = Arc<dyn Fn(&str) -> io::Result<CommandOutput> + Send + Sync>;

const OUTPUT_PLACEHOLDER: &str = "@OUTPUT@";
const FALLBACK_OUTPUT: &str = "HDMI-A-1";

/// Drives the display through shell commands and an optional backlight
/// sysfs attribute.
pub struct CommandDisplayDriver {
    plan: DisplayPowerPlan,
    runner: CommandRunner,
    output: Mutex<Option<String>>,
}

impl fmt::Debug for CommandDisplayDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDisplayDriver")
            .field("plan", &self.plan)
            .finish_non_exhaustive()
    }
}

impl CommandDisplayDriver {
    pub fn new(plan: DisplayPowerPlan) -> Result<Self> {
        Self::with_runner(plan, Arc::new(run_shell))
    }

    pub fn with_runner(plan: DisplayPowerPlan, runner: CommandRunner) -> Result<Self> {
        if plan.sysfs.is_none() && plan.sleep_command.is_none() && plan.wake_command.is_none() {
            return Err(Error::Initialization(
                "display power needs a sysfs path or at least one command".to_string(),
            ));
        }
        for (label, command) in [
            ("sleep-command", &plan.sleep_command),
            ("wake-command", &plan.wake_command),
            ("query-command", &plan.query_command),
        ] {
            if command.as_deref().is_some_and(|cmd| cmd.trim().is_empty()) {
                return Err(Error::Initialization(format!("{label} must not be blank")));
            }
        }
        Ok(Self {
            plan,
            runner,
            output: Mutex::new(None),
        })
    }

    pub fn apply(&self, action: PowerAction) -> PowerAttempt {
        let mut attempt = PowerAttempt {
            action,
            output: None,
            steps: Vec::new(),
        };

        if let Some(sysfs) = &self.plan.sysfs {
            attempt.steps.push(sysfs.write(action));
        }

        let template = match action {
            PowerAction::Sleep => self.plan.sleep_command.as_deref(),
            PowerAction::Wake => self.plan.wake_command.as_deref(),
        };
        if let Some(template) = template {
            let command = if template.contains(OUTPUT_PLACEHOLDER) {
                match self.resolve_output() {
                    Some(output) => {
                        let command = template.replace(OUTPUT_PLACEHOLDER, &output);
                        attempt.output = Some(output);
                        Some(command)
                    }
                    None => {
                        warn!(%action, "no connected output; skipping display command");
                        attempt.steps.push(PowerStep {
                            target: template.to_string(),
                            success: false,
                            detail: Some("no connected outputs detected".to_string()),
                        });
                        None
                    }
                }
            } else {
                Some(template.to_string())
            };
            if let Some(command) = command {
                attempt.steps.push(self.run(action, command));
            }
        }

        attempt
    }

    fn run(&self, action: PowerAction, command: String) -> PowerStep {
        match (self.runner)(&command) {
            Ok(output) if output.success => {
                debug!(%action, command, "display power command succeeded");
                PowerStep {
                    target: command,
                    success: true,
                    detail: None,
                }
            }
            Ok(output) => {
                let exit = output
                    .code
                    .map(|code| code.to_string())
                    .unwrap_or_else(|| "signal".to_string());
                warn!(%action, exit_code = exit, stderr = output.stderr, command, "display power command failed");
                PowerStep {
                    target: command,
                    success: false,
                    detail: Some(format!("exit {exit}: {}", output.stderr.trim())),
                }
            }
            Err(err) => {
                warn!(%action, error = %err, command, "failed to spawn display power command");
                PowerStep {
                    target: command,
                    success: false,
                    detail: Some(err.to_string()),
                }
            }
        }
    }

    /// Backlight attribute first, then the query command.
    pub fn query(&self) -> Option<bool> {
        if let Some(state) = self.plan.sysfs.as_ref().and_then(BacklightSysfs::read) {
            return Some(state);
        }
        let command = self.plan.query_command.as_deref()?;
        match (self.runner)(command) {
            Ok(output) if output.success => {
                let state = parse_monitor_state(&output.stdout);
                debug!(command, ?state, "queried display power state");
                state
            }
            Ok(output) => {
                debug!(command, stderr = output.stderr, "display state query failed");
                None
            }
            Err(err) => {
                debug!(command, error = %err, "display state query unavailable");
                None
            }
        }
    }

    fn resolve_output(&self) -> Option<String> {
        let mut cached = self.output.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(name) = cached.as_ref() {
            return Some(name.clone());
        }
        let name = match (self.runner)("wlr-randr") {
            Ok(output) if output.success => {
                let name = first_connected_output(&output.stdout)?;
                info!(output = name, "detected Wayland output");
                name
            }
            Ok(output) => {
                warn!(stderr = output.stderr, "wlr-randr failed; using {FALLBACK_OUTPUT}");
                FALLBACK_OUTPUT.to_string()
            }
            Err(err) => {
                warn!(error = %err, "wlr-randr unavailable; using {FALLBACK_OUTPUT}");
                FALLBACK_OUTPUT.to_string()
            }
        };
        *cached = Some(name.clone());
        Some(name)
    }
}

impl DisplayPowerDriver for CommandDisplayDriver {
    fn set_power(&self, on: bool) -> bool {
        self.apply(PowerAction::for_state(on)).succeeded()
    }

    fn is_on(&self) -> Option<bool> {
        self.query()
    }
}

impl BacklightSysfs {
    fn read(&self) -> Option<bool> {
        let value = fs::read_to_string(&self.path).ok()?;
        match value.trim() {
            v if v == self.wake_value.trim() => Some(true),
            v if v == self.sleep_value.trim() => Some(false),
            _ => None,
        }
    }

    fn write(&self, action: PowerAction) -> PowerStep {
        let value = match action {
            PowerAction::Sleep => &self.sleep_value,
            PowerAction::Wake => &self.wake_value,
        };
        let target = self.path.display().to_string();
        match fs::write(&self.path, value) {
            Ok(()) => {
                debug!(path = target, value, %action, "wrote backlight value");
                PowerStep {
                    target,
                    success: true,
                    detail: None,
                }
            }
            Err(err) => {
                warn!(path = target, value, %action, error = %err, "failed to write backlight value");
                PowerStep {
                    target,
                    success: false,
                    detail: Some(err.to_string()),
                }
            }
        }
    }
}

/// Picks an output from wlr-randr's listing. Header lines start in column
/// zero; external outputs win over built-in panels.
fn first_connected_output(listing: &str) -> Option<String> {
    let mut internal = None;
    for line in listing.lines() {
        if line.is_empty() || line.starts_with(char::is_whitespace) {
            continue;
        }
        let mut parts = line.split_whitespace();
        let Some(name) = parts.next() else { continue };
        if parts.next() == Some("disconnected") {
            continue;
        }
        if name.starts_with("eDP") || name.starts_with("LVDS") || name.starts_with("DSI") {
            internal.get_or_insert_with(|| name.to_string());
            continue;
        }
        return Some(name.to_string());
    }
    internal
}

/// `Monitor is On` means awake; standby, suspend and off all count as
/// asleep. No such line means DPMS is disabled or unsupported.
fn parse_monitor_state(listing: &str) -> Option<bool> {
    listing
        .lines()
        .find_map(|line| line.trim().strip_prefix("Monitor is "))
        .map(|state| state.trim() == "On")
}

fn run_shell(command: &str) -> io::Result<CommandOutput> {
    let output = Command::new("sh").arg("-c").arg(command).output()?;
    Ok(CommandOutput {
        success: output.status.success(),
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
