//! Operating-system seams: display power and login autostart.

pub mod autostart;
pub mod display_power;

pub use autostart::{Autostart, XdgAutostart};
pub use display_power::{
    BacklightSysfs, CommandDisplayDriver, DisplayPowerDriver, DisplayPowerPlan, PowerAction,
};
