//! Turns the display off while a chosen USB peripheral is unplugged and back
//! on when it returns or after a delay.

pub mod app;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod platform;
pub mod power;
pub mod storage;
pub mod tasks;

pub use app::{AppOptions, Application, Collaborators};
pub use error::{Error, Result};
