//! Common utilities for the guest init components.
//!
//! This crate provides shared functionality for every guest-side crate:
//! - Console logging with boot-relative timestamps
//! - Power control (sync and power-off)
//! - Go-style duration strings used by descriptor files
//! - Error categories shared by all error enums

pub mod category;
pub mod duration;
pub mod log;
pub mod power;

pub use category::Category;
pub use duration::{DurationError, parse_duration};
pub use power::{PowerControl, PowerError, SystemPower};
