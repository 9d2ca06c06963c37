//! Power control: flush filesystems and switch the machine off.

use nix::sys::reboot::{RebootMode, reboot};

#[derive(Debug, thiserror::Error)]
pub enum PowerError {
    #[error("power off failed: {0}")]
    PowerOff(#[source] nix::Error),
}

/// Machine-level shutdown operations.
///
/// Abstracted so the stop-on-exit and ACPI paths can be tested without
/// powering off the test host.
pub trait PowerControl: Send + Sync {
    /// Flush dirty pages to disk.
    fn sync(&self);

    /// Power off immediately. Does not return on success.
    fn power_off(&self) -> Result<(), PowerError>;
}

/// The real kernel interface.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPower;

impl PowerControl for SystemPower {
    fn sync(&self) {
        nix::unistd::sync();
    }

    fn power_off(&self) -> Result<(), PowerError> {
        tracing::warn!("powering off");
        reboot(RebootMode::RB_POWER_OFF)
            .map(|_| ())
            .map_err(PowerError::PowerOff)
    }
}
