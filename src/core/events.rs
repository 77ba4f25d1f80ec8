//! Daemon-wide notification events.
//!
//! Sessions report lifecycle changes here instead of calling back into
//! their owner. Delivery is best-effort: a closed receiver never affects
//! session state.

use tokio::sync::mpsc;

pub type EventSender = mpsc::UnboundedSender<DaemonEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<DaemonEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Notifications emitted by device sessions and the discovery loop.
#[derive(Debug, Clone)]
pub enum DaemonEvent {
    /// A device finished setup.
    DeviceConnected { serial: String, name: String },

    /// A device was torn down.
    DeviceDisconnected { serial: String, name: String },

    /// The set of connected devices changed.
    ConnectedListChanged,

    /// A firmware version was read from a device.
    FirmwareVersion { serial: String, version: u16 },

    /// A device is locked down until a firmware update runs.
    FirmwareUpdateNeeded { serial: String, version: u16 },

    /// A reset loop brought a device back.
    ResetRecovered { serial: String },

    /// A reset loop gave up; the device is eligible for teardown.
    ResetFailed { serial: String },
}
