//! chromakd - user-space driver daemon for programmable RGB keyboards
//!
//! The daemon owns the full lifecycle of each attached board over its USB
//! control channel: feature negotiation, command queuing, firmware-version
//! gating, hardware profile synchronization, and reset/recovery.
//!
//! # Layout
//! - [`usb`] - per-device sessions, the outbound command queue, discovery,
//!   and the transport boundary
//! - [`profile`] - mode slots, keymaps, and the serial-keyed profile store
//! - [`devnode`] - per-device control paths other processes talk to
//! - [`input`] - key-event surface registration
//! - [`core`] - configuration and daemon events

pub mod core;
pub mod devnode;
pub mod input;
pub mod profile;
pub mod usb;

pub use crate::core::config::Config;
pub use crate::core::events::DaemonEvent;
pub use crate::profile::store::ProfileStore;
pub use crate::profile::Profile;
pub use crate::usb::{DeviceEnv, DeviceManager, Features, Model, Packet, UsbDevice};
