//! USB session layer: per-device lifecycle, command queue, transport.

mod device;
pub mod features;
mod manager;
mod packet;
mod queue;
pub mod transport;

pub use device::{
    DeviceEnv, QueueError, ResetError, RevertError, SetupError, SetupOutcome, Timings, UsbDevice,
};
pub use features::{Features, Model, KB_VENDOR};
pub use manager::{DeviceManager, DEV_MAX};
pub use packet::{Packet, MSG_SIZE};
pub use queue::{CommandQueue, QueueFull, QUEUE_LEN};
pub use transport::{DeviceIo, FwInfo, HidIo, LoadProfile, TransportError};
