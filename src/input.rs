//! Key-event surface registration.
//!
//! Key events reach other processes through an external bridge (uinput on
//! Linux); this module owns only the registration contract the session
//! layer needs: a device is either registered as an event source or it
//! isn't.

use std::collections::HashSet;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::devnode::NodeInfo;

#[derive(Debug, Error)]
pub enum InputError {
    #[error("input surface already registered for S/N {0}")]
    AlreadyOpen(String),
    #[error("input surface rejected: {0}")]
    Rejected(String),
}

/// Input surface registration. `close` is a no-op for devices that were
/// never registered.
pub trait InputOps: Send + Sync {
    fn open(&self, info: &NodeInfo) -> Result<(), InputError>;
    fn close(&self, info: &NodeInfo);
}

impl<T: InputOps + ?Sized> InputOps for std::sync::Arc<T> {
    fn open(&self, info: &NodeInfo) -> Result<(), InputError> {
        (**self).open(info)
    }

    fn close(&self, info: &NodeInfo) {
        (**self).close(info)
    }
}

/// Registration bookkeeping for the default bridge.
#[derive(Default)]
pub struct InputRegistry {
    open: Mutex<HashSet<String>>,
}

impl InputRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self, serial: &str) -> bool {
        self.open.lock().contains(serial)
    }
}

impl InputOps for InputRegistry {
    fn open(&self, info: &NodeInfo) -> Result<(), InputError> {
        let mut open = self.open.lock();
        if !open.insert(info.serial.clone()) {
            return Err(InputError::AlreadyOpen(info.serial.clone()));
        }
        debug!("input surface registered for {}", info.name);
        Ok(())
    }

    fn close(&self, info: &NodeInfo) {
        if self.open.lock().remove(&info.serial) {
            debug!("input surface released for {}", info.name);
        }
    }
}
