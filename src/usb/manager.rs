//! Device discovery and the daemon's device table.
//!
//! A scan thread polls enumeration for supported vendor/product pairs,
//! brings new units up and reaps units that stay missing. The table is
//! bounded; a board beyond the last slot is ignored until one frees up.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use hidapi::HidApi;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::core::events::DaemonEvent;

use super::device::{DeviceEnv, SetupError, SetupOutcome, UsbDevice};
use super::features;
use super::transport::HidIo;

/// Maximum number of concurrently attached devices.
pub const DEV_MAX: usize = 9;

/// How many consecutive scans a unit must be missing before it is torn
/// down. A device mid-reset briefly drops off the bus; reaping it on the
/// first missed scan would race its own recovery.
const REMOVE_THRESHOLD: u32 = 3;

struct ScanTarget {
    vendor: u16,
    product: u16,
    serial: String,
    name: Option<String>,
}

pub struct DeviceManager {
    api: Arc<Mutex<HidApi>>,
    env: Arc<DeviceEnv>,
    slots: Mutex<Vec<Option<Arc<UsbDevice>>>>,
    stop: AtomicBool,
    scan_interval: Duration,
}

impl DeviceManager {
    pub fn new(env: Arc<DeviceEnv>, scan_interval: Duration) -> Result<Self> {
        let api = HidApi::new().context("failed to initialize HID API")?;
        Ok(Self {
            api: Arc::new(Mutex::new(api)),
            env,
            slots: Mutex::new(vec![None; DEV_MAX]),
            stop: AtomicBool::new(false),
            scan_interval,
        })
    }

    /// Start the scan thread. Runs until `shutdown`.
    pub fn run(self: Arc<Self>) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            info!("device scan thread started");
            let mut missing: HashMap<String, u32> = HashMap::new();
            while !self.stop.load(Ordering::Relaxed) {
                self.scan_once(&mut missing);
                thread::sleep(self.scan_interval);
            }
            info!("device scan thread stopped");
        })
    }

    fn scan_once(&self, missing: &mut HashMap<String, u32>) {
        // Reap sessions that died on their own (failed recovery).
        {
            let mut slots = self.slots.lock();
            for slot in slots.iter_mut() {
                if slot.as_ref().is_some_and(|d| !d.is_attached()) {
                    *slot = None;
                }
            }
        }

        {
            let mut api = self.api.lock();
            if let Err(err) = api.refresh_devices() {
                debug!("device list refresh failed: {}", err);
                return;
            }
        }

        let targets = self.enumerate();
        let present: HashSet<String> = targets.iter().map(|t| t.serial.clone()).collect();

        for target in targets {
            missing.remove(&target.serial);
            if self.device_by_serial(&target.serial).is_none() {
                self.attach(target);
            }
        }

        // Count down units that disappeared from enumeration.
        let lost: Vec<Arc<UsbDevice>> = self
            .devices()
            .into_iter()
            .filter(|d| !present.contains(d.serial()))
            .collect();
        for device in lost {
            let count = missing.entry(device.serial().to_string()).or_insert(0);
            *count += 1;
            if *count >= REMOVE_THRESHOLD {
                missing.remove(device.serial());
                self.detach(&device);
            }
        }
    }

    fn enumerate(&self) -> Vec<ScanTarget> {
        let api = self.api.lock();
        // A board exposes several HID interfaces; fold them by serial.
        let mut by_serial: HashMap<String, ScanTarget> = HashMap::new();
        for info in api.device_list() {
            if !features::supported(info.vendor_id(), info.product_id()) {
                continue;
            }
            let Some(serial) = info.serial_number().filter(|s| !s.is_empty()) else {
                debug!(
                    "skipping {:04x}:{:04x} without a serial number",
                    info.vendor_id(),
                    info.product_id()
                );
                continue;
            };
            by_serial
                .entry(serial.to_string())
                .or_insert_with(|| ScanTarget {
                    vendor: info.vendor_id(),
                    product: info.product_id(),
                    serial: serial.to_string(),
                    name: info.product_string().map(str::to_owned),
                });
        }
        by_serial.into_values().collect()
    }

    fn attach(&self, target: ScanTarget) {
        let index = {
            let slots = self.slots.lock();
            match slots.iter().position(Option::is_none) {
                Some(index) => index,
                None => {
                    warn!(
                        "device table full; ignoring {} (S/N: {})",
                        target.name.as_deref().unwrap_or("keyboard"),
                        target.serial
                    );
                    return;
                }
            }
        };

        let io = match HidIo::open(&self.api, target.vendor, target.product, Some(&target.serial))
        {
            Ok(io) => io,
            Err(err) => {
                warn!("failed to open {}: {}", target.serial, err);
                return;
            }
        };

        let device = UsbDevice::new(
            Arc::clone(&self.env),
            Box::new(io),
            target.vendor,
            target.product,
            index,
            target.serial,
            target.name,
        );
        self.slots.lock()[index] = Some(Arc::clone(&device));

        match device.setup() {
            Ok(SetupOutcome::Ready) => {
                info!("connected {} (S/N: {})", device.name(), device.serial());
                self.notify_connected(&device);
            }
            Ok(SetupOutcome::FirmwareUpdate) => {
                warn!(
                    "{} (S/N: {}) attached but needs a firmware update",
                    device.name(),
                    device.serial()
                );
                self.notify_connected(&device);
            }
            Err(SetupError::Sync(err)) => {
                // The session exists but isn't synchronized; try to reset
                // it back to health off the scan thread.
                warn!(
                    "{}: profile sync failed during setup: {}",
                    device.name(),
                    err
                );
                self.notify_connected(&device);
                let recovering = Arc::clone(&device);
                thread::spawn(move || {
                    if recovering.try_reset().is_err() {
                        recovering.close();
                    }
                });
            }
            Err(err) => {
                error!("failed to set up {}: {}", device.serial(), err);
                self.slots.lock()[index] = None;
            }
        }
    }

    fn notify_connected(&self, device: &UsbDevice) {
        let _ = self.env.events.send(DaemonEvent::DeviceConnected {
            serial: device.serial().to_string(),
            name: device.name().to_string(),
        });
        let _ = self.env.events.send(DaemonEvent::ConnectedListChanged);
    }

    fn detach(&self, device: &Arc<UsbDevice>) {
        info!("{} (S/N: {}) removed", device.name(), device.serial());
        device.close();
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(device.index()) {
            *slot = None;
        }
    }

    fn device_by_serial(&self, serial: &str) -> Option<Arc<UsbDevice>> {
        self.slots
            .lock()
            .iter()
            .flatten()
            .find(|d| d.serial() == serial)
            .cloned()
    }

    /// Every live session, in slot order.
    pub fn devices(&self) -> Vec<Arc<UsbDevice>> {
        self.slots.lock().iter().flatten().cloned().collect()
    }

    /// Stop scanning and tear down every live session.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
        let devices: Vec<Arc<UsbDevice>> = {
            let mut slots = self.slots.lock();
            slots.iter_mut().filter_map(Option::take).collect()
        };
        for device in devices {
            device.close();
        }
    }
}
