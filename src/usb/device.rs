//! Per-device session lifecycle: bring-up, command queuing, recovery and
//! teardown.
//!
//! A session is shared between the command writers, the transport drain,
//! the input bridge and whatever thread decides to reset or tear the
//! device down. Two locks split those concerns: the device lock covers
//! top-level session state and is held across whole setup/reset/teardown
//! sequences, while the key lock only serializes input delivery against
//! teardown. Queue bookkeeping sits behind its own lock so producers and
//! the drain stay atomic even while a long operation holds the device
//! lock.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::events::{DaemonEvent, EventSender};
use crate::devnode::{DevNode, NodeInfo, NodeOps};
use crate::input::{InputError, InputOps};
use crate::profile::store::ProfileStore;
use crate::profile::{Keymap, Profile};

use super::features::{self, Features, Model};
use super::packet::Packet;
use super::queue::{CommandQueue, QueueFull, QUEUE_LEN};
use super::transport::{DeviceIo, LoadProfile, TransportError};

/// Settling delays between link operations. The hardware needs quiescence
/// time after mode changes before the next command is reliable; these are
/// fixed waits, not condition polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub short: Duration,
    pub medium: Duration,
    pub long: Duration,
}

impl Timings {
    /// No waiting at all; test configurations use this.
    pub const ZERO: Timings = Timings {
        short: Duration::ZERO,
        medium: Duration::ZERO,
        long: Duration::ZERO,
    };
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            short: Duration::from_millis(3),
            medium: Duration::from_millis(10),
            long: Duration::from_millis(100),
        }
    }
}

/// Collaborators shared by every session.
pub struct DeviceEnv {
    pub nodes: Box<dyn NodeOps>,
    pub input: Box<dyn InputOps>,
    pub store: Arc<ProfileStore>,
    pub events: EventSender,
    /// Features excluded from every device, fixed at startup.
    pub feature_mask: Features,
    pub timings: Timings,
}

/// Setup could not produce a usable session.
#[derive(Debug, Error)]
pub enum SetupError {
    /// Control-path creation failed; nothing was left behind.
    #[error("control path setup failed: {0}")]
    DevPath(#[source] std::io::Error),
    /// Input surface registration failed; the control path was unwound.
    #[error("input surface setup failed: {0}")]
    Input(#[source] InputError),
    /// The device is attached but firmware/profile sync failed; the caller
    /// should attempt recovery or disconnect.
    #[error("profile sync failed: {0}")]
    Sync(#[source] TransportError),
}

/// Enqueue was refused; nothing was appended.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("device detached")]
    NoDevice,
    #[error(transparent)]
    Full(#[from] QueueFull),
}

/// Quiescence before a reset failed.
#[derive(Debug, Error)]
pub enum RevertError {
    /// A drain pass produced nothing while entries were pending.
    #[error("outbound queue stuck with {remaining} entries")]
    Stuck { remaining: usize },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Reset failure classes. Transport failures are worth retrying; reinit
/// failures are not.
#[derive(Debug, Error)]
pub enum ResetError {
    #[error("transport reset failed: {0}")]
    Transport(#[source] TransportError),
    #[error("reinitialization failed: {0}")]
    Reinit(#[source] TransportError),
}

/// How setup left the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupOutcome {
    /// Fully synchronized and accepting traffic.
    Ready,
    /// Alive but locked down until a firmware update runs.
    FirmwareUpdate,
}

#[derive(Default)]
struct DeviceState {
    io: Option<Box<dyn DeviceIo>>,
    features: Features,
    active: bool,
    /// Reporting interval in ms; -1 when not applicable (non-RGB).
    pollrate: i32,
    profile: Profile,
    /// 0 until a firmware query succeeds.
    fwversion: u16,
    /// Whether the hardware-resident profile was loaded this session.
    hw_loaded: bool,
    node: Option<DevNode>,
    input_open: bool,
}

#[derive(Default)]
struct QueueState {
    /// Mirrors handle presence so enqueue callers see a lost device
    /// without contending for the device lock.
    attached: bool,
    slot: Option<CommandQueue>,
}

/// One attached physical unit.
pub struct UsbDevice {
    vendor: u16,
    product: u16,
    index: usize,
    model: Model,
    serial: String,
    name: String,
    env: Arc<DeviceEnv>,
    /// Device lock: top-level session state.
    state: Mutex<DeviceState>,
    /// Queue bookkeeping, independent of the device lock.
    queue: Mutex<QueueState>,
    /// Serializes input-event delivery against teardown.
    key_lock: Mutex<()>,
}

impl UsbDevice {
    /// Wrap a freshly opened transport handle in a session. `setup` must
    /// run before the device is exposed to clients.
    pub fn new(
        env: Arc<DeviceEnv>,
        io: Box<dyn DeviceIo>,
        vendor: u16,
        product: u16,
        index: usize,
        serial: impl Into<String>,
        name: Option<String>,
    ) -> Arc<Self> {
        let serial = serial.into();
        let (model, resolved) = features::resolve(vendor, product, env.feature_mask);
        let name = name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| features::default_name(model, resolved));
        Arc::new(Self {
            vendor,
            product,
            index,
            model,
            serial: serial.clone(),
            name,
            env,
            state: Mutex::new(DeviceState {
                io: Some(io),
                profile: Profile::new(serial),
                ..DeviceState::default()
            }),
            queue: Mutex::new(QueueState::default()),
            key_lock: Mutex::new(()),
        })
    }

    pub fn vendor(&self) -> u16 {
        self.vendor
    }

    pub fn product(&self) -> u16 {
        self.product
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn model(&self) -> Model {
        self.model
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn features(&self) -> Features {
        self.state.lock().features
    }

    pub fn pollrate(&self) -> i32 {
        self.state.lock().pollrate
    }

    pub fn fw_version(&self) -> u16 {
        self.state.lock().fwversion
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Whether the transport handle is still live.
    pub fn is_attached(&self) -> bool {
        self.queue.lock().attached
    }

    /// Snapshot of the current profile.
    pub fn profile(&self) -> Profile {
        self.state.lock().profile.clone()
    }

    pub fn queue_len(&self) -> usize {
        self.queue
            .lock()
            .slot
            .as_ref()
            .map_or(0, CommandQueue::len)
    }

    fn node_info(&self, features: Features) -> NodeInfo {
        NodeInfo {
            index: self.index,
            serial: self.serial.clone(),
            name: self.name.clone(),
            model: self.model.class(),
            features,
        }
    }

    fn needs_fw_update(&self, state: &DeviceState) -> bool {
        state.features.contains(Features::FWVERSION)
            && features::fw_update_required(self.model, state.fwversion)
    }

    /// Bring the device up: control path, input surface, firmware check,
    /// profile restore. Holds the device lock for the whole sequence.
    pub fn setup(&self) -> Result<SetupOutcome, SetupError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.features = features::resolve(self.vendor, self.product, self.env.feature_mask).1;
        info!("setting up {} (S/N: {})", self.name, self.serial);

        let node = self
            .env
            .nodes
            .create(&self.node_info(state.features))
            .map_err(SetupError::DevPath)?;
        state.node = Some(node);

        if let Err(err) = self.env.input.open(&self.node_info(state.features)) {
            if let Some(node) = state.node.take() {
                self.env.nodes.remove(node);
            }
            return Err(SetupError::Input(err));
        }
        state.input_open = true;

        // Indicator sync is best-effort and never gates bring-up.
        if let Some(io) = state.io.as_mut() {
            io.update_indicators(true);
        }

        if state.features.contains(Features::RGB) {
            self.setup_rgb(state)
        } else {
            self.setup_non_rgb(state)
        }
    }

    /// Legacy boards only need to be dropped into software mode; they
    /// carry no command queue at all.
    fn setup_non_rgb(&self, state: &mut DeviceState) -> Result<SetupOutcome, SetupError> {
        if let Some(io) = state.io.as_mut() {
            if let Err(err) = io.set_hw_mode(false) {
                warn!("{}: failed to leave hardware mode: {}", self.name, err);
            }
        }
        state.active = true;
        if let Some(node) = &state.node {
            node.update_fwversion(state.fwversion);
        }
        state.profile.keymap = Keymap::System;
        // Mirror the RGB mode layout so clients see a uniform surface.
        state.pollrate = -1;
        state.profile.current = state.profile.ensure_mode(0);
        if self.model == Model::K95 {
            state.profile.ensure_mode(1);
            state.profile.ensure_mode(2);
        }
        if let Some(node) = &state.node {
            node.update_pollrate(state.pollrate);
        }
        self.queue.lock().attached = true;
        Ok(SetupOutcome::Ready)
    }

    fn setup_rgb(&self, state: &mut DeviceState) -> Result<SetupOutcome, SetupError> {
        {
            let mut queue = self.queue.lock();
            queue.attached = true;
            queue.slot = Some(CommandQueue::new(QUEUE_LEN));
        }

        if state.features.contains(Features::FWVERSION) {
            let io = state
                .io
                .as_mut()
                .ok_or(SetupError::Sync(TransportError::DeviceGone))?;
            match io.fw_info() {
                Ok(fw) if !features::fw_update_required(self.model, fw.version) => {
                    state.fwversion = fw.version;
                    state.pollrate = i32::from(fw.poll_ms);
                }
                Ok(fw) => {
                    state.fwversion = fw.version;
                    return Ok(self.enter_fw_update(state));
                }
                Err(err) => {
                    warn!(
                        "{}: firmware query failed ({}); treating device as update-pending",
                        self.name, err
                    );
                    return Ok(self.enter_fw_update(state));
                }
            }
            if let Some(node) = &state.node {
                node.update_fwversion(state.fwversion);
                node.update_pollrate(state.pollrate);
            }
            let _ = self.env.events.send(DaemonEvent::FirmwareVersion {
                serial: self.serial.clone(),
                version: state.fwversion,
            });
        }

        // Give the link time to settle after the firmware exchange before
        // profile traffic starts.
        thread::sleep(self.env.timings.long);

        match self.env.store.find(&self.serial) {
            Some(stored) => {
                state.profile = stored;
                if self.model == Model::K95 {
                    // The K95 exposes three hardware mode slots; a restored
                    // profile has to fill them all.
                    state.profile.ensure_min_modes(3);
                }
                self.hw_load(state, LoadProfile::Restore)
                    .map_err(SetupError::Sync)?;
            }
            None => {
                state.profile.keymap = Keymap::System;
                state.profile.current = state.profile.ensure_mode(0);
                if self.model == Model::K95 {
                    state.profile.ensure_mode(1);
                    state.profile.ensure_mode(2);
                }
                self.hw_load(state, LoadProfile::Pull)
                    .map_err(SetupError::Sync)?;
            }
        }
        thread::sleep(self.env.timings.short);
        Ok(SetupOutcome::Ready)
    }

    /// Leave the board alive but locked down: only the firmware update
    /// surface stays reachable, and the profile store is not consulted.
    fn enter_fw_update(&self, state: &mut DeviceState) -> SetupOutcome {
        info!(
            "{} needs a firmware update before RGB control is available",
            self.name
        );
        state.features = Features::FW_UPDATE_PENDING;
        state.active = true;
        state.profile.keymap = Keymap::System;
        state.profile.current = state.profile.ensure_mode(0);
        state.profile.ensure_mode(1);
        state.profile.ensure_mode(2);
        if let Some(node) = &state.node {
            node.update_features(state.features);
            node.update_fwversion(state.fwversion);
        }
        let _ = self.env.events.send(DaemonEvent::FirmwareUpdateNeeded {
            serial: self.serial.clone(),
            version: state.fwversion,
        });
        SetupOutcome::FirmwareUpdate
    }

    fn hw_load(&self, state: &mut DeviceState, mode: LoadProfile) -> Result<(), TransportError> {
        let DeviceState {
            io,
            profile,
            hw_loaded,
            ..
        } = state;
        let io = io.as_mut().ok_or(TransportError::DeviceGone)?;
        io.load_profile(profile, mode)?;
        *hw_loaded = true;
        Ok(())
    }

    /// Queue outbound reports. All-or-nothing: either every report is
    /// appended in order or none are. Boards without RGB control accept
    /// and discard silently, since nothing would ever drain them.
    pub fn enqueue(&self, packets: &[Packet]) -> Result<(), QueueError> {
        let mut queue = self.queue.lock();
        if !queue.attached {
            return Err(QueueError::NoDevice);
        }
        match queue.slot.as_mut() {
            None => Ok(()),
            Some(slot) => slot.push_all(packets).map_err(QueueError::from),
        }
    }

    /// Transmit the oldest queued report, if any. Returns false when the
    /// queue is empty. This is the drain side used by the transport
    /// writer thread.
    pub fn dequeue_send(&self) -> Result<bool, TransportError> {
        let packet = {
            let mut queue = self.queue.lock();
            queue.slot.as_mut().and_then(CommandQueue::pop)
        };
        let Some(packet) = packet else {
            return Ok(false);
        };
        let mut state = self.state.lock();
        let io = state.io.as_mut().ok_or(TransportError::DeviceGone)?;
        io.write(&packet)?;
        Ok(true)
    }

    fn clear_queue(&self) {
        if let Some(slot) = self.queue.lock().slot.as_mut() {
            slot.clear();
        }
    }

    /// Quiesce the device ahead of a transport reset: flush everything
    /// pending, drop out of software mode, flush again.
    pub fn revert(&self) -> Result<(), RevertError> {
        let timings = self.env.timings;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if self.needs_fw_update(state) {
            return Ok(());
        }
        let rgb = state.features.contains(Features::RGB);
        let io = state
            .io
            .as_mut()
            .ok_or(RevertError::Transport(TransportError::DeviceGone))?;
        if !rgb {
            // Hand the board back to hardware playback.
            if let Err(err) = io.set_hw_mode(true) {
                warn!("{}: failed to re-enable hardware mode: {}", self.name, err);
            }
            return Ok(());
        }
        self.drain(io.as_mut(), timings.short)?;
        thread::sleep(timings.medium);
        if let Err(err) = io.set_active(false) {
            warn!("{}: failed to deactivate: {}", self.name, err);
        }
        // Deactivation needs a longer settle than plain queue traffic.
        self.drain(io.as_mut(), timings.medium)?;
        Ok(())
    }

    fn drain(&self, io: &mut dyn DeviceIo, delay: Duration) -> Result<(), RevertError> {
        loop {
            let remaining = self.queue_len();
            if remaining == 0 {
                return Ok(());
            }
            thread::sleep(delay);
            let packet = {
                let mut queue = self.queue.lock();
                queue.slot.as_mut().and_then(CommandQueue::pop)
            };
            match packet {
                Some(packet) => io.write(&packet).map_err(RevertError::Transport)?,
                // Nothing came out while entries were pending: the
                // transport is stuck.
                None => return Err(RevertError::Stuck { remaining }),
            }
        }
    }

    /// Transport-level reset followed by a reduced re-initialization.
    /// Queued-but-unsent reports are discarded; they describe pre-reset
    /// state.
    pub fn reset(&self) -> Result<(), ResetError> {
        let timings = self.env.timings;
        let mut guard = self.state.lock();
        let state = &mut *guard;

        {
            let io = state
                .io
                .as_mut()
                .ok_or(ResetError::Reinit(TransportError::DeviceGone))?;
            thread::sleep(timings.long);
            io.reset().map_err(ResetError::Transport)?;
            thread::sleep(timings.long);
        }
        self.clear_queue();

        if !state.features.contains(Features::RGB) {
            return Ok(());
        }
        let has_fwversion = state.features.contains(Features::FWVERSION);
        let DeviceState {
            io,
            profile,
            hw_loaded,
            fwversion,
            pollrate,
            active,
            ..
        } = state;
        let io = io
            .as_mut()
            .ok_or(ResetError::Reinit(TransportError::DeviceGone))?;

        if has_fwversion {
            let fw = io.fw_info().map_err(ResetError::Reinit)?;
            *fwversion = fw.version;
            *pollrate = i32::from(fw.poll_ms);
            if features::fw_update_required(self.model, *fwversion) {
                return Ok(());
            }
        }

        if let Err(err) = io.set_active(*active) {
            warn!("{}: failed to restore active state: {}", self.name, err);
        }

        let mut load_result = Ok(());
        if !*hw_loaded {
            let mode = if self.env.store.find(&self.serial).is_some() {
                LoadProfile::Restore
            } else {
                LoadProfile::Pull
            };
            load_result = io.load_profile(profile, mode);
            if load_result.is_ok() {
                *hw_loaded = true;
            }
        }
        io.update_rgb(profile);
        load_result.map_err(ResetError::Reinit)
    }

    /// Retry `reset` until it succeeds. Transient transport failures are
    /// retried indefinitely; the reinit class ends the loop and leaves the
    /// device for teardown.
    pub fn try_reset(&self) -> Result<(), ResetError> {
        info!("{}: attempting reset", self.name);
        loop {
            thread::sleep(self.env.timings.long);
            match self.reset() {
                Ok(()) => {
                    info!("{}: reset succeeded", self.name);
                    let _ = self.env.events.send(DaemonEvent::ResetRecovered {
                        serial: self.serial.clone(),
                    });
                    return Ok(());
                }
                Err(ResetError::Transport(err)) => {
                    debug!("{}: reset failed ({}); retrying", self.name, err);
                }
                Err(err) => {
                    warn!("{}: reset failed ({}); disconnecting", self.name, err);
                    let _ = self.env.events.send(DaemonEvent::ResetFailed {
                        serial: self.serial.clone(),
                    });
                    return Err(err);
                }
            }
        }
    }

    /// Tear the session down. Idempotent: a second call finds a zeroed
    /// record and does nothing.
    pub fn close(&self) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.node.is_none() {
            return false;
        }
        let _key = self.key_lock.lock();
        let node_features = state.features;

        if let Some(mut io) = state.io.take() {
            info!("disconnecting {} (S/N: {})", self.name, self.serial);
            if state.input_open {
                self.env.input.close(&self.node_info(node_features));
                state.input_open = false;
            }
            let _ = self.env.events.send(DaemonEvent::ConnectedListChanged);
            {
                let mut queue = self.queue.lock();
                queue.attached = false;
                queue.slot = None;
            }
            let profile = std::mem::take(&mut state.profile);
            if state.fwversion == 0 {
                // Never validated against real hardware; not worth keeping.
                drop(profile);
            } else {
                self.env.store.put(profile);
            }
            io.close();
            let _ = self.env.events.send(DaemonEvent::DeviceDisconnected {
                serial: self.serial.clone(),
                name: self.name.clone(),
            });
        } else {
            let _ = self.env.events.send(DaemonEvent::ConnectedListChanged);
        }

        if let Some(node) = state.node.take() {
            self.env.nodes.remove(node);
        }
        // Zero the record so nothing stale survives reuse of the slot.
        *state = DeviceState::default();
        true
    }

    /// Run `f` under the input-path lock if the device is still attached.
    /// Key delivery callers use this so events never pass through a
    /// partially closed surface.
    pub fn with_input_lock<T>(&self, f: impl FnOnce() -> T) -> Option<T> {
        let _guard = self.key_lock.lock();
        if !self.is_attached() {
            return None;
        }
        Some(f())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::{self, EventReceiver};
    use crate::devnode::MemNodes;
    use crate::input::InputRegistry;
    use crate::usb::features::{KB_VENDOR, P_K70, P_K70_NRGB, P_K95, P_K95_NRGB};
    use crate::usb::transport::mock::MockIo;

    struct TestEnv {
        env: Arc<DeviceEnv>,
        nodes: Arc<MemNodes>,
        input: Arc<InputRegistry>,
        store: Arc<ProfileStore>,
        rx: EventReceiver,
    }

    fn test_env() -> TestEnv {
        let (tx, rx) = events::channel();
        let nodes = Arc::new(MemNodes::default());
        let input = Arc::new(InputRegistry::new());
        let store = Arc::new(ProfileStore::new());
        let env = Arc::new(DeviceEnv {
            nodes: Box::new(Arc::clone(&nodes)),
            input: Box::new(Arc::clone(&input)),
            store: Arc::clone(&store),
            events: tx,
            feature_mask: Features::all(),
            timings: Timings::ZERO,
        });
        TestEnv {
            env,
            nodes,
            input,
            store,
            rx,
        }
    }

    fn device(env: &TestEnv, io: &MockIo, product: u16, serial: &str) -> Arc<UsbDevice> {
        UsbDevice::new(
            Arc::clone(&env.env),
            Box::new(io.clone()),
            KB_VENDOR,
            product,
            0,
            serial,
            None,
        )
    }

    fn drain_events(rx: &mut EventReceiver) -> Vec<DaemonEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_non_rgb_k95_setup() {
        let env = test_env();
        let io = MockIo::default();
        let dev = device(&env, &io, P_K95_NRGB, "nrgb95");

        assert_eq!(dev.setup().unwrap(), SetupOutcome::Ready);
        assert_eq!(dev.name(), "K95 Keyboard");
        assert_eq!(dev.features(), Features::STD_NRGB);
        assert!(!dev.features().contains(Features::RGB));
        assert_eq!(dev.pollrate(), -1);
        assert!(dev.is_active());

        let profile = dev.profile();
        assert_eq!(profile.modes.len(), 3);
        assert_eq!(profile.current, 0);
        assert_eq!(profile.keymap, Keymap::System);

        // No queue is ever allocated: enqueue succeeds without mutation.
        dev.enqueue(&[Packet::new()]).unwrap();
        assert_eq!(dev.queue_len(), 0);

        let state = io.state.lock();
        assert_eq!(state.hw_mode_calls, vec![false]);
        assert_eq!(state.indicator_calls, 1);
        assert_eq!(state.fw_queries, 0);
    }

    #[test]
    fn test_non_rgb_k70_gets_single_mode() {
        let env = test_env();
        let io = MockIo::default();
        let dev = device(&env, &io, P_K70_NRGB, "nrgb70");
        dev.setup().unwrap();
        assert_eq!(dev.profile().modes.len(), 1);
        assert_eq!(dev.name(), "K70 Keyboard");
    }

    #[test]
    fn test_rgb_setup_pulls_when_store_empty() {
        let env = test_env();
        let io = MockIo::with_fw(130);
        let dev = device(&env, &io, P_K70, "rgb70");

        assert_eq!(dev.setup().unwrap(), SetupOutcome::Ready);
        assert_eq!(dev.features(), Features::STD_RGB);
        assert_eq!(dev.fw_version(), 130);
        assert_eq!(dev.pollrate(), 1);
        assert!(!dev.is_active());
        assert_eq!(io.state.lock().load_calls, vec![LoadProfile::Pull]);
        assert!(!dev.profile().modes.is_empty());
    }

    #[test]
    fn test_rgb_setup_restores_stored_profile() {
        let env = test_env();
        let mut stored = Profile::new("rgb95");
        stored.name = "stored".into();
        stored.current = stored.ensure_mode(0);
        env.store.put(stored);

        let io = MockIo::with_fw(130);
        let dev = device(&env, &io, P_K95, "rgb95");
        assert_eq!(dev.setup().unwrap(), SetupOutcome::Ready);

        let profile = dev.profile();
        assert_eq!(profile.name, "stored");
        // The K95 three-mode floor applies to restored profiles too.
        assert_eq!(profile.modes.len(), 3);
        assert_eq!(io.state.lock().load_calls, vec![LoadProfile::Restore]);
    }

    #[test]
    fn test_fw_query_failure_enters_update_state() {
        let mut env = test_env();
        let io = MockIo::with_fw(130);
        io.state.lock().fw_failures = 1;
        let dev = device(&env, &io, P_K70, "glitchy");

        assert_eq!(dev.setup().unwrap(), SetupOutcome::FirmwareUpdate);
        assert_eq!(dev.features(), Features::FW_UPDATE_PENDING);
        assert_eq!(dev.fw_version(), 0);
        assert!(dev.is_active());
        assert_eq!(dev.profile().modes.len(), 3);

        // The profile store is never consulted and hardware is never
        // loaded in this state.
        assert!(env.store.is_empty());
        assert!(io.state.lock().load_calls.is_empty());

        assert!(drain_events(&mut env.rx)
            .iter()
            .any(|e| matches!(e, DaemonEvent::FirmwareUpdateNeeded { .. })));
    }

    #[test]
    fn test_old_firmware_enters_update_state() {
        let env = test_env();
        let io = MockIo::with_fw(100);
        let dev = device(&env, &io, P_K95, "old95");

        assert_eq!(dev.setup().unwrap(), SetupOutcome::FirmwareUpdate);
        assert_eq!(dev.features(), Features::FW_UPDATE_PENDING);
        assert_eq!(dev.fw_version(), 100);
        assert!(io.state.lock().load_calls.is_empty());
    }

    #[test]
    fn test_setup_sync_fatal_on_load_failure() {
        let env = test_env();
        let io = MockIo::with_fw(130);
        io.state.lock().load_failures = 1;
        let dev = device(&env, &io, P_K70, "badload");

        assert!(matches!(dev.setup(), Err(SetupError::Sync(_))));
        // The session exists; the caller decides between recovery and
        // teardown.
        assert!(dev.is_attached());
        assert_eq!(env.nodes.created.lock().len(), 1);
        assert_eq!(*env.nodes.removed.lock(), 0);
    }

    #[test]
    fn test_devpath_failure_aborts() {
        let env = test_env();
        env.nodes
            .fail_create
            .store(true, std::sync::atomic::Ordering::Relaxed);
        let io = MockIo::with_fw(130);
        let dev = device(&env, &io, P_K70, "nopath");

        assert!(matches!(dev.setup(), Err(SetupError::DevPath(_))));
        assert!(!env.input.is_open("nopath"));
        assert!(!dev.is_attached());
    }

    #[test]
    fn test_input_failure_unwinds_devpath() {
        struct DenyInput;
        impl InputOps for DenyInput {
            fn open(&self, _info: &NodeInfo) -> Result<(), InputError> {
                Err(InputError::Rejected("no uinput access".into()))
            }
            fn close(&self, _info: &NodeInfo) {}
        }

        let (tx, _rx) = events::channel();
        let nodes = Arc::new(MemNodes::default());
        let env = Arc::new(DeviceEnv {
            nodes: Box::new(Arc::clone(&nodes)),
            input: Box::new(DenyInput),
            store: Arc::new(ProfileStore::new()),
            events: tx,
            feature_mask: Features::all(),
            timings: Timings::ZERO,
        });
        let io = MockIo::with_fw(130);
        let dev = UsbDevice::new(env, Box::new(io), KB_VENDOR, P_K70, 0, "noinput", None);

        assert!(matches!(dev.setup(), Err(SetupError::Input(_))));
        assert_eq!(nodes.created.lock().len(), 1);
        assert_eq!(*nodes.removed.lock(), 1);
        assert!(!dev.is_attached());
    }

    #[test]
    fn test_enqueue_all_or_nothing() {
        let env = test_env();
        let io = MockIo::with_fw(130);
        let dev = device(&env, &io, P_K70, "queued");
        dev.setup().unwrap();

        let almost_full: Vec<Packet> = (0..QUEUE_LEN - 1)
            .map(|i| Packet::with_opcode(i as u8))
            .collect();
        dev.enqueue(&almost_full).unwrap();
        assert_eq!(dev.queue_len(), QUEUE_LEN - 1);

        // Two more would overflow; neither may land.
        let pair = [Packet::with_opcode(0xFE), Packet::with_opcode(0xFF)];
        assert!(matches!(dev.enqueue(&pair), Err(QueueError::Full(_))));
        assert_eq!(dev.queue_len(), QUEUE_LEN - 1);

        dev.enqueue(&[Packet::with_opcode(0xFE)]).unwrap();
        assert_eq!(dev.queue_len(), QUEUE_LEN);
    }

    #[test]
    fn test_enqueue_after_close_rejected() {
        let env = test_env();
        let io = MockIo::with_fw(130);
        let dev = device(&env, &io, P_K70, "gone");
        dev.setup().unwrap();
        dev.close();
        assert!(matches!(
            dev.enqueue(&[Packet::new()]),
            Err(QueueError::NoDevice)
        ));
    }

    #[test]
    fn test_fifo_round_trip() {
        let env = test_env();
        let io = MockIo::with_fw(130);
        let dev = device(&env, &io, P_K70, "fifo");
        dev.setup().unwrap();

        let packets: Vec<Packet> = (1..=5).map(Packet::with_opcode).collect();
        dev.enqueue(&packets).unwrap();

        for _ in 0..5 {
            assert!(dev.dequeue_send().unwrap());
        }
        assert!(!dev.dequeue_send().unwrap());

        let written: Vec<u8> = io.state.lock().written.iter().map(Packet::opcode).collect();
        assert_eq!(written, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_revert_drains_and_deactivates() {
        let env = test_env();
        let io = MockIo::with_fw(130);
        let dev = device(&env, &io, P_K70, "revert");
        dev.setup().unwrap();

        dev.enqueue(&[Packet::with_opcode(1), Packet::with_opcode(2)])
            .unwrap();
        dev.revert().unwrap();

        assert_eq!(dev.queue_len(), 0);
        let state = io.state.lock();
        assert_eq!(state.written.len(), 2);
        assert_eq!(state.active_calls, vec![false]);
    }

    #[test]
    fn test_revert_noop_when_update_pending() {
        let env = test_env();
        let io = MockIo::with_fw(130);
        io.state.lock().fw_failures = 1;
        let dev = device(&env, &io, P_K70, "pending");
        dev.setup().unwrap();

        dev.enqueue(&[Packet::with_opcode(9)]).unwrap();
        dev.revert().unwrap();

        // Nothing was drained or deactivated.
        assert_eq!(dev.queue_len(), 1);
        let state = io.state.lock();
        assert!(state.written.is_empty());
        assert!(state.active_calls.is_empty());
    }

    #[test]
    fn test_revert_non_rgb_reenables_hardware_mode() {
        let env = test_env();
        let io = MockIo::default();
        let dev = device(&env, &io, P_K95_NRGB, "legacy");
        dev.setup().unwrap();
        dev.revert().unwrap();
        assert_eq!(io.state.lock().hw_mode_calls, vec![false, true]);
    }

    #[test]
    fn test_revert_propagates_write_failure() {
        let env = test_env();
        let io = MockIo::with_fw(130);
        let dev = device(&env, &io, P_K70, "wedged");
        dev.setup().unwrap();

        dev.enqueue(&[Packet::with_opcode(1)]).unwrap();
        io.state.lock().write_failures = 1;
        assert!(matches!(dev.revert(), Err(RevertError::Transport(_))));
    }

    #[test]
    fn test_reset_discards_stale_queue() {
        let env = test_env();
        let io = MockIo::with_fw(130);
        let dev = device(&env, &io, P_K70, "stale");
        dev.setup().unwrap();

        dev.enqueue(&(0..4).map(Packet::with_opcode).collect::<Vec<_>>())
            .unwrap();
        assert_eq!(dev.queue_len(), 4);

        dev.reset().unwrap();
        assert_eq!(dev.queue_len(), 0);
        let state = io.state.lock();
        assert_eq!(state.resets, 1);
        assert_eq!(state.rgb_syncs, 1);
    }

    #[test]
    fn test_reset_transport_failure_is_retryable_class() {
        let env = test_env();
        let io = MockIo::with_fw(130);
        let dev = device(&env, &io, P_K70, "flaky");
        dev.setup().unwrap();

        dev.enqueue(&[Packet::with_opcode(1)]).unwrap();
        io.state.lock().reset_failures = 1;

        assert!(matches!(dev.reset(), Err(ResetError::Transport(_))));
        // The queue is only discarded once the transport reset succeeds.
        assert_eq!(dev.queue_len(), 1);
    }

    #[test]
    fn test_reset_fw_failure_is_reinit_class() {
        let env = test_env();
        let io = MockIo::with_fw(130);
        let dev = device(&env, &io, P_K70, "refw");
        dev.setup().unwrap();

        io.state.lock().fw_failures = 1;
        assert!(matches!(dev.reset(), Err(ResetError::Reinit(_))));
    }

    #[test]
    fn test_reset_recovers_missed_profile_load() {
        let env = test_env();
        let io = MockIo::with_fw(130);
        io.state.lock().fw_failures = 1;
        let dev = device(&env, &io, P_K70, "missed");

        // Setup hit the firmware glitch, so the hardware profile was never
        // loaded.
        assert_eq!(dev.setup().unwrap(), SetupOutcome::FirmwareUpdate);
        assert!(io.state.lock().load_calls.is_empty());

        // The next reset sees a healthy firmware query and catches up.
        dev.reset().unwrap();
        assert_eq!(dev.fw_version(), 130);
        let state = io.state.lock();
        assert_eq!(state.load_calls, vec![LoadProfile::Pull]);
        assert_eq!(state.rgb_syncs, 1);
        // Software mode is restored to what it was before the reset.
        assert_eq!(state.active_calls, vec![true]);
    }

    #[test]
    fn test_try_reset_retries_transport_failures() {
        let env = test_env();
        let io = MockIo::with_fw(130);
        let dev = device(&env, &io, P_K70, "retry");
        dev.setup().unwrap();

        io.state.lock().reset_failures = 5;
        dev.try_reset().unwrap();
        assert_eq!(io.state.lock().resets, 6);
    }

    #[test]
    fn test_try_reset_breaks_on_reinit() {
        let env = test_env();
        let io = MockIo::with_fw(130);
        let dev = device(&env, &io, P_K70, "fatal");
        dev.setup().unwrap();

        io.state.lock().fw_failures = 10;
        assert!(matches!(dev.try_reset(), Err(ResetError::Reinit(_))));
        // The loop must not burn retries on the non-retriable class.
        assert_eq!(io.state.lock().resets, 1);
    }

    #[test]
    fn test_close_persists_validated_profile() {
        let env = test_env();
        let io = MockIo::with_fw(130);
        let dev = device(&env, &io, P_K70, "keeper");
        dev.setup().unwrap();
        assert!(env.input.is_open("keeper"));

        assert!(dev.close());
        assert!(env.store.find("keeper").is_some());
        assert!(!env.input.is_open("keeper"));
        assert!(io.state.lock().closed);
        assert_eq!(*env.nodes.removed.lock(), 1);
        assert!(!dev.is_attached());
    }

    #[test]
    fn test_close_discards_unvalidated_profile() {
        let env = test_env();
        let io = MockIo::with_fw(130);
        io.state.lock().fw_failures = 1;
        let dev = device(&env, &io, P_K70, "unvalidated");
        dev.setup().unwrap();
        assert_eq!(dev.fw_version(), 0);

        dev.close();
        assert!(env.store.is_empty());
    }

    #[test]
    fn test_close_is_idempotent() {
        let env = test_env();
        let io = MockIo::with_fw(130);
        let dev = device(&env, &io, P_K70, "twice");
        dev.setup().unwrap();

        assert!(dev.close());
        assert!(!dev.close());
        assert_eq!(*env.nodes.removed.lock(), 1);
        assert_eq!(env.store.len(), 1);
    }

    #[test]
    fn test_reset_after_close_is_terminal() {
        let env = test_env();
        let io = MockIo::with_fw(130);
        let dev = device(&env, &io, P_K70, "detached");
        dev.setup().unwrap();
        dev.close();
        assert!(matches!(dev.reset(), Err(ResetError::Reinit(_))));
    }

    #[test]
    fn test_input_lock_gates_on_attachment() {
        let env = test_env();
        let io = MockIo::with_fw(130);
        let dev = device(&env, &io, P_K70, "inputlock");
        dev.setup().unwrap();

        assert_eq!(dev.with_input_lock(|| 42), Some(42));
        dev.close();
        assert_eq!(dev.with_input_lock(|| 42), None);
    }

    #[test]
    fn test_feature_mask_is_applied() {
        let (tx, _rx) = events::channel();
        let env = Arc::new(DeviceEnv {
            nodes: Box::new(Arc::new(MemNodes::default())),
            input: Box::new(InputRegistry::new()),
            store: Arc::new(ProfileStore::new()),
            events: tx,
            feature_mask: Features::all() & !Features::NOTIFY,
            timings: Timings::ZERO,
        });
        let io = MockIo::with_fw(130);
        let dev = UsbDevice::new(env, Box::new(io), KB_VENDOR, P_K70, 0, "masked", None);
        dev.setup().unwrap();
        assert!(!dev.features().contains(Features::NOTIFY));
        assert!(dev.features().contains(Features::RGB));
    }
}
