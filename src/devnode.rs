//! Per-device control paths.
//!
//! Each attached unit gets a directory under the devnode root holding a
//! `cmd` FIFO for client commands and plain metadata files clients poll:
//! `model`, `serial`, `name`, `features`, `pollrate`, `fwversion`. The
//! directory disappears with the session.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::usb::{features, Features};

/// Identity handed to the node and input boundaries at creation time.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// Slot index in the daemon's device table.
    pub index: usize,
    pub serial: String,
    pub name: String,
    /// Numeric model class (65/70/95).
    pub model: u8,
    pub features: Features,
}

/// A live control path. Metadata writers are best-effort: a failed write
/// leaves the old contents in place and is only logged.
pub struct DevNode {
    path: Option<PathBuf>,
}

impl DevNode {
    /// A node with no backing path; used by in-memory `NodeOps`
    /// implementations.
    pub fn detached() -> Self {
        Self { path: None }
    }

    fn rooted(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn update_fwversion(&self, version: u16) {
        self.write_meta("fwversion", &features::format_fw_version(version));
    }

    pub fn update_pollrate(&self, rate: i32) {
        let contents = if rate < 0 {
            "n/a".to_string()
        } else {
            format!("{} ms", rate)
        };
        self.write_meta("pollrate", &contents);
    }

    pub fn update_features(&self, features: Features) {
        self.write_meta("features", &features.name_list());
    }

    fn write_meta(&self, name: &str, contents: &str) {
        let Some(path) = &self.path else { return };
        let file = path.join(name);
        if let Err(err) = fs::write(&file, format!("{}\n", contents)) {
            warn!("failed to update {:?}: {}", file, err);
        }
    }
}

/// Control-path creation and removal. Removal is idempotent: removing a
/// node whose path is already gone succeeds silently.
pub trait NodeOps: Send + Sync {
    fn create(&self, info: &NodeInfo) -> io::Result<DevNode>;
    fn remove(&self, node: DevNode);
}

impl<T: NodeOps + ?Sized> NodeOps for std::sync::Arc<T> {
    fn create(&self, info: &NodeInfo) -> io::Result<DevNode> {
        (**self).create(info)
    }

    fn remove(&self, node: DevNode) {
        (**self).remove(node)
    }
}

/// Filesystem-backed control paths under a fixed root directory.
pub struct DevFs {
    root: PathBuf,
}

impl DevFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl NodeOps for DevFs {
    fn create(&self, info: &NodeInfo) -> io::Result<DevNode> {
        let dir = self.root.join(format!("chromakd{}", info.index));
        fs::create_dir_all(&dir)?;

        fs::write(dir.join("model"), format!("{}\n", info.model))?;
        fs::write(dir.join("serial"), format!("{}\n", info.serial))?;
        fs::write(dir.join("name"), format!("{}\n", info.name))?;
        fs::write(
            dir.join("features"),
            format!("{}\n", info.features.name_list()),
        )?;

        make_cmd_fifo(&dir)?;

        debug!("created control path {:?}", dir);
        Ok(DevNode::rooted(dir))
    }

    fn remove(&self, node: DevNode) {
        let Some(path) = node.path() else { return };
        match fs::remove_dir_all(path) {
            Ok(()) => debug!("removed control path {:?}", path),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!("failed to remove control path {:?}: {}", path, err),
        }
    }
}

#[cfg(unix)]
fn make_cmd_fifo(dir: &Path) -> io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let path = dir.join("cmd");
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
    if unsafe { libc::mkfifo(cpath.as_ptr(), 0o600) } != 0 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::AlreadyExists {
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn make_cmd_fifo(_dir: &Path) -> io::Result<()> {
    Ok(())
}

/// In-memory node bookkeeping for driving sessions without a filesystem.
#[cfg(any(test, feature = "mock-hid"))]
pub struct MemNodes {
    pub created: parking_lot::Mutex<Vec<String>>,
    pub removed: parking_lot::Mutex<usize>,
    pub fail_create: std::sync::atomic::AtomicBool,
}

#[cfg(any(test, feature = "mock-hid"))]
impl Default for MemNodes {
    fn default() -> Self {
        Self {
            created: parking_lot::Mutex::new(Vec::new()),
            removed: parking_lot::Mutex::new(0),
            fail_create: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

#[cfg(any(test, feature = "mock-hid"))]
impl NodeOps for MemNodes {
    fn create(&self, info: &NodeInfo) -> io::Result<DevNode> {
        if self.fail_create.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "node creation disabled",
            ));
        }
        self.created.lock().push(info.serial.clone());
        Ok(DevNode::detached())
    }

    fn remove(&self, _node: DevNode) {
        *self.removed.lock() += 1;
    }
}
