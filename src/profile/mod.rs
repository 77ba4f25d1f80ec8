//! In-memory device configuration: mode slots, keymap binding, serial
//! identity.
//!
//! Lighting payloads themselves are rendered by the LED writers; the
//! session layer only cares about which slots exist and which one is
//! current.

pub mod store;

use serde::{Deserialize, Serialize};

/// Key layout bound to a profile or mode. The system map is the
/// daemon-wide default; custom maps are assigned by upper layers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Keymap {
    #[default]
    System,
    Custom(String),
}

/// A single hardware mode slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mode {
    pub name: String,
    pub keymap: Keymap,
}

impl Mode {
    fn numbered(index: usize, keymap: Keymap) -> Self {
        Self {
            name: format!("Mode {}", index + 1),
            keymap,
        }
    }
}

/// A device's current configuration, keyed by its serial number in the
/// profile store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub serial: String,
    pub name: String,
    pub keymap: Keymap,
    pub modes: Vec<Mode>,
    /// Index of the active mode slot.
    pub current: usize,
}

impl Profile {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            ..Self::default()
        }
    }

    /// Fetch the mode slot at `index`, synthesizing empty slots up to and
    /// including it. Returns `index` for assignment to `current`.
    pub fn ensure_mode(&mut self, index: usize) -> usize {
        while self.modes.len() <= index {
            let mode = Mode::numbered(self.modes.len(), self.keymap.clone());
            self.modes.push(mode);
        }
        index
    }

    /// Make sure at least `count` mode slots exist.
    pub fn ensure_min_modes(&mut self, count: usize) {
        if count > 0 {
            self.ensure_mode(count - 1);
        }
    }

    pub fn current_mode(&self) -> Option<&Mode> {
        self.modes.get(self.current)
    }
}
