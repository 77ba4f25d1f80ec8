//! Device identity: model classes, capability flags, firmware gating.
//!
//! Everything here is a pure function of the vendor/product pair and the
//! configured exclusion mask, so the same device always resolves the same
//! way no matter how often it reattaches.

use bitflags::bitflags;

/// Vendor id shared by every supported board.
pub const KB_VENDOR: u16 = 0x1b1c;

// Product ids. The `_NRGB` variants speak a reduced legacy protocol and
// carry no per-key lighting.
pub const P_K65: u16 = 0x1b17;
pub const P_K70: u16 = 0x1b13;
pub const P_K70_NRGB: u16 = 0x1b09;
pub const P_K95: u16 = 0x1b11;
pub const P_K95_NRGB: u16 = 0x1b08;

bitflags! {
    /// Capabilities a session may expose to clients.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Features: u32 {
        const RGB       = 1 << 0;
        const POLLRATE  = 1 << 1;
        const ADJRATE   = 1 << 2;
        const BIND      = 1 << 3;
        const NOTIFY    = 1 << 4;
        const FWVERSION = 1 << 5;
        const FWUPDATE  = 1 << 6;
    }
}

impl Default for Features {
    fn default() -> Self {
        Features::empty()
    }
}

impl Features {
    /// Full set for RGB boards.
    pub const STD_RGB: Features = Features::RGB
        .union(Features::POLLRATE)
        .union(Features::ADJRATE)
        .union(Features::BIND)
        .union(Features::NOTIFY)
        .union(Features::FWVERSION)
        .union(Features::FWUPDATE);

    /// Minimal set for boards without RGB control.
    pub const STD_NRGB: Features = Features::BIND.union(Features::NOTIFY);

    /// What remains usable while a firmware update is pending.
    pub const FW_UPDATE_PENDING: Features = Features::RGB
        .union(Features::FWVERSION)
        .union(Features::FWUPDATE);

    /// Parse a single feature name as used in config files and devnode
    /// metadata.
    pub fn parse_name(name: &str) -> Option<Features> {
        match name.to_ascii_lowercase().as_str() {
            "rgb" => Some(Features::RGB),
            "pollrate" => Some(Features::POLLRATE),
            "adjrate" => Some(Features::ADJRATE),
            "bind" => Some(Features::BIND),
            "notify" => Some(Features::NOTIFY),
            "fwversion" => Some(Features::FWVERSION),
            "fwupdate" => Some(Features::FWUPDATE),
            _ => None,
        }
    }

    /// Space-separated lowercase names, for the devnode `features` file.
    pub fn name_list(&self) -> String {
        self.iter_names()
            .map(|(name, _)| name.to_ascii_lowercase())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Model class of a board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Model {
    K65,
    K70,
    K95,
}

impl Model {
    /// Numeric class, as exposed in the devnode `model` file.
    pub fn class(self) -> u8 {
        match self {
            Model::K65 => 65,
            Model::K70 => 70,
            Model::K95 => 95,
        }
    }
}

/// Whether this vendor/product pair is one we drive at all.
pub fn supported(vendor: u16, product: u16) -> bool {
    vendor == KB_VENDOR
        && matches!(product, P_K65 | P_K70 | P_K70_NRGB | P_K95 | P_K95_NRGB)
}

fn is_rgb(product: u16) -> bool {
    matches!(product, P_K65 | P_K70 | P_K95)
}

/// Resolve model class and capability set for a vendor/product pair.
///
/// The capability set is the standard set for the board class intersected
/// with the configured exclusion mask. Unknown products fall back to the
/// 95 class, the largest layout.
pub fn resolve(_vendor: u16, product: u16, mask: Features) -> (Model, Features) {
    let model = match product {
        P_K65 => Model::K65,
        P_K70 | P_K70_NRGB => Model::K70,
        _ => Model::K95,
    };
    let features = if is_rgb(product) {
        Features::STD_RGB
    } else {
        Features::STD_NRGB
    };
    (model, features & mask)
}

/// Default display name when enumeration didn't supply one.
pub fn default_name(model: Model, features: Features) -> String {
    if features.contains(Features::RGB) {
        format!("K{} RGB Keyboard", model.class())
    } else {
        format!("K{} Keyboard", model.class())
    }
}

/// Oldest firmware each model class is reliable with. Anything older (or
/// an unknown version, reported as 0) must be updated before RGB control
/// traffic flows.
pub fn fw_update_required(model: Model, version: u16) -> bool {
    let min = match model {
        Model::K65 => 120,
        Model::K70 => 120,
        Model::K95 => 125,
    };
    version < min
}

/// Render a firmware version the way the boards report it (hundredths).
pub fn format_fw_version(version: u16) -> String {
    format!("{}.{:02}", version / 100, version % 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_rgb() {
        let (model, features) = resolve(KB_VENDOR, P_K70, Features::all());
        assert_eq!(model, Model::K70);
        assert_eq!(features, Features::STD_RGB);
    }

    #[test]
    fn test_resolve_non_rgb() {
        let (model, features) = resolve(KB_VENDOR, P_K95_NRGB, Features::all());
        assert_eq!(model, Model::K95);
        assert_eq!(features, Features::STD_NRGB);
        assert!(!features.contains(Features::RGB));
    }

    #[test]
    fn test_resolve_applies_mask() {
        let mask = Features::all() & !Features::NOTIFY;
        let (_, features) = resolve(KB_VENDOR, P_K65, mask);
        assert!(!features.contains(Features::NOTIFY));
        assert!(features.contains(Features::RGB));
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let a = resolve(KB_VENDOR, P_K95, Features::all());
        let b = resolve(KB_VENDOR, P_K95, Features::all());
        assert_eq!(a, b);
    }

    #[test]
    fn test_default_names() {
        assert_eq!(
            default_name(Model::K95, Features::STD_RGB),
            "K95 RGB Keyboard"
        );
        assert_eq!(default_name(Model::K70, Features::STD_NRGB), "K70 Keyboard");
    }

    #[test]
    fn test_feature_names_roundtrip() {
        for (name, flag) in Features::all().iter_names() {
            assert_eq!(
                Features::parse_name(&name.to_ascii_lowercase()),
                Some(flag)
            );
        }
        assert_eq!(Features::parse_name("turbo"), None);
    }

    #[test]
    fn test_fw_gating() {
        assert!(fw_update_required(Model::K95, 0));
        assert!(fw_update_required(Model::K95, 124));
        assert!(!fw_update_required(Model::K95, 125));
        assert!(!fw_update_required(Model::K65, 120));
        assert!(fw_update_required(Model::K65, 119));
    }

    #[test]
    fn test_fw_version_format() {
        assert_eq!(format_fw_version(125), "1.25");
        assert_eq!(format_fw_version(0), "0.00");
    }

    #[test]
    fn test_supported_table() {
        assert!(supported(KB_VENDOR, P_K65));
        assert!(supported(KB_VENDOR, P_K95_NRGB));
        assert!(!supported(KB_VENDOR, 0x0001));
        assert!(!supported(0x046d, P_K65));
    }
}
