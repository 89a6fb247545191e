//! Hardware categories, their descriptor table and the hardware item record.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, Result};
use crate::types::Params;

/// Literal value asking the host to assign an identifier.
pub const GENERATE: &str = "generate";

/// Device categories in their fixed display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareCategory {
    Disk,
    Filesystem,
    Interface,
    InputDev,
    Graphics,
    Sound,
    Serial,
    Parallel,
    Video,
}

impl HardwareCategory {
    /// All categories, in display order.
    pub const ALL: [HardwareCategory; 9] = [
        HardwareCategory::Disk,
        HardwareCategory::Filesystem,
        HardwareCategory::Interface,
        HardwareCategory::InputDev,
        HardwareCategory::Graphics,
        HardwareCategory::Sound,
        HardwareCategory::Serial,
        HardwareCategory::Parallel,
        HardwareCategory::Video,
    ];

    /// Position of the category in the display order.
    pub fn rank(&self) -> usize {
        *self as usize
    }

    /// Descriptor of this category.
    pub fn descriptor(&self) -> &'static CategoryDescriptor {
        &DESCRIPTORS[self.rank()]
    }

    /// Short lowercase name.
    pub fn name(&self) -> &'static str {
        self.descriptor().name
    }
}

impl fmt::Display for HardwareCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// DESCRIPTOR TABLE
// =============================================================================

/// Category-specific behaviour, looked up by category tag.
pub struct CategoryDescriptor {
    /// Category this descriptor belongs to
    pub category: HardwareCategory,
    /// Short lowercase name
    pub name: &'static str,
    /// Parameter carrying the item's identity
    pub key_param: &'static str,
    /// Parameter that may hold `generate` to have the host assign the identity
    pub generate_param: Option<&'static str>,
    /// Default parameters of a new placeholder
    pub defaults: fn() -> Params,
    /// Checks that the parameters describe a usable device
    pub validate: fn(&Params) -> Result<()>,
    /// Display string used for interactive lookups
    pub display: fn(&str, &Params) -> String,
}

impl fmt::Debug for CategoryDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CategoryDescriptor")
            .field("category", &self.category)
            .field("key_param", &self.key_param)
            .field("generate_param", &self.generate_param)
            .finish()
    }
}

static DESCRIPTORS: [CategoryDescriptor; 9] = [
    CategoryDescriptor {
        category: HardwareCategory::Disk,
        name: "disk",
        key_param: "target_dev",
        generate_param: Some("target_dev"),
        defaults: disk_defaults,
        validate: validate_disk,
        display: display_disk,
    },
    CategoryDescriptor {
        category: HardwareCategory::Filesystem,
        name: "filesystem",
        key_param: "target_dir",
        generate_param: None,
        defaults: filesystem_defaults,
        validate: validate_filesystem,
        display: display_filesystem,
    },
    CategoryDescriptor {
        category: HardwareCategory::Interface,
        name: "interface",
        key_param: "mac",
        generate_param: Some("mac"),
        defaults: interface_defaults,
        validate: validate_interface,
        display: display_interface,
    },
    CategoryDescriptor {
        category: HardwareCategory::InputDev,
        name: "input",
        key_param: "index",
        generate_param: Some("index"),
        defaults: input_defaults,
        validate: validate_typed,
        display: display_input,
    },
    CategoryDescriptor {
        category: HardwareCategory::Graphics,
        name: "graphics",
        key_param: "index",
        generate_param: Some("index"),
        defaults: graphics_defaults,
        validate: validate_graphics,
        display: display_graphics,
    },
    CategoryDescriptor {
        category: HardwareCategory::Sound,
        name: "sound",
        key_param: "index",
        generate_param: Some("index"),
        defaults: sound_defaults,
        validate: validate_model,
        display: display_model,
    },
    CategoryDescriptor {
        category: HardwareCategory::Serial,
        name: "serial",
        key_param: "index",
        generate_param: Some("index"),
        defaults: serial_defaults,
        validate: validate_typed,
        display: display_char_device,
    },
    CategoryDescriptor {
        category: HardwareCategory::Parallel,
        name: "parallel",
        key_param: "index",
        generate_param: Some("index"),
        defaults: parallel_defaults,
        validate: validate_typed,
        display: display_char_device,
    },
    CategoryDescriptor {
        category: HardwareCategory::Video,
        name: "video",
        key_param: "index",
        generate_param: Some("index"),
        defaults: video_defaults,
        validate: validate_video,
        display: display_video,
    },
];

fn params(pairs: &[(&str, &str)]) -> Params {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn value<'a>(p: &'a Params, name: &str) -> &'a str {
    p.get(name).map(String::as_str).unwrap_or("")
}

fn require(p: &Params, name: &str, category: &str) -> Result<()> {
    if value(p, name).trim().is_empty() {
        return Err(DomainError::InvalidParameter(format!(
            "{} requires '{}'",
            category, name
        )));
    }
    Ok(())
}

fn disk_defaults() -> Params {
    params(&[
        ("type", "file"),
        ("device", "disk"),
        ("target_bus", "virtio"),
        ("driver_type", "qcow2"),
        ("target_dev", GENERATE),
    ])
}

fn validate_disk(p: &Params) -> Result<()> {
    require(p, "target_dev", "disk")?;
    // An empty CD-ROM drive has no source.
    if value(p, "device") != "cdrom" {
        require(p, "source", "disk")?;
    }
    Ok(())
}

fn display_disk(key: &str, p: &Params) -> String {
    match p.get("source") {
        Some(source) if !source.is_empty() => format!("disk {} {}", key, source),
        _ => format!("disk {}", key),
    }
}

fn filesystem_defaults() -> Params {
    params(&[("type", "mount"), ("access_mode", "passthrough")])
}

fn validate_filesystem(p: &Params) -> Result<()> {
    require(p, "source_dir", "filesystem")?;
    require(p, "target_dir", "filesystem")
}

fn display_filesystem(key: &str, p: &Params) -> String {
    format!("filesystem {} {}", key, value(p, "source_dir"))
}

fn interface_defaults() -> Params {
    params(&[
        ("type", "network"),
        ("source", "default"),
        ("model", "virtio"),
        ("mac", GENERATE),
    ])
}

fn validate_interface(p: &Params) -> Result<()> {
    require(p, "type", "interface")?;
    let mac = value(p, "mac");
    if mac.is_empty() || mac == GENERATE {
        return Ok(());
    }
    let octets: Vec<&str> = mac.split(':').collect();
    let well_formed = octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
    if !well_formed {
        return Err(DomainError::InvalidParameter(format!(
            "interface mac '{}' is not a MAC address",
            mac
        )));
    }
    Ok(())
}

fn display_interface(key: &str, p: &Params) -> String {
    format!("interface {} {}", key, value(p, "source"))
}

fn input_defaults() -> Params {
    params(&[("type", "tablet"), ("bus", "usb")])
}

fn display_input(key: &str, p: &Params) -> String {
    format!("input {} {} {}", key, value(p, "type"), value(p, "bus"))
}

fn validate_typed(p: &Params) -> Result<()> {
    require(p, "type", "device")
}

fn graphics_defaults() -> Params {
    params(&[("type", "vnc"), ("port", "-1"), ("listen", "127.0.0.1")])
}

fn validate_graphics(p: &Params) -> Result<()> {
    match value(p, "type") {
        "vnc" | "spice" => Ok(()),
        other => Err(DomainError::InvalidParameter(format!(
            "graphics type '{}' is not vnc or spice",
            other
        ))),
    }
}

fn display_graphics(key: &str, p: &Params) -> String {
    format!("graphics {} {} :{}", key, value(p, "type"), value(p, "port"))
}

fn sound_defaults() -> Params {
    params(&[("model", "ich6")])
}

fn validate_model(p: &Params) -> Result<()> {
    require(p, "model", "sound")
}

fn display_model(key: &str, p: &Params) -> String {
    format!("sound {} {}", key, value(p, "model"))
}

fn serial_defaults() -> Params {
    params(&[("type", "pty"), ("target_port", "0")])
}

fn parallel_defaults() -> Params {
    params(&[("type", "pty"), ("target_port", "0")])
}

fn display_char_device(key: &str, p: &Params) -> String {
    format!("port {} {} {}", key, value(p, "type"), value(p, "target_port"))
}

fn video_defaults() -> Params {
    params(&[("model_type", "virtio"), ("model_vram", "16384"), ("model_heads", "1")])
}

fn validate_video(p: &Params) -> Result<()> {
    require(p, "model_type", "video")?;
    let vram = value(p, "model_vram");
    if !vram.is_empty() && vram.parse::<u64>().is_err() {
        return Err(DomainError::InvalidParameter(format!(
            "video vram '{}' is not a number",
            vram
        )));
    }
    Ok(())
}

fn display_video(key: &str, p: &Params) -> String {
    format!("video {} {}", key, value(p, "model_type"))
}

// =============================================================================
// PARAMETER SETS
// =============================================================================

/// Live parameter values next to the values last applied or observed.
///
/// The two differ while the user has unapplied edits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamSet {
    live: Params,
    saved: Params,
}

impl ParamSet {
    /// Values already known to a host.
    pub fn saved(params: Params) -> Self {
        Self {
            saved: params.clone(),
            live: params,
        }
    }

    /// Values that exist only locally.
    pub fn unsaved(params: Params) -> Self {
        Self {
            live: params,
            saved: Params::new(),
        }
    }

    /// Live value of a parameter.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.live.get(name).map(String::as_str)
    }

    /// Last saved value of a parameter.
    pub fn get_saved(&self, name: &str) -> Option<&str> {
        self.saved.get(name).map(String::as_str)
    }

    /// All live values.
    pub fn live(&self) -> &Params {
        &self.live
    }

    /// Edit a live value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.live.insert(name.into(), value.into());
    }

    /// Merge values reported by a host.
    ///
    /// Only fields whose external value differs from the saved one are
    /// overwritten, so live edits of unchanged fields survive. Returns true
    /// if any field was updated.
    pub fn update_from_external(&mut self, external: &Params) -> bool {
        let mut updated = false;
        for (name, value) in external {
            if self.saved.get(name) != Some(value) {
                self.saved.insert(name.clone(), value.clone());
                self.live.insert(name.clone(), value.clone());
                updated = true;
            }
        }
        let vanished: Vec<String> = self
            .saved
            .keys()
            .filter(|name| !external.contains_key(*name))
            .cloned()
            .collect();
        for name in vanished {
            self.saved.remove(&name);
            self.live.remove(&name);
            updated = true;
        }
        updated
    }

    /// Live values that differ from the saved ones.
    pub fn diff(&self) -> Params {
        self.live
            .iter()
            .filter(|(name, value)| self.saved.get(*name) != Some(*value))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    /// True when some live value is not saved.
    pub fn is_dirty(&self) -> bool {
        self.live.iter().any(|(n, v)| self.saved.get(n) != Some(v))
    }

    /// Record the live values as saved.
    pub fn mark_saved(&mut self) {
        self.saved = self.live.clone();
    }

    /// Record `applied` as saved. Live edits made since it was captured
    /// stay dirty.
    pub fn mark_saved_as(&mut self, applied: &Params) {
        self.saved = applied.clone();
    }
}

// =============================================================================
// HARDWARE ITEM
// =============================================================================

/// One device record of a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareItem {
    /// Device category
    pub category: HardwareCategory,
    /// Category-specific identity (target device, MAC, index)
    pub key: String,
    values: ParamSet,
    /// Locally created and not yet applied
    pub is_new: bool,
    /// Waiting for a host-assigned key
    pub generate: bool,
}

impl HardwareItem {
    /// Item observed in an external snapshot.
    pub fn observed(category: HardwareCategory, key: impl Into<String>, params: Params) -> Self {
        Self {
            category,
            key: key.into(),
            values: ParamSet::saved(params),
            is_new: false,
            generate: false,
        }
    }

    /// Locally created placeholder. Nothing is saved yet.
    pub fn placeholder(
        category: HardwareCategory,
        key: impl Into<String>,
        params: Params,
        generate: bool,
    ) -> Self {
        Self {
            category,
            key: key.into(),
            values: ParamSet::unsaved(params),
            is_new: true,
            generate,
        }
    }

    /// Live value of a parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.values.get(name)
    }

    /// Last saved value of a parameter.
    pub fn saved_param(&self, name: &str) -> Option<&str> {
        self.values.get_saved(name)
    }

    /// All live values.
    pub fn params(&self) -> &Params {
        self.values.live()
    }

    /// Edit a live value.
    pub fn set_param(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.set(name, value);
    }

    /// Merge the values a host reports for this item.
    pub fn update_from_external(&mut self, external: &Params) -> bool {
        self.values.update_from_external(external)
    }

    /// Live values that differ from the saved ones.
    pub fn diff(&self) -> Params {
        self.values.diff()
    }

    /// The item needs to be written to a host.
    pub fn is_changed(&self) -> bool {
        self.is_new || self.values.is_dirty()
    }

    /// Record the live values as applied.
    pub fn mark_saved(&mut self) {
        self.values.mark_saved();
        self.is_new = false;
    }

    /// Record the values of `applied`, a copy of this item taken before it
    /// was written to the hosts.
    pub fn mark_applied(&mut self, applied: &HardwareItem) {
        self.values.mark_saved_as(applied.params());
        self.is_new = false;
    }

    /// Attach a host-assigned key to a generate placeholder.
    pub fn bind(&mut self, key: impl Into<String>) {
        self.key = key.into();
        if let Some(param) = self.category.descriptor().generate_param {
            self.values.set(param, self.key.clone());
        }
        self.generate = false;
        self.is_new = false;
    }

    /// Display string of the item.
    pub fn display(&self) -> String {
        (self.category.descriptor().display)(&self.key, self.params())
    }

    /// Validate the live values through the category descriptor.
    pub fn validate(&self) -> Result<()> {
        (self.category.descriptor().validate)(self.params())
    }
}
