pub mod graph;

pub use graph::DeviceGraph;

use crate::formats;

/// Handle into the [`DeviceGraph`]. The core never owns devices directly;
/// it passes these around and lets the graph resolve them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub(crate) u32);

#[derive(Debug, Clone, PartialEq)]
pub struct MdArrayInfo {
    pub level: String,
    pub num_devices: u32,
    pub uuid: String,
}

impl MdArrayInfo {
    pub fn conf_entry(&self, path: &str) -> String {
        format!(
            "ARRAY {path} level={} num-devices={} UUID={}\n",
            self.level, self.num_devices, self.uuid
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceKind {
    Disk,
    Partition,
    /// Device-mapper node, e.g. an opened LUKS mapping.
    DmCrypt,
    Md(MdArrayInfo),
    /// File-backed device (swap files).
    File,
    /// Directory-backed device (bind mounts).
    Directory,
    Nfs,
    /// Placeholder for filesystems that need no backing device.
    NoDevice,
    Optical,
}

/// What we know about the formatted content of a device.
///
/// Capability answers (mountable, check, dump, ...) come from the static
/// format registry keyed on `kind`; a `kind` of `None` means the type
/// could not be determined.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Format {
    pub kind: Option<String>,
    pub mountpoint: Option<String>,
    pub options: String,
    pub uuid: Option<String>,
    pub label: Option<String>,
    pub exists: bool,

    // encrypted-volume bookkeeping
    pub map_name: Option<String>,
    pub key_file: Option<String>,
    pub escrow_cert: Option<String>,
}

impl Format {
    /// Build a format for a declared fstype. Unknown types yield an
    /// indeterminate (`kind: None`) format rather than an error.
    pub fn new(fstype: &str) -> Self {
        Format {
            kind: formats::spec(fstype).map(|s| s.kind.to_string()),
            ..Format::default()
        }
    }

    pub fn is(&self, kind: &str) -> bool {
        self.kind.as_deref() == Some(kind)
    }

    pub fn mount_type(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    pub fn mountable(&self) -> bool {
        self.kind
            .as_deref()
            .and_then(formats::spec)
            .map(|s| s.mountable)
            .unwrap_or(false)
    }

    pub fn check(&self) -> bool {
        self.kind
            .as_deref()
            .and_then(formats::spec)
            .map(|s| s.check)
            .unwrap_or(false)
    }

    pub fn dump(&self) -> bool {
        self.kind
            .as_deref()
            .and_then(formats::spec)
            .map(|s| s.dump)
            .unwrap_or(false)
    }

    pub fn linux_native(&self) -> bool {
        self.kind
            .as_deref()
            .and_then(formats::spec)
            .map(|s| s.linux_native)
            .unwrap_or(false)
    }

    pub fn can_trial_mount(&self) -> bool {
        self.kind
            .as_deref()
            .map(formats::can_trial_mount)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct Device {
    pub name: String,
    pub path: String,
    pub kind: DeviceKind,
    pub parents: Vec<DeviceId>,
    pub format: Format,
    pub exists: bool,
    pub controllable: bool,
    pub size: u64,
}

impl Device {
    pub fn new(name: &str, path: &str, kind: DeviceKind, format: Format) -> Self {
        Device {
            name: name.to_string(),
            path: path.to_string(),
            kind,
            parents: Vec::new(),
            format,
            exists: true,
            controllable: true,
            size: 0,
        }
    }

    /// The device spec written to fstab: stable UUID reference when we
    /// have one, raw path otherwise.
    pub fn fstab_spec(&self) -> String {
        match &self.format.uuid {
            Some(uuid) => format!("UUID={uuid}"),
            None => self.path.clone(),
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self.kind, DeviceKind::Nfs)
    }
}
