//! Reconciliation between storage configuration tables and a scanned
//! device graph.
//!
//! The crate parses fstab, crypttab and blkid.tab, resolves their
//! entries against a [`DeviceGraph`], plans mount and unmount order,
//! regenerates the tables from the graph, and discovers existing
//! installations on scanned devices. All side effects go through the
//! [`DeviceOps`] trait so the core stays testable.

pub mod device;
pub mod errors;
pub mod find;
pub mod formats;
pub mod ops;
pub mod owner;
pub mod plan;
pub mod resolve;
pub mod shell;
pub mod tabs;

use std::path::PathBuf;

pub use device::{Device, DeviceGraph, DeviceId, DeviceKind, Format, MdArrayInfo};
pub use errors::StorageError;
pub use find::{find_existing_installations, mount_existing_system, Root};
pub use ops::{DeviceOps, ErrorDecision};
pub use owner::{PathOwner, SysPathOwner};
pub use plan::{write_escrow_packets, MountPlan};
pub use resolve::{GraphSpecLookup, Resolution, ResolvedDevice, SpecLookup};
pub use tabs::{KeyMapTable, KeyMapping, TagTable};

/// Where discovered installations get mounted by default.
pub const DEFAULT_SYSROOT: &str = "/mnt/sysimage";

/// Ambient facts about the run that used to live in process-wide flags.
#[derive(Debug, Clone)]
pub struct Session {
    /// Whether destructive phases (mounting targets, activating swap,
    /// writing configuration) are allowed to run.
    pub installer_mode: bool,
    /// The running system booted via EFI.
    pub efi: bool,
    /// Root of the target system tree.
    pub sysroot: PathBuf,
    /// Mountpoint of the device physically holding the target root
    /// filesystem; differs from "/" for btrfs-subvolume style layouts.
    pub physical_root: PathBuf,
}

impl Session {
    pub fn new(installer_mode: bool, efi: bool) -> Self {
        Session {
            installer_mode,
            efi,
            sysroot: PathBuf::from(DEFAULT_SYSROOT),
            physical_root: PathBuf::from(DEFAULT_SYSROOT),
        }
    }

    pub fn with_sysroot(mut self, sysroot: impl Into<PathBuf>) -> Self {
        self.sysroot = sysroot.into();
        self
    }

    pub fn with_physical_root(mut self, physical_root: impl Into<PathBuf>) -> Self {
        self.physical_root = physical_root.into();
        self
    }
}
