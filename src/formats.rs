//! Static registry of filesystem/format kinds and their capabilities.
//!
//! A format string that is not listed here has an indeterminate type,
//! which is what the resolver keys its "unrecognized entry" checks on.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatClass {
    /// A real disk filesystem that can be mounted and trial-mounted.
    Filesystem,
    /// Kernel-backed filesystem with no backing device (proc, sysfs, ...).
    NoDev,
    /// A bind mount of an existing directory.
    Bind,
    Swap,
    /// Network-attached filesystem (NFS).
    Network,
    /// Container member formats (LUKS, LVM PV, MD member).
    Member,
}

#[derive(Debug, Clone, Copy)]
pub struct FormatSpec {
    pub kind: &'static str,
    pub class: FormatClass,
    pub mountable: bool,
    pub check: bool,
    pub dump: bool,
    pub linux_native: bool,
}

const SPECS: &[FormatSpec] = &[
    FormatSpec { kind: "ext2", class: FormatClass::Filesystem, mountable: true, check: true, dump: true, linux_native: true },
    FormatSpec { kind: "ext3", class: FormatClass::Filesystem, mountable: true, check: true, dump: true, linux_native: true },
    FormatSpec { kind: "ext4", class: FormatClass::Filesystem, mountable: true, check: true, dump: true, linux_native: true },
    FormatSpec { kind: "xfs", class: FormatClass::Filesystem, mountable: true, check: false, dump: false, linux_native: true },
    FormatSpec { kind: "btrfs", class: FormatClass::Filesystem, mountable: true, check: false, dump: false, linux_native: true },
    FormatSpec { kind: "f2fs", class: FormatClass::Filesystem, mountable: true, check: false, dump: false, linux_native: true },
    FormatSpec { kind: "reiserfs", class: FormatClass::Filesystem, mountable: true, check: false, dump: false, linux_native: true },
    FormatSpec { kind: "jfs", class: FormatClass::Filesystem, mountable: true, check: false, dump: false, linux_native: true },
    FormatSpec { kind: "vfat", class: FormatClass::Filesystem, mountable: true, check: true, dump: false, linux_native: false },
    FormatSpec { kind: "ntfs", class: FormatClass::Filesystem, mountable: true, check: false, dump: false, linux_native: false },
    FormatSpec { kind: "iso9660", class: FormatClass::Filesystem, mountable: true, check: false, dump: false, linux_native: false },
    FormatSpec { kind: "proc", class: FormatClass::NoDev, mountable: true, check: false, dump: false, linux_native: false },
    FormatSpec { kind: "sysfs", class: FormatClass::NoDev, mountable: true, check: false, dump: false, linux_native: false },
    FormatSpec { kind: "devpts", class: FormatClass::NoDev, mountable: true, check: false, dump: false, linux_native: false },
    FormatSpec { kind: "tmpfs", class: FormatClass::NoDev, mountable: true, check: false, dump: false, linux_native: false },
    FormatSpec { kind: "usbfs", class: FormatClass::NoDev, mountable: true, check: false, dump: false, linux_native: false },
    FormatSpec { kind: "selinuxfs", class: FormatClass::NoDev, mountable: true, check: false, dump: false, linux_native: false },
    FormatSpec { kind: "efivarfs", class: FormatClass::NoDev, mountable: true, check: false, dump: false, linux_native: false },
    FormatSpec { kind: "bind", class: FormatClass::Bind, mountable: true, check: false, dump: false, linux_native: false },
    FormatSpec { kind: "swap", class: FormatClass::Swap, mountable: false, check: false, dump: false, linux_native: false },
    FormatSpec { kind: "nfs", class: FormatClass::Network, mountable: true, check: false, dump: false, linux_native: false },
    FormatSpec { kind: "nfs4", class: FormatClass::Network, mountable: true, check: false, dump: false, linux_native: false },
    FormatSpec { kind: "luks", class: FormatClass::Member, mountable: false, check: false, dump: false, linux_native: false },
    FormatSpec { kind: "lvmpv", class: FormatClass::Member, mountable: false, check: false, dump: false, linux_native: false },
    FormatSpec { kind: "mdmember", class: FormatClass::Member, mountable: false, check: false, dump: false, linux_native: false },
];

pub fn spec(kind: &str) -> Option<&'static FormatSpec> {
    SPECS.iter().find(|s| s.kind == kind)
}

pub fn is_nodev(kind: &str) -> bool {
    spec(kind).map(|s| s.class == FormatClass::NoDev).unwrap_or(false)
}

/// Only real disk filesystems support a trial mount to settle a type
/// disagreement; pseudo and network filesystems do not.
pub fn can_trial_mount(kind: &str) -> bool {
    spec(kind)
        .map(|s| s.class == FormatClass::Filesystem)
        .unwrap_or(false)
}
