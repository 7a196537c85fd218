//! Per-line fstab entry resolution.
//!
//! Classification is most-specific-first: an answer from the device
//! graph always beats heuristic reconstruction, and virtual filesystems
//! are recognized by mountpoint alone so any declared fstype is
//! tolerated for them.

use std::path::Path;

use log::{error, info, warn};

use crate::device::{Device, DeviceGraph, DeviceId, DeviceKind, Format};
use crate::errors::StorageError;
use crate::formats;
use crate::ops::DeviceOps;
use crate::owner::PathOwner;
use crate::tabs::{KeyMapTable, TagTable};

/// Mountpoints that are never persisted as resolved entries; the mount
/// plan recreates them synthetically.
pub const VIRTUAL_MOUNTPOINTS: &[&str] = &[
    "/proc",
    "/sys",
    "/dev/shm",
    "/dev/pts",
    "/sys/fs/selinux",
    "/proc/bus/usb",
    "/sys/firmware/efi/efivars",
];

/// The fields of one fstab entry, in file order.
#[derive(Debug, Clone, Copy)]
pub struct FstabFields<'a> {
    pub devspec: &'a str,
    pub mountpoint: &'a str,
    pub fstype: &'a str,
    pub options: &'a str,
    pub dump: &'a str,
    pub passno: &'a str,
}

/// Where a successfully classified entry's device lives.
#[derive(Debug)]
pub enum ResolvedDevice {
    /// Already present in the device graph.
    Existing(DeviceId),
    /// Synthesized for this entry; the caller decides whether to add it.
    New(Device),
}

/// Outcome of classifying one entry. A type mismatch is the only hard
/// error and is returned as `Err`, not a variant.
#[derive(Debug)]
pub enum Resolution {
    Resolved(ResolvedDevice),
    /// Could not be interpreted; the caller preserves the raw line.
    Unrecognized,
    /// Virtual filesystem entry, dropped and recreated at mount time.
    Virtual,
}

/// Textual device specification resolution against the device graph.
/// The key map and tag table give context for mapper names and stale
/// device paths.
pub trait SpecLookup {
    fn resolve(
        &self,
        graph: &DeviceGraph,
        spec: &str,
        key_map: Option<&KeyMapTable>,
        tags: Option<&TagTable>,
        options: &str,
    ) -> Option<DeviceId>;
}

/// Default lookup over the graph's own indexes.
pub struct GraphSpecLookup;

impl SpecLookup for GraphSpecLookup {
    fn resolve(
        &self,
        graph: &DeviceGraph,
        spec: &str,
        key_map: Option<&KeyMapTable>,
        tags: Option<&TagTable>,
        _options: &str,
    ) -> Option<DeviceId> {
        let spec = spec.trim();
        if spec.is_empty() {
            return None;
        }

        if let Some(uuid) = spec.strip_prefix("UUID=") {
            return graph.get_by_uuid(uuid);
        }

        if let Some(label) = spec.strip_prefix("LABEL=") {
            return graph.get_by_label(label);
        }

        if let Some(name) = spec.strip_prefix("/dev/mapper/") {
            if let Some(id) = graph.get_by_name(name) {
                return Some(id);
            }

            // an unscanned mapping: hand back the decrypted child of the
            // crypttab backing device when one exists
            if let Some(mapping) = key_map.and_then(|t| t.get(name)) {
                let child = graph
                    .iter()
                    .find(|(_, d)| d.parents.contains(&mapping.device))
                    .map(|(id, _)| id);
                return child.or(Some(mapping.device));
            }

            return None;
        }

        if spec.starts_with('/') {
            if let Some(id) = graph.get_by_path(spec) {
                return Some(id);
            }
        } else if let Some(id) = graph.get_by_name(spec) {
            return Some(id);
        }

        // the spec may be a device path from an older scan; the tag
        // table can carry it over to a stable UUID
        if let Some(uuid) = tags.and_then(|t| t.get(spec)).and_then(|a| a.get("UUID")) {
            return graph.get_by_uuid(uuid);
        }

        None
    }
}

fn has_option(options: &str, wanted: &str) -> bool {
    options.split(',').any(|opt| opt == wanted)
}

/// Classify one fstab entry and produce its device.
#[allow(clippy::too_many_arguments)]
pub fn resolve_entry(
    graph: &mut DeviceGraph,
    lookup: &dyn SpecLookup,
    ops: &mut dyn DeviceOps,
    owner: &dyn PathOwner,
    key_map: Option<&KeyMapTable>,
    tags: Option<&TagTable>,
    entry: &FstabFields,
) -> Result<Resolution, StorageError> {
    // no sense in doing any legwork for a noauto entry
    if has_option(entry.options, "noauto") {
        info!("ignoring noauto entry for {}", entry.mountpoint);
        return Ok(Resolution::Unrecognized);
    }

    let mut fstype = entry.fstype;

    let found = if let Some(id) =
        lookup.resolve(graph, entry.devspec, key_map, tags, entry.options)
    {
        Some(ResolvedDevice::Existing(id))
    } else if entry.devspec.starts_with("/dev/loop") {
        warn!("completely ignoring loop mount {}", entry.devspec);
        None
    } else if entry.devspec.contains(':') && fstype.starts_with("nfs") {
        let mut format = Format::new(fstype);
        format.exists = true;
        Some(ResolvedDevice::New(Device::new(
            entry.devspec,
            entry.devspec,
            DeviceKind::Nfs,
            format,
        )))
    } else if entry.devspec.starts_with('/') && fstype == "swap" {
        // swap file, parented by whatever holds its directory
        let parent = Path::new(entry.devspec)
            .parent()
            .and_then(|dir| owner.containing_device(dir, graph));

        let mut format = Format::new("swap");
        format.exists = true;
        let mut device = Device::new(entry.devspec, entry.devspec, DeviceKind::File, format);
        device.parents = parent.into_iter().collect();
        Some(ResolvedDevice::New(device))
    } else if fstype == "bind" || entry.options.contains("bind") {
        // substring on purpose: rbind and friends count too
        // normalize so the later type comparison cannot false-positive
        fstype = "bind";

        // probably useless this early; the mount phase re-resolves the
        // parent once the target directory actually exists
        let parent = owner.containing_device(Path::new(entry.devspec), graph);

        let mut format = Format::new("bind");
        format.exists = true;
        let mut device = Device::new(entry.devspec, entry.devspec, DeviceKind::Directory, format);
        device.parents = parent.into_iter().collect();
        Some(ResolvedDevice::New(device))
    } else if VIRTUAL_MOUNTPOINTS.contains(&entry.mountpoint) {
        return Ok(Resolution::Virtual);
    } else if entry.devspec == "none" || formats::is_nodev(fstype) {
        Some(ResolvedDevice::New(Device::new(
            fstype,
            fstype,
            DeviceKind::NoDevice,
            Format::new(fstype),
        )))
    } else {
        None
    };

    let Some(found) = found else {
        error!(
            "failed to resolve {} ({fstype}) from fstab",
            entry.devspec
        );
        return Ok(Resolution::Unrecognized);
    };

    match found {
        ResolvedDevice::Existing(id) => {
            let Some(device) = graph.get_mut(id) else {
                return Ok(Resolution::Unrecognized);
            };
            match activate_and_check(device, ops, entry.mountpoint, fstype, entry.options)? {
                true => Ok(Resolution::Resolved(ResolvedDevice::Existing(id))),
                false => Ok(Resolution::Unrecognized),
            }
        }
        ResolvedDevice::New(mut device) => {
            match activate_and_check(&mut device, ops, entry.mountpoint, fstype, entry.options)? {
                true => Ok(Resolution::Resolved(ResolvedDevice::New(device))),
                false => Ok(Resolution::Unrecognized),
            }
        }
    }
}

/// Steps shared by every classified entry: activate the device, validate
/// the declared type against what the device already carries, and stamp
/// mountpoint and options onto the format.
fn activate_and_check(
    device: &mut Device,
    ops: &mut dyn DeviceOps,
    mountpoint: &str,
    fstype: &str,
    options: &str,
) -> Result<bool, StorageError> {
    ops.setup(device)?;

    let mut declared = Format::new(fstype);
    declared.exists = true;

    if fstype != "auto" && (device.format.kind.is_none() || declared.kind.is_none()) {
        info!("unrecognized filesystem type for {} ({fstype})", device.name);
        teardown_quietly(device, ops);
        return Ok(false);
    }

    let declared_type = declared.mount_type().map(str::to_string);
    let device_type = device.format.mount_type().map(str::to_string);

    if declared.can_trial_mount() && fstype != "auto" && declared_type != device_type {
        info!(
            "fstab says {:?} at {mountpoint} is {:?}",
            device_type, declared_type
        );

        if ops.trial_mount(device, fstype) {
            // the declared type demonstrably mounts; rebind to it
            device.format = declared;
        } else {
            teardown_quietly(device, ops);
            return Err(StorageError::FstabTypeMismatch {
                mountpoint: mountpoint.to_string(),
                detected: device_type.unwrap_or_default(),
                declared: declared_type.unwrap_or_default(),
            });
        }
    }

    if device.format.mountable() {
        device.format.mountpoint = Some(mountpoint.to_string());
    }
    device.format.options = options.to_string();

    Ok(true)
}

fn teardown_quietly(device: &Device, ops: &mut dyn DeviceOps) {
    if let Err(err) = ops.teardown(device) {
        warn!("teardown of {} failed: {err}", device.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::testing::RecordingOps;

    struct NoOwner;

    impl PathOwner for NoOwner {
        fn containing_device(&self, _path: &Path, _graph: &DeviceGraph) -> Option<DeviceId> {
            None
        }
    }

    fn fields<'a>(
        devspec: &'a str,
        mountpoint: &'a str,
        fstype: &'a str,
        options: &'a str,
    ) -> FstabFields<'a> {
        FstabFields {
            devspec,
            mountpoint,
            fstype,
            options,
            dump: "0",
            passno: "0",
        }
    }

    fn graph_with(name: &str, path: &str, fstype: &str, uuid: &str) -> (DeviceGraph, DeviceId) {
        let mut graph = DeviceGraph::new();
        let mut dev = Device::new(name, path, DeviceKind::Partition, Format::new(fstype));
        dev.format.uuid = Some(uuid.to_string());
        let id = graph.add(dev).unwrap();

        (graph, id)
    }

    fn run(
        graph: &mut DeviceGraph,
        ops: &mut RecordingOps,
        entry: &FstabFields,
    ) -> Result<Resolution, StorageError> {
        resolve_entry(graph, &GraphSpecLookup, ops, &NoOwner, None, None, entry)
    }

    #[test]
    fn test_noauto_is_unrecognized() {
        let (mut graph, _) = graph_with("sda1", "/dev/sda1", "ext4", "1111");
        let mut ops = RecordingOps::new();

        let entry = fields("UUID=1111", "/data", "ext4", "defaults,noauto");
        let res = run(&mut graph, &mut ops, &entry).unwrap();

        assert!(matches!(res, Resolution::Unrecognized));
        assert!(ops.events.is_empty());
    }

    #[test]
    fn test_existing_device_resolves_and_is_stamped() {
        let (mut graph, id) = graph_with("sda1", "/dev/sda1", "ext4", "1111");
        let mut ops = RecordingOps::new();

        let entry = fields("UUID=1111", "/home", "ext4", "defaults");
        let res = run(&mut graph, &mut ops, &entry).unwrap();

        assert!(matches!(
            res,
            Resolution::Resolved(ResolvedDevice::Existing(did)) if did == id
        ));
        let dev = graph.get(id).unwrap();
        assert_eq!(dev.format.mountpoint.as_deref(), Some("/home"));
        assert_eq!(dev.format.options, "defaults");
        assert_eq!(ops.events, vec!["setup sda1"]);
    }

    #[test]
    fn test_loop_mount_is_unrecognized() {
        let mut graph = DeviceGraph::new();
        let mut ops = RecordingOps::new();

        let entry = fields("/dev/loop3", "/mnt/img", "ext4", "defaults");
        let res = run(&mut graph, &mut ops, &entry).unwrap();

        assert!(matches!(res, Resolution::Unrecognized));
    }

    #[test]
    fn test_nfs_entry_builds_network_device() {
        let mut graph = DeviceGraph::new();
        let mut ops = RecordingOps::new();

        let entry = fields("filer:/export/home", "/home", "nfs", "defaults");
        let res = run(&mut graph, &mut ops, &entry).unwrap();

        let Resolution::Resolved(ResolvedDevice::New(dev)) = res else {
            panic!("expected new device");
        };
        assert!(matches!(dev.kind, DeviceKind::Nfs));
        assert!(dev.exists);
        assert_eq!(dev.format.mountpoint.as_deref(), Some("/home"));
        assert_eq!(dev.path, "filer:/export/home");
    }

    #[test]
    fn test_rbind_option_classifies_as_bind() {
        let mut graph = DeviceGraph::new();
        let mut ops = RecordingOps::new();

        let entry = fields("/mnt/data", "/srv", "none", "rbind");
        let res = run(&mut graph, &mut ops, &entry).unwrap();

        let Resolution::Resolved(ResolvedDevice::New(dev)) = res else {
            panic!("expected new device");
        };
        assert!(matches!(dev.kind, DeviceKind::Directory));
        assert!(dev.format.is("bind"));
        assert_eq!(dev.format.mountpoint.as_deref(), Some("/srv"));
        assert_eq!(dev.format.options, "rbind");
    }

    #[test]
    fn test_virtual_mountpoint_is_dropped() {
        let mut graph = DeviceGraph::new();
        let mut ops = RecordingOps::new();

        for mountpoint in VIRTUAL_MOUNTPOINTS {
            let entry = fields("whatever", mountpoint, "weirdfs", "defaults");
            let res = run(&mut graph, &mut ops, &entry).unwrap();
            assert!(matches!(res, Resolution::Virtual), "for {mountpoint}");
        }
        assert!(ops.events.is_empty());
    }

    #[test]
    fn test_nodev_entry_builds_placeholder() {
        let mut graph = DeviceGraph::new();
        let mut ops = RecordingOps::new();

        let entry = fields("tmpfs", "/tmp", "tmpfs", "size=2G");
        let res = run(&mut graph, &mut ops, &entry).unwrap();

        let Resolution::Resolved(ResolvedDevice::New(dev)) = res else {
            panic!("expected new device");
        };
        assert!(matches!(dev.kind, DeviceKind::NoDevice));
        assert_eq!(dev.name, "tmpfs");
        assert_eq!(dev.format.mountpoint.as_deref(), Some("/tmp"));
        assert_eq!(dev.format.options, "size=2G");
    }

    #[test]
    fn test_unknown_fstype_tears_down() {
        let (mut graph, _) = graph_with("sda1", "/dev/sda1", "ext4", "1111");
        let mut ops = RecordingOps::new();

        let entry = fields("UUID=1111", "/data", "weirdfs", "defaults");
        let res = run(&mut graph, &mut ops, &entry).unwrap();

        assert!(matches!(res, Resolution::Unrecognized));
        assert_eq!(ops.events, vec!["setup sda1", "teardown sda1"]);
    }

    #[test]
    fn test_type_mismatch_raises_and_tears_down() {
        let (mut graph, _) = graph_with("sda1", "/dev/sda1", "xfs", "1111");
        let mut ops = RecordingOps::new();

        let entry = fields("UUID=1111", "/var", "ext4", "defaults");
        let err = run(&mut graph, &mut ops, &entry).unwrap_err();

        match err {
            StorageError::FstabTypeMismatch {
                mountpoint,
                detected,
                declared,
            } => {
                assert_eq!(mountpoint, "/var");
                assert_eq!(detected, "xfs");
                assert_eq!(declared, "ext4");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(
            ops.events,
            vec!["setup sda1", "trial_mount sda1 ext4", "teardown sda1"]
        );
    }

    #[test]
    fn test_trial_mount_success_rebinds_format() {
        let (mut graph, id) = graph_with("sda1", "/dev/sda1", "xfs", "1111");
        let mut ops = RecordingOps::new();
        ops.trial_results.insert("sda1".to_string(), true);

        let entry = fields("UUID=1111", "/var", "ext4", "defaults");
        let res = run(&mut graph, &mut ops, &entry).unwrap();

        assert!(matches!(res, Resolution::Resolved(ResolvedDevice::Existing(_))));
        let dev = graph.get(id).unwrap();
        assert!(dev.format.is("ext4"));
        assert_eq!(dev.format.mountpoint.as_deref(), Some("/var"));
    }

    #[test]
    fn test_auto_fstype_tolerated() {
        let (mut graph, id) = graph_with("sda1", "/dev/sda1", "ext4", "1111");
        let mut ops = RecordingOps::new();

        let entry = fields("UUID=1111", "/srv", "auto", "defaults");
        let res = run(&mut graph, &mut ops, &entry).unwrap();

        assert!(matches!(res, Resolution::Resolved(ResolvedDevice::Existing(_))));
        assert!(graph.get(id).unwrap().format.is("ext4"));
    }

    #[test]
    fn test_unresolvable_spec_is_unrecognized() {
        let mut graph = DeviceGraph::new();
        let mut ops = RecordingOps::new();

        let entry = fields("UUID=nope", "/data", "ext4", "defaults");
        let res = run(&mut graph, &mut ops, &entry).unwrap();

        assert!(matches!(res, Resolution::Unrecognized));
    }

    #[test]
    fn test_mapper_spec_through_key_map() {
        let mut graph = DeviceGraph::new();
        let mut backing =
            Device::new("sda2", "/dev/sda2", DeviceKind::Partition, Format::new("luks"));
        backing.format.uuid = Some("abcd".to_string());
        let backing = graph.add(backing).unwrap();

        let mut table = KeyMapTable::new();
        table.insert(
            "luks-1".to_string(),
            crate::tabs::KeyMapping {
                device: backing,
                key_file: "none".to_string(),
                options: String::new(),
            },
        );

        let resolved =
            GraphSpecLookup.resolve(&graph, "/dev/mapper/luks-1", Some(&table), None, "");
        assert_eq!(resolved, Some(backing));
    }
}
