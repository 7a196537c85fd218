//! Discovery of existing installations on scanned devices.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use log::{debug, info, warn};

use crate::device::{DeviceGraph, DeviceId};
use crate::errors::StorageError;
use crate::ops::{DeviceOps, ErrorDecision};
use crate::owner::PathOwner;
use crate::plan::MountPlan;
use crate::resolve::SpecLookup;
use crate::shell;
use crate::tabs;
use crate::Session;

/// One discovered installation: its mount layout, its swap devices and a
/// human-readable name.
#[derive(Debug)]
pub struct Root {
    pub name: String,
    pub mounts: HashMap<String, DeviceId>,
    pub swaps: Vec<DeviceId>,
}

impl Root {
    /// When no name is given, fall back to the root filesystem's UUID so
    /// the entry is at least distinguishable.
    pub fn new(
        graph: &DeviceGraph,
        mounts: HashMap<String, DeviceId>,
        swaps: Vec<DeviceId>,
        name: Option<String>,
    ) -> Self {
        let name = name
            .or_else(|| {
                mounts
                    .get("/")
                    .and_then(|id| graph.get(*id))
                    .and_then(|d| d.format.uuid.clone())
            })
            .unwrap_or_else(|| "Linux".to_string());

        Root { name, mounts, swaps }
    }

    /// The device holding the installation's root filesystem.
    pub fn device(&self) -> Option<DeviceId> {
        self.mounts.get("/").copied()
    }
}

// "Fedora release 38 (Thirty Eight)" style.
fn release_from_redhat_release(text: &str) -> (Option<String>, Option<String>) {
    let Some(line) = text.lines().next() else {
        return (None, None);
    };

    match line.split_once(" release ") {
        Some((product, rest)) => {
            let version = rest.split_whitespace().next().map(str::to_string);
            (Some(product.to_string()), version)
        }
        None => (None, None),
    }
}

// os-release KEY=VALUE pairs, VALUE possibly shell-quoted.
fn release_from_os_release(text: &str) -> (Option<String>, Option<String>) {
    let mut product = None;
    let mut version = None;

    for line in text.lines() {
        let line = line.trim();
        if line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };

        let value = shlex::split(value).and_then(|words| words.into_iter().next());
        match key {
            "NAME" => product = value,
            "VERSION_ID" => version = value,
            _ => {}
        }
    }

    (product, version)
}

type ReleaseInfo = (Option<String>, Option<String>, Option<String>);

/// Sniff (arch, product, version) out of a mounted system tree. A
/// missing release file leaves product and version unset; only a
/// present-but-unreadable file errors.
pub fn release_string(sysroot: &Path) -> Result<ReleaseInfo, StorageError> {
    let sysroot_str = sysroot.display().to_string();
    let arch = shell::exec_capture("chroot", &[sysroot_str.as_str(), "arch"])
        .ok()
        .map(|out| out.trim().to_string());

    let redhat_release = sysroot.join("etc/redhat-release");
    let os_release = sysroot.join("etc/os-release");

    let (product, version) = if redhat_release.is_file() {
        let text = fs::read_to_string(&redhat_release).map_err(|err| StorageError::Io {
            path: redhat_release.display().to_string(),
            source: err,
        })?;
        release_from_redhat_release(&text)
    } else if os_release.is_file() {
        let text = fs::read_to_string(&os_release).map_err(|err| StorageError::Io {
            path: os_release.display().to_string(),
            source: err,
        })?;
        release_from_os_release(&text)
    } else {
        (None, None)
    };

    Ok((arch, product, version))
}

fn compose_name(release: Result<ReleaseInfo, StorageError>, device_name: &str) -> String {
    match release {
        Err(_) => format!("Linux on {device_name}"),
        Ok((Some(arch), Some(product), Some(version))) => {
            if product.to_lowercase().contains("linux") {
                format!("{product} {version} for {arch}")
            } else {
                format!("{product} Linux {version} for {arch}")
            }
        }
        Ok(_) => "Unknown Linux".to_string(),
    }
}

/// Name a mounted installation from its release files, falling back to
/// the backing device's name.
pub fn installation_name(sysroot: &Path, device_name: &str) -> String {
    compose_name(release_string(sysroot), device_name)
}

/// Read the fstab of a mounted-elsewhere system and map its entries back
/// onto the device graph. Pure lookup: nothing is activated and the
/// graph is untouched.
pub fn read_fstab(
    graph: &DeviceGraph,
    lookup: &dyn SpecLookup,
    root: &Path,
) -> Result<(HashMap<String, DeviceId>, Vec<DeviceId>), StorageError> {
    let path = root.join("etc/fstab");
    let text = fs::read_to_string(&path).map_err(|err| StorageError::Io {
        path: path.display().to_string(),
        source: err,
    })?;

    let (tags, key_map) = tabs::load(root, graph, lookup);

    let mut mounts = HashMap::new();
    let mut swaps = Vec::new();
    for line in text.lines() {
        let line = line.split('#').next().unwrap_or("");
        let fields: Vec<&str> = line.split_whitespace().collect();
        if !(4..=6).contains(&fields.len()) {
            continue;
        }

        let (devspec, mountpoint, fstype, options) = (fields[0], fields[1], fields[2], fields[3]);

        let Some(id) = lookup.resolve(graph, devspec, key_map.as_ref(), tags.as_ref(), options)
        else {
            debug!("cannot resolve {devspec} in discovered fstab");
            continue;
        };

        if fstype == "swap" {
            swaps.push(id);
        } else if mountpoint.starts_with('/') {
            mounts.insert(mountpoint.to_string(), id);
        }
    }

    Ok((mounts, swaps))
}

/// Trial-mount every candidate leaf filesystem and collect the
/// installations whose fstab we can interpret. Never fails: a scan error
/// just yields an empty list.
pub fn find_existing_installations(
    graph: &DeviceGraph,
    ops: &mut dyn DeviceOps,
    lookup: &dyn SpecLookup,
    session: &Session,
    teardown_all: bool,
) -> Vec<Root> {
    let roots = match scan_installations(graph, ops, lookup, session) {
        Ok(roots) => roots,
        Err(err) => {
            info!("failure detecting existing installations: {err}");
            Vec::new()
        }
    };

    if teardown_all {
        graph.teardown_all(ops);
    }

    roots
}

fn scan_installations(
    graph: &DeviceGraph,
    ops: &mut dyn DeviceOps,
    lookup: &dyn SpecLookup,
    session: &Session,
) -> Result<Vec<Root>, StorageError> {
    let staging = &session.physical_root;
    fs::create_dir_all(staging).map_err(|err| StorageError::Io {
        path: staging.display().to_string(),
        source: err,
    })?;

    let mut roots = Vec::new();
    for id in graph.leaves() {
        let Some(dev) = graph.get(id) else { continue };
        if !dev.controllable || !dev.format.linux_native() || !dev.format.mountable() {
            continue;
        }
        let dev = dev.clone();

        if let Err(err) = ops.setup(&dev) {
            warn!("setup of {} failed: {err}", dev.name);
            continue;
        }

        if let Err(err) = ops.mount(&dev, staging, "ro") {
            warn!("mount of {} failed: {err}", dev.name);
            unmount_staging(ops, staging);
            continue;
        }

        if !staging.join("etc/fstab").is_file() {
            // a filesystem, but not an installation
            unmount_staging(ops, staging);
            if let Err(err) = ops.teardown(&dev) {
                debug!("teardown of {} failed: {err}", dev.name);
            }
            continue;
        }

        let name = installation_name(staging, &dev.name);
        debug!("considering existing installation: {name}");

        let (mounts, swaps) = match read_fstab(graph, lookup, staging) {
            Ok(found) => found,
            Err(err) => {
                warn!("error parsing fstab of {name}: {err}");
                (HashMap::new(), Vec::new())
            }
        };

        unmount_staging(ops, staging);

        if mounts.is_empty() && swaps.is_empty() {
            continue;
        }
        roots.push(Root::new(graph, mounts, swaps, Some(name)));
    }

    Ok(roots)
}

fn unmount_staging(ops: &mut dyn DeviceOps, staging: &Path) {
    if let Err(err) = ops.unmount_path(staging) {
        warn!("failed to unmount {}: {err}", staging.display());
    }
}

/// Mount a discovered installation under the session sysroot: the root
/// filesystem first, then everything its own fstab declares.
#[allow(clippy::too_many_arguments)]
pub fn mount_existing_system(
    plan: &mut MountPlan,
    graph: &mut DeviceGraph,
    ops: &mut dyn DeviceOps,
    lookup: &dyn SpecLookup,
    owner: &dyn PathOwner,
    session: &Session,
    root_device: DeviceId,
    read_only: bool,
    on_error: &mut dyn FnMut(&StorageError) -> ErrorDecision,
) -> Result<(), StorageError> {
    let root_path = session.sysroot.clone();
    let read_only = if read_only { Some("ro") } else { None };

    let dev = graph
        .get(root_device)
        .cloned()
        .ok_or_else(|| StorageError::NoSuchDevice(format!("{root_device:?}")))?;

    ops.setup(&dev)?;

    let mut options = if dev.format.options.is_empty() {
        "defaults".to_string()
    } else {
        dev.format.options.clone()
    };
    if let Some(read_only) = read_only {
        options = format!("{options},{read_only}");
    }
    ops.mount(&dev, &root_path, &options)?;

    if let Some(dev) = graph.get_mut(root_device) {
        dev.format.mountpoint = Some("/".to_string());
    }

    plan.parse_fstab(graph, lookup, ops, owner, &root_path)?;
    plan.mount_filesystems(
        graph,
        ops,
        owner,
        session,
        &root_path,
        read_only,
        true,
        on_error,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DeviceKind, Format};
    use crate::ops::testing::RecordingOps;
    use crate::resolve::GraphSpecLookup;

    struct NoOwner;

    impl PathOwner for NoOwner {
        fn containing_device(&self, _path: &Path, _graph: &DeviceGraph) -> Option<DeviceId> {
            None
        }
    }

    fn ext4(name: &str, uuid: &str) -> Device {
        let path = format!("/dev/{name}");
        let mut dev = Device::new(name, &path, DeviceKind::Partition, Format::new("ext4"));
        dev.format.uuid = Some(uuid.to_string());
        dev.format.exists = true;
        dev
    }

    fn write_file(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_release_from_redhat_release() {
        let (product, version) =
            release_from_redhat_release("Fedora release 38 (Thirty Eight)\n");
        assert_eq!(product.as_deref(), Some("Fedora"));
        assert_eq!(version.as_deref(), Some("38"));

        assert_eq!(release_from_redhat_release("garbage\n"), (None, None));
    }

    #[test]
    fn test_release_from_os_release() {
        let text = concat!(
            "# comment\n",
            "NAME=\"Fedora Linux\"\n",
            "VERSION=\"38 (Workstation Edition)\"\n",
            "VERSION_ID=38\n",
        );
        let (product, version) = release_from_os_release(text);
        assert_eq!(product.as_deref(), Some("Fedora Linux"));
        assert_eq!(version.as_deref(), Some("38"));
    }

    #[test]
    fn test_compose_name() {
        let full = Ok((
            Some("x86_64".to_string()),
            Some("Fedora Linux".to_string()),
            Some("38".to_string()),
        ));
        assert_eq!(compose_name(full, "sda1"), "Fedora Linux 38 for x86_64");

        let no_linux = Ok((
            Some("x86_64".to_string()),
            Some("CentOS".to_string()),
            Some("7".to_string()),
        ));
        assert_eq!(compose_name(no_linux, "sda1"), "CentOS Linux 7 for x86_64");

        let partial = Ok((None, Some("Fedora".to_string()), Some("38".to_string())));
        assert_eq!(compose_name(partial, "sda1"), "Unknown Linux");

        let nothing = Ok((None, None, None));
        assert_eq!(compose_name(nothing, "sda1"), "Unknown Linux");

        let unreadable = Err(StorageError::NoSuchDevice("x".to_string()));
        assert_eq!(compose_name(unreadable, "sda1"), "Linux on sda1");
    }

    #[test]
    fn test_installation_name_without_release_files() {
        let root = tempfile::tempdir().unwrap();
        assert_eq!(installation_name(root.path(), "sda1"), "Unknown Linux");
    }

    #[test]
    fn test_read_fstab_is_lookup_only() {
        let mut graph = DeviceGraph::new();
        let root_dev = graph.add(ext4("sda1", "1111")).unwrap();
        let mut swap = Device::new("sda2", "/dev/sda2", DeviceKind::Partition, Format::new("swap"));
        swap.format.uuid = Some("2222".to_string());
        let swap = graph.add(swap).unwrap();
        let before = graph.len();

        let root = tempfile::tempdir().unwrap();
        write_file(
            root.path(),
            "etc/fstab",
            concat!(
                "UUID=1111 / ext4 defaults 1 1\n",
                "UUID=2222 swap swap defaults 0 0\n",
                "UUID=nope /data ext4 defaults 0 0\n",
            ),
        );

        let (mounts, swaps) = read_fstab(&graph, &GraphSpecLookup, root.path()).unwrap();

        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts.get("/"), Some(&root_dev));
        assert_eq!(swaps, vec![swap]);
        assert_eq!(graph.len(), before);
    }

    #[test]
    fn test_root_name_defaults_to_uuid() {
        let mut graph = DeviceGraph::new();
        let id = graph.add(ext4("sda1", "1111")).unwrap();

        let mut mounts = HashMap::new();
        mounts.insert("/".to_string(), id);
        let root = Root::new(&graph, mounts, Vec::new(), None);

        assert_eq!(root.name, "1111");
        assert_eq!(root.device(), Some(id));
    }

    #[test]
    fn test_find_existing_installations() {
        let mut graph = DeviceGraph::new();
        let disk = graph
            .add(Device::new("sda", "/dev/sda", DeviceKind::Disk, Format::default()))
            .unwrap();
        let mut part = ext4("sda1", "1111");
        part.parents = vec![disk];
        let part = graph.add(part).unwrap();

        // swap is not linux-native mountable, so it is never probed
        let mut swap = Device::new("sdb1", "/dev/sdb1", DeviceKind::Partition, Format::new("swap"));
        swap.format.uuid = Some("2222".to_string());
        graph.add(swap).unwrap();

        let staging = tempfile::tempdir().unwrap();
        write_file(staging.path(), "etc/fstab", "UUID=1111 / ext4 defaults 1 1\n");

        let session = Session::new(true, false)
            .with_sysroot(staging.path())
            .with_physical_root(staging.path());

        let mut ops = RecordingOps::new();
        let roots =
            find_existing_installations(&graph, &mut ops, &GraphSpecLookup, &session, true);

        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].name, "Unknown Linux");
        assert_eq!(roots[0].device(), Some(part));

        assert!(ops.events.iter().any(|e| e.starts_with("mount sda1 ")));
        assert!(!ops.events.iter().any(|e| e.starts_with("mount sdb1")));

        // teardown_all sweeps leaves before their parents
        let part_down = ops.events.iter().position(|e| e == "teardown sda1").unwrap();
        let disk_down = ops.events.iter().position(|e| e == "teardown sda").unwrap();
        assert!(part_down < disk_down);
    }

    #[test]
    fn test_non_installation_filesystem_is_torn_down() {
        let mut graph = DeviceGraph::new();
        graph.add(ext4("sda1", "1111")).unwrap();

        // no etc/fstab in the staging tree
        let staging = tempfile::tempdir().unwrap();
        let session = Session::new(true, false)
            .with_sysroot(staging.path())
            .with_physical_root(staging.path());

        let mut ops = RecordingOps::new();
        let roots =
            find_existing_installations(&graph, &mut ops, &GraphSpecLookup, &session, false);

        assert!(roots.is_empty());
        assert!(ops.events.contains(&"teardown sda1".to_string()));
        assert!(ops
            .events
            .iter()
            .any(|e| e.starts_with("unmount_path ")));
    }

    #[test]
    fn test_mount_existing_system() {
        let mut graph = DeviceGraph::new();
        let root_dev = graph.add(ext4("sda1", "1111")).unwrap();
        graph.add(ext4("sda2", "2222")).unwrap();

        let sysroot = tempfile::tempdir().unwrap();
        write_file(
            sysroot.path(),
            "etc/fstab",
            "UUID=1111 / ext4 defaults 1 1\nUUID=2222 /home ext4 defaults 1 2\n",
        );

        let session = Session::new(true, false)
            .with_sysroot(sysroot.path())
            .with_physical_root(sysroot.path());

        let mut plan = MountPlan::new();
        let mut ops = RecordingOps::new();
        mount_existing_system(
            &mut plan,
            &mut graph,
            &mut ops,
            &GraphSpecLookup,
            &NoOwner,
            &session,
            root_dev,
            true,
            &mut |_| ErrorDecision::Raise,
        )
        .unwrap();

        // the root filesystem is mounted once, directly and read-only
        let root_mounts: Vec<_> = ops
            .events
            .iter()
            .filter(|e| e.starts_with("mount sda1 "))
            .collect();
        assert_eq!(
            root_mounts,
            vec![&format!("mount sda1 {} defaults,ro", sysroot.path().display())]
        );

        // fstab-declared filesystems follow, read-only as well
        let home = sysroot.path().join("home");
        assert!(ops
            .events
            .contains(&format!("mount sda2 {} defaults,ro", home.display())));

        assert!(plan.is_active());
    }
}
