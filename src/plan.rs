//! The mount plan: owns the resolved fstab entry set, decides mount and
//! unmount order, manages swap, and regenerates the persisted
//! configuration files.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};

use crate::device::{Device, DeviceGraph, DeviceId, DeviceKind, Format};
use crate::errors::StorageError;
use crate::ops::{DeviceOps, ErrorDecision};
use crate::owner::PathOwner;
use crate::resolve::{self, FstabFields, ResolvedDevice, Resolution, SpecLookup};
use crate::tabs::{self, KeyMapTable, TagTable};
use crate::Session;

/// Resolve an absolute in-target path against a root prefix.
pub(crate) fn chroot_path(root: &Path, abs: &str) -> PathBuf {
    root.join(abs.trim_start_matches('/'))
}

/// The virtual filesystems recreated for every installation target.
/// Built once per plan; these never enter the device graph and never
/// show up in the generated fstab.
#[derive(Debug, Clone)]
struct VirtualDevices {
    devices: Vec<Device>,
    efivars: Device,
}

impl VirtualDevices {
    fn new() -> Self {
        let nodev = |fstype: &str, mountpoint: &str| {
            let mut format = Format::new(fstype);
            format.mountpoint = Some(mountpoint.to_string());
            Device::new(fstype, fstype, DeviceKind::NoDevice, format)
        };

        let bind = |path: &str| {
            let mut format = Format::new("bind");
            format.mountpoint = Some(path.to_string());
            format.exists = true;
            Device::new(path, path, DeviceKind::Directory, format)
        };

        VirtualDevices {
            devices: vec![
                bind("/dev"),
                nodev("tmpfs", "/dev/shm"),
                nodev("devpts", "/dev/pts"),
                nodev("sysfs", "/sys"),
                nodev("proc", "/proc"),
                nodev("selinuxfs", "/sys/fs/selinux"),
                nodev("usbfs", "/proc/bus/usb"),
                bind("/run"),
            ],
            efivars: nodev("efivarfs", "/sys/firmware/efi/efivars"),
        }
    }
}

enum Target {
    Graph(DeviceId),
    Local(usize),
}

/// A set of filesystems moving through three phases: parsed, mounted
/// (`active`), unmounted.
#[derive(Default)]
pub struct MountPlan {
    key_map: Option<KeyMapTable>,
    tag_table: Option<TagTable>,
    orig_fstab: Option<String>,
    preserve_lines: Vec<String>,
    active: bool,
    fstab_swaps: HashSet<DeviceId>,
    virtuals: Option<VirtualDevices>,
}

impl MountPlan {
    pub fn new() -> Self {
        MountPlan::default()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn original_fstab(&self) -> Option<&str> {
        self.orig_fstab.as_deref()
    }

    pub fn preserve_lines(&self) -> &[String] {
        &self.preserve_lines
    }

    pub fn key_map(&self) -> Option<&KeyMapTable> {
        self.key_map.as_ref()
    }

    /// Mountpoint to device, derived from the graph. Devices are visited
    /// in path order so collisions resolve deterministically.
    pub fn mountpoints(&self, graph: &DeviceGraph) -> HashMap<String, DeviceId> {
        let mut map = HashMap::new();
        for id in graph.ids_by_path() {
            let Some(dev) = graph.get(id) else { continue };
            if dev.format.mountable() {
                if let Some(mountpoint) = &dev.format.mountpoint {
                    map.insert(mountpoint.clone(), id);
                }
            }
        }

        map
    }

    pub fn swap_devices(&self, graph: &DeviceGraph) -> Vec<DeviceId> {
        graph
            .ids_by_path()
            .into_iter()
            .filter(|id| {
                graph
                    .get(*id)
                    .map(|d| d.format.is("swap"))
                    .unwrap_or(false)
            })
            .collect()
    }

    pub fn root_device(&self, graph: &DeviceGraph, session: &Session) -> Option<DeviceId> {
        let mounts = self.mountpoints(graph);
        mounts.get("/").copied().or_else(|| {
            session
                .physical_root
                .to_str()
                .and_then(|p| mounts.get(p).copied())
        })
    }

    /// Parse `<root>/etc/fstab` into the plan.
    ///
    /// Lines that cannot be interpreted are preserved for re-emission;
    /// only a filesystem-type mismatch aborts the parse.
    pub fn parse_fstab(
        &mut self,
        graph: &mut DeviceGraph,
        lookup: &dyn SpecLookup,
        ops: &mut dyn DeviceOps,
        owner: &dyn PathOwner,
        root: &Path,
    ) -> Result<(), StorageError> {
        let path = root.join("etc/fstab");
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) => {
                info!("cannot open {} for read: {err}", path.display());
                return Ok(());
            }
        };

        let (tags, key_map) = tabs::load(root, graph, lookup);
        self.tag_table = tags;
        self.key_map = key_map;
        self.orig_fstab = Some(text.clone());

        debug!("parsing {}", path.display());
        for raw in text.split_inclusive('\n') {
            let line = raw.split('#').next().unwrap_or("");
            let fields: Vec<&str> = line.split_whitespace().collect();

            if fields.is_empty() {
                // blank or comment-only line
                continue;
            }
            if !(4..=6).contains(&fields.len()) {
                self.preserve_lines.push(raw.to_string());
                continue;
            }

            let entry = FstabFields {
                devspec: fields[0],
                mountpoint: fields[1],
                fstype: fields[2],
                options: fields[3],
                dump: fields.get(4).copied().unwrap_or("0"),
                passno: fields.get(5).copied().unwrap_or("0"),
            };

            let resolution = resolve::resolve_entry(
                graph,
                lookup,
                ops,
                owner,
                self.key_map.as_ref(),
                self.tag_table.as_ref(),
                &entry,
            )?;

            match resolution {
                Resolution::Resolved(ResolvedDevice::Existing(_)) => {}
                Resolution::Resolved(ResolvedDevice::New(device)) => {
                    if let Err(err) = graph.add(device) {
                        match err {
                            StorageError::DuplicateDevice(name) => {
                                debug!("preserving duplicate fstab entry for {name}");
                                self.preserve_lines.push(raw.to_string());
                            }
                            other => return Err(other),
                        }
                    }
                }
                Resolution::Unrecognized => self.preserve_lines.push(raw.to_string()),
                Resolution::Virtual => {}
            }
        }

        Ok(())
    }

    fn virtual_devices(&mut self, session: &Session) -> Vec<Device> {
        let virtuals = self.virtuals.get_or_insert_with(VirtualDevices::new);

        let mut list = virtuals.devices.clone();
        if session.efi {
            list.push(virtuals.efivars.clone());
        }

        list
    }

    // Mountpoint string order approximates path-depth order: parents
    // sort before their children for ordinary absolute paths. Sibling
    // names can still interleave with an unrelated parent's children
    // (e.g. "/a-b" sorts between "/a" and "/a/b"); kept as-is for
    // compatibility with existing configurations.
    fn mount_order(&self, graph: &DeviceGraph, virtuals: &[Device]) -> Vec<Target> {
        let mut keyed: Vec<(String, usize, Target)> = Vec::new();

        let mounts = self.mountpoints(graph);
        for (mountpoint, id) in &mounts {
            keyed.push((mountpoint.clone(), keyed.len(), Target::Graph(*id)));
        }
        for id in self.swap_devices(graph) {
            keyed.push((String::new(), keyed.len(), Target::Graph(id)));
        }
        for (index, dev) in virtuals.iter().enumerate() {
            let key = dev.format.mountpoint.clone().unwrap_or_default();
            keyed.push((key, keyed.len(), Target::Local(index)));
        }

        keyed.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

        keyed.into_iter().map(|(_, _, target)| target).collect()
    }

    /// Activate the system's swap space. File-backed swap resolves its
    /// containing device only now, once earlier mounts have made the
    /// target directory reachable.
    #[allow(clippy::too_many_arguments)]
    pub fn turn_on_swap(
        &mut self,
        graph: &mut DeviceGraph,
        ops: &mut dyn DeviceOps,
        owner: &dyn PathOwner,
        session: &Session,
        root_path: &Path,
        on_error: &mut dyn FnMut(&StorageError) -> ErrorDecision,
    ) -> Result<(), StorageError> {
        if !session.installer_mode {
            return Ok(());
        }

        for id in self.swap_devices(graph) {
            let is_file = graph
                .get(id)
                .map(|d| matches!(d.kind, DeviceKind::File))
                .unwrap_or(false);

            if is_file {
                let device_path = graph
                    .get(id)
                    .map(|d| d.path.clone())
                    .unwrap_or_default();
                let target = chroot_path(root_path, &device_path);

                match owner.containing_device(&target, graph) {
                    Some(parent) => {
                        if let Some(dev) = graph.get_mut(id) {
                            dev.parents = vec![parent];
                        }
                    }
                    None => {
                        error!(
                            "cannot determine which device contains directory {device_path}"
                        );
                        graph.remove(id);
                        continue;
                    }
                }
            }

            let Some(dev) = graph.get(id).cloned() else { continue };
            loop {
                let result = ops.setup(&dev).and_then(|_| ops.swap_on(&dev));
                match result {
                    Ok(()) => break,
                    Err(err) => {
                        if on_error(&err) == ErrorDecision::Raise {
                            return Err(err);
                        }
                        // otherwise retry the same device
                    }
                }
            }
        }

        Ok(())
    }

    /// Mount the plan's filesystems under `root_path`, virtual
    /// filesystems included, in mountpoint order.
    #[allow(clippy::too_many_arguments)]
    pub fn mount_filesystems(
        &mut self,
        graph: &mut DeviceGraph,
        ops: &mut dyn DeviceOps,
        owner: &dyn PathOwner,
        session: &Session,
        root_path: &Path,
        read_only: Option<&str>,
        skip_root: bool,
        on_error: &mut dyn FnMut(&StorageError) -> ErrorDecision,
    ) -> Result<(), StorageError> {
        if !session.installer_mode {
            return Ok(());
        }

        let virtuals = self.virtual_devices(session);
        let order = self.mount_order(graph, &virtuals);

        for target in order {
            if let Target::Graph(id) = target {
                // bind targets become reachable only after earlier
                // mounts; resolve their parent here, not at parse time
                let bind_path = graph
                    .get(id)
                    .filter(|d| d.format.is("bind") && matches!(d.kind, DeviceKind::Directory))
                    .map(|d| d.path.clone());

                if let Some(path) = bind_path {
                    match owner.containing_device(&chroot_path(root_path, &path), graph) {
                        Some(parent) => {
                            if let Some(dev) = graph.get_mut(id) {
                                dev.parents = vec![parent];
                            }
                        }
                        None => {
                            error!(
                                "cannot determine which device contains directory {path}"
                            );
                            graph.remove(id);
                            continue;
                        }
                    }
                }
            }

            let dev = match &target {
                Target::Graph(id) => match graph.get(*id) {
                    Some(dev) => dev.clone(),
                    None => continue,
                },
                Target::Local(index) => virtuals[*index].clone(),
            };

            let Some(mountpoint) = dev.format.mountpoint.clone() else {
                continue;
            };
            if !dev.format.mountable() {
                continue;
            }
            if skip_root && mountpoint == "/" {
                continue;
            }
            if dev.format.options.split(',').any(|opt| opt == "noauto") {
                continue;
            }

            if let Err(err) = ops.setup(&dev) {
                warn!("unable to set up device {}: {err}", dev.name);
                match on_error(&err) {
                    ErrorDecision::Raise => return Err(err),
                    ErrorDecision::Continue => continue,
                }
            }

            let mut options = if dev.format.options.is_empty() {
                "defaults".to_string()
            } else {
                dev.format.options.clone()
            };
            if let Some(read_only) = read_only {
                options = format!("{options},{read_only}");
            }

            let at = chroot_path(root_path, &mountpoint);
            if let Err(err) = ops.mount(&dev, &at, &options) {
                error!("error mounting {} on {mountpoint}: {err}", dev.path);
                if on_error(&err) == ErrorDecision::Raise {
                    return Err(err);
                }
            }
        }

        self.active = true;

        Ok(())
    }

    /// Unmount everything in reverse mount order. Swap is deactivated
    /// only when `swapoff` is set.
    pub fn umount_filesystems(
        &mut self,
        graph: &DeviceGraph,
        ops: &mut dyn DeviceOps,
        session: &Session,
        swapoff: bool,
    ) -> Result<(), StorageError> {
        if !session.installer_mode {
            return Ok(());
        }

        let virtuals = self.virtual_devices(session);
        let mut order = self.mount_order(graph, &virtuals);
        order.reverse();

        for target in order {
            let dev = match &target {
                Target::Graph(id) => match graph.get(*id) {
                    Some(dev) => dev.clone(),
                    None => continue,
                },
                Target::Local(index) => virtuals[*index].clone(),
            };

            if dev.format.is("swap") {
                if swapoff {
                    ops.swap_off(&dev)?;
                }
                continue;
            }

            if !dev.format.mountable() || dev.format.mountpoint.is_none() {
                continue;
            }

            ops.unmount(&dev)?;
        }

        self.active = false;

        Ok(())
    }

    /// Create and activate a swap file on the filesystem mounted by
    /// `device`, under a name no existing file or device claims.
    pub fn create_swap_file(
        &mut self,
        graph: &mut DeviceGraph,
        ops: &mut dyn DeviceOps,
        session: &Session,
        device: DeviceId,
        size: u64,
    ) -> Result<(), StorageError> {
        if !session.installer_mode {
            return Ok(());
        }

        let mountpoint = graph
            .get(device)
            .and_then(|d| d.format.mountpoint.clone())
            .ok_or_else(|| StorageError::DeviceOp {
                op: "create_swap_file",
                device: format!("{device:?}"),
                reason: "device has no mountpoint".to_string(),
            })?;

        let basedir = chroot_path(&session.physical_root, &mountpoint);
        let mut filename = String::from("/SWAP");
        let mut count = 0;
        while basedir.join(filename.trim_start_matches('/')).exists()
            || graph.get_by_name(&filename).is_some()
        {
            count += 1;
            filename = format!("/SWAP-{count}");
        }

        let mut swap = Device::new(&filename, &filename, DeviceKind::File, Format::new("swap"));
        swap.parents = vec![device];
        swap.exists = false;
        swap.size = size;

        ops.create(&swap)?;
        swap.exists = true;
        ops.setup(&swap)?;
        ops.format_create(&swap)?;
        swap.format.exists = true;
        ops.swap_on(&swap)?;

        graph.add(swap)?;

        Ok(())
    }

    /// Add a swap device to the set emitted into fstab during
    /// installation. Discovered and newly created swap have different
    /// persistence intent, so callers opt devices in explicitly.
    pub fn add_fstab_swap(&mut self, device: DeviceId) {
        self.fstab_swaps.insert(device);
    }

    pub fn remove_fstab_swap(&mut self, device: DeviceId) {
        self.fstab_swaps.remove(&device);
    }

    pub fn set_fstab_swaps(&mut self, devices: &[DeviceId]) {
        self.fstab_swaps = devices.iter().copied().collect();
    }

    /// Render the fstab contents for the current mount set.
    pub fn fstab(&self, graph: &DeviceGraph, session: &Session) -> String {
        let now = chrono::Local::now().format("%a %b %e %H:%M:%S %Y");
        let mut fstab = format!(
            "\n\
             #\n\
             # /etc/fstab\n\
             # Created by anaconda on {now}\n\
             #\n\
             # Accessible filesystems, by reference, are maintained under '/dev/disk'\n\
             # See man pages fstab(5), findfs(8), mount(8) and/or blkid(8) for more info\n\
             #\n"
        );

        let mut mounts: Vec<(String, DeviceId)> = self.mountpoints(graph).into_iter().collect();
        mounts.sort_by(|a, b| a.0.cmp(&b.0));
        let mut devices: Vec<DeviceId> = mounts.into_iter().map(|(_, id)| id).collect();

        let swaps = self.swap_devices(graph);
        if session.installer_mode {
            devices.extend(swaps.iter().copied().filter(|id| self.fstab_swaps.contains(id)));
        } else {
            devices.extend(swaps.iter().copied());
        }

        let netdevs: Vec<DeviceId> = graph
            .iter()
            .filter(|(_, d)| d.is_network())
            .map(|(id, _)| id)
            .collect();
        let root_on_netdev = devices
            .first()
            .map(|root| netdevs.iter().any(|net| graph.depends_on(*root, *net)))
            .unwrap_or(false);

        for id in devices {
            let Some(dev) = graph.get(id) else { continue };

            let is_swap = dev.format.is("swap");
            if !dev.format.mountable() && !is_swap {
                continue;
            }
            if matches!(dev.kind, DeviceKind::Optical) {
                continue;
            }

            let fstype = dev.format.mount_type().unwrap_or("auto").to_string();
            let mountpoint = if is_swap {
                "swap".to_string()
            } else {
                match &dev.format.mountpoint {
                    Some(mountpoint) => mountpoint.clone(),
                    None => {
                        warn!("{fstype} filesystem on {} has no mountpoint", dev.path);
                        continue;
                    }
                }
            };

            let mut options = if dev.format.options.is_empty() {
                "defaults".to_string()
            } else {
                dev.format.options.clone()
            };
            for net in &netdevs {
                if graph.depends_on(id, *net) || id == *net {
                    if root_on_netdev && mountpoint == "/var" {
                        options.push_str(",x-initrd.mount");
                    }
                    break;
                }
            }
            if graph.encrypted(id) {
                options.push_str(",x-systemd.device-timeout=0");
            }

            let devspec = dev.fstab_spec();
            let dump = dev.format.dump() as u8;
            let passno = if dev.format.check() && mountpoint == "/" {
                1
            } else if dev.format.check() {
                2
            } else {
                0
            };

            fstab.push_str(&format!(
                "{devspec:<23} {mountpoint:<23} {fstype:<7} {options:<15} {dump} {passno}\n"
            ));
        }

        // lines we could not interpret go back out untouched, in order
        for line in &self.preserve_lines {
            fstab.push_str(line);
        }

        fstab
    }

    /// Render crypttab, populating from the device graph when no table
    /// was parsed and pruning to mappings the mount set reaches.
    pub fn crypttab(&mut self, graph: &DeviceGraph) -> String {
        if self.key_map.is_none() {
            let mut table = KeyMapTable::new();
            table.populate(graph);
            self.key_map = Some(table);
        }

        let mut live: Vec<DeviceId> = self.mountpoints(graph).into_values().collect();
        live.extend(self.swap_devices(graph));

        let Some(table) = self.key_map.as_mut() else {
            return String::new();
        };
        table.prune(graph, &live);
        table.render(graph)
    }

    /// Render mdadm.conf, or an empty string when no arrays exist.
    ///
    /// Arrays are emitted in path order, which puts containers (md0,
    /// md1, ...) ahead of their members (md127, md126, ...); mdadm will
    /// not assemble the stack unless the conf lists them that way.
    pub fn mdadm_conf(&self, graph: &DeviceGraph) -> String {
        let mut arrays: Vec<(String, DeviceId)> = graph
            .iter()
            .filter(|(_, d)| matches!(d.kind, DeviceKind::Md(_)))
            .map(|(id, d)| (d.path.clone(), id))
            .collect();
        arrays.sort_by(|a, b| a.0.cmp(&b.0));

        if arrays.is_empty() {
            return String::new();
        }

        let mut conf = String::from(
            "# mdadm.conf written out by anaconda\nMAILADDR root\nAUTO +imsm +1.x -all\n",
        );

        let mut live: Vec<DeviceId> = self.mountpoints(graph).into_values().collect();
        live.extend(self.swap_devices(graph));

        for (path, array) in arrays {
            let used = live
                .iter()
                .any(|dev| *dev == array || graph.depends_on(*dev, array));
            if !used {
                continue;
            }

            if let Some(DeviceKind::Md(info)) = graph.get(array).map(|d| &d.kind) {
                conf.push_str(&info.conf_entry(&path));
            }
        }

        conf
    }

    /// Write fstab, crypttab and mdadm.conf under the session sysroot.
    pub fn write(&mut self, graph: &DeviceGraph, session: &Session) -> Result<(), StorageError> {
        let etc = session.sysroot.join("etc");
        fs::create_dir_all(&etc).map_err(|err| StorageError::Io {
            path: etc.display().to_string(),
            source: err,
        })?;

        let fstab_path = etc.join("fstab");
        fs::write(&fstab_path, self.fstab(graph, session)).map_err(|err| StorageError::Io {
            path: fstab_path.display().to_string(),
            source: err,
        })?;

        // crypttab may carry key file paths; keep it root-only
        let crypttab = self.crypttab(graph);
        let crypttab_path = etc.join("crypttab");
        let io_err = |err| StorageError::Io {
            path: crypttab_path.display().to_string(),
            source: err,
        };
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&crypttab_path)
            .map_err(io_err)?;
        file.write_all(crypttab.as_bytes()).map_err(|err| StorageError::Io {
            path: crypttab_path.display().to_string(),
            source: err,
        })?;

        let mdadm = self.mdadm_conf(graph);
        if !mdadm.is_empty() {
            let mdadm_path = etc.join("mdadm.conf");
            fs::write(&mdadm_path, mdadm).map_err(|err| StorageError::Io {
                path: mdadm_path.display().to_string(),
                source: err,
            })?;
        }

        Ok(())
    }
}

/// Write escrow packets for every encrypted device carrying an escrow
/// certificate. Strictly best-effort: failures are logged, never raised.
pub fn write_escrow_packets(
    graph: &DeviceGraph,
    ops: &mut dyn DeviceOps,
    session: &Session,
    backup_passphrase: &str,
) {
    let escrow_devices: Vec<DeviceId> = graph
        .iter()
        .filter(|(_, d)| d.format.is("luks") && d.format.escrow_cert.is_some())
        .map(|(id, _)| id)
        .collect();

    if escrow_devices.is_empty() {
        return;
    }

    debug!("escrow: write_escrow_packets start");

    let escrow_dir = session.sysroot.join("root");
    if let Err(err) = fs::create_dir_all(&escrow_dir) {
        error!("failed to store encryption key: {err}");
        return;
    }

    for id in escrow_devices {
        let Some(dev) = graph.get(id) else { continue };
        debug!("escrow: device {} ({:?})", dev.path, dev.format.kind);
        if let Err(err) = ops.escrow(dev, &escrow_dir, backup_passphrase) {
            error!("failed to store encryption key: {err}");
        }
    }

    debug!("escrow: write_escrow_packets done");
}
