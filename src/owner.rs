//! Resolve which device in the graph contains a filesystem path.

use std::fs;
use std::path::Path;

use log::debug;
use nix::sys::stat;

use crate::device::{DeviceGraph, DeviceId};

pub trait PathOwner {
    /// The device backing `path`, or `None` when the path does not exist
    /// or any step of the lookup chain fails. Never errors.
    fn containing_device(&self, path: &Path, graph: &DeviceGraph) -> Option<DeviceId>;
}

/// Kernel-backed lookup: stat the path, follow the device-number symlink
/// under /sys/dev/block, and translate device-mapper nodes to their
/// logical names.
pub struct SysPathOwner;

impl PathOwner for SysPathOwner {
    fn containing_device(&self, path: &Path, graph: &DeviceGraph) -> Option<DeviceId> {
        let st = stat::stat(path).ok()?;
        let (major, minor) = (stat::major(st.st_dev), stat::minor(st.st_dev));

        let link = format!("/sys/dev/block/{major}:{minor}");
        if !Path::new(&link).exists() {
            return None;
        }

        let target = match fs::read_link(&link) {
            Ok(t) => t,
            Err(err) => {
                debug!("failed to find device name for path {}: {err}", path.display());
                return None;
            }
        };

        let mut node = target.file_name()?.to_str()?.to_string();
        if node.starts_with("dm-") {
            node = fs::read_to_string(format!("/sys/block/{node}/dm/name"))
                .ok()?
                .trim()
                .to_string();
        }

        graph.get_by_name(&node)
    }
}
