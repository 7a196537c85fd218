use log::info;

use crate::errors::StorageError;
use crate::ops::DeviceOps;

use super::{Device, DeviceId};

/// Ordered set of devices, owned in one place and addressed by id.
///
/// The graph assumes exclusive ownership by one resolver/plan pipeline at
/// a time; nothing here is synchronized.
#[derive(Debug, Default)]
pub struct DeviceGraph {
    next: u32,
    entries: Vec<(DeviceId, Device)>,
}

impl DeviceGraph {
    pub fn new() -> Self {
        DeviceGraph::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (DeviceId, &Device)> {
        self.entries.iter().map(|(id, dev)| (*id, dev))
    }

    pub fn ids(&self) -> Vec<DeviceId> {
        self.entries.iter().map(|(id, _)| *id).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: DeviceId) -> Option<&Device> {
        self.entries
            .iter()
            .find(|(did, _)| *did == id)
            .map(|(_, dev)| dev)
    }

    pub fn get_mut(&mut self, id: DeviceId) -> Option<&mut Device> {
        self.entries
            .iter_mut()
            .find(|(did, _)| *did == id)
            .map(|(_, dev)| dev)
    }

    /// Add a device. Device names are the graph's identity; a second
    /// device under an existing name is rejected, not merged.
    pub fn add(&mut self, device: Device) -> Result<DeviceId, StorageError> {
        if self.get_by_name(&device.name).is_some() {
            return Err(StorageError::DuplicateDevice(device.name));
        }

        let id = DeviceId(self.next);
        self.next += 1;
        self.entries.push((id, device));

        Ok(id)
    }

    pub fn remove(&mut self, id: DeviceId) {
        self.entries.retain(|(did, _)| *did != id);
    }

    pub fn get_by_name(&self, name: &str) -> Option<DeviceId> {
        self.iter().find(|(_, d)| d.name == name).map(|(id, _)| id)
    }

    pub fn get_by_path(&self, path: &str) -> Option<DeviceId> {
        self.iter().find(|(_, d)| d.path == path).map(|(id, _)| id)
    }

    pub fn get_by_uuid(&self, uuid: &str) -> Option<DeviceId> {
        self.iter()
            .find(|(_, d)| d.format.uuid.as_deref() == Some(uuid))
            .map(|(id, _)| id)
    }

    pub fn get_by_label(&self, label: &str) -> Option<DeviceId> {
        self.iter()
            .find(|(_, d)| d.format.label.as_deref() == Some(label))
            .map(|(id, _)| id)
    }

    /// Devices with no dependents.
    pub fn leaves(&self) -> Vec<DeviceId> {
        self.ids()
            .into_iter()
            .filter(|id| !self.entries.iter().any(|(_, d)| d.parents.contains(id)))
            .collect()
    }

    /// True if `ancestor` is reachable through `id`'s parent chain.
    pub fn depends_on(&self, id: DeviceId, ancestor: DeviceId) -> bool {
        let mut stack: Vec<DeviceId> = match self.get(id) {
            Some(dev) => dev.parents.clone(),
            None => return false,
        };

        while let Some(current) = stack.pop() {
            if current == ancestor {
                return true;
            }

            if let Some(dev) = self.get(current) {
                stack.extend(dev.parents.iter().copied());
            }
        }

        false
    }

    /// True if the device or anything beneath it is an encrypted volume.
    pub fn encrypted(&self, id: DeviceId) -> bool {
        if self.get(id).map(|d| d.format.is("luks")).unwrap_or(false) {
            return true;
        }

        self.iter()
            .filter(|(did, d)| d.format.is("luks") && *did != id)
            .any(|(did, _)| self.depends_on(id, did))
    }

    pub fn ids_by_path(&self) -> Vec<DeviceId> {
        let mut ids: Vec<(String, DeviceId)> = self
            .iter()
            .map(|(id, d)| (d.path.clone(), id))
            .collect();
        ids.sort_by(|a, b| a.0.cmp(&b.0));

        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Tear every device down, leaves first so dependents release their
    /// parents before the parents go away. Failures are logged and the
    /// sweep continues.
    pub fn teardown_all(&self, ops: &mut dyn DeviceOps) {
        for id in self.teardown_order() {
            if let Some(dev) = self.get(id) {
                if let Err(err) = ops.teardown(dev) {
                    info!("teardown of {} failed: {err}", dev.name);
                }
            }
        }
    }

    fn teardown_order(&self) -> Vec<DeviceId> {
        let mut remaining = self.ids();
        let mut order = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let layer: Vec<DeviceId> = remaining
                .iter()
                .copied()
                .filter(|id| {
                    !remaining.iter().any(|other| {
                        self.get(*other)
                            .map(|d| d.parents.contains(id))
                            .unwrap_or(false)
                    })
                })
                .collect();

            if layer.is_empty() {
                // parent cycle; flush what is left rather than spin
                order.extend(remaining);
                break;
            }

            for id in layer {
                order.push(id);
                remaining.retain(|r| *r != id);
            }
        }

        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceKind, Format};

    fn dev(name: &str, path: &str) -> Device {
        Device::new(name, path, DeviceKind::Partition, Format::new("ext4"))
    }

    #[test]
    fn test_add_duplicate() {
        let mut graph = DeviceGraph::new();
        graph.add(dev("sda1", "/dev/sda1")).unwrap();

        let err = graph.add(dev("sda1", "/dev/sda1")).unwrap_err();
        assert!(matches!(err, StorageError::DuplicateDevice(_)));
    }

    #[test]
    fn test_depends_on_and_leaves() {
        let mut graph = DeviceGraph::new();
        let disk = graph
            .add(Device::new("sda", "/dev/sda", DeviceKind::Disk, Format::default()))
            .unwrap();

        let mut part = dev("sda1", "/dev/sda1");
        part.parents = vec![disk];
        let part = graph.add(part).unwrap();

        assert!(graph.depends_on(part, disk));
        assert!(!graph.depends_on(disk, part));
        assert_eq!(graph.leaves(), vec![part]);
    }

    #[test]
    fn test_encrypted_through_parent() {
        let mut graph = DeviceGraph::new();

        let mut luks = Device::new("sda2", "/dev/sda2", DeviceKind::Partition, Format::new("luks"));
        luks.format.uuid = Some("abcd".to_string());
        let luks = graph.add(luks).unwrap();

        let mut mapped = Device::new(
            "luks-1",
            "/dev/mapper/luks-1",
            DeviceKind::DmCrypt,
            Format::new("ext4"),
        );
        mapped.parents = vec![luks];
        let mapped = graph.add(mapped).unwrap();

        assert!(graph.encrypted(mapped));
        assert!(graph.encrypted(luks));

        let plain = graph.add(dev("sda1", "/dev/sda1")).unwrap();
        assert!(!graph.encrypted(plain));
    }
}
