use std::fs;
use std::path::Path;

use log::debug;

use crate::device::{DeviceGraph, DeviceId};
use crate::errors::StorageError;
use crate::resolve::SpecLookup;
use crate::tabs::TagTable;

/// One named encrypted-volume mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyMapping {
    pub device: DeviceId,
    pub key_file: String,
    pub options: String,
}

/// Table of crypttab mappings keyed by unique mapping name, in original
/// (or discovery) order.
#[derive(Debug, Default)]
pub struct KeyMapTable {
    entries: Vec<(String, KeyMapping)>,
}

impl KeyMapTable {
    pub fn new() -> Self {
        KeyMapTable::default()
    }

    /// Parse `<root>/etc/crypttab`, resolving each devspec through the
    /// device-resolution interface. Mappings whose backing device cannot
    /// be resolved are dropped; that loss is this table's contract.
    pub fn parse(
        root: &Path,
        graph: &DeviceGraph,
        lookup: &dyn SpecLookup,
        tags: Option<&TagTable>,
    ) -> Result<Self, StorageError> {
        let path = root.join("etc/crypttab");
        debug!("parsing {}", path.display());

        let text = fs::read_to_string(&path).map_err(|err| StorageError::Io {
            path: path.display().to_string(),
            source: err,
        })?;

        let mut table = KeyMapTable::new();
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or("");
            let fields: Vec<&str> = line.split_whitespace().collect();
            if !(2..=4).contains(&fields.len()) {
                continue;
            }

            let name = fields[0];
            let devspec = fields[1];
            let key_file = fields.get(2).copied().unwrap_or("none");
            let options = fields.get(3).copied().unwrap_or("");

            match lookup.resolve(graph, devspec, None, tags, "") {
                Some(device) => table.insert(
                    name.to_string(),
                    KeyMapping {
                        device,
                        key_file: key_file.to_string(),
                        options: options.to_string(),
                    },
                ),
                None => {
                    debug!("dropping crypttab mapping {name}: cannot resolve {devspec}");
                }
            }
        }

        Ok(table)
    }

    /// Populate from the device graph instead of a file: one mapping per
    /// encrypted-volume device, using the format's own mapping name.
    pub fn populate(&mut self, graph: &DeviceGraph) {
        for (id, dev) in graph.iter() {
            if !dev.format.is("luks") {
                continue;
            }

            let Some(map_name) = dev.format.map_name.clone() else {
                debug!("luks device {} has no mapping name", dev.name);
                continue;
            };

            let key_file = dev
                .format
                .key_file
                .clone()
                .filter(|k| !k.is_empty())
                .unwrap_or_else(|| "none".to_string());

            self.insert(
                map_name,
                KeyMapping {
                    device: id,
                    key_file,
                    options: dev.format.options.clone(),
                },
            );
        }
    }

    pub fn get(&self, name: &str) -> Option<&KeyMapping> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, m)| m)
    }

    pub fn insert(&mut self, name: String, mapping: KeyMapping) {
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = mapping,
            None => self.entries.push((name, mapping)),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &KeyMapping)> {
        self.entries.iter().map(|(n, m)| (n.as_str(), m))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop mappings not backing any of the `live` devices. Keeps the
    /// emitted crypttab minimal.
    pub fn prune(&mut self, graph: &DeviceGraph, live: &[DeviceId]) {
        self.entries.retain(|(_, mapping)| {
            live.iter()
                .any(|dev| *dev == mapping.device || graph.depends_on(*dev, mapping.device))
        });
    }

    /// Serialize in `name UUID=<uuid> keyfile options` form.
    pub fn render(&self, graph: &DeviceGraph) -> String {
        let mut out = String::new();
        for (name, mapping) in &self.entries {
            let uuid = graph
                .get(mapping.device)
                .and_then(|d| d.format.uuid.clone())
                .unwrap_or_default();

            out.push_str(&format!(
                "{name} UUID={uuid} {} {}\n",
                mapping.key_file, mapping.options
            ));
        }

        out
    }
}
