use std::collections::HashMap;
use std::fs;
use std::path::Path;

use log::debug;

use crate::errors::StorageError;

/// Table of device identification attributes keyed by device path, read
/// from the legacy blkid.tab dump. Immutable once parsed.
#[derive(Debug, Default)]
pub struct TagTable {
    devices: HashMap<String, HashMap<String, String>>,
}

impl TagTable {
    /// Parse `<root>/etc/blkid/blkid.tab`.
    ///
    /// Only the file read can fail; malformed content degrades to a
    /// sparser table instead of erroring.
    pub fn parse(root: &Path) -> Result<Self, StorageError> {
        let path = root.join("etc/blkid/blkid.tab");
        debug!("parsing {}", path.display());

        let text = fs::read_to_string(&path).map_err(|err| StorageError::Io {
            path: path.display().to_string(),
            source: err,
        })?;

        Ok(Self::parse_str(&text))
    }

    // The dump is pseudo-XML, one <device ...>path</device> per line. A
    // real XML parser is more work than this format justifies.
    fn parse_str(text: &str) -> Self {
        let mut devices = HashMap::new();

        for line in text.lines() {
            let Some(rest) = line.strip_prefix("<device ") else {
                continue;
            };
            let rest = rest.strip_suffix("</device>").unwrap_or(rest);

            let Some((data, device)) = rest.split_once('>') else {
                continue;
            };
            if device.is_empty() {
                continue;
            }

            let mut attrs = HashMap::new();
            for pair in data.split_whitespace() {
                let Some((key, value)) = pair.split_once('=') else {
                    continue;
                };

                // strip exactly one character off each end, quoted or
                // not; multibyte junk must degrade, never panic
                let mut chars = value.chars();
                chars.next();
                chars.next_back();
                attrs.insert(key.to_string(), chars.as_str().to_string());
            }

            devices.insert(device.to_string(), attrs);
        }

        TagTable { devices }
    }

    pub fn get(&self, device_path: &str) -> Option<&HashMap<String, String>> {
        self.devices.get(device_path)
    }

    pub fn device_paths(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }
}
