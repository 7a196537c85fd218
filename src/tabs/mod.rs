pub mod blkid;
pub mod crypttab;

pub use blkid::TagTable;
pub use crypttab::{KeyMapTable, KeyMapping};

use std::path::Path;

use log::{debug, info};

use crate::device::DeviceGraph;
use crate::resolve::SpecLookup;

/// Load both identification tables from under `root`. Either table may be
/// missing or broken; parsing this pair is always best-effort.
pub fn load(
    root: &Path,
    graph: &DeviceGraph,
    lookup: &dyn SpecLookup,
) -> (Option<TagTable>, Option<KeyMapTable>) {
    let tags = match TagTable::parse(root) {
        Ok(table) => {
            debug!(
                "blkid.tab devs: {:?}",
                table.device_paths().collect::<Vec<_>>()
            );
            Some(table)
        }
        Err(err) => {
            info!("error parsing blkid.tab: {err}");
            None
        }
    };

    let key_map = match KeyMapTable::parse(root, graph, lookup, tags.as_ref()) {
        Ok(table) => {
            debug!("crypttab maps: {:?}", table.names().collect::<Vec<_>>());
            Some(table)
        }
        Err(err) => {
            info!("error parsing crypttab: {err}");
            None
        }
    };

    (tags, key_map)
}
