//! Side-effecting device and format operations.
//!
//! The reconciliation core decides *what* to do and in what order; the
//! actual mounting, activation and teardown belong to the surrounding
//! system. Callers hand in an implementation of [`DeviceOps`]; tests use
//! the recording mock from [`testing`].

use std::path::Path;

use crate::device::Device;
use crate::errors::StorageError;

/// What the failure-decision callback tells us to do with a mount/setup
/// error: abort the whole operation, or skip the device and continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDecision {
    Raise,
    Continue,
}

pub trait DeviceOps {
    /// Activate the device (open mappings, assemble arrays, ...).
    fn setup(&mut self, device: &Device) -> Result<(), StorageError>;

    /// Deactivate the device.
    fn teardown(&mut self, device: &Device) -> Result<(), StorageError>;

    /// Create the backing object for a not-yet-existing device (e.g. a
    /// swap file).
    fn create(&mut self, device: &Device) -> Result<(), StorageError>;

    /// Write the device's format to disk (mkswap and friends).
    fn format_create(&mut self, device: &Device) -> Result<(), StorageError>;

    fn mount(
        &mut self,
        device: &Device,
        mountpoint: &Path,
        options: &str,
    ) -> Result<(), StorageError>;

    fn unmount(&mut self, device: &Device) -> Result<(), StorageError>;

    /// Force-unmount a path regardless of which device backs it. Used to
    /// clear the discovery staging root after a half-failed mount.
    fn unmount_path(&mut self, mountpoint: &Path) -> Result<(), StorageError>;

    fn swap_on(&mut self, device: &Device) -> Result<(), StorageError>;

    fn swap_off(&mut self, device: &Device) -> Result<(), StorageError>;

    /// Probe whether the device actually mounts as `fstype`. Only called
    /// for formats whose registry class supports it.
    fn trial_mount(&mut self, device: &Device, fstype: &str) -> bool;

    /// Write an escrow packet for an encrypted device.
    fn escrow(
        &mut self,
        device: &Device,
        dir: &Path,
        passphrase: &str,
    ) -> Result<(), StorageError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::{HashMap, HashSet};
    use std::path::Path;

    use super::*;

    /// Records every operation as a flat string and lets tests inject
    /// failures per device name.
    #[derive(Default)]
    pub struct RecordingOps {
        pub events: Vec<String>,
        pub fail_setup: HashSet<String>,
        pub fail_mount: HashSet<String>,
        pub fail_swap_on: HashSet<String>,
        pub trial_results: HashMap<String, bool>,
    }

    impl RecordingOps {
        pub fn new() -> Self {
            RecordingOps::default()
        }

        fn fail(op: &'static str, device: &Device) -> StorageError {
            StorageError::DeviceOp {
                op,
                device: device.name.clone(),
                reason: "injected failure".to_string(),
            }
        }
    }

    impl DeviceOps for RecordingOps {
        fn setup(&mut self, device: &Device) -> Result<(), StorageError> {
            self.events.push(format!("setup {}", device.name));
            if self.fail_setup.contains(&device.name) {
                return Err(Self::fail("setup", device));
            }
            Ok(())
        }

        fn teardown(&mut self, device: &Device) -> Result<(), StorageError> {
            self.events.push(format!("teardown {}", device.name));
            Ok(())
        }

        fn create(&mut self, device: &Device) -> Result<(), StorageError> {
            self.events.push(format!("create {}", device.name));
            Ok(())
        }

        fn format_create(&mut self, device: &Device) -> Result<(), StorageError> {
            self.events.push(format!("format_create {}", device.name));
            Ok(())
        }

        fn mount(
            &mut self,
            device: &Device,
            mountpoint: &Path,
            options: &str,
        ) -> Result<(), StorageError> {
            self.events.push(format!(
                "mount {} {} {options}",
                device.name,
                mountpoint.display()
            ));
            if self.fail_mount.contains(&device.name) {
                return Err(Self::fail("mount", device));
            }
            Ok(())
        }

        fn unmount(&mut self, device: &Device) -> Result<(), StorageError> {
            self.events.push(format!("unmount {}", device.name));
            Ok(())
        }

        fn unmount_path(&mut self, mountpoint: &Path) -> Result<(), StorageError> {
            self.events
                .push(format!("unmount_path {}", mountpoint.display()));
            Ok(())
        }

        fn swap_on(&mut self, device: &Device) -> Result<(), StorageError> {
            self.events.push(format!("swap_on {}", device.name));
            if self.fail_swap_on.contains(&device.name) {
                // fail once, then let a retry succeed
                self.fail_swap_on.remove(&device.name);
                return Err(Self::fail("swap_on", device));
            }
            Ok(())
        }

        fn swap_off(&mut self, device: &Device) -> Result<(), StorageError> {
            self.events.push(format!("swap_off {}", device.name));
            Ok(())
        }

        fn trial_mount(&mut self, device: &Device, fstype: &str) -> bool {
            self.events
                .push(format!("trial_mount {} {fstype}", device.name));
            self.trial_results.get(&device.name).copied().unwrap_or(false)
        }

        fn escrow(
            &mut self,
            device: &Device,
            dir: &Path,
            _passphrase: &str,
        ) -> Result<(), StorageError> {
            self.events
                .push(format!("escrow {} {}", device.name, dir.display()));
            Ok(())
        }
    }
}
