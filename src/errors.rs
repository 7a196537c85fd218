use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("cannot read {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{mountpoint}: detected as {detected}, fstab says {declared}")]
    FstabTypeMismatch {
        mountpoint: String,
        detected: String,
        declared: String,
    },

    #[error("device {0} already exists in the device graph")]
    DuplicateDevice(String),

    #[error("no such device {0}")]
    NoSuchDevice(String),

    #[error("{op} failed on {device}: {reason}")]
    DeviceOp {
        op: &'static str,
        device: String,
        reason: String,
    },

    #[error("command {command} failed: {reason}")]
    CmdFailed { command: String, reason: String },
}
