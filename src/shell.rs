use std::process::Command;

use crate::errors::StorageError;

/// Run a command and capture stdout. Non-zero exit is an error.
pub fn exec_capture(cmd: &str, args: &[&str]) -> Result<String, StorageError> {
    let output = Command::new(cmd)
        .args(args)
        .output()
        .map_err(|err| StorageError::CmdFailed {
            command: cmd.to_string(),
            reason: format!("failed to spawn: {err}"),
        })?;

    if !output.status.success() {
        return Err(StorageError::CmdFailed {
            command: cmd.to_string(),
            reason: format!("exited with {}", output.status),
        });
    }

    String::from_utf8(output.stdout).map_err(|err| StorageError::CmdFailed {
        command: cmd.to_string(),
        reason: format!("output not utf-8: {err}"),
    })
}
