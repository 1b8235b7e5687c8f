//! Node power control.

use std::process::Command;
use std::thread;
use std::time::Duration;

use havoc::protocol::OperationResult;

use crate::error::{CommandError, CommandResult};

/// Lets the acknowledgment reach the caller before the host goes down.
const POWER_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Shutdown,
    Restart,
}

impl PowerAction {
    fn command(self) -> Command {
        let flag = match (self, cfg!(windows)) {
            (Self::Shutdown, true) => "/p",
            (Self::Restart, true) => "/r",
            (Self::Shutdown, false) => "-h",
            (Self::Restart, false) => "-r",
        };
        let mut cmd = Command::new("shutdown");
        if cfg!(windows) {
            cmd.args([flag, "/f"]);
        } else {
            cmd.args([flag, "now"]);
        }
        cmd
    }

    fn acknowledgment(self) -> &'static str {
        match self {
            Self::Shutdown => "Node is shut down",
            Self::Restart => "Node is restarted",
        }
    }
}

pub fn shutdown_node() -> CommandResult<OperationResult> {
    power(PowerAction::Shutdown)
}

pub fn restart_node() -> CommandResult<OperationResult> {
    power(PowerAction::Restart)
}

fn power(action: PowerAction) -> CommandResult<OperationResult> {
    thread::Builder::new()
        .name("havoc-power".to_string())
        .spawn(move || {
            thread::sleep(POWER_GRACE);
            tracing::warn!("Running {:?}", action);
            match action.command().status() {
                Ok(status) if status.success() => {}
                Ok(status) => tracing::error!("{:?} exited with {}", action, status),
                Err(e) => tracing::error!("{:?} failed: {}", action, e),
            }
        })
        .map_err(|e| CommandError::Unexpected(format!("Failed to schedule {:?}: {}", action, e)))?;

    Ok(OperationResult::success(action.acknowledgment()))
}
