use std::io;
use std::process::ExitStatus;
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// Supervises the traced command.
#[derive(Debug)]
pub struct Runner {
    child: Child,
    pid: i32,
}

impl Runner {
    /// Launch the command and capture its pid.
    pub fn spawn(command: &[String]) -> io::Result<Self> {
        let Some((program, args)) = command.split_first() else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no command provided to run",
            ));
        };
        let mut child = Command::new(program).args(args).spawn()?;
        let Some(pid) = child.id() else {
            return Err(io::Error::other("command exited before its pid was read"));
        };
        let pid = pid as i32;
        info!(pid, program = %program, "started traced command");
        Ok(Self { child, pid })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Wait for the traced command to exit.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Terminate the command if it is still running.
    pub async fn cleanup(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            warn!(pid = self.pid, "terminating traced command");
            if let Err(err) = self.child.kill().await {
                warn!(pid = self.pid, error = ?err, "failed to kill traced command");
            }
        }
    }
}
