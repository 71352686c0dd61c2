//! Fencing actions: make sure no more writes reach shared storage from this
//! host once its lease can no longer be proven.

use std::io;
use std::process::{Command, Stdio};

use crate::utils::SafeleaseError;

use tokio::time::Duration;

/// Host self-protection actions invoked on entering the fencing state.
///
/// Every action must return promptly: it only launches (or signals) and
/// never waits on anything that may be stuck behind the same storage path.
pub trait Fencer: Send + Sync {
    /// Arranges a forced reboot after `grace`.
    fn schedule_reboot(&self, grace: Duration) -> Result<(), SafeleaseError>;

    /// Starts stopping the local dependent service, giving up after `grace`.
    fn stop_service(
        &self,
        service: &str,
        grace: Duration,
    ) -> Result<(), SafeleaseError>;

    /// Delivers `signal` to process (group, if `pid` is negative) `pid`.
    fn signal_process(
        &self,
        pid: i32,
        signal: i32,
    ) -> Result<(), SafeleaseError>;
}

/// Fencer driving the host's own reboot and service-manager commands.
#[derive(Debug, Clone)]
pub struct SystemFencer {
    /// Shell command line that reboots the host immediately.
    reboot_cmd: String,

    /// Shell command prefix that stops a service given its name.
    stop_service_cmd: String,
}

impl SystemFencer {
    pub fn new(reboot_cmd: &str, stop_service_cmd: &str) -> Self {
        SystemFencer {
            reboot_cmd: reboot_cmd.into(),
            stop_service_cmd: stop_service_cmd.into(),
        }
    }

    /// Launches `script` under `sh -c`, detached from our stdio, without
    /// waiting. The child outlives us if we exit first.
    fn launch(script: &str) -> Result<(), SafeleaseError> {
        pf_debug!("launching '{}'", script);
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(())
    }
}

impl Fencer for SystemFencer {
    fn schedule_reboot(&self, grace: Duration) -> Result<(), SafeleaseError> {
        Self::launch(&format!(
            "sleep {}; {}",
            grace.as_secs(),
            self.reboot_cmd
        ))
    }

    fn stop_service(
        &self,
        service: &str,
        grace: Duration,
    ) -> Result<(), SafeleaseError> {
        Self::launch(&format!(
            "timeout {} {} {}",
            grace.as_secs().max(1),
            self.stop_service_cmd,
            service
        ))
    }

    fn signal_process(
        &self,
        pid: i32,
        signal: i32,
    ) -> Result<(), SafeleaseError> {
        // SAFETY: kill() has no memory-safety preconditions
        if unsafe { libc::kill(pid, signal) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }
}
