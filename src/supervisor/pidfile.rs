//! Pid files: how the stop utility finds the running supervisor, and how
//! fencing finds the dependent service.

use std::fs;
use std::path::Path;

use crate::utils::{ErrorKind, SafeleaseError};

/// Records this process's pid into `path`.
pub fn write_pid_file(path: &Path) -> Result<(), SafeleaseError> {
    fs::write(path, format!("{}\n", std::process::id()))?;
    Ok(())
}

/// Reads a pid out of `path`. A negative value `-pgid` names a process
/// group; 0 and -1 are rejected since `kill()` reads them as "our own
/// group" and "every process".
pub fn read_pid_file(path: &Path) -> Result<i32, SafeleaseError> {
    let content = fs::read_to_string(path).map_err(|e| {
        SafeleaseError::new(
            ErrorKind::Io,
            format!("error reading pid file '{}': {}", path.display(), e),
        )
    })?;
    let pid: i32 = content.trim().parse()?;
    if pid == 0 || pid == -1 {
        return Err(SafeleaseError::new(
            ErrorKind::InvalidParameters,
            format!("invalid pid {} in '{}'", pid, path.display()),
        ));
    }
    Ok(pid)
}

/// Removes the pid file if it exists.
pub fn remove_pid_file(path: &Path) -> Result<(), SafeleaseError> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod pidfile_tests {
    use super::*;

    #[test]
    fn pid_roundtrip() -> Result<(), SafeleaseError> {
        let path = Path::new("/tmp/test-safelease-pid-0.pid");
        write_pid_file(path)?;
        assert_eq!(read_pid_file(path)?, std::process::id() as i32);
        remove_pid_file(path)?;
        assert!(!path.exists());
        remove_pid_file(path)?;
        Ok(())
    }

    #[test]
    fn pid_process_group() -> Result<(), SafeleaseError> {
        let path = Path::new("/tmp/test-safelease-pid-2.pid");
        fs::write(path, "-4242\n")?;
        assert_eq!(read_pid_file(path)?, -4242);
        fs::write(path, "  4242 \n")?;
        assert_eq!(read_pid_file(path)?, 4242);
        Ok(())
    }

    #[test]
    fn pid_invalid() -> Result<(), SafeleaseError> {
        let path = Path::new("/tmp/test-safelease-pid-1.pid");
        fs::write(path, "not-a-pid\n")?;
        assert!(read_pid_file(path).is_err());
        for pid in ["0\n", "-1\n"] {
            fs::write(path, pid)?;
            assert_eq!(
                read_pid_file(path).map_err(|e| e.kind()),
                Err(ErrorKind::InvalidParameters)
            );
        }
        assert_eq!(
            read_pid_file(Path::new("/tmp/no/such.pid"))
                .map_err(|e| e.kind()),
            Err(ErrorKind::Io)
        );
        Ok(())
    }
}
