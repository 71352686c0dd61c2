//! Single-sector direct I/O on the shared device or file.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::utils::{ErrorKind, SafeleaseError};

/// Size of the lease sector, and the unit of every transfer.
pub const SECTOR_SIZE: usize = 512;

/// Sector buffer aligned for `O_DIRECT` transfers on any common logical
/// block size.
#[repr(C, align(4096))]
struct AlignedSector([u8; SECTOR_SIZE]);

/// Handle to the device or file holding lease sectors.
///
/// Every read and write goes straight to the medium: the file is opened with
/// `O_DIRECT` (or `O_DSYNC` when direct I/O is turned off, e.g. for image
/// files on tmpfs), so no page cache can hide another host's write.
#[derive(Debug)]
pub struct SectorDevice {
    file: File,
    path: PathBuf,
    direct: bool,
}

impl SectorDevice {
    /// Opens `path` for sector I/O.
    pub fn open(path: &Path, direct: bool) -> Result<Self, SafeleaseError> {
        let flags = if direct { libc::O_DIRECT } else { libc::O_DSYNC };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(flags)
            .open(path)
            .map_err(|e| {
                SafeleaseError::new(
                    ErrorKind::Io,
                    format!("error opening '{}': {}", path.display(), e),
                )
            })?;
        pf_trace!("opened '{}' direct={}", path.display(), direct);

        Ok(SectorDevice {
            file,
            path: path.to_path_buf(),
            direct,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_direct(&self) -> bool {
        self.direct
    }

    /// Byte offsets must be sector aligned for direct transfers.
    pub fn check_offset(offset: u64) -> Result<(), SafeleaseError> {
        if offset % SECTOR_SIZE as u64 != 0 {
            Err(SafeleaseError::new(
                ErrorKind::InvalidParameters,
                format!("offset {} not aligned to {}", offset, SECTOR_SIZE),
            ))
        } else {
            Ok(())
        }
    }

    /// Reads exactly one sector at `offset`. If `budget` is given and the
    /// read takes longer, fails with `TimedOut` even though data came back.
    pub fn read_sector(
        &self,
        offset: u64,
        budget: Option<Duration>,
    ) -> Result<[u8; SECTOR_SIZE], SafeleaseError> {
        Self::check_offset(offset)?;
        let mut buf = AlignedSector([0; SECTOR_SIZE]);

        let start = Instant::now();
        let nread = retry_interrupted(|| self.file.read_at(&mut buf.0, offset));
        let elapsed = start.elapsed();

        let nread = nread.map_err(|e| {
            SafeleaseError::new(
                ErrorKind::Io,
                format!(
                    "read of '{}' at {} failed: {}",
                    self.path.display(),
                    offset,
                    e
                ),
            )
        })?;
        if nread != SECTOR_SIZE {
            return Err(SafeleaseError::new(
                ErrorKind::Io,
                format!(
                    "short read of '{}' at {}: {} bytes",
                    self.path.display(),
                    offset,
                    nread
                ),
            ));
        }
        Self::check_budget("read", elapsed, budget)?;

        Ok(buf.0)
    }

    /// Writes exactly one sector at `offset`. Same budget semantics as
    /// `read_sector()`.
    pub fn write_sector(
        &self,
        offset: u64,
        data: &[u8; SECTOR_SIZE],
        budget: Option<Duration>,
    ) -> Result<(), SafeleaseError> {
        Self::check_offset(offset)?;
        let buf = AlignedSector(*data);

        let start = Instant::now();
        let nwritten = retry_interrupted(|| self.file.write_at(&buf.0, offset));
        let elapsed = start.elapsed();

        let nwritten = nwritten.map_err(|e| {
            SafeleaseError::new(
                ErrorKind::Io,
                format!(
                    "write of '{}' at {} failed: {}",
                    self.path.display(),
                    offset,
                    e
                ),
            )
        })?;
        if nwritten != SECTOR_SIZE {
            return Err(SafeleaseError::new(
                ErrorKind::Io,
                format!(
                    "short write of '{}' at {}: {} bytes",
                    self.path.display(),
                    offset,
                    nwritten
                ),
            ));
        }
        Self::check_budget("write", elapsed, budget)?;

        Ok(())
    }

    fn check_budget(
        what: &str,
        elapsed: Duration,
        budget: Option<Duration>,
    ) -> Result<(), SafeleaseError> {
        match budget {
            Some(budget) if elapsed > budget => Err(SafeleaseError::new(
                ErrorKind::TimedOut,
                format!(
                    "sector {} took {} ms, budget {} ms",
                    what,
                    elapsed.as_millis(),
                    budget.as_millis()
                ),
            )),
            _ => Ok(()),
        }
    }
}

fn retry_interrupted(
    mut op: impl FnMut() -> io::Result<usize>,
) -> io::Result<usize> {
    loop {
        match op() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            res => return res,
        }
    }
}

#[cfg(test)]
pub(crate) mod sector_tests {
    use super::*;

    /// Creates (or resets) a zero-filled scratch image of `sectors` sectors.
    pub(crate) fn prepare_test_image(
        path: &str,
        sectors: u64,
    ) -> Result<SectorDevice, SafeleaseError> {
        let file = File::create(path)?;
        file.set_len(sectors * SECTOR_SIZE as u64)?;
        SectorDevice::open(Path::new(path), false)
    }

    #[test]
    fn write_read_sector() -> Result<(), SafeleaseError> {
        let dev = prepare_test_image("/tmp/test-safelease-sector-0.img", 4)?;
        let mut data = [0u8; SECTOR_SIZE];
        data[..5].copy_from_slice(b"hello");
        data[SECTOR_SIZE - 1] = 0xff;
        assert!(!dev.is_direct());
        dev.write_sector(1024, &data, None)?;
        assert_eq!(dev.read_sector(1024, None)?, data);
        assert_eq!(dev.read_sector(0, None)?, [0u8; SECTOR_SIZE]);
        assert_eq!(dev.read_sector(512, None)?, [0u8; SECTOR_SIZE]);
        Ok(())
    }

    #[test]
    fn misaligned_offset() -> Result<(), SafeleaseError> {
        let dev = prepare_test_image("/tmp/test-safelease-sector-1.img", 2)?;
        assert_eq!(
            dev.read_sector(100, None).map_err(|e| e.kind()),
            Err(ErrorKind::InvalidParameters)
        );
        assert_eq!(
            dev.write_sector(513, &[0u8; SECTOR_SIZE], None)
                .map_err(|e| e.kind()),
            Err(ErrorKind::InvalidParameters)
        );
        Ok(())
    }

    #[test]
    fn short_read_past_end() -> Result<(), SafeleaseError> {
        let dev = prepare_test_image("/tmp/test-safelease-sector-2.img", 1)?;
        assert_eq!(
            dev.read_sector(512, None).map_err(|e| e.kind()),
            Err(ErrorKind::Io)
        );
        Ok(())
    }

    #[test]
    fn missing_device() {
        assert_eq!(
            SectorDevice::open(Path::new("/tmp/no/such/safelease.img"), false)
                .map(|_| ())
                .map_err(|e| e.kind()),
            Err(ErrorKind::Io)
        );
    }

    #[test]
    fn budget_exceeded() {
        assert!(SectorDevice::check_budget(
            "read",
            Duration::from_millis(5),
            Some(Duration::from_millis(10))
        )
        .is_ok());
        assert!(SectorDevice::check_budget(
            "read",
            Duration::from_secs(3),
            None
        )
        .is_ok());
        assert_eq!(
            SectorDevice::check_budget(
                "write",
                Duration::from_millis(1500),
                Some(Duration::from_millis(1000))
            )
            .map_err(|e| e.kind()),
            Err(ErrorKind::TimedOut)
        );
    }
}
