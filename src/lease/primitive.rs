//! The lease primitive: acquire, renew, release and query on one sector.
//!
//! There is no compare-and-swap on the medium. Acquisition writes a claim
//! optimistically, waits out a contention window during which a racing
//! contender may overwrite it, and reads back to learn who won. Sector
//! writes are assumed atomic, nothing more.

use std::sync::Arc;

use crate::lease::{Clock, LeaseParams, SectorDevice, SystemClock, Tag};
use crate::lease::SECTOR_SIZE;
use crate::utils::{ErrorKind, SafeleaseError};

use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};

/// Lease on one sector of a shared device, as seen by one owner.
pub struct SectorLease {
    /// Shared device handle.
    device: Arc<SectorDevice>,

    /// Byte offset of the lease sector.
    offset: u64,

    /// Owner id this process claims the lease as.
    owner_id: String,

    /// Timing parameters.
    params: LeaseParams,

    /// Timestamp source for written tags.
    clock: Arc<dyn Clock>,
}

impl SectorLease {
    /// Creates a lease handle after validating the owner id and offset.
    pub fn new(
        device: Arc<SectorDevice>,
        offset: u64,
        owner_id: &str,
        params: LeaseParams,
    ) -> Result<Self, SafeleaseError> {
        Tag::validate_owner_id(owner_id)?;
        SectorDevice::check_offset(offset)?;
        Ok(SectorLease {
            device,
            offset,
            owner_id: owner_id.into(),
            params,
            clock: Arc::new(SystemClock),
        })
    }

    /// Replaces the timestamp source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn params(&self) -> &LeaseParams {
        &self.params
    }

    pub fn device(&self) -> &SectorDevice {
        &self.device
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Tries to take the lease. Returns the timestamp of the winning claim.
    ///
    /// `last_seen` is the tag observed by the previous attempt (possibly by a
    /// previous process, see the reference file); it is updated with every
    /// tag observed here. A foreign tag is only overwritten once it has been
    /// seen unchanged across a full backoff, i.e. its owner stopped
    /// renewing. In non-busy mode a changing tag yields `Busy` and a lost
    /// race yields `Lost`, both after one backoff so that an immediate retry
    /// with the updated `last_seen` is safe.
    pub async fn acquire(
        &self,
        busy_loop: bool,
        last_seen: &mut Option<Tag>,
    ) -> Result<u64, SafeleaseError> {
        loop {
            let curr = self.read_tag(None).await?;
            if !curr.is_free() && last_seen.as_ref() != Some(&curr) {
                pf_debug!(
                    "lease at {} held as '{}', backing off {} ms",
                    self.offset,
                    curr,
                    self.params.backoff().as_millis()
                );
                *last_seen = Some(curr);
                time::sleep(self.params.backoff()).await;
                if !busy_loop {
                    return Err(SafeleaseError::new(
                        ErrorKind::Busy,
                        format!("lease held as '{}'", curr),
                    ));
                }
                continue;
            }

            // free, or unchanged since last seen: write our claim
            let timestamp = self.clock.now_us();
            let claim = Tag::encode(&self.owner_id, timestamp)?;
            self.write_tag(&claim, None).await?;
            *last_seen = Some(claim);

            // let any racing contender overwrite us before reading back
            time::sleep(self.params.contention_wait()).await;

            let confirm = self.read_tag(None).await?;
            if confirm == claim {
                pf_debug!("won lease at {} ts {:x}", self.offset, timestamp);
                return Ok(timestamp);
            }

            pf_debug!(
                "lost lease race at {} to '{}', backing off",
                self.offset,
                confirm
            );
            *last_seen = Some(confirm);
            time::sleep(self.params.backoff()).await;
            if !busy_loop {
                return Err(SafeleaseError::new(
                    ErrorKind::Lost,
                    format!("lease race lost to '{}'", confirm),
                ));
            }
        }
    }

    /// Advances the timestamp of a lease held by this owner. Fails with
    /// `LeaseLost` if someone else holds the tag (or, with `known_ts`, if it
    /// was rewritten under our id), and with `TimedOut` if the lease already
    /// expired by our own clock or the write did not land before it would.
    /// Nothing is written on failure.
    pub async fn renew(
        &self,
        known_ts: Option<u64>,
    ) -> Result<u64, SafeleaseError> {
        let curr = self.read_tag(None).await?;
        if !curr.is_owned_by(&self.owner_id) {
            return Err(SafeleaseError::new(
                ErrorKind::LeaseLost,
                format!("lease at {} now held as '{}'", self.offset, curr),
            ));
        }
        let fields = curr.decode()?;
        if let Some(known_ts) = known_ts {
            if known_ts != fields.timestamp {
                return Err(SafeleaseError::new(
                    ErrorKind::LeaseLost,
                    format!(
                        "lease at {} rewritten: ts {:x} expected {:x}",
                        self.offset, fields.timestamp, known_ts
                    ),
                ));
            }
        }

        let lease_us = self.params.lease_ms() * 1000;
        let age_us = self.clock.now_us().saturating_sub(fields.timestamp);
        if age_us >= lease_us {
            return Err(SafeleaseError::new(
                ErrorKind::TimedOut,
                format!(
                    "lease at {} expired {} ms ago",
                    self.offset,
                    (age_us - lease_us) / 1000
                ),
            ));
        }
        let deadline =
            Instant::now() + Duration::from_micros(lease_us - age_us);

        let timestamp = self.clock.now_us();
        let tag = Tag::encode(&self.owner_id, timestamp)?;
        self.write_tag(&tag, Some(deadline)).await?;
        pf_trace!("renewed lease at {} ts {:x}", self.offset, timestamp);
        Ok(timestamp)
    }

    /// Frees the lease. Without `force`, only a lease held by this owner is
    /// freed and `Ok(false)` is returned if there was nothing to release.
    pub async fn release(&self, force: bool) -> Result<bool, SafeleaseError> {
        if !force {
            let curr = self.read_tag(None).await?;
            if !curr.is_owned_by(&self.owner_id) {
                pf_debug!(
                    "nothing to release at {}, held as '{}'",
                    self.offset,
                    curr
                );
                return Ok(false);
            }
        }
        self.write_tag(&Tag::free(), None).await?;
        pf_debug!("released lease at {}", self.offset);
        Ok(true)
    }

    /// Reads the current tag without changing anything.
    pub async fn query(&self) -> Result<Tag, SafeleaseError> {
        self.read_tag(None).await
    }

    /// Reads the tag, failing with `TimedOut` if the read overruns the op
    /// timeout or does not return before `deadline`.
    async fn read_tag(
        &self,
        deadline: Option<Instant>,
    ) -> Result<Tag, SafeleaseError> {
        let device = self.device.clone();
        let offset = self.offset;
        let budget = Some(self.params.op_timeout());
        let task = tokio::task::spawn_blocking(move || {
            device.read_sector(offset, budget)
        });
        let buf = Self::join_before(task, deadline).await?;
        Tag::from_bytes(&buf)
    }

    /// Writes `tag` as the whole sector, zero-filling the rest of it. Same
    /// timing rules as `read_tag()`.
    async fn write_tag(
        &self,
        tag: &Tag,
        deadline: Option<Instant>,
    ) -> Result<(), SafeleaseError> {
        let mut buf = [0u8; SECTOR_SIZE];
        buf[..tag.as_bytes().len()].copy_from_slice(tag.as_bytes());

        let device = self.device.clone();
        let offset = self.offset;
        let budget = Some(self.params.op_timeout());
        let task = tokio::task::spawn_blocking(move || {
            device.write_sector(offset, &buf, budget)
        });
        Self::join_before(task, deadline).await
    }

    /// Waits for a blocking I/O task, giving up at `deadline` if any. The
    /// syscall itself cannot be cancelled; the caller just stops trusting it.
    async fn join_before<T>(
        task: JoinHandle<Result<T, SafeleaseError>>,
        deadline: Option<Instant>,
    ) -> Result<T, SafeleaseError> {
        match deadline {
            Some(deadline) => match time::timeout_at(deadline, task).await {
                Ok(joined) => joined?,
                Err(_) => Err(SafeleaseError::new(
                    ErrorKind::TimedOut,
                    "sector I/O did not complete before lease deadline",
                )),
            },
            None => task.await?,
        }
    }
}

/// Reads the tag at `offset` of `device` without taking any owner identity,
/// for inspection tooling.
pub async fn query_tag(
    device: Arc<SectorDevice>,
    offset: u64,
    op_timeout: Option<Duration>,
) -> Result<Tag, SafeleaseError> {
    SectorDevice::check_offset(offset)?;
    let buf = tokio::task::spawn_blocking(move || {
        device.read_sector(offset, op_timeout)
    })
    .await??;
    Tag::from_bytes(&buf)
}
