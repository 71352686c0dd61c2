//! Safelease: exclusive ownership of a shared storage pool through a
//! time-bounded lease kept in a single 512-byte sector.
//!
//! Hosts sharing a block device (or file) agree on a single writer purely by
//! reading and writing one sector. A holder keeps its claim alive by
//! renewing the tag's timestamp, and a holder that cannot prove its lease
//! before the deadline fences itself.

#[macro_use]
mod utils;

mod lease;
mod supervisor;

pub use utils::{logger_init, ErrorKind, SafeleaseError, Timer, ME};

pub use lease::{
    query_tag, Clock, LeaseParams, SectorDevice, SectorLease, SystemClock,
    Tag, TagFields, FREE_OWNER_ID, MAX_LEASE_MS, OWNER_ID_LEN, SECTOR_SIZE,
    TAG_SIZE,
};
pub use lease::{load_ref_tag, store_ref_tag, write_marker};

pub use supervisor::{
    read_pid_file, remove_pid_file, write_pid_file, Fencer, LeaseBackend,
    Supervisor, SupervisorConfig, SupervisorExit, SystemFencer,
};
