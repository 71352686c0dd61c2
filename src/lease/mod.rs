//! Lease on a shared sector: tag codec, sector I/O and the lease primitive.

mod clock;
mod params;
mod primitive;
mod reffile;
mod sector;
mod tag;

pub use clock::{Clock, SystemClock};
pub use params::{LeaseParams, MAX_LEASE_MS};
pub use primitive::{query_tag, SectorLease};
pub use reffile::{load_ref_tag, store_ref_tag, write_marker};
pub use sector::{SectorDevice, SECTOR_SIZE};
pub use tag::{Tag, TagFields, FREE_OWNER_ID, OWNER_ID_LEN, TAG_SIZE};

#[cfg(test)]
pub(crate) use clock::ManualClock;
