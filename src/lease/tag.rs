//! Owner tag codec: the fixed-width record at the start of the lease sector.
//!
//! Layout (32 bytes, ASCII):
//!
//! ```text
//! | owner id, left-justified, space-padded (16) | timestamp, lowercase hex (16) |
//! ```

use std::fmt;

use crate::utils::{ErrorKind, SafeleaseError};

/// Width of the owner id field.
pub const OWNER_ID_LEN: usize = 16;

/// Width of the hex timestamp field.
const TIMESTAMP_LEN: usize = 16;

/// Total encoded tag width.
pub const TAG_SIZE: usize = OWNER_ID_LEN + TIMESTAMP_LEN;

/// Owner id field of the free sentinel; reserved, never a valid owner.
pub const FREE_OWNER_ID: &str = "------FREE------";

/// The whole free sentinel tag.
const FREE_TAG: &[u8; TAG_SIZE] = b"------FREE----------------------";

/// Decoded fields of a tag.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TagFields {
    pub owner_id: String,

    /// Microseconds since the Unix epoch at the time of writing.
    pub timestamp: u64,
}

/// Encoded owner tag as it sits on disk.
#[derive(PartialEq, Eq, Clone, Copy, Hash)]
pub struct Tag([u8; TAG_SIZE]);

impl Tag {
    /// The free sentinel tag.
    pub fn free() -> Self {
        Tag(*FREE_TAG)
    }

    /// Checks that `owner_id` can be encoded into a tag: non-empty, at most
    /// `OWNER_ID_LEN` bytes, no trailing space (it would be eaten by the
    /// padding), and not the free sentinel's id.
    pub fn validate_owner_id(owner_id: &str) -> Result<(), SafeleaseError> {
        if owner_id.is_empty() {
            Err(SafeleaseError::new(
                ErrorKind::InvalidOwnerId,
                "owner id must not be empty",
            ))
        } else if owner_id.len() > OWNER_ID_LEN {
            Err(SafeleaseError::new(
                ErrorKind::InvalidOwnerId,
                format!(
                    "owner id '{}' longer than {} bytes",
                    owner_id, OWNER_ID_LEN
                ),
            ))
        } else if owner_id.ends_with(' ') {
            Err(SafeleaseError::new(
                ErrorKind::InvalidOwnerId,
                format!("owner id '{}' ends with a space", owner_id),
            ))
        } else if owner_id == FREE_OWNER_ID {
            Err(SafeleaseError::new(
                ErrorKind::InvalidOwnerId,
                format!("owner id '{}' is reserved", owner_id),
            ))
        } else {
            Ok(())
        }
    }

    /// Encodes `(owner_id, timestamp)` into a tag.
    pub fn encode(
        owner_id: &str,
        timestamp: u64,
    ) -> Result<Self, SafeleaseError> {
        Self::validate_owner_id(owner_id)?;
        let mut bytes = [0u8; TAG_SIZE];
        bytes[..OWNER_ID_LEN].copy_from_slice(&Self::owner_field(owner_id));
        let ts = format!("{:016x}", timestamp);
        bytes[OWNER_ID_LEN..].copy_from_slice(ts.as_bytes());
        Ok(Tag(bytes))
    }

    /// Takes the tag out of the leading bytes of a sector buffer.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, SafeleaseError> {
        if buf.len() < TAG_SIZE {
            return Err(SafeleaseError::new(
                ErrorKind::Corrupted,
                format!("buffer of {} bytes too short for a tag", buf.len()),
            ));
        }
        let mut bytes = [0u8; TAG_SIZE];
        bytes.copy_from_slice(&buf[..TAG_SIZE]);
        Ok(Tag(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; TAG_SIZE] {
        &self.0
    }

    /// Decodes the tag. The free sentinel decodes to its own owner id with a
    /// zero timestamp. The timestamp's range is not checked.
    pub fn decode(&self) -> Result<TagFields, SafeleaseError> {
        if self.is_free() {
            return Ok(TagFields {
                owner_id: FREE_OWNER_ID.into(),
                timestamp: 0,
            });
        }

        let owner = &self.0[..OWNER_ID_LEN];
        let owner_len = owner
            .iter()
            .rposition(|&b| b != b' ')
            .map_or(0, |pos| pos + 1);
        let owner_id = String::from_utf8(owner[..owner_len].to_vec())?;
        if owner_id.is_empty() {
            return Err(SafeleaseError::new(
                ErrorKind::Corrupted,
                format!("tag '{}' has a blank owner id", self),
            ));
        }

        let ts_field = &self.0[OWNER_ID_LEN..];
        if !ts_field.iter().all(u8::is_ascii_hexdigit) {
            return Err(SafeleaseError::new(
                ErrorKind::Corrupted,
                format!("tag '{}' has a non-hex timestamp", self),
            ));
        }
        // all hex digits, so this is valid utf8 and fits in u64
        let ts_str = String::from_utf8(ts_field.to_vec())?;
        let timestamp = u64::from_str_radix(&ts_str, 16).map_err(|e| {
            SafeleaseError::new(ErrorKind::Corrupted, e.to_string())
        })?;

        Ok(TagFields {
            owner_id,
            timestamp,
        })
    }

    /// Exact byte comparison against the free sentinel.
    pub fn is_free(&self) -> bool {
        &self.0 == FREE_TAG
    }

    /// Compares only the owner id fields of two tags.
    pub fn same_owner(&self, other: &Tag) -> bool {
        self.0[..OWNER_ID_LEN] == other.0[..OWNER_ID_LEN]
    }

    /// Compares the owner id field against a candidate owner id.
    pub fn is_owned_by(&self, owner_id: &str) -> bool {
        owner_id.len() <= OWNER_ID_LEN
            && self.0[..OWNER_ID_LEN] == Self::owner_field(owner_id)
    }

    /// Space-padded owner field; caller guarantees the length bound.
    fn owner_field(owner_id: &str) -> [u8; OWNER_ID_LEN] {
        let mut field = [b' '; OWNER_ID_LEN];
        field[..owner_id.len()].copy_from_slice(owner_id.as_bytes());
        field
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Tag({:?})", String::from_utf8_lossy(&self.0))
    }
}
