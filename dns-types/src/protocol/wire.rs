//! Position-aware wire-format primitives shared by the decoder and
//! encoder: a consumable byte reader with bookmark/restore for
//! following compression pointers, and the compression table itself.

use crate::protocol::types::DomainName;

/// Maximum number of labels in a domain name (root included).
pub const MAXLABELS: usize = 128;

/// Errors encountered when parsing a datagram.  Variants carrying a
/// `u16` carry the message ID from the header, so an error response
/// can still be linked to the right query.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    /// The datagram is not even 2 octets long, so it doesn't even
    /// contain a valid ID.  No error response can be sent back, since
    /// there's nothing to correlate it with.
    CompletelyBusted,
    /// The header is missing one or more required fields.
    HeaderTooShort(u16),
    /// A question ends with an incomplete field.
    QuestionTooShort(u16),
    /// A resource record ends with an incomplete field.
    ResourceRecordTooShort(u16),
    /// A resource record's RDATA did not consume exactly `RDLENGTH`
    /// octets.
    ResourceRecordInvalid(u16),
    /// A domain name ends with an incomplete label or pointer.
    NameTooShort(u16),
    /// A domain name is over 255 octets once expanded.
    NameTooLong(u16),
    /// A domain name has more than `MAXLABELS` labels.
    TooManyLabels(u16),
    /// A compression pointer targets its own position or a later one.
    BadCompression(u16),
    /// A label length octet has the reserved top bits `01` or `10`.
    BadLabelType(u16),
}

impl Error {
    pub fn id(self) -> Option<u16> {
        match self {
            Error::CompletelyBusted => None,
            Error::HeaderTooShort(id)
            | Error::QuestionTooShort(id)
            | Error::ResourceRecordTooShort(id)
            | Error::ResourceRecordInvalid(id)
            | Error::NameTooShort(id)
            | Error::NameTooLong(id)
            | Error::TooManyLabels(id)
            | Error::BadCompression(id)
            | Error::BadLabelType(id) => Some(id),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::CompletelyBusted => write!(f, "datagram too short to contain a header"),
            Error::HeaderTooShort(id) => write!(f, "[{id}] header is truncated"),
            Error::QuestionTooShort(id) => write!(f, "[{id}] question is truncated"),
            Error::ResourceRecordTooShort(id) => write!(f, "[{id}] resource record is truncated"),
            Error::ResourceRecordInvalid(id) => {
                write!(f, "[{id}] resource record RDATA length mismatch")
            }
            Error::NameTooShort(id) => write!(f, "[{id}] domain name is truncated"),
            Error::NameTooLong(id) => write!(f, "[{id}] domain name exceeds 255 octets"),
            Error::TooManyLabels(id) => write!(f, "[{id}] domain name exceeds 128 labels"),
            Error::BadCompression(id) => write!(f, "[{id}] compression pointer does not go backwards"),
            Error::BadLabelType(id) => write!(f, "[{id}] reserved label type bits"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// A buffer which is consumed as it is parsed.  Cloning via
/// `at_offset` is how compression pointers are followed: the clone
/// starts reading at the target offset but the original cursor is
/// untouched, so the caller resumes exactly where it left off.
#[derive(Clone, Copy)]
pub struct ConsumableBuffer<'a> {
    octets: &'a [u8],
    position: usize,
}

impl<'a> ConsumableBuffer<'a> {
    pub fn new(octets: &'a [u8]) -> Self {
        Self {
            octets,
            position: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn next_u8(&mut self) -> Option<u8> {
        if self.octets.len() > self.position {
            let a = self.octets[self.position];
            self.position += 1;
            Some(a)
        } else {
            None
        }
    }

    pub fn next_u16(&mut self) -> Option<u16> {
        if self.octets.len() > self.position + 1 {
            let a = self.octets[self.position];
            let b = self.octets[self.position + 1];
            self.position += 2;
            Some(u16::from_be_bytes([a, b]))
        } else {
            None
        }
    }

    pub fn next_u32(&mut self) -> Option<u32> {
        if self.octets.len() > self.position + 3 {
            let bytes = [
                self.octets[self.position],
                self.octets[self.position + 1],
                self.octets[self.position + 2],
                self.octets[self.position + 3],
            ];
            self.position += 4;
            Some(u32::from_be_bytes(bytes))
        } else {
            None
        }
    }

    pub fn next_u48(&mut self) -> Option<u64> {
        if self.octets.len() > self.position + 5 {
            let mut bytes = [0u8; 8];
            bytes[2..].copy_from_slice(&self.octets[self.position..self.position + 6]);
            self.position += 6;
            Some(u64::from_be_bytes(bytes))
        } else {
            None
        }
    }

    pub fn take(&mut self, size: usize) -> Option<&'a [u8]> {
        if self.octets.len() >= self.position + size {
            let slice = &self.octets[self.position..self.position + size];
            self.position += size;
            Some(slice)
        } else {
            None
        }
    }

    /// A read-only view of everything consumed so far, for TSIG MAC
    /// input and similar uses.
    pub fn consumed(&self) -> &'a [u8] {
        &self.octets[0..self.position]
    }

    pub fn remaining(&self) -> usize {
        self.octets.len().saturating_sub(self.position)
    }

    /// Clone this buffer with its cursor moved to `position`, to
    /// follow a compression pointer without disturbing the caller's
    /// own cursor.
    pub fn at_offset(&self, position: usize) -> ConsumableBuffer<'a> {
        Self {
            octets: self.octets,
            position,
        }
    }
}

/// A small fixed-size bucket hash mapping `DomainName` suffixes to the
/// wire offset they were last written at.  Not thread-safe; a fresh
/// table is used per message render (see the concurrency model).
///
/// Implemented as a chained bucket array rather than a plain
/// `HashMap` to mirror the source's fixed small table; 17 is prime,
/// which spreads the standard `DomainName` hash reasonably across
/// buckets for the handful of names a typical response contains.
pub struct CompressionTable {
    buckets: [Vec<(DomainName, u16)>; NUM_BUCKETS],
}

const NUM_BUCKETS: usize = 17;

/// Offsets above this cannot be represented in a 14-bit pointer, so
/// they are never recorded.
pub const MAX_POINTER_OFFSET: usize = 0x3FFF;

impl Default for CompressionTable {
    fn default() -> Self {
        Self {
            buckets: std::array::from_fn(|_| Vec::new()),
        }
    }
}

impl CompressionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket_for(name: &DomainName) -> usize {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        (hasher.finish() as usize) % NUM_BUCKETS
    }

    /// Record `name` at `offset`, most-recent first, so `get` returns
    /// the latest match.  Offsets that don't fit in 14 bits are
    /// silently dropped, per the wire-format pointer width.
    pub fn add(&mut self, offset: usize, name: &DomainName) {
        if offset > MAX_POINTER_OFFSET {
            return;
        }
        let bucket = &mut self.buckets[Self::bucket_for(name)];
        // safe: checked against MAX_POINTER_OFFSET above
        bucket.insert(0, (name.clone(), offset as u16));
    }

    /// The most recently added offset for `name`, if any.
    pub fn get(&self, name: &DomainName) -> Option<u16> {
        let bucket = &self.buckets[Self::bucket_for(name)];
        bucket
            .iter()
            .find(|(stored, _)| stored == name)
            .map(|(_, offset)| *offset)
    }
}
