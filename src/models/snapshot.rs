//! Opaque reply-region snapshot.

use std::fmt::{Debug, Formatter};

/// An opaque, comparable capture of a destination's reply region.
///
/// The completion detector only ever tests snapshots for exact byte
/// equality; the payload may be raw pixels, a capture digest, or anything
/// else the endpoint driver finds cheap to produce, as long as it is stable
/// while the destination's visible output is stable.
#[derive(Clone, PartialEq, Eq)]
pub struct Snapshot {
    bytes: Vec<u8>,
}

impl Snapshot {
    /// Wrap raw capture bytes.
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Size of the capture payload in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the capture payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl From<&str> for Snapshot {
    fn from(value: &str) -> Self {
        Self::new(value.as_bytes().to_vec())
    }
}

impl Debug for Snapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Snapshot({} bytes)", self.bytes.len())
    }
}
