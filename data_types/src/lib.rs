//! Shared data types of the chunk store: positions, indexes, partition and
//! operation identifiers, and the immutable [`Chunk`] record itself.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use bytes::Bytes;
use std::{fmt, ops::Add, sync::Arc};
use uuid::Uuid;

/// Globally unique, strictly monotonic identifier of a persisted chunk.
///
/// Positions are assigned by the sequence allocator at write time and form a
/// dense sequence starting at [`Position::FIRST`]. A `Position` of 0 denotes
/// "nothing persisted yet" and never appears on a stored chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position(i64);

impl Position {
    /// The first position a store ever assigns.
    pub const FIRST: Self = Self(1);

    /// Wrap a raw value.
    pub fn new(v: i64) -> Self {
        Self(v)
    }

    /// The raw value.
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl Add<i64> for Position {
    type Output = Self;

    fn add(self, other: i64) -> Self {
        Self(self.0 + other)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-partition ordinal of a chunk.
///
/// Unique within a partition but not necessarily contiguous; writers may skip
/// index values deliberately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkIndex(i64);

impl ChunkIndex {
    /// The largest representable index, used as the open upper bound of
    /// "read everything" ranges.
    pub const MAX: Self = Self(i64::MAX);

    /// Wrap a raw value.
    pub fn new(v: i64) -> Self {
        Self(v)
    }

    /// The raw value.
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl Add<i64> for ChunkIndex {
    type Output = Self;

    fn add(self, other: i64) -> Self {
        Self(self.0 + other)
    }
}

impl fmt::Display for ChunkIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of the reserved partition that holds only filler chunks.
pub const EMPTY_PARTITION_ID: &str = "::empty";

/// Opaque identifier of a partition (an event stream).
///
/// Cheap to clone; the inner string is shared.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionId(Arc<str>);

impl PartitionId {
    /// The reserved filler partition, [`EMPTY_PARTITION_ID`].
    pub fn empty() -> Self {
        Self::from(EMPTY_PARTITION_ID)
    }

    /// `true` iff this is the reserved filler partition.
    pub fn is_empty_partition(&self) -> bool {
        self.0.as_ref() == EMPTY_PARTITION_ID
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        self.0.as_ref()
    }
}

impl From<&str> for PartitionId {
    fn from(v: &str) -> Self {
        Self(Arc::from(v))
    }
}

impl From<String> for PartitionId {
    fn from(v: String) -> Self {
        Self(Arc::from(v.as_str()))
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Idempotency token, unique within a partition.
///
/// Cheap to clone; the inner string is shared.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperationId(Arc<str>);

impl OperationId {
    /// Generate a fresh, unique token for writes that did not supply one.
    pub fn new_unique() -> Self {
        Self(Arc::from(Uuid::new_v4().to_string().as_str()))
    }

    /// The token borne by the filler chunk reserving `position`.
    pub fn filler(position: Position) -> Self {
        Self(Arc::from(format!("_{}", position).as_str()))
    }

    /// The token as a string slice.
    pub fn as_str(&self) -> &str {
        self.0.as_ref()
    }
}

impl From<&str> for OperationId {
    fn from(v: &str) -> Self {
        Self(Arc::from(v))
    }
}

impl From<String> for OperationId {
    fn from(v: String) -> Self {
        Self(Arc::from(v.as_str()))
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One immutable record in the log.
///
/// Once persisted a chunk never changes; range deletes only flip a
/// backend-internal flag and never reuse the position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    position: Position,
    partition_id: PartitionId,
    index: ChunkIndex,
    operation_id: OperationId,
    payload: Option<Bytes>,
}

impl Chunk {
    /// Assemble a chunk. Backends call this at write time and when
    /// re-materializing stored rows for delivery.
    pub fn new(
        position: Position,
        partition_id: PartitionId,
        index: ChunkIndex,
        operation_id: OperationId,
        payload: Option<Bytes>,
    ) -> Self {
        Self {
            position,
            partition_id,
            index,
            operation_id,
            payload,
        }
    }

    /// Global position of this chunk.
    pub fn position(&self) -> Position {
        self.position
    }

    /// Partition this chunk belongs to.
    pub fn partition_id(&self) -> &PartitionId {
        &self.partition_id
    }

    /// Ordinal of this chunk within its partition.
    pub fn index(&self) -> ChunkIndex {
        self.index
    }

    /// Idempotency token of the write that produced this chunk.
    pub fn operation_id(&self) -> &OperationId {
        &self.operation_id
    }

    /// The (already decoded) payload, if any. Fillers carry none.
    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    /// `true` iff this is a stand-in chunk reserving a position after a
    /// write conflict.
    pub fn is_filler(&self) -> bool {
        self.partition_id.is_empty_partition()
    }
}
