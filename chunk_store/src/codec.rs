//! Encode/decode hook applied to every payload crossing the storage boundary.

use bytes::Bytes;
use std::fmt::Debug;

use crate::core::ChunkStoreError;

/// Transforms payloads between their application form and the form the
/// backend stores.
///
/// Invoked on every write — the empty-chunk filler included, which encodes an
/// absent payload — and on every read before a chunk is handed to a
/// subscription. Implementations are stateless and must be safe for
/// concurrent invocation.
pub trait PayloadCodec: Send + Sync + Debug + 'static {
    /// Encode an application payload into its wire form.
    fn encode(&self, payload: Option<&Bytes>) -> Result<Option<Bytes>, ChunkStoreError>;

    /// Decode a wire payload back into its application form.
    fn decode(&self, wire: Option<&Bytes>) -> Result<Option<Bytes>, ChunkStoreError>;
}

/// The default codec: stores payloads unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityCodec;

impl PayloadCodec for IdentityCodec {
    fn encode(&self, payload: Option<&Bytes>) -> Result<Option<Bytes>, ChunkStoreError> {
        Ok(payload.cloned())
    }

    fn decode(&self, wire: Option<&Bytes>) -> Result<Option<Bytes>, ChunkStoreError> {
        Ok(wire.cloned())
    }
}
