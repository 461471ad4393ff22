//! Shared, immutable byte chunks handed to receive callbacks

use std::ops::Deref;

use bytes::Bytes;

/// A view over received bytes
///
/// Cloning is cheap and shares the underlying buffer. A chunk produced by a
/// file read also carries the file offset it was read from; network chunks
/// have offset 0. Pooled buffers return to their pool once every clone of the
/// chunk has been dropped.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DataChunk {
    buf: Bytes,
    offset: u64,
}

impl DataChunk {
    pub fn new(buf: Bytes) -> Self {
        Self { buf, offset: 0 }
    }

    pub fn with_offset(buf: Bytes, offset: u64) -> Self {
        Self { buf, offset }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Shared handle to the bytes, suitable for passing straight to `send_data`
    pub fn bytes(&self) -> Bytes {
        self.buf.clone()
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf
    }
}

impl Deref for DataChunk {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl AsRef<[u8]> for DataChunk {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl From<DataChunk> for Bytes {
    fn from(chunk: DataChunk) -> Bytes {
        chunk.buf
    }
}
