//! Chunked accumulation of row bytes into message payloads.
//!
//! [`ChunkedRowBuffer`] collects the bytes of consecutive rows into
//! fixed-capacity chunks and cuts a message every `max_rows` rows. Chunks are
//! allocated lazily as writes spill over, so a long batch never reallocates
//! one big growing buffer.
//!
//! The assembled payload is the concatenation of all full chunks followed by
//! the last chunk truncated at the write offset. If a delimiter is
//! configured and the payload ends with it, that single byte is dropped: the
//! delimiter separates rows, it does not terminate messages.
//!
//! # Example
//!
//! ```rust
//! use amqp_row_producer::buffer::ChunkedRowBuffer;
//!
//! let mut buffer = ChunkedRowBuffer::new(2, 4096, Some(b';'));
//!
//! buffer.write(b"a;");
//! assert!(buffer.count_row().is_none());
//!
//! buffer.write(b"b;");
//! let payload = buffer.count_row().unwrap();
//! assert_eq!(&payload[..], b"a;b");
//! assert!(buffer.is_empty());
//! ```

use bytes::{BufMut, Bytes, BytesMut};

#[derive(Debug)]
pub struct ChunkedRowBuffer {
    chunks: Vec<Box<[u8]>>,
    offset: usize,
    rows: usize,
    max_rows: usize,
    chunk_size: usize,
    delimiter: Option<u8>,
}

impl ChunkedRowBuffer {
    /// Creates an empty buffer.
    ///
    /// `max_rows` and `chunk_size` are clamped to at least one.
    pub fn new(max_rows: usize, chunk_size: usize, delimiter: Option<u8>) -> Self {
        Self {
            chunks: Vec::new(),
            offset: 0,
            rows: 0,
            max_rows: max_rows.max(1),
            chunk_size: chunk_size.max(1),
            delimiter,
        }
    }

    /// Appends raw bytes, allocating new chunks as the current one fills up.
    pub fn write(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            if self.chunks.is_empty() || self.offset == self.chunk_size {
                self.chunks.push(vec![0u8; self.chunk_size].into_boxed_slice());
                self.offset = 0;
            }

            let available = self.chunk_size - self.offset;
            let n = available.min(bytes.len());
            // Non-empty after the push above.
            if let Some(chunk) = self.chunks.last_mut() {
                chunk[self.offset..self.offset + n].copy_from_slice(&bytes[..n]);
            }
            self.offset += n;
            bytes = &bytes[n..];
        }
    }

    /// Marks the end of a row.
    ///
    /// Returns the assembled payload when this row completes a batch of
    /// `max_rows` rows; the buffer is empty afterwards.
    pub fn count_row(&mut self) -> Option<Bytes> {
        self.rows += 1;
        if self.rows % self.max_rows != 0 {
            return None;
        }
        Some(self.take_payload())
    }

    /// Emits whatever is buffered as a payload, regardless of the row count.
    ///
    /// Returns `None` when nothing is pending.
    pub fn flush_pending(&mut self) -> Option<Bytes> {
        if self.is_empty() {
            return None;
        }
        Some(self.take_payload())
    }

    fn take_payload(&mut self) -> Bytes {
        let mut last_len = self.offset;
        if let (Some(delim), Some(last)) = (self.delimiter, self.chunks.last()) {
            if last_len > 0 && last[last_len - 1] == delim {
                last_len -= 1;
            }
        }

        let full = self.chunks.len().saturating_sub(1);
        let mut payload = BytesMut::with_capacity(full * self.chunk_size + last_len);
        for chunk in &self.chunks[..full] {
            payload.put_slice(chunk);
        }
        if let Some(last) = self.chunks.last() {
            payload.put_slice(&last[..last_len]);
        }

        self.rows = 0;
        self.chunks.clear();
        self.offset = 0;

        payload.freeze()
    }

    /// Rows counted since the last emitted payload.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of chunks currently held.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// True when no row and no byte is pending.
    pub fn is_empty(&self) -> bool {
        self.rows == 0 && self.chunks.is_empty()
    }

    pub fn max_rows(&self) -> usize {
        self.max_rows
    }
}
