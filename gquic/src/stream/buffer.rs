//! # Stream Data Reassembly
//!
//! STREAM frames can arrive out of order, duplicated or overlapping. The
//! buffer keeps received fragments keyed by start offset and a cursor
//! (`contiguous_end`) marking how far data is gap-free from the read
//! offset. Only bytes below the cursor are ever handed to the reader.
//!
//! ```text
//! read_offset          contiguous_end        highest_offset
//!      |=====================|      [####]   [##]  |
//!      readable               waiting for the gap
//! ```

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::types::StreamOffset;

/// Out-of-order receive buffer for one stream.
#[derive(Debug, Default)]
pub struct ReassemblyBuffer {
    fragments: BTreeMap<StreamOffset, Bytes>,
    read_offset: StreamOffset,
    contiguous_end: StreamOffset,
    final_offset: Option<StreamOffset>,
    highest_offset: StreamOffset,
}

impl ReassemblyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a received fragment.
    ///
    /// Bytes already received are ignored, so re-inserting a fragment is a
    /// no-op. Fails with [`Error::InvalidFinalOffset`] when data lies beyond
    /// a known final offset or two FINs disagree.
    pub fn insert(&mut self, offset: StreamOffset, data: Bytes, fin: bool) -> Result<()> {
        let end = offset + data.len() as u64;

        if let Some(final_offset) = self.final_offset {
            if end > final_offset || (fin && end != final_offset) {
                return Err(Error::InvalidFinalOffset);
            }
        }
        if fin {
            if end < self.highest_offset {
                return Err(Error::InvalidFinalOffset);
            }
            self.final_offset = Some(end);
        }
        self.highest_offset = self.highest_offset.max(end);

        if end <= self.contiguous_end {
            return Ok(());
        }

        let (offset, data) = if offset < self.contiguous_end {
            let skip = (self.contiguous_end - offset) as usize;
            (self.contiguous_end, data.slice(skip..))
        } else {
            (offset, data)
        };
        self.store(offset, data);
        self.advance_contiguous();
        Ok(())
    }

    /// Keep the longer of two fragments starting at the same offset.
    fn store(&mut self, offset: StreamOffset, data: Bytes) {
        if data.is_empty() {
            return;
        }
        match self.fragments.get(&offset) {
            Some(existing) if existing.len() >= data.len() => {}
            _ => {
                self.fragments.insert(offset, data);
            }
        }
    }

    /// Extend the cursor over every fragment that starts at or below it.
    ///
    /// Fragments starting below the previous cursor all end at or below it,
    /// so each pass only has to look at the newly covered span.
    fn advance_contiguous(&mut self) {
        let mut scan_from = self.contiguous_end;
        loop {
            let reach = self
                .fragments
                .range(scan_from..=self.contiguous_end)
                .map(|(start, data)| start + data.len() as u64)
                .max();
            match reach {
                Some(end) if end > self.contiguous_end => {
                    scan_from = self.contiguous_end;
                    self.contiguous_end = end;
                }
                _ => break,
            }
        }
    }

    /// Copy contiguous bytes into `buf`, returning how many were copied.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut written = 0;
        while written < buf.len() && self.read_offset < self.contiguous_end {
            let Some((start, data)) = self.fragments.pop_first() else {
                break;
            };
            let end = start + data.len() as u64;
            if end <= self.read_offset {
                continue;
            }
            if start > self.read_offset {
                self.fragments.insert(start, data);
                break;
            }

            let skip = (self.read_offset - start) as usize;
            let n = (data.len() - skip).min(buf.len() - written);
            buf[written..written + n].copy_from_slice(&data[skip..skip + n]);
            written += n;
            self.read_offset += n as u64;

            if skip + n < data.len() {
                self.store(self.read_offset, data.slice(skip + n..));
            }
        }
        written
    }

    /// Drain every contiguous byte.
    pub fn read_available(&mut self) -> Bytes {
        let len = (self.contiguous_end - self.read_offset) as usize;
        if len == 0 {
            return Bytes::new();
        }
        let mut out = BytesMut::zeroed(len);
        let n = self.read(&mut out);
        out.truncate(n);
        out.freeze()
    }

    pub fn has_readable(&self) -> bool {
        self.read_offset < self.contiguous_end
    }

    /// FIN received and every byte before it read.
    pub fn is_eof(&self) -> bool {
        self.final_offset == Some(self.read_offset)
    }

    pub fn read_offset(&self) -> StreamOffset {
        self.read_offset
    }

    pub fn final_offset(&self) -> Option<StreamOffset> {
        self.final_offset
    }

    pub fn highest_offset(&self) -> StreamOffset {
        self.highest_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(buffer: &mut ReassemblyBuffer) -> Vec<u8> {
        buffer.read_available().to_vec()
    }

    #[test]
    fn test_in_order() {
        let mut buffer = ReassemblyBuffer::new();
        buffer.insert(0, Bytes::from_static(&[0xde, 0xca]), false).unwrap();
        buffer.insert(2, Bytes::from_static(&[0xfb, 0xad]), false).unwrap();

        let mut out = [0u8; 4];
        assert_eq!(buffer.read(&mut out), 4);
        assert_eq!(out, [0xde, 0xca, 0xfb, 0xad]);
        assert!(!buffer.has_readable());
    }

    #[test]
    fn test_gap_blocks_reading() {
        let mut buffer = ReassemblyBuffer::new();
        buffer.insert(2, Bytes::from_static(b"cd"), false).unwrap();
        assert!(!buffer.has_readable());

        buffer.insert(0, Bytes::from_static(b"ab"), false).unwrap();
        assert_eq!(read_all(&mut buffer), b"abcd");
    }

    #[test]
    fn test_run_of_fragments_absorbed_at_once() {
        let mut buffer = ReassemblyBuffer::new();
        for (offset, data) in [(6u64, &b"gh"[..]), (4, b"ef"), (2, b"cd")] {
            buffer.insert(offset, Bytes::copy_from_slice(data), false).unwrap();
        }
        buffer.insert(0, Bytes::from_static(b"ab"), false).unwrap();
        assert_eq!(read_all(&mut buffer), b"abcdefgh");
    }

    #[test]
    fn test_overlapping_fragments() {
        let mut buffer = ReassemblyBuffer::new();
        buffer.insert(4, Bytes::from_static(b"efgh"), false).unwrap();
        buffer.insert(2, Bytes::from_static(b"cdef"), false).unwrap();
        buffer.insert(0, Bytes::from_static(b"abc"), false).unwrap();
        assert_eq!(read_all(&mut buffer), b"abcdefgh");
    }

    #[test]
    fn test_duplicate_is_idempotent() {
        let mut buffer = ReassemblyBuffer::new();
        buffer.insert(0, Bytes::from_static(b"abcd"), false).unwrap();
        buffer.insert(0, Bytes::from_static(b"abcd"), false).unwrap();
        buffer.insert(1, Bytes::from_static(b"bc"), false).unwrap();

        let mut out = [0u8; 2];
        assert_eq!(buffer.read(&mut out), 2);
        // data below the read offset is dropped
        buffer.insert(0, Bytes::from_static(b"ab"), false).unwrap();
        assert_eq!(read_all(&mut buffer), b"cd");
        assert_eq!(buffer.read_offset(), 4);
    }

    #[test]
    fn test_partial_read_keeps_remainder() {
        let mut buffer = ReassemblyBuffer::new();
        buffer.insert(0, Bytes::from_static(b"abcdef"), false).unwrap();
        let mut out = [0u8; 4];
        assert_eq!(buffer.read(&mut out), 4);
        assert_eq!(&out, b"abcd");
        assert_eq!(read_all(&mut buffer), b"ef");
    }

    #[test]
    fn test_fin_and_eof() {
        let mut buffer = ReassemblyBuffer::new();
        buffer.insert(0, Bytes::from_static(b"ab"), true).unwrap();
        assert!(!buffer.is_eof());
        assert_eq!(read_all(&mut buffer), b"ab");
        assert!(buffer.is_eof());
    }

    #[test]
    fn test_empty_fin_is_immediate_eof() {
        let mut buffer = ReassemblyBuffer::new();
        buffer.insert(0, Bytes::new(), true).unwrap();
        assert!(buffer.is_eof());
    }

    #[test]
    fn test_data_beyond_final_offset() {
        let mut buffer = ReassemblyBuffer::new();
        buffer.insert(0, Bytes::from_static(b"ab"), true).unwrap();
        assert_eq!(
            buffer.insert(2, Bytes::from_static(b"c"), false),
            Err(Error::InvalidFinalOffset)
        );
    }

    #[test]
    fn test_conflicting_fin() {
        let mut buffer = ReassemblyBuffer::new();
        buffer.insert(4, Bytes::from_static(b"ef"), false).unwrap();
        assert_eq!(
            buffer.insert(0, Bytes::from_static(b"ab"), true),
            Err(Error::InvalidFinalOffset)
        );

        buffer.insert(6, Bytes::new(), true).unwrap();
        assert_eq!(
            buffer.insert(0, Bytes::from_static(b"abcd"), true),
            Err(Error::InvalidFinalOffset)
        );
        // repeating the same FIN is fine
        buffer.insert(4, Bytes::from_static(b"ef"), true).unwrap();
    }

    /// Heap's algorithm over fragment orderings.
    fn permutations<T: Clone>(items: &mut Vec<T>, k: usize, out: &mut Vec<Vec<T>>) {
        if k <= 1 {
            out.push(items.clone());
            return;
        }
        permutations(items, k - 1, out);
        for i in 0..k - 1 {
            if k % 2 == 0 {
                items.swap(i, k - 1);
            } else {
                items.swap(0, k - 1);
            }
            permutations(items, k - 1, out);
        }
    }

    #[test]
    fn test_any_arrival_order_reassembles() {
        let payload: Vec<u8> = (0u8..12).collect();
        let mut fragments = vec![
            (0u64, 0usize, 3usize, false),
            (2, 2, 7, false),
            (7, 7, 10, false),
            (9, 9, 12, false),
            (12, 12, 12, true),
        ];

        let mut orders = Vec::new();
        let len = fragments.len();
        permutations(&mut fragments, len, &mut orders);
        assert_eq!(orders.len(), 120);

        for order in orders {
            let mut buffer = ReassemblyBuffer::new();
            for (offset, from, to, fin) in order {
                let data = Bytes::copy_from_slice(&payload[from..to]);
                buffer.insert(offset, data, fin).unwrap();
            }
            assert_eq!(read_all(&mut buffer), payload);
            assert!(buffer.is_eof());
        }
    }
}
