//! Stream table with tombstones.
//!
//! Ids are never reused: once a stream is collected its slot turns into a
//! tombstone and any later reference to that id is a protocol error.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use tracing::debug;

use super::Stream;
use crate::error::{Error, Result};
use crate::types::StreamId;

/// State of one stream id that has been seen.
#[derive(Debug, Clone)]
pub enum StreamSlot {
    Live(Stream),
    Tombstone,
}

/// Streams of one session, ordered by id.
#[derive(Debug, Default)]
pub struct StreamTable {
    slots: BTreeMap<StreamId, StreamSlot>,
}

impl StreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The live stream with this id, if any.
    pub fn get(&self, id: StreamId) -> Option<&Stream> {
        match self.slots.get(&id) {
            Some(StreamSlot::Live(stream)) => Some(stream),
            _ => None,
        }
    }

    pub fn is_tombstoned(&self, id: StreamId) -> bool {
        matches!(self.slots.get(&id), Some(StreamSlot::Tombstone))
    }

    /// Whether the id was ever used, live or collected.
    pub fn contains(&self, id: StreamId) -> bool {
        self.slots.contains_key(&id)
    }

    pub fn insert(&mut self, stream: Stream) -> Result<()> {
        let id = stream.id();
        match self.slots.get(&id) {
            Some(StreamSlot::Tombstone) => Err(Error::ReopeningStream),
            Some(StreamSlot::Live(_)) => Err(Error::StreamExists(id)),
            None => {
                self.slots.insert(id, StreamSlot::Live(stream));
                Ok(())
            }
        }
    }

    /// Replace a live stream with a tombstone, returning it.
    pub fn tombstone(&mut self, id: StreamId) -> Option<Stream> {
        let slot = self.slots.get_mut(&id)?;
        match std::mem::replace(slot, StreamSlot::Tombstone) {
            StreamSlot::Live(stream) => Some(stream),
            StreamSlot::Tombstone => None,
        }
    }

    /// Live streams in ascending id order.
    pub fn live(&self) -> impl Iterator<Item = &Stream> {
        self.slots.values().filter_map(|slot| match slot {
            StreamSlot::Live(stream) => Some(stream),
            StreamSlot::Tombstone => None,
        })
    }

    /// Slots in use, tombstones included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn live_count(&self) -> usize {
        self.live().count()
    }

    /// Tombstone every finished stream except the handshake stream,
    /// returning the collected ids.
    pub fn collect_garbage(&mut self) -> Vec<StreamId> {
        let finished: Vec<StreamId> = self
            .live()
            .filter(|stream| !stream.id().is_handshake() && stream.is_finished())
            .map(Stream::id)
            .collect();
        for id in &finished {
            self.tombstone(*id);
            debug!(stream_id = %id, "stream collected");
        }
        finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SendScheduler;

    fn stream(id: u64) -> Stream {
        Stream::new(StreamId(id), SendScheduler::new())
    }

    #[test]
    fn test_insert_and_get() {
        let mut table = StreamTable::new();
        table.insert(stream(5)).unwrap();
        assert_eq!(table.get(StreamId(5)).map(Stream::id), Some(StreamId(5)));
        assert_eq!(table.insert(stream(5)), Err(Error::StreamExists(StreamId(5))));
    }

    #[test]
    fn test_tombstone_blocks_reopening() {
        let mut table = StreamTable::new();
        table.insert(stream(5)).unwrap();
        assert!(table.tombstone(StreamId(5)).is_some());
        assert!(table.get(StreamId(5)).is_none());
        assert!(table.is_tombstoned(StreamId(5)));
        assert_eq!(table.len(), 1);
        assert_eq!(table.live_count(), 0);
        assert_eq!(table.insert(stream(5)), Err(Error::ReopeningStream));
    }

    #[test]
    fn test_garbage_collection_spares_handshake_stream() {
        let mut table = StreamTable::new();
        let handshake = stream(1);
        let data = stream(3);
        handshake.close_with_error(Error::SessionClosed);
        data.close_with_error(Error::SessionClosed);
        table.insert(handshake).unwrap();
        table.insert(data).unwrap();
        table.insert(stream(5)).unwrap();

        assert_eq!(table.collect_garbage(), vec![StreamId(3)]);
        assert!(table.get(StreamId::HANDSHAKE).is_some());
        assert!(table.get(StreamId(5)).is_some());
    }

    #[test]
    fn test_live_in_id_order() {
        let mut table = StreamTable::new();
        for id in [7, 3, 5] {
            table.insert(stream(id)).unwrap();
        }
        let ids: Vec<u64> = table.live().map(|s| s.id().value()).collect();
        assert_eq!(ids, vec![3, 5, 7]);
    }
}
