//! Stream registry: id → live stream.
//!
//! Only non-terminal streams are stored. Removal is idempotent because the
//! graceful-close path and transport invalidation may both try to remove the
//! same id.

use std::collections::HashMap;

use relaymux_core::{RelayError, Result, StreamId};

use crate::stream::Stream;

/// Live streams keyed by id.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    streams: HashMap<StreamId, Stream>,
}

impl StreamRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a stream under its own id. Fails with
    /// [`RelayError::DuplicateId`] if the id is live, leaving the existing
    /// stream untouched.
    pub fn create(&mut self, stream: Stream) -> Result<&mut Stream> {
        use std::collections::hash_map::Entry;

        match self.streams.entry(stream.id().clone()) {
            Entry::Occupied(entry) => Err(RelayError::DuplicateId(entry.key().clone())),
            Entry::Vacant(entry) => Ok(entry.insert(stream)),
        }
    }

    /// Look up a live stream.
    pub fn get(&self, id: &StreamId) -> Result<&Stream> {
        self.streams
            .get(id)
            .ok_or_else(|| RelayError::UnknownStream(id.clone()))
    }

    /// Look up a live stream mutably.
    pub fn get_mut(&mut self, id: &StreamId) -> Result<&mut Stream> {
        self.streams
            .get_mut(id)
            .ok_or_else(|| RelayError::UnknownStream(id.clone()))
    }

    /// Whether `id` is live.
    pub fn contains(&self, id: &StreamId) -> bool {
        self.streams.contains_key(id)
    }

    /// Remove and return the stream; `None` if already gone.
    pub fn remove(&mut self, id: &StreamId) -> Option<Stream> {
        self.streams.remove(id)
    }

    /// Remove every stream.
    pub fn drain(&mut self) -> Vec<Stream> {
        self.streams.drain().map(|(_, stream)| stream).collect()
    }

    /// Number of live streams.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Whether no stream is live.
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Iterate over live streams.
    pub fn iter(&self) -> impl Iterator<Item = &Stream> {
        self.streams.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamState;
    use assert_matches::assert_matches;
    use relaymux_core::Destination;

    fn stream(id: &str, serial: u64) -> Stream {
        Stream::new(
            StreamId::from(id),
            serial,
            Destination::new("example.com", 443).unwrap(),
        )
    }

    #[test]
    fn create_then_get() {
        let mut reg = StreamRegistry::new();
        let _ = reg.create(stream("s1", 1)).unwrap();
        assert_eq!(reg.get(&StreamId::from("s1")).unwrap().serial(), 1);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn duplicate_create_keeps_original() {
        let mut reg = StreamRegistry::new();
        let _ = reg.create(stream("s1", 1)).unwrap();
        assert_matches!(
            reg.create(stream("s1", 2)),
            Err(RelayError::DuplicateId(id)) if id.as_str() == "s1"
        );
        let existing = reg.get(&StreamId::from("s1")).unwrap();
        assert_eq!(existing.serial(), 1);
        assert_eq!(existing.state(), StreamState::Pending);
    }

    #[test]
    fn get_absent_is_unknown_stream() {
        let reg = StreamRegistry::new();
        assert_matches!(reg.get(&StreamId::from("nope")), Err(RelayError::UnknownStream(_)));
    }

    #[test]
    fn remove_is_idempotent() {
        let mut reg = StreamRegistry::new();
        let _ = reg.create(stream("s1", 1)).unwrap();
        assert!(reg.remove(&StreamId::from("s1")).is_some());
        assert!(reg.remove(&StreamId::from("s1")).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn id_reusable_after_remove() {
        let mut reg = StreamRegistry::new();
        let _ = reg.create(stream("s1", 1)).unwrap();
        let _ = reg.remove(&StreamId::from("s1"));
        assert_eq!(reg.create(stream("s1", 2)).unwrap().serial(), 2);
    }

    #[test]
    fn drain_empties() {
        let mut reg = StreamRegistry::new();
        let _ = reg.create(stream("a", 1)).unwrap();
        let _ = reg.create(stream("b", 2)).unwrap();
        let drained = reg.drain();
        assert_eq!(drained.len(), 2);
        assert!(reg.is_empty());
        assert_eq!(reg.iter().count(), 0);
    }
}
