//! Per-stream parking of inbound frames.
//!
//! A paused id keeps its `data` and `close` frames in arrival order until it
//! is resumed, so one slow outbound socket never stalls the frames of other
//! streams. Everything else is delivered at once; a `connect` for a paused id
//! is answered without waiting for the old stream to drain.

use std::collections::{HashMap, VecDeque};

use relaymux_core::{Frame, StreamId};

#[derive(Debug, Default)]
pub(crate) struct FlowControl {
    paused: HashMap<StreamId, VecDeque<Frame>>,
}

impl FlowControl {
    /// Returns `false` if the id was already paused.
    pub(crate) fn pause(&mut self, id: StreamId) -> bool {
        if self.paused.contains_key(&id) {
            return false;
        }
        let _ = self.paused.insert(id, VecDeque::new());
        true
    }

    pub(crate) fn is_paused(&self, id: &StreamId) -> bool {
        self.paused.contains_key(id)
    }

    /// Park a `data` or `close` frame if its stream is paused, otherwise hand
    /// the frame back for immediate delivery.
    pub(crate) fn admit(&mut self, frame: Frame) -> Option<Frame> {
        let queue = match &frame {
            Frame::Data { id, .. } | Frame::Close { id } => self.paused.get_mut(id),
            _ => None,
        };
        match queue {
            Some(queue) => {
                queue.push_back(frame);
                None
            }
            None => Some(frame),
        }
    }

    /// Unpause and return the parked frames in arrival order.
    pub(crate) fn resume(&mut self, id: &StreamId) -> VecDeque<Frame> {
        self.paused.remove(id).unwrap_or_default()
    }

    pub(crate) fn parked(&self, id: &StreamId) -> usize {
        self.paused.get(id).map_or(0, VecDeque::len)
    }

    /// Drop every pause and parked frame. Returns the number of frames dropped.
    pub(crate) fn clear(&mut self) -> usize {
        let dropped = self.paused.values().map(VecDeque::len).sum();
        self.paused.clear();
        dropped
    }
}
