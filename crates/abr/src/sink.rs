use std::{collections::VecDeque, sync::Mutex};

use bytes::Bytes;
use serde::Serialize;

use crate::{time::TimeValue, StreamType};

/// Reasons an access unit should not be presented.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DropFlags(u8);

impl DropFlags {
    pub const PTS_TOO_EARLY: DropFlags = DropFlags(1);
    pub const DTS_TOO_EARLY: DropFlags = DropFlags(1 << 1);
    pub const PTS_TOO_LATE: DropFlags = DropFlags(1 << 2);
    pub const DTS_TOO_LATE: DropFlags = DropFlags(1 << 3);

    pub fn contains(&self, other: DropFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: DropFlags) {
        self.0 |= other.0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn is_too_late(&self) -> bool {
        self.0 & (Self::PTS_TOO_LATE.0 | Self::DTS_TOO_LATE.0) != 0
    }
}

/// One demuxed sample, with timestamps on the presentation timeline.
#[derive(Debug, Clone)]
pub struct AccessUnit {
    pub stream_type: StreamType,
    pub dts: TimeValue,
    pub pts: TimeValue,
    pub duration: TimeValue,
    pub data: Bytes,
    pub is_sync_sample: bool,
    /// Synthesized filler without payload.
    pub is_dummy_data: bool,
    pub is_last_in_period: bool,
    pub drop_flags: DropFlags,
    pub period_id: String,
    pub representation_id: String,
    pub bitrate: u64,
    pub playback_sequence_id: u32,
}

/// Receiver of demuxed access units.
pub trait AccessUnitSink: Send + Sync {
    /// Hands `au` to the sink. A full sink returns it back.
    fn push(&self, au: AccessUnit) -> Result<(), AccessUnit>;

    /// Duration of the media buffered and not yet consumed.
    fn buffered_duration(&self) -> TimeValue;
}

struct BufferState {
    queue: VecDeque<AccessUnit>,
    duration: TimeValue,
}

/// FIFO of access units bounded by the buffered duration.
pub struct AccessUnitBuffer {
    max_duration: TimeValue,
    state: Mutex<BufferState>,
}

impl AccessUnitBuffer {
    pub fn new(max_duration: TimeValue) -> Self {
        Self {
            max_duration,
            state: Mutex::new(BufferState {
                queue: VecDeque::new(),
                duration: TimeValue::zero(),
            }),
        }
    }

    pub fn pop(&self) -> Option<AccessUnit> {
        let mut state = self.state.lock().unwrap();
        let au = state.queue.pop_front()?;
        state.duration -= au.duration;
        if state.queue.is_empty() {
            state.duration = TimeValue::zero();
        }
        Some(au)
    }

    /// Removes everything up to and including `pts`.
    pub fn consume_until(&self, pts: TimeValue) -> Vec<AccessUnit> {
        let mut consumed = Vec::new();
        let mut state = self.state.lock().unwrap();
        while state.queue.front().is_some_and(|au| au.pts <= pts) {
            if let Some(au) = state.queue.pop_front() {
                state.duration -= au.duration;
                consumed.push(au);
            }
        }
        if state.queue.is_empty() {
            state.duration = TimeValue::zero();
        }
        consumed
    }

    pub fn drain(&self) -> Vec<AccessUnit> {
        let mut state = self.state.lock().unwrap();
        state.duration = TimeValue::zero();
        state.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AccessUnitSink for AccessUnitBuffer {
    fn push(&self, au: AccessUnit) -> Result<(), AccessUnit> {
        let mut state = self.state.lock().unwrap();
        // An empty buffer always accepts, so a single oversized unit cannot block the stream.
        if !state.queue.is_empty() && state.duration + au.duration > self.max_duration {
            return Err(au);
        }
        state.duration += au.duration;
        state.queue.push_back(au);
        Ok(())
    }

    fn buffered_duration(&self) -> TimeValue {
        self.state.lock().unwrap().duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn au(pts: f64, duration: f64) -> AccessUnit {
        AccessUnit {
            stream_type: StreamType::Video,
            dts: TimeValue::from_seconds(pts),
            pts: TimeValue::from_seconds(pts),
            duration: TimeValue::from_seconds(duration),
            data: Bytes::new(),
            is_sync_sample: true,
            is_dummy_data: false,
            is_last_in_period: false,
            drop_flags: DropFlags::default(),
            period_id: "p0".to_string(),
            representation_id: "v1".to_string(),
            bitrate: 0,
            playback_sequence_id: 0,
        }
    }

    #[test]
    fn test_buffer_is_bounded_by_duration() {
        let buffer = AccessUnitBuffer::new(TimeValue::from_seconds(1.0));
        assert!(buffer.push(au(0.0, 0.5)).is_ok());
        assert!(buffer.push(au(0.5, 0.5)).is_ok());
        let rejected = buffer.push(au(1.0, 0.5)).unwrap_err();
        assert_eq!(rejected.pts, TimeValue::from_seconds(1.0));
        assert_eq!(buffer.buffered_duration(), TimeValue::from_seconds(1.0));

        assert_eq!(buffer.pop().unwrap().pts, TimeValue::zero());
        assert!(buffer.push(rejected).is_ok());
        assert_eq!(buffer.consume_until(TimeValue::from_seconds(0.5)).len(), 1);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_drop_flags() {
        let mut flags = DropFlags::default();
        assert!(flags.is_empty());
        flags.insert(DropFlags::PTS_TOO_LATE);
        assert!(flags.contains(DropFlags::PTS_TOO_LATE));
        assert!(!flags.contains(DropFlags::PTS_TOO_EARLY));
        assert!(flags.is_too_late());
    }
}
