//! Frame-tagged event history.
//!
//! Snapshot providers sync component data on their own cadence, but a
//! replica that wakes up every sixth frame must still see the events of the
//! five frames it slept through. The accumulator keeps a ring of per-frame
//! batches and replays the tail a replica has not seen yet.

use std::collections::VecDeque;

use crate::event::{EventBatch, EventBus};

struct FrameRecord {
    tick: u64,
    batches: Vec<Box<dyn EventBatch>>,
}

pub struct EventAccumulator {
    frames: VecDeque<FrameRecord>,
    max_history_frames: usize,
}

impl EventAccumulator {
    pub fn new(max_history_frames: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(max_history_frames),
            max_history_frames,
        }
    }

    /// Snapshots the bus's current-frame events (call before the buffer
    /// swap) under `tick`. Frames older than the history window fall off.
    pub fn record_frame(&mut self, bus: &EventBus, tick: u64) {
        let batches = bus.snapshot_current_buffers();
        if !batches.is_empty() {
            self.frames.push_back(FrameRecord { tick, batches });
        }
        while let Some(front) = self.frames.front() {
            if self.frames.len() > self.max_history_frames
                || tick.saturating_sub(front.tick) >= self.max_history_frames as u64
            {
                self.frames.pop_front();
            } else {
                break;
            }
        }
    }

    /// Appends every recorded entry newer than `last_seen_tick` into the
    /// target's current buffers. Returns the number of events flushed.
    pub fn flush_to(&self, target: &mut EventBus, last_seen_tick: u64) -> usize {
        let mut flushed = 0;
        for frame in &self.frames {
            if frame.tick <= last_seen_tick {
                continue;
            }
            for batch in &frame.batches {
                batch.append_to(target);
                flushed += batch.len();
            }
        }
        flushed
    }

    pub fn recorded_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn newest_tick(&self) -> Option<u64> {
        self.frames.back().map(|f| f.tick)
    }
}
