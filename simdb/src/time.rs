//! The global simulation clock, stored as a component on a distinguished
//! singleton entity so it replicates to snapshots like any other value.

use crate::component::Component;
use crate::storage::column::PlainColumn;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlobalTime {
    /// Monotonic frame counter.
    pub frame_number: u64,
    /// Scaled seconds elapsed since the previous frame.
    pub delta_seconds: f32,
    /// Scaled seconds elapsed since the simulation started.
    pub total_seconds: f64,
    /// Multiplier applied to wall deltas; 0 pauses, 2 runs double speed.
    pub time_scale: f32,
}

impl Default for GlobalTime {
    fn default() -> Self {
        Self {
            frame_number: 0,
            delta_seconds: 0.0,
            total_seconds: 0.0,
            time_scale: 1.0,
        }
    }
}

impl Component for GlobalTime {
    type Storage = PlainColumn<Self>;
}

impl GlobalTime {
    /// The next frame's time given a wall-clock delta.
    pub fn advanced_by(&self, wall_delta_seconds: f32) -> Self {
        let scaled = wall_delta_seconds * self.time_scale;
        Self {
            frame_number: self.frame_number + 1,
            delta_seconds: scaled,
            total_seconds: self.total_seconds + f64::from(scaled),
            time_scale: self.time_scale,
        }
    }
}
