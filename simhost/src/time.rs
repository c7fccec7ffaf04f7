//! Time controllers.
//!
//! The kernel advances simulation time through a pluggable controller,
//! selected declaratively before initialization. Standalone mode follows the
//! wall clock; the master/slave variants coordinate over two wire events:
//!
//! - continuous: the master stamps frames and broadcasts `FrameOrder`;
//!   slaves snap to the newest order they have seen, no acknowledgement.
//! - lockstep: the master publishes `FrameOrder(N)` and holds the whole
//!   simulation until every known node has returned `FrameAck(N)`.
//!
//! A controller that does not advance returns `advanced: false` with a zero
//! delta; the kernel still swaps event buffers, so pending ACKs keep
//! flowing while everyone waits.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use simdb::{Event, EventBus, GlobalTime};

/// Master -> slaves: execute frame `frame_id` with this fixed delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameOrder {
    pub frame_id: u64,
    pub fixed_delta_seconds: f32,
    pub sequence: u64,
}

impl Event for FrameOrder {}

/// Slave -> master: frame `frame_id` finished on `node_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameAck {
    pub frame_id: u64,
    pub node_id: u32,
    pub total_time_seconds: f64,
}

impl Event for FrameAck {}

/// One controller step: the frame's time, and whether the frame actually
/// advanced.
#[derive(Debug, Clone, Copy)]
pub struct TimeStep {
    pub time: GlobalTime,
    pub advanced: bool,
}

pub trait TimeController: Send {
    fn update(&mut self, wall_delta_seconds: f32, events: &mut EventBus) -> TimeStep;

    fn time(&self) -> GlobalTime;
}

fn holding(time: GlobalTime) -> TimeStep {
    TimeStep {
        time: GlobalTime {
            delta_seconds: 0.0,
            ..time
        },
        advanced: false,
    }
}

// ---------------------------------------------------------------------------

/// Wall-clock time, no coordination.
pub struct StandaloneClock {
    time: GlobalTime,
}

impl StandaloneClock {
    pub fn new(time_scale: f32) -> Self {
        Self {
            time: GlobalTime {
                time_scale,
                ..GlobalTime::default()
            },
        }
    }
}

impl TimeController for StandaloneClock {
    fn update(&mut self, wall_delta_seconds: f32, _events: &mut EventBus) -> TimeStep {
        self.time = self.time.advanced_by(wall_delta_seconds);
        TimeStep {
            time: self.time,
            advanced: true,
        }
    }

    fn time(&self) -> GlobalTime {
        self.time
    }
}

// ---------------------------------------------------------------------------

/// Continuous master: advances with the wall clock and broadcasts its frame
/// stamps; never waits for anyone.
pub struct MasterContinuousClock {
    time: GlobalTime,
    sequence: u64,
}

impl MasterContinuousClock {
    pub fn new(time_scale: f32) -> Self {
        Self {
            time: GlobalTime {
                time_scale,
                ..GlobalTime::default()
            },
            sequence: 0,
        }
    }
}

impl TimeController for MasterContinuousClock {
    fn update(&mut self, wall_delta_seconds: f32, events: &mut EventBus) -> TimeStep {
        self.time = self.time.advanced_by(wall_delta_seconds);
        self.sequence += 1;
        events.publish(FrameOrder {
            frame_id: self.time.frame_number,
            fixed_delta_seconds: self.time.delta_seconds,
            sequence: self.sequence,
        });
        TimeStep {
            time: self.time,
            advanced: true,
        }
    }

    fn time(&self) -> GlobalTime {
        self.time
    }
}

// ---------------------------------------------------------------------------

/// Continuous slave: snaps to the newest `FrameOrder` seen, holds otherwise.
pub struct SlaveContinuousClock {
    time: GlobalTime,
    current_frame: i64,
}

impl SlaveContinuousClock {
    pub fn new() -> Self {
        Self {
            time: GlobalTime::default(),
            current_frame: -1,
        }
    }
}

impl Default for SlaveContinuousClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeController for SlaveContinuousClock {
    fn update(&mut self, _wall_delta_seconds: f32, events: &mut EventBus) -> TimeStep {
        let newest = events
            .consume::<FrameOrder>()
            .iter()
            .max_by_key(|order| order.frame_id)
            .cloned();
        let Some(order) = newest else {
            return holding(self.time);
        };
        if (order.frame_id as i64) <= self.current_frame {
            return holding(self.time);
        }
        self.current_frame = order.frame_id as i64;
        let scaled = order.fixed_delta_seconds * self.time.time_scale;
        self.time = GlobalTime {
            frame_number: order.frame_id,
            delta_seconds: scaled,
            total_seconds: self.time.total_seconds + f64::from(scaled),
            time_scale: self.time.time_scale,
        };
        TimeStep {
            time: self.time,
            advanced: true,
        }
    }

    fn time(&self) -> GlobalTime {
        self.time
    }
}

// ---------------------------------------------------------------------------

/// Lockstep master: publishes `FrameOrder(N)` and refuses to advance to
/// `N + 1` until every node in the peer set has acked `N`. Late ACKs are
/// ignored.
pub struct MasterLockstepClock {
    fixed_delta_seconds: f32,
    peers: HashSet<u32>,
    pending_acks: HashSet<u32>,
    current_frame: i64,
    sequence: u64,
    time: GlobalTime,
}

impl MasterLockstepClock {
    pub fn new(fixed_delta_seconds: f32, peers: impl IntoIterator<Item = u32>) -> Self {
        Self {
            fixed_delta_seconds,
            peers: peers.into_iter().collect(),
            pending_acks: HashSet::new(),
            current_frame: -1,
            sequence: 0,
            time: GlobalTime::default(),
        }
    }

    pub fn waiting_on(&self) -> &HashSet<u32> {
        &self.pending_acks
    }

    pub fn current_frame(&self) -> i64 {
        self.current_frame
    }
}

impl TimeController for MasterLockstepClock {
    fn update(&mut self, _wall_delta_seconds: f32, events: &mut EventBus) -> TimeStep {
        for ack in events.consume::<FrameAck>() {
            if ack.frame_id as i64 == self.current_frame {
                self.pending_acks.remove(&ack.node_id);
            } else if (ack.frame_id as i64) < self.current_frame {
                log::debug!(
                    "ignoring late ack for frame {} from node {}",
                    ack.frame_id,
                    ack.node_id
                );
            }
        }

        let frame_done = self.current_frame < 0 || self.pending_acks.is_empty();
        if !frame_done {
            log::trace!(
                "lockstep holding frame {}, waiting on {:?}",
                self.current_frame,
                self.pending_acks
            );
            return holding(self.time);
        }

        self.current_frame += 1;
        self.sequence += 1;
        let scaled = self.fixed_delta_seconds * self.time.time_scale;
        self.time = GlobalTime {
            frame_number: self.current_frame as u64,
            delta_seconds: scaled,
            total_seconds: self.time.total_seconds + f64::from(scaled),
            time_scale: self.time.time_scale,
        };
        events.publish(FrameOrder {
            frame_id: self.current_frame as u64,
            fixed_delta_seconds: self.fixed_delta_seconds,
            sequence: self.sequence,
        });
        self.pending_acks = self.peers.clone();
        TimeStep {
            time: self.time,
            advanced: true,
        }
    }

    fn time(&self) -> GlobalTime {
        self.time
    }
}

// ---------------------------------------------------------------------------

/// Lockstep slave: executes exactly the ordered frames and acks each one.
/// Starts at frame -1 so order 0 is accepted. An order at or behind the
/// current frame is a transport artifact and is skipped; an order ahead of
/// the expected next frame is snapped to.
pub struct SlaveLockstepClock {
    node_id: u32,
    current_frame: i64,
    time: GlobalTime,
}

impl SlaveLockstepClock {
    pub fn new(node_id: u32) -> Self {
        Self {
            node_id,
            current_frame: -1,
            time: GlobalTime::default(),
        }
    }

    pub fn current_frame(&self) -> i64 {
        self.current_frame
    }
}

impl TimeController for SlaveLockstepClock {
    fn update(&mut self, _wall_delta_seconds: f32, events: &mut EventBus) -> TimeStep {
        let newest = events
            .consume::<FrameOrder>()
            .iter()
            .max_by_key(|order| order.frame_id)
            .cloned();
        let Some(order) = newest else {
            return holding(self.time);
        };
        if (order.frame_id as i64) <= self.current_frame {
            log::warn!(
                "stale frame order {} at frame {}, skipping",
                order.frame_id,
                self.current_frame
            );
            return holding(self.time);
        }
        if order.frame_id as i64 > self.current_frame + 1 {
            log::warn!(
                "frame order jumped from {} to {}, snapping forward",
                self.current_frame,
                order.frame_id
            );
        }

        self.current_frame = order.frame_id as i64;
        let scaled = order.fixed_delta_seconds * self.time.time_scale;
        self.time = GlobalTime {
            frame_number: order.frame_id,
            delta_seconds: scaled,
            total_seconds: self.time.total_seconds + f64::from(scaled),
            time_scale: self.time.time_scale,
        };
        events.publish(FrameAck {
            frame_id: order.frame_id,
            node_id: self.node_id,
            total_time_seconds: self.time.total_seconds,
        });
        TimeStep {
            time: self.time,
            advanced: true,
        }
    }

    fn time(&self) -> GlobalTime {
        self.time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simdb::EventTypeRegistry;
    use std::sync::Arc;

    const DT: f32 = 1.0 / 60.0;

    fn bus() -> EventBus {
        EventBus::new(Arc::new(EventTypeRegistry::new()))
    }

    #[test]
    fn standalone_scales_wall_time() {
        let mut clock = StandaloneClock::new(2.0);
        let mut bus = bus();
        let step = clock.update(0.5, &mut bus);
        assert!(step.advanced);
        assert_eq!(step.time.frame_number, 1);
        assert!((step.time.delta_seconds - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn continuous_slave_follows_the_newest_order() {
        let mut master = MasterContinuousClock::new(1.0);
        let mut slave = SlaveContinuousClock::new();
        let mut bus = bus();

        master.update(DT, &mut bus);
        master.update(DT, &mut bus);
        bus.swap_buffers();

        let step = slave.update(DT, &mut bus);
        assert!(step.advanced);
        assert_eq!(slave.time().frame_number, master.time().frame_number);

        // No new orders: the slave holds.
        bus.swap_buffers();
        assert!(!slave.update(DT, &mut bus).advanced);
    }

    #[test]
    fn master_publishes_frame_zero_without_acks() {
        let mut master = MasterLockstepClock::new(DT, [2, 3]);
        let mut bus = bus();

        let step = master.update(DT, &mut bus);
        assert!(step.advanced);
        assert_eq!(master.current_frame(), 0);
        bus.swap_buffers();
        assert_eq!(bus.consume::<FrameOrder>().len(), 1);
    }

    #[test]
    fn master_waits_for_every_peer() {
        let mut master = MasterLockstepClock::new(DT, [2, 3]);
        let mut bus = bus();

        master.update(DT, &mut bus);
        bus.swap_buffers();

        // Only node 2 acks frame 0.
        bus.publish(FrameAck {
            frame_id: 0,
            node_id: 2,
            total_time_seconds: 0.0,
        });
        bus.swap_buffers();
        let held = master.update(DT, &mut bus);
        assert!(!held.advanced);
        assert_eq!(master.current_frame(), 0);
        assert_eq!(held.time.delta_seconds, 0.0);

        // Node 3 catches up; frame 1 goes out.
        bus.publish(FrameAck {
            frame_id: 0,
            node_id: 3,
            total_time_seconds: 0.0,
        });
        bus.swap_buffers();
        let advanced = master.update(DT, &mut bus);
        assert!(advanced.advanced);
        assert_eq!(master.current_frame(), 1);
    }

    #[test]
    fn late_acks_do_not_regress_state() {
        let mut master = MasterLockstepClock::new(DT, [2]);
        let mut bus = bus();

        master.update(DT, &mut bus); // frame 0
        bus.swap_buffers();
        bus.publish(FrameAck {
            frame_id: 0,
            node_id: 2,
            total_time_seconds: 0.0,
        });
        bus.swap_buffers();
        master.update(DT, &mut bus); // frame 1
        bus.swap_buffers();

        // A duplicate ack for frame 0 arrives after frame 1 went out.
        bus.publish(FrameAck {
            frame_id: 0,
            node_id: 2,
            total_time_seconds: 0.0,
        });
        bus.swap_buffers();
        let held = master.update(DT, &mut bus);
        assert!(!held.advanced);
        assert_eq!(master.current_frame(), 1);
        assert_eq!(master.waiting_on().len(), 1);
    }

    #[test]
    fn slave_accepts_frame_zero_and_acks() {
        let mut slave = SlaveLockstepClock::new(2);
        let mut bus = bus();

        bus.publish(FrameOrder {
            frame_id: 0,
            fixed_delta_seconds: DT,
            sequence: 1,
        });
        bus.swap_buffers();
        let step = slave.update(DT, &mut bus);
        assert!(step.advanced);
        assert_eq!(slave.current_frame(), 0);

        bus.swap_buffers();
        let acks = bus.consume::<FrameAck>();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].node_id, 2);
        assert_eq!(acks[0].frame_id, 0);
    }

    #[test]
    fn slave_skips_stale_orders_and_snaps_forward() {
        let mut slave = SlaveLockstepClock::new(2);
        let mut bus = bus();

        bus.publish(FrameOrder {
            frame_id: 5,
            fixed_delta_seconds: DT,
            sequence: 6,
        });
        bus.swap_buffers();
        assert!(slave.update(DT, &mut bus).advanced);
        assert_eq!(slave.current_frame(), 5);

        // A replayed earlier order must not move time backwards.
        bus.publish(FrameOrder {
            frame_id: 3,
            fixed_delta_seconds: DT,
            sequence: 4,
        });
        bus.swap_buffers();
        assert!(!slave.update(DT, &mut bus).advanced);
        assert_eq!(slave.current_frame(), 5);
    }

    // Full order/ack round trip across a shared bus: the master only ever
    // publishes frame N+1 after both slaves acked N.
    #[test]
    fn lockstep_round_trip() {
        let mut master = MasterLockstepClock::new(DT, [2, 3]);
        let mut slave2 = SlaveLockstepClock::new(2);
        let mut slave3 = SlaveLockstepClock::new(3);
        let mut bus = bus();

        for expected_frame in 0..4i64 {
            let step = master.update(DT, &mut bus);
            assert!(step.advanced);
            assert_eq!(master.current_frame(), expected_frame);

            bus.swap_buffers();
            assert!(slave2.update(DT, &mut bus).advanced);
            assert!(slave3.update(DT, &mut bus).advanced);
            bus.swap_buffers();
        }
    }
}
