//! Network gateway: the lifecycle participant that speaks for remote peers.
//!
//! Entities carrying the [`PendingNetworkAck`] marker are not acknowledged
//! to the lifecycle barrier until every peer in the topology has reported
//! the entity through an [`EntityLifecycleStatus`]. Entities without the
//! marker are acknowledged immediately; a peer that never answers is
//! overridden by the frame timeout so one silent node cannot wedge local
//! spawning forever.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use simdb::{Component, Entity, Event, LifecycleState, PlainColumn, SimulationView};

use crate::error::{HostError, Result};
use crate::lifecycle::{ConstructionAck, ConstructionOrder, DestructionAck, DestructionOrder};
use crate::module::{ExecutionPolicy, Module, ModuleId};
use crate::transport::{NetworkTopology, NodeId};

/// Marker component: activation must wait for peer acknowledgements. The
/// network id is the entity's cluster-wide identity.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PendingNetworkAck {
    pub network_id: u64,
}

impl Component for PendingNetworkAck {
    type Storage = PlainColumn<Self>;
}

/// A peer's report about one replicated entity (network boundary event).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityLifecycleStatus {
    pub node_id: NodeId,
    pub entity_network_id: u64,
    pub state: LifecycleState,
}

impl Event for EntityLifecycleStatus {}

#[derive(Debug)]
struct PendingPeerAcks {
    entity: Entity,
    expected: HashSet<NodeId>,
    start_frame: u64,
}

pub struct NetworkGateway {
    id: Option<ModuleId>,
    topology: Box<dyn NetworkTopology>,
    timeout_frames: u64,
    pending: HashMap<u64, PendingPeerAcks>,
    timeout_count: u64,
}

impl NetworkGateway {
    pub fn new(topology: Box<dyn NetworkTopology>, timeout_frames: u64) -> Self {
        Self {
            id: None,
            topology,
            timeout_frames,
            pending: HashMap::new(),
            timeout_count: 0,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn timeout_count(&self) -> u64 {
        self.timeout_count
    }

    fn ack_construction(
        module_id: ModuleId,
        entity: Entity,
        commands: &mut simdb::CommandBuffer,
        clear_marker: bool,
    ) {
        commands.publish_event(ConstructionAck {
            entity,
            module_id,
            success: true,
            error: None,
        });
        if clear_marker {
            commands.remove_component::<PendingNetworkAck>(entity);
        }
    }
}

impl Module for NetworkGateway {
    fn name(&self) -> &str {
        "network_gateway"
    }

    fn policy(&self) -> ExecutionPolicy {
        ExecutionPolicy::synchronous()
    }

    fn on_registered(&mut self, id: ModuleId) {
        self.id = Some(id);
    }

    fn tick(&mut self, view: &mut SimulationView<'_>, _dt: f32) -> Result<()> {
        let my_id = self.id.ok_or_else(|| {
            HostError::InvalidState("gateway ticked before registration".to_string())
        })?;
        let frame = view.time().frame_number;
        let orders = view.consume_events::<ConstructionOrder>().to_vec();
        let statuses = view.consume_events::<EntityLifecycleStatus>().to_vec();
        let destructions = view.consume_events::<DestructionOrder>().to_vec();

        for order in &orders {
            let marker = view
                .get_component_ro::<PendingNetworkAck>(order.entity)
                .ok()
                .copied();
            let Some(marker) = marker else {
                // Nothing to wait for; confirm right away.
                Self::ack_construction(my_id, order.entity, view.commands(), false);
                continue;
            };

            let mut expected: HashSet<NodeId> =
                self.topology.peers_for(order.type_id).into_iter().collect();
            expected.remove(&self.topology.local_node());
            if expected.is_empty() {
                Self::ack_construction(my_id, order.entity, view.commands(), true);
                continue;
            }
            log::debug!(
                "entity {} (net {}) waiting on peers {:?}",
                order.entity,
                marker.network_id,
                expected
            );
            self.pending.insert(
                marker.network_id,
                PendingPeerAcks {
                    entity: order.entity,
                    expected,
                    start_frame: frame,
                },
            );
        }

        for status in &statuses {
            let Some(pending) = self.pending.get_mut(&status.entity_network_id) else {
                continue;
            };
            // Duplicate reports from the same node are harmless.
            pending.expected.remove(&status.node_id);
            if pending.expected.is_empty() {
                let entity = pending.entity;
                self.pending.remove(&status.entity_network_id);
                Self::ack_construction(my_id, entity, view.commands(), true);
            }
        }

        for order in &destructions {
            self.pending.retain(|_, p| p.entity != order.entity);
            view.commands().publish_event(DestructionAck {
                entity: order.entity,
                module_id: my_id,
                success: true,
            });
        }

        let timeout = self.timeout_frames;
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| frame.saturating_sub(p.start_frame) > timeout)
            .map(|(net_id, _)| *net_id)
            .collect();
        for net_id in expired {
            if let Some(pending) = self.pending.remove(&net_id) {
                log::warn!(
                    "peer ack wait for entity {} (net {net_id}) timed out, acking anyway",
                    pending.entity
                );
                self.timeout_count += 1;
                Self::ack_construction(my_id, pending.entity, view.commands(), true);
            }
        }
        Ok(())
    }
}
