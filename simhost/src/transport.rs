//! Transport boundary.
//!
//! The core never talks to a wire. Descriptor translators implement these
//! capabilities against a concrete transport and bridge samples into the
//! world through command buffers; the gateway and host only consume the
//! traits.

use simdb::{CommandBuffer, SimulationView};

use crate::error::Result;

pub type NodeId = u32;

/// Who participates in replicating which entity types.
pub trait NetworkTopology: Send {
    fn local_node(&self) -> NodeId;

    /// Nodes that must confirm lifecycle transitions for the given entity
    /// type, the local node included if it participates.
    fn peers_for(&self, entity_type_id: u32) -> Vec<NodeId>;
}

/// Fixed topology where every entity type involves the same node set.
pub struct StaticTopology {
    local: NodeId,
    nodes: Vec<NodeId>,
}

impl StaticTopology {
    pub fn new(local: NodeId, nodes: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            local,
            nodes: nodes.into_iter().collect(),
        }
    }
}

impl NetworkTopology for StaticTopology {
    fn local_node(&self) -> NodeId {
        self.local
    }

    fn peers_for(&self, _entity_type_id: u32) -> Vec<NodeId> {
        self.nodes.clone()
    }
}

/// Consumes incoming samples of message type `T` and enqueues the resulting
/// component and event changes through the command buffer.
pub trait DataReader<T>: Send {
    fn poll_ingress(
        &mut self,
        view: &SimulationView<'_>,
        commands: &mut CommandBuffer,
    ) -> Result<usize>;
}

/// Scans entities the local node is authoritative for and emits samples of
/// message type `T`.
pub trait DataWriter<T>: Send {
    fn scan_and_publish(&mut self, view: &SimulationView<'_>) -> Result<usize>;
}
