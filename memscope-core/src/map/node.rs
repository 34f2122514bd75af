/*!
Nodes of the discovered-object graph.

All graph edges are non-owning ids into the [`NodeStore`](super::NodeStore)
arena; parent back-references are lookup-only and never own, which keeps
cyclic kernel structures free of ownership cycles.
*/

use crate::instance::Origin;
use crate::symbols::TypeId;
use crate::types::Address;

use smallvec::SmallVec;

/// Index of a node within its `NodeStore`.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde_derive", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A lower-ranked interpretation of a node's address, retained for later
/// disambiguation instead of being silently discarded.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde_derive", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct TypeAlternative {
    pub type_id: TypeId,
    pub probability: f32,
}

/// A persisted, scored, typed object discovered during a build.
///
/// Created the first time a candidate instance is accepted; updated or
/// merged when the same address is rediscovered via a different path;
/// never deleted during a build run.
#[derive(Clone, Debug)]
pub struct MemoryMapNode {
    pub id: NodeId,
    pub address: Address,
    /// Byte size of the primary type (0 for void/flexible views).
    pub size: usize,
    /// The best-known (primary) type at this address.
    pub type_id: TypeId,
    /// Heuristic plausibility in `[0, 1]`.
    pub probability: f32,
    pub origin: Origin,
    /// Fully-qualified discovery path, e.g. `init_task.tasks.next`.
    pub name: String,
    /// Non-owning back-reference to the discovering parent.
    pub parent: Option<NodeId>,
    pub children: SmallVec<[NodeId; 4]>,
    /// Lower-ranked candidate types at the same address.
    pub alternatives: Vec<TypeAlternative>,
    /// Set once the node's members have been expanded into tasks; bounds
    /// cyclic structures to one expansion per (address, type).
    pub expanded: bool,
    /// Set once the overlap penalty has landed on this node; the penalty
    /// applies at most once per node.
    pub penalized: bool,
}

impl MemoryMapNode {
    /// First address past the node's extent.
    pub fn end_address(&self) -> Address {
        self.address + self.size.max(1)
    }

    /// Checks whether the node's extent intersects `[start, end)`.
    pub fn overlaps(&self, start: Address, end: Address) -> bool {
        self.address < end && start < self.end_address()
    }
}
