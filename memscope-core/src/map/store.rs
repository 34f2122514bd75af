/*!
The node store: exclusive owner of all discovered-object nodes.

Nodes live in an arena indexed by [`NodeId`]; a primary index maps each
address to at most one node. Rediscoveries of an address merge into the
existing node instead of duplicating it, which makes the final map
independent of discovery order.
*/

use super::node::{MemoryMapNode, NodeId, TypeAlternative};
use super::probability;
use crate::instance::Origin;
use crate::symbols::TypeId;
use crate::types::Address;

use hashbrown::HashMap;
use smallvec::SmallVec;

/// A scored candidate for insertion into the store.
#[derive(Clone, Debug)]
pub struct CandidateNode {
    pub address: Address,
    pub size: usize,
    pub type_id: TypeId,
    pub probability: f32,
    pub origin: Origin,
    pub name: String,
    pub parent: Option<NodeId>,
    /// Whether the overlap penalty is already part of `probability`.
    pub penalized: bool,
}

/// What `insert_or_merge` did with a candidate.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// No node occupied the address; a new one was created.
    Inserted,
    /// The candidate outranked the existing primary type and replaced it;
    /// the old primary was demoted to an alternative.
    PrimaryReplaced,
    /// The candidate ranked below the existing primary and was recorded
    /// as an alternative.
    AlternativeAdded,
    /// The candidate matched the existing primary type; at most the
    /// probability was raised.
    Revisited,
}

/// Arena-backed store of all [`MemoryMapNode`]s of one build run.
#[derive(Default)]
pub struct NodeStore {
    arena: Vec<MemoryMapNode>,
    by_addr: HashMap<u64, NodeId>,
    by_type: HashMap<TypeId, SmallVec<[NodeId; 4]>>,
    pointers_to: HashMap<u64, SmallVec<[NodeId; 2]>>,
    roots: Vec<NodeId>,
}

/// Deterministic primary ranking: higher probability wins, ties break to
/// the lexicographically smaller type id.
fn outranks(prob: f32, type_id: TypeId, other_prob: f32, other_type: TypeId) -> bool {
    prob > other_prob || (prob == other_prob && type_id < other_type)
}

impl NodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn get(&self, id: NodeId) -> Option<&MemoryMapNode> {
        self.arena.get(id.index())
    }

    /// The node occupying `addr`, if any.
    pub fn at(&self, addr: Address) -> Option<&MemoryMapNode> {
        self.by_addr.get(&addr.as_u64()).map(|id| &self.arena[id.index()])
    }

    /// All nodes, in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &MemoryMapNode> {
        self.arena.iter()
    }

    /// Entry nodes of the graph (global kernel variables).
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// All nodes whose primary type is `type_id`.
    pub fn nodes_of_type(&self, type_id: TypeId) -> &[NodeId] {
        self.by_type.get(&type_id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// All nodes holding a pointer member that points to `addr`.
    pub fn pointers_to(&self, addr: Address) -> &[NodeId] {
        self.pointers_to
            .get(&addr.as_u64())
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Records that `from` holds a pointer whose value is `target`.
    pub fn add_pointer(&mut self, from: NodeId, target: Address) {
        let entry = self.pointers_to.entry(target.as_u64()).or_default();
        if !entry.contains(&from) {
            entry.push(from);
        }
    }

    /// Inserts `cand` or merges it into the node already occupying its
    /// address.
    ///
    /// The existence check and the insert/merge are one operation; the
    /// builder serializes calls behind the map lock so that two workers
    /// can never create separate nodes for the same address.
    pub fn insert_or_merge(&mut self, cand: CandidateNode) -> (NodeId, MergeOutcome) {
        if let Some(&id) = self.by_addr.get(&cand.address.as_u64()) {
            let outcome = self.merge(id, &cand);
            self.link_parent(id, cand.parent);
            (id, outcome)
        } else {
            let id = NodeId(self.arena.len() as u32);
            self.arena.push(MemoryMapNode {
                id,
                address: cand.address,
                size: cand.size,
                type_id: cand.type_id,
                probability: cand.probability,
                origin: cand.origin,
                name: cand.name,
                parent: None,
                children: SmallVec::new(),
                alternatives: Vec::new(),
                expanded: false,
                penalized: cand.penalized,
            });
            self.by_addr.insert(cand.address.as_u64(), id);
            self.by_type.entry(cand.type_id).or_default().push(id);
            self.link_parent(id, cand.parent);
            if cand.parent.is_none() {
                self.roots.push(id);
            }
            (id, MergeOutcome::Inserted)
        }
    }

    fn merge(&mut self, id: NodeId, cand: &CandidateNode) -> MergeOutcome {
        let node = &mut self.arena[id.index()];

        if cand.type_id == node.type_id {
            if cand.probability > node.probability {
                node.probability = cand.probability;
            }
            node.penalized |= cand.penalized;
            return MergeOutcome::Revisited;
        }

        if outranks(cand.probability, cand.type_id, node.probability, node.type_id) {
            let old_type = node.type_id;
            let old_prob = node.probability;
            node.type_id = cand.type_id;
            node.size = cand.size;
            node.probability = cand.probability;
            node.origin = cand.origin;
            // a primary change invalidates the previous expansion claim
            node.expanded = false;
            node.penalized = cand.penalized;
            Self::push_alternative(&mut node.alternatives, old_type, old_prob);
            node.alternatives.retain(|a| a.type_id != cand.type_id);
            self.reindex_type(id, old_type, cand.type_id);
            MergeOutcome::PrimaryReplaced
        } else {
            Self::push_alternative(&mut node.alternatives, cand.type_id, cand.probability);
            MergeOutcome::AlternativeAdded
        }
    }

    fn push_alternative(alternatives: &mut Vec<TypeAlternative>, type_id: TypeId, probability: f32) {
        match alternatives.iter_mut().find(|a| a.type_id == type_id) {
            Some(alt) => {
                if probability > alt.probability {
                    alt.probability = probability;
                }
            }
            None => alternatives.push(TypeAlternative { type_id, probability }),
        }
    }

    fn reindex_type(&mut self, id: NodeId, old_type: TypeId, new_type: TypeId) {
        if let Some(ids) = self.by_type.get_mut(&old_type) {
            ids.retain(|n| *n != id);
        }
        self.by_type.entry(new_type).or_default().push(id);
    }

    fn link_parent(&mut self, id: NodeId, parent: Option<NodeId>) {
        let parent = match parent {
            Some(p) if p != id => p,
            _ => return,
        };
        // roots never acquire a parent back-reference, even when a cycle
        // leads back to them
        if self.arena[id.index()].parent.is_none() && !self.roots.contains(&id) {
            self.arena[id.index()].parent = Some(parent);
        }
        let children = &mut self.arena[parent.index()].children;
        if !children.contains(&id) {
            children.push(id);
        }
    }

    /// Records `child` as reached from `parent` without re-scoring it,
    /// used when a traversal rediscovers an already stored node.
    pub fn attach(&mut self, parent: NodeId, child: NodeId) {
        self.link_parent(child, Some(parent));
    }

    /// Applies the overlap penalty to a stored node's probability, at
    /// most once per node. Returns the lowered probability on the first
    /// application.
    pub fn penalize(&mut self, id: NodeId, weight: f32) -> Option<f32> {
        let node = self.arena.get_mut(id.index())?;
        if node.penalized {
            return None;
        }
        node.penalized = true;
        node.probability = probability::apply_overlap_penalty(node.probability, weight);
        Some(node.probability)
    }

    /// Claims the expansion of a node. Returns `true` exactly once per
    /// (address, primary type) incarnation; later calls report that the
    /// node was already expanded.
    pub fn try_claim_expansion(&mut self, id: NodeId) -> bool {
        let node = &mut self.arena[id.index()];
        if node.expanded {
            false
        } else {
            node.expanded = true;
            true
        }
    }
}
