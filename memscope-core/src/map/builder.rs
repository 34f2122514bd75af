/*!
The parallel memory-map builder.

A fixed pool of worker threads drains a shared, probability-ordered task
queue. Each task interprets the bytes at one (address, type) pair, scores
the interpretation and publishes the result into the node store and range
index under a single coarse lock; accepted aggregates expand into child
tasks. All mutable build state lives in one explicitly shared handle,
constructed per build run.
*/

use super::node::{MemoryMapNode, NodeId};
use super::probability::{self, PROB_UNRESOLVED};
use super::range_tree::{RangeProps, RangeTree};
use super::store::{CandidateNode, NodeStore};
use crate::error::{Error, Result};
use crate::instance::{Instance, Origin};
use crate::mem::AddressSpace;
use crate::symbols::{TypeCatalog, TypeId, TypeKind, TypeOverrides};
use crate::types::Address;

use log::{info, trace, warn};
use smallvec::SmallVec;

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as MemOrdering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

/// Hard upper bound on the worker pool size.
const MAX_BUILDER_THREADS: usize = 32;

/// Tuning knobs of a build run.
#[derive(Copy, Clone, Debug)]
#[cfg_attr(feature = "serde_derive", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct BuildConfig {
    /// Worker threads; 0 means "one per detected hardware thread". The
    /// effective count is always clamped by hardware parallelism.
    pub max_threads: usize,
    /// Maximum traversal depth before child tasks are deferred.
    pub max_depth: u32,
    /// Maximum number of nodes before child tasks are deferred.
    pub max_nodes: usize,
    /// Minimum probability for a node to be created and expanded.
    pub acceptance_threshold: f32,
    /// Weight of the incompatible-overlap penalty, clamped to `[0, 0.95]`.
    pub overlap_penalty_weight: f32,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            max_threads: 0,
            max_depth: 64,
            max_nodes: 1_000_000,
            acceptance_threshold: 0.1,
            overlap_penalty_weight: 0.3,
        }
    }
}

/// A traversal starting point: a global kernel variable, or any
/// externally known-good address such as a slab object root.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde_derive", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct RootSpec {
    pub name: String,
    pub address: Address,
    pub type_id: TypeId,
}

impl RootSpec {
    pub fn new(name: &str, address: Address, type_id: TypeId) -> Self {
        Self {
            name: name.to_string(),
            address,
            type_id,
        }
    }
}

/// Completeness report of a (possibly partial) build.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde_derive", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct BuildStats {
    pub total_nodes: usize,
    /// Nodes at or above the acceptance threshold.
    pub accepted_nodes: usize,
    /// Nodes recorded with an unresolved type.
    pub unresolved_nodes: usize,
    pub processed_tasks: u64,
    pub rejected_tasks: u64,
    /// Tasks dropped due to depth/node budgets or cancellation.
    pub deferred_tasks: u64,
    pub elapsed: Duration,
}

struct Task {
    inst: Instance,
    parent: Option<NodeId>,
    depth: u32,
    /// Queue priority; the probability of the discovering parent.
    priority: f32,
}

impl Ord for Task {
    fn cmp(&self, other: &Self) -> Ordering {
        // highest probability first; ties resolve to the lower address
        // and type id so the pop order is deterministic
        self.priority
            .to_bits()
            .cmp(&other.priority.to_bits())
            .then_with(|| other.inst.address.cmp(&self.inst.address))
            .then_with(|| other.inst.type_id.cmp(&self.inst.type_id))
    }
}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Task {}

#[derive(Default)]
struct QueueInner {
    heap: BinaryHeap<Task>,
    in_flight: usize,
    cancelled: bool,
}

/// Shared work queue: pops block until a task arrives, every task is
/// drained, or the build is cancelled.
#[derive(Default)]
struct TaskQueue {
    inner: Mutex<QueueInner>,
    cond: Condvar,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TaskQueue {
    /// Enqueues a task. Returns `false` when the queue no longer accepts
    /// work because the build was cancelled; the caller accounts for the
    /// dropped task.
    fn push(&self, task: Task) -> bool {
        let mut inner = lock(&self.inner);
        if inner.cancelled {
            return false;
        }
        inner.heap.push(task);
        drop(inner);
        self.cond.notify_one();
        true
    }

    /// Takes the highest-priority task, blocking while other workers may
    /// still produce new ones. Returns `None` once the queue has drained
    /// completely or the build was cancelled.
    fn pop(&self) -> Option<Task> {
        let mut inner = lock(&self.inner);
        loop {
            if inner.cancelled {
                return None;
            }
            if let Some(task) = inner.heap.pop() {
                inner.in_flight += 1;
                return Some(task);
            }
            if inner.in_flight == 0 {
                self.cond.notify_all();
                return None;
            }
            inner = self
                .cond
                .wait(inner)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn task_done(&self) {
        let mut inner = lock(&self.inner);
        inner.in_flight -= 1;
        if inner.in_flight == 0 && inner.heap.is_empty() {
            drop(inner);
            self.cond.notify_all();
        }
    }

    /// Drops all pending tasks and wakes every worker. Returns the number
    /// of tasks that were still pending.
    fn cancel(&self) -> usize {
        let mut inner = lock(&self.inner);
        inner.cancelled = true;
        let dropped = inner.heap.len();
        inner.heap.clear();
        drop(inner);
        self.cond.notify_all();
        dropped
    }
}

struct MapState {
    store: NodeStore,
    index: RangeTree,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    rejected: AtomicU64,
    deferred: AtomicU64,
    unresolved: AtomicU64,
}

struct BuildShared {
    config: BuildConfig,
    state: Mutex<MapState>,
    queue: TaskQueue,
    cancel: AtomicBool,
    counters: Counters,
    started: coarsetime::Instant,
}

/// Handle to a running or finished build.
///
/// Holds all mutable state of the run; dropping the handle cancels the
/// build and joins the workers. The node set is a monotonically growing
/// approximation and is safe to inspect while workers are still running.
pub struct BuildHandle {
    shared: Arc<BuildShared>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl BuildHandle {
    /// Signals cancellation. Workers finish their current task and exit;
    /// already discovered nodes remain valid and queryable.
    pub fn cancel(&self) {
        self.shared.cancel.store(true, MemOrdering::Relaxed);
        let dropped = self.shared.queue.cancel() as u64;
        self.shared
            .counters
            .deferred
            .fetch_add(dropped, MemOrdering::Relaxed);
        info!("build cancelled, {} pending tasks dropped", dropped);
    }

    /// Blocks until all workers have exited and returns the final stats.
    pub fn wait(&mut self) -> BuildStats {
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        self.stats()
    }

    pub fn is_finished(&self) -> bool {
        self.workers.iter().all(|w| w.is_finished())
    }

    /// Snapshot of all discovered nodes. Iterating the snapshot does not
    /// block the build; nodes added afterwards are not reflected.
    pub fn nodes(&self) -> Vec<MemoryMapNode> {
        lock(&self.shared.state).store.nodes().cloned().collect()
    }

    /// Snapshot of all nodes whose extent intersects `[start, end)`, in
    /// ascending address order.
    pub fn query(&self, start: Address, end: Address) -> Vec<MemoryMapNode> {
        let guard = lock(&self.shared.state);
        guard
            .index
            .query(start, end)
            .into_iter()
            .filter_map(|id| guard.store.get(id))
            .cloned()
            .collect()
    }

    /// Aggregate statistics over all nodes intersecting `[start, end)`.
    pub fn range_props(&self, start: Address, end: Address) -> RangeProps {
        lock(&self.shared.state).index.props_in_range(start, end)
    }

    /// Current completeness report; valid mid-build.
    pub fn stats(&self) -> BuildStats {
        let threshold = self.shared.config.acceptance_threshold;
        let (total, accepted) = {
            let guard = lock(&self.shared.state);
            let accepted = guard
                .store
                .nodes()
                .filter(|n| n.probability >= threshold)
                .count();
            (guard.store.len(), accepted)
        };
        let elapsed = self.shared.started.elapsed();
        BuildStats {
            total_nodes: total,
            accepted_nodes: accepted,
            unresolved_nodes: self.shared.counters.unresolved.load(MemOrdering::Relaxed) as usize,
            processed_tasks: self.shared.counters.processed.load(MemOrdering::Relaxed),
            rejected_tasks: self.shared.counters.rejected.load(MemOrdering::Relaxed),
            deferred_tasks: self.shared.counters.deferred.load(MemOrdering::Relaxed),
            elapsed: Duration::new(elapsed.as_secs(), elapsed.subsec_nanos()),
        }
    }
}

impl Drop for BuildHandle {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.cancel();
            for worker in self.workers.drain(..) {
                let _ = worker.join();
            }
        }
    }
}

fn effective_threads(requested: usize) -> usize {
    let hw = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let wanted = if requested == 0 { hw } else { requested.min(hw) };
    wanted.max(1).min(MAX_BUILDER_THREADS)
}

/// Starts an asynchronous build over `roots`.
///
/// The only fatal failure is a precondition violated before any task
/// runs: an empty root set, no root with a catalog-known type, or worker
/// spawning itself failing. Everything after that is folded into node and
/// task state and surfaced through [`BuildHandle::stats`].
pub fn build<C, A, O>(
    catalog: Arc<C>,
    mem: Arc<A>,
    overrides: Arc<O>,
    roots: &[RootSpec],
    config: BuildConfig,
) -> Result<BuildHandle>
where
    C: TypeCatalog + Send + Sync + 'static,
    A: AddressSpace + Send + Sync + 'static,
    O: TypeOverrides + Send + Sync + 'static,
{
    if roots.is_empty() {
        return Err(Error::Precondition("no root symbols"));
    }

    let shared = Arc::new(BuildShared {
        config,
        state: Mutex::new(MapState {
            store: NodeStore::new(),
            index: RangeTree::new(),
        }),
        queue: TaskQueue::default(),
        cancel: AtomicBool::new(false),
        counters: Counters::default(),
        started: coarsetime::Instant::now(),
    });

    let mut seeded = 0usize;
    for root in roots {
        if catalog.type_of(root.type_id).is_none() {
            warn!("root symbol {} has an unresolved type, skipped", root.name);
            continue;
        }
        // the queue cannot be cancelled before the workers exist
        if shared.queue.push(Task {
            inst: Instance::variable(&root.name, root.address, root.type_id),
            parent: None,
            depth: 0,
            priority: 1.0,
        }) {
            seeded += 1;
        }
    }
    if seeded == 0 {
        return Err(Error::Precondition("no resolvable root symbols"));
    }

    let threads = effective_threads(config.max_threads);
    info!("starting build: {} roots, {} worker threads", seeded, threads);

    let mut workers = Vec::with_capacity(threads);
    for i in 0..threads {
        let worker_shared = shared.clone();
        let catalog = catalog.clone();
        let mem = mem.clone();
        let overrides = overrides.clone();
        let spawned = thread::Builder::new()
            .name(format!("memscope-builder-{}", i))
            .spawn(move || worker_run(worker_shared, catalog, mem, overrides));
        match spawned {
            Ok(handle) => workers.push(handle),
            Err(_) => {
                shared.cancel.store(true, MemOrdering::Relaxed);
                shared.queue.cancel();
                return Err(Error::Precondition("failed to spawn builder thread"));
            }
        }
    }

    Ok(BuildHandle { shared, workers })
}

fn worker_run<C, A, O>(shared: Arc<BuildShared>, catalog: Arc<C>, mem: Arc<A>, overrides: Arc<O>)
where
    C: TypeCatalog + Send + Sync,
    A: AddressSpace + Send + Sync,
    O: TypeOverrides + Send + Sync,
{
    // the cancel flag is polled between tasks via the queue; a task's
    // reads and scoring run to completion as one unit of work
    while let Some(task) = shared.queue.pop() {
        process_task(&shared, &*catalog, &*mem, &*overrides, task);
        shared.queue.task_done();
    }
    trace!("builder worker exiting");
}

fn process_task<C, A, O>(shared: &BuildShared, catalog: &C, mem: &A, overrides: &O, task: Task)
where
    C: TypeCatalog,
    A: AddressSpace,
    O: TypeOverrides,
{
    shared.counters.processed.fetch_add(1, MemOrdering::Relaxed);
    let inst = &task.inst;

    let (size, resolved) = match catalog.size_of(inst.type_id) {
        Ok(size) => (size, true),
        Err(_) => (0, false),
    };

    let base = probability::score_instance(catalog, mem, inst);
    let is_candidate = inst.origin == Origin::Candidate;

    // candidate siblings are always recorded so that losing
    // interpretations stay visible as alternatives
    if resolved && base < shared.config.acceptance_threshold && !is_candidate {
        shared.counters.rejected.fetch_add(1, MemOrdering::Relaxed);
        trace!(
            "rejected {:x} as {:?} (p={:.3})",
            inst.address,
            inst.type_id,
            base
        );
        return;
    }
    if !resolved {
        shared.counters.unresolved.fetch_add(1, MemOrdering::Relaxed);
    }

    let weight = shared.config.overlap_penalty_weight;
    let (node_id, expand, prob) = {
        let mut guard = lock(&shared.state);
        let state = &mut *guard;

        // incompatible-overlap check against already indexed extents,
        // atomic with the insert below. Containment (an embedded member
        // inside its parent's extent, or an aggregate spanning already
        // discovered elements) is compatible and carries no penalty.
        let overlap_ids: SmallVec<[NodeId; 4]> = if resolved {
            let end = inst.address + size.max(1);
            state
                .index
                .query(inst.address, end)
                .into_iter()
                .filter(|&oid| {
                    state.store.get(oid).map_or(false, |n| {
                        probability::incompatible_extent(inst.address, size, n.address, n.size)
                    })
                })
                .collect()
        } else {
            SmallVec::new()
        };
        let prob = if !resolved {
            PROB_UNRESOLVED
        } else if overlap_ids.is_empty() {
            base
        } else {
            probability::apply_overlap_penalty(base, weight)
        };

        let (id, _) = state.store.insert_or_merge(CandidateNode {
            address: inst.address,
            size,
            type_id: inst.type_id,
            probability: prob,
            origin: inst.origin,
            name: inst.path.clone(),
            parent: task.parent,
            penalized: !overlap_ids.is_empty(),
        });

        // the penalty lands on both sides of an incompatible overlap,
        // independent of which side was discovered first
        for oid in overlap_ids {
            if oid == id {
                continue;
            }
            if let Some(lowered) = state.store.penalize(oid, weight) {
                if let Some(other) = state.store.get(oid) {
                    let (oa, os, ot) = (other.address, other.size, other.type_id);
                    state.index.insert(oid, oa, os, lowered, catalog.category_of(ot));
                }
            }
        }

        // re-observe on every outcome so merges that changed the stored
        // probability are reflected in the index aggregates
        if let Some(node) = state.store.get(id) {
            let (na, ns, np, nt) = (node.address, node.size, node.probability, node.type_id);
            state.index.insert(id, na, ns, np, catalog.category_of(nt));
        }

        let primary_matches = state
            .store
            .get(id)
            .map(|n| n.type_id == inst.type_id)
            .unwrap_or(false);
        let expand = primary_matches
            && prob >= shared.config.acceptance_threshold
            && state.store.try_claim_expansion(id);
        (id, expand, prob)
    };

    if expand {
        expand_node(shared, catalog, mem, overrides, &task, node_id, prob);
    }
}

/// Expands an accepted node into child tasks according to its type tag.
fn expand_node<C, A, O>(
    shared: &BuildShared,
    catalog: &C,
    mem: &A,
    overrides: &O,
    task: &Task,
    id: NodeId,
    prob: f32,
) where
    C: TypeCatalog,
    A: AddressSpace,
    O: TypeOverrides,
{
    let inst = &task.inst;
    let desc = match catalog.strip(inst.type_id) {
        Ok((_, desc)) => desc,
        Err(_) => return,
    };
    let depth = task.depth + 1;

    match &desc.kind {
        TypeKind::Struct { members } | TypeKind::Union { members } => {
            let mut pointer_targets: SmallVec<[Address; 4]> = SmallVec::new();
            for member in members {
                let view = match inst.member(catalog, &member.name) {
                    Ok(view) => view,
                    Err(_) => {
                        trace!("member {}.{} unresolved", inst.path, member.name);
                        continue;
                    }
                };
                expand_member(
                    shared,
                    catalog,
                    mem,
                    id,
                    depth,
                    prob,
                    &view,
                    &mut pointer_targets,
                );
                let candidates = inst
                    .member_candidates(catalog, overrides, &member.name)
                    .unwrap_or_default();
                for cand in candidates {
                    expand_candidate(shared, catalog, mem, id, depth, prob, &view, cand);
                }
            }
            if !pointer_targets.is_empty() {
                let mut guard = lock(&shared.state);
                for target in pointer_targets {
                    guard.store.add_pointer(id, target);
                }
            }
        }
        TypeKind::Array { .. } => {
            expand_array(shared, catalog, id, depth, prob, inst);
        }
        TypeKind::Pointer { .. } => match inst.deref(catalog, mem) {
            Ok(Some(pointee)) => {
                {
                    let mut guard = lock(&shared.state);
                    guard.store.add_pointer(id, pointee.address);
                }
                if !pointee_is_opaque(catalog, pointee.type_id) {
                    enqueue_child(shared, pointee, id, depth, prob);
                }
            }
            // a null or unmapped pointer yields zero children, never an
            // aborted build
            Ok(None) | Err(_) => {}
        },
        _ => {}
    }
}

/// Expands one struct/union member under its declared type.
#[allow(clippy::too_many_arguments)]
fn expand_member<C, A>(
    shared: &BuildShared,
    catalog: &C,
    mem: &A,
    parent: NodeId,
    depth: u32,
    prob: f32,
    view: &Instance,
    pointer_targets: &mut SmallVec<[Address; 4]>,
) where
    C: TypeCatalog,
    A: AddressSpace,
{
    let desc = match catalog.strip(view.type_id) {
        Ok((_, desc)) => desc,
        Err(_) => return,
    };
    match &desc.kind {
        TypeKind::Pointer { .. } => match view.deref(catalog, mem) {
            Ok(Some(pointee)) => {
                pointer_targets.push(pointee.address);
                if !pointee_is_opaque(catalog, pointee.type_id) {
                    enqueue_child(shared, pointee, parent, depth, prob);
                }
            }
            Ok(None) | Err(_) => {}
        },
        TypeKind::Struct { .. } | TypeKind::Union { .. } => {
            enqueue_child(shared, view.clone(), parent, depth, prob);
        }
        TypeKind::Array { elem, count } => {
            // only arrays of aggregates or pointers warrant their own
            // traversal; scalar arrays resolve with the parent
            let expandable = matches!(
                catalog.strip(*elem).map(|(_, d)| &d.kind),
                Ok(TypeKind::Struct { .. })
                    | Ok(TypeKind::Union { .. })
                    | Ok(TypeKind::Pointer { .. })
            );
            if expandable && count.is_some() {
                enqueue_child(shared, view.clone(), parent, depth, prob);
            }
        }
        _ => {}
    }
}

/// Expands one candidate interpretation of an ambiguous member as a
/// sibling task; the highest-scoring interpretation wins the merge.
#[allow(clippy::too_many_arguments)]
fn expand_candidate<C, A>(
    shared: &BuildShared,
    catalog: &C,
    mem: &A,
    parent: NodeId,
    depth: u32,
    prob: f32,
    declared: &Instance,
    cand: Instance,
) where
    C: TypeCatalog,
    A: AddressSpace,
{
    let cand_kind = match catalog.strip(cand.type_id) {
        Ok((_, desc)) => &desc.kind,
        Err(_) => return,
    };
    if let TypeKind::Pointer { .. } = cand_kind {
        if let Ok(Some(mut pointee)) = cand.deref(catalog, mem) {
            pointee.origin = Origin::Candidate;
            enqueue_child(shared, pointee, parent, depth, prob);
        }
        return;
    }

    let declared_is_ptr = matches!(
        catalog.strip(declared.type_id).map(|(_, d)| &d.kind),
        Ok(TypeKind::Pointer { .. })
    );
    if declared_is_ptr {
        // the candidate describes the pointee of the declared pointer
        if let Ok(Some(target)) = declared.deref(catalog, mem) {
            let mut sibling = cand;
            sibling.address = target.address;
            sibling.origin = Origin::Candidate;
            enqueue_child(shared, sibling, parent, depth, prob);
        }
    } else {
        // union-style ambiguity: candidate view at the member address
        enqueue_child(shared, cand, parent, depth, prob);
    }
}

fn expand_array<C: TypeCatalog>(
    shared: &BuildShared,
    catalog: &C,
    parent: NodeId,
    depth: u32,
    prob: f32,
    inst: &Instance,
) {
    let count = match catalog.strip(inst.type_id).map(|(_, d)| d.kind.clone()) {
        Ok(TypeKind::Array { count: Some(count), .. }) => count,
        // flexible arrays have no traversable extent
        _ => return,
    };
    for i in 0..count {
        match inst.array_elem(catalog, i) {
            Ok(elem) => enqueue_child(shared, elem, parent, depth, prob),
            Err(_) => break,
        }
    }
}

/// Enqueues one child task, honoring budgets and the revisit guard.
fn enqueue_child(shared: &BuildShared, inst: Instance, parent: NodeId, depth: u32, priority: f32) {
    if depth > shared.config.max_depth {
        shared.counters.deferred.fetch_add(1, MemOrdering::Relaxed);
        return;
    }
    {
        let mut guard = lock(&shared.state);
        if guard.store.len() >= shared.config.max_nodes {
            shared.counters.deferred.fetch_add(1, MemOrdering::Relaxed);
            return;
        }
        // revisit guard: one expansion per distinct (address, type)
        if let Some(existing) = guard.store.at(inst.address) {
            if existing.type_id == inst.type_id {
                let existing_id = existing.id;
                guard.store.attach(parent, existing_id);
                return;
            }
        }
    }
    // tasks refused by a cancelled queue are deferred, never silently
    // dropped
    if !shared.queue.push(Task {
        inst,
        parent: Some(parent),
        depth,
        priority,
    }) {
        shared.counters.deferred.fetch_add(1, MemOrdering::Relaxed);
    }
}

/// Pointee types with no interpretable content are not traversed.
fn pointee_is_opaque<C: TypeCatalog>(catalog: &C, type_id: TypeId) -> bool {
    matches!(
        catalog.strip(type_id).map(|(_, d)| &d.kind),
        Ok(TypeKind::Void) | Ok(TypeKind::Function)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::DummyMemory;
    use crate::symbols::{MemberDesc, NoOverrides, TypeDesc, TypeRegistry};
    use crate::types::size;

    const KERNEL: u64 = 0xffff_8800_0000_0000;

    fn catalog() -> TypeRegistry {
        let mut reg = TypeRegistry::new();
        reg.insert(TypeId(1), TypeDesc::new("u64", 8, TypeKind::Numeric { size: 8, signed: false }));
        reg.insert(
            TypeId(10),
            TypeDesc::new(
                "struct list_head",
                16,
                TypeKind::Struct {
                    members: vec![
                        MemberDesc::new("next", 0, TypeId(11)),
                        MemberDesc::new("prev", 8, TypeId(11)),
                    ],
                },
            ),
        );
        reg.insert(
            TypeId(11),
            TypeDesc::new("struct list_head *", 8, TypeKind::Pointer { target: TypeId(10) }),
        );
        reg.insert(TypeId(21), TypeDesc::new("void *", 8, TypeKind::Pointer { target: TypeId(22) }));
        reg.insert(TypeId(22), TypeDesc::new("void", 0, TypeKind::Void));
        reg
    }

    fn mem() -> DummyMemory {
        DummyMemory::with_kernel_base(Address::from(KERNEL), size::kb(64))
    }

    fn config(threads: usize) -> BuildConfig {
        BuildConfig {
            max_threads: threads,
            ..BuildConfig::default()
        }
    }

    fn run(
        reg: TypeRegistry,
        mem: DummyMemory,
        roots: &[RootSpec],
        config: BuildConfig,
    ) -> (BuildHandle, BuildStats) {
        let mut handle = build(
            Arc::new(reg),
            Arc::new(mem),
            Arc::new(NoOverrides),
            roots,
            config,
        )
        .unwrap();
        let stats = handle.wait();
        (handle, stats)
    }

    #[test]
    fn cyclic_list_terminates_with_one_node_per_element() {
        let reg = catalog();
        let mut mem = mem();
        let a = Address::from(KERNEL + 0x1000);
        let b = Address::from(KERNEL + 0x2000);
        // two-element ring
        mem.write_u64(a, b.as_u64());
        mem.write_u64(a + 8u64, b.as_u64());
        mem.write_u64(b, a.as_u64());
        mem.write_u64(b + 8u64, a.as_u64());

        let roots = [RootSpec::new("task_list", a, TypeId(10))];
        let (handle, stats) = run(reg, mem, &roots, config(1));

        assert_eq!(stats.total_nodes, 2);
        assert_eq!(stats.accepted_nodes, 2);
        let nodes = handle.nodes();
        let node_a = nodes.iter().find(|n| n.address == a).unwrap();
        let node_b = nodes.iter().find(|n| n.address == b).unwrap();
        assert_eq!(node_a.children.as_slice(), &[node_b.id]);
        assert_eq!(node_b.children.as_slice(), &[node_a.id]);
        assert_eq!(node_b.parent, Some(node_a.id));
        // the ring leads back to the root, which stays a root
        assert_eq!(node_a.parent, None);
    }

    #[test]
    fn null_and_unmapped_pointers_yield_zero_children() {
        let mut reg = catalog();
        reg.insert(
            TypeId(30),
            TypeDesc::new(
                "struct holder",
                16,
                TypeKind::Struct {
                    members: vec![
                        MemberDesc::new("head", 0, TypeId(11)),
                        MemberDesc::new("tail", 8, TypeId(11)),
                    ],
                },
            ),
        );
        let mut mem = mem();
        let base = Address::from(KERNEL + 0x1000);
        // head points past the end of the snapshot; tail is null
        mem.write_u64(base, KERNEL + 0x20_0000);
        mem.write_u64(base + 8u64, 0);

        let roots = [RootSpec::new("holder", base, TypeId(30))];
        let (handle, stats) = run(reg, mem, &roots, config(1));

        assert_eq!(stats.total_nodes, 1);
        // the unreadable pointee was scored and dropped, not fatal
        assert_eq!(stats.rejected_tasks, 1);
        let nodes = handle.nodes();
        assert!(nodes[0].children.is_empty());
    }

    #[test]
    fn unmapped_root_is_rejected_outright() {
        let mut reg = catalog();
        reg.insert(
            TypeId(70),
            TypeDesc::new(
                "struct plain",
                16,
                TypeKind::Struct {
                    members: vec![
                        MemberDesc::new("a", 0, TypeId(1)),
                        MemberDesc::new("b", 8, TypeId(1)),
                    ],
                },
            ),
        );
        // kernel-shaped address far past the end of the snapshot
        let roots = [RootSpec::new(
            "plain",
            Address::from(KERNEL + 0x100_0000),
            TypeId(70),
        )];
        let (_, stats) = run(reg, mem(), &roots, config(1));

        assert_eq!(stats.total_nodes, 0);
        assert_eq!(stats.rejected_tasks, 1);
    }

    #[test]
    fn overlap_penalty_lands_on_both_nodes() {
        fn registry() -> TypeRegistry {
            let mut reg = catalog();
            reg.insert(
                TypeId(70),
                TypeDesc::new(
                    "struct first",
                    16,
                    TypeKind::Struct {
                        members: vec![
                            MemberDesc::new("a", 0, TypeId(1)),
                            MemberDesc::new("b", 8, TypeId(1)),
                        ],
                    },
                ),
            );
            reg.insert(
                TypeId(71),
                TypeDesc::new(
                    "struct second",
                    16,
                    TypeKind::Struct {
                        members: vec![
                            MemberDesc::new("a", 0, TypeId(1)),
                            MemberDesc::new("b", 8, TypeId(1)),
                        ],
                    },
                ),
            );
            reg
        }
        let x = Address::from(KERNEL + 0x1000);
        let y = Address::from(KERNEL + 0x1008);
        let forward = [
            RootSpec::new("x", x, TypeId(70)),
            RootSpec::new("y", y, TypeId(71)),
        ];
        let backward = [
            RootSpec::new("y", y, TypeId(71)),
            RootSpec::new("x", x, TypeId(70)),
        ];
        for roots in [&forward[..], &backward[..]].iter() {
            let (handle, stats) = run(registry(), mem(), roots, config(1));
            assert_eq!(stats.total_nodes, 2);
            // both interpretations carry the penalty, whichever landed
            // in the map first
            for node in handle.nodes() {
                assert!((node.probability - 0.7).abs() < 1e-6, "{}", node.name);
            }
            let props = handle.range_props(x, y + 16usize);
            assert!((props.min_probability - 0.7).abs() < 1e-6);
        }
    }

    #[test]
    fn embedded_member_extent_is_compatible() {
        let mut reg = catalog();
        reg.insert(
            TypeId(80),
            TypeDesc::new(
                "struct stats",
                16,
                TypeKind::Struct {
                    members: vec![
                        MemberDesc::new("hits", 0, TypeId(1)),
                        MemberDesc::new("misses", 8, TypeId(1)),
                    ],
                },
            ),
        );
        reg.insert(
            TypeId(81),
            TypeDesc::new(
                "struct counter",
                24,
                TypeKind::Struct {
                    members: vec![
                        MemberDesc::new("id", 0, TypeId(1)),
                        MemberDesc::new("stats", 8, TypeId(80)),
                    ],
                },
            ),
        );
        let base = Address::from(KERNEL + 0x1000);
        let roots = [RootSpec::new("counter", base, TypeId(81))];
        let (handle, stats) = run(reg, mem(), &roots, config(1));

        // the embedded member lives inside its parent's extent; neither
        // side is penalized for it
        assert_eq!(stats.total_nodes, 2);
        for node in handle.nodes() {
            assert_eq!(node.probability, 1.0, "{}", node.name);
        }
    }

    #[test]
    fn cancelled_queue_refuses_new_tasks() {
        let queue = TaskQueue::default();
        queue.cancel();
        let task = Task {
            inst: Instance::variable("x", Address::from(KERNEL), TypeId(1)),
            parent: None,
            depth: 0,
            priority: 1.0,
        };
        assert!(!queue.push(task));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn candidate_types_compete_at_the_pointer_target() {
        let mut reg = catalog();
        reg.insert(
            TypeId(40),
            TypeDesc::new(
                "struct holder",
                8,
                TypeKind::Struct {
                    members: vec![MemberDesc::new("data", 0, TypeId(21))],
                },
            ),
        );
        reg.insert(
            TypeId(41),
            TypeDesc::new(
                "struct small",
                16,
                TypeKind::Struct {
                    members: vec![
                        MemberDesc::new("x", 0, TypeId(1)),
                        MemberDesc::new("y", 8, TypeId(1)),
                    ],
                },
            ),
        );
        reg.insert(
            TypeId(42),
            TypeDesc::new(
                "struct big",
                4096,
                TypeKind::Struct {
                    members: vec![
                        MemberDesc::new("p", 0, TypeId(11)),
                        MemberDesc::new("q", 8, TypeId(11)),
                    ],
                },
            ),
        );
        reg.add_candidates(TypeId(40), "data", vec![TypeId(41), TypeId(42)]);

        let mut mem = mem();
        let base = Address::from(KERNEL + 0x1000);
        let target = Address::from(KERNEL + 0x2000);
        mem.write_u64(base, target.as_u64());
        // as `small` the target is two plain integers; as `big` it holds
        // a garbage userspace pointer
        mem.write_u64(target, 0);
        mem.write_u64(target + 8u64, 0xdead);

        let roots = [RootSpec::new("holder", base, TypeId(40))];
        let (handle, stats) = run(reg, mem, &roots, config(1));

        let nodes = handle.nodes();
        let node = nodes.iter().find(|n| n.address == target).unwrap();
        assert_eq!(node.type_id, TypeId(41));
        assert_eq!(node.probability, 1.0);
        assert_eq!(node.alternatives.len(), 1);
        assert_eq!(node.alternatives[0].type_id, TypeId(42));
        assert!(node.alternatives[0].probability < 1.0);

        let root = nodes.iter().find(|n| n.address == base).unwrap();
        assert!(root.children.contains(&node.id));
        assert_eq!(stats.total_nodes, 2);
    }

    fn chain_registry() -> TypeRegistry {
        let mut reg = catalog();
        reg.insert(
            TypeId(50),
            TypeDesc::new(
                "struct chain",
                8,
                TypeKind::Struct {
                    members: vec![MemberDesc::new("next", 0, TypeId(51))],
                },
            ),
        );
        reg.insert(
            TypeId(51),
            TypeDesc::new("struct chain *", 8, TypeKind::Pointer { target: TypeId(50) }),
        );
        reg
    }

    fn chain_memory(len: u64) -> (DummyMemory, Address) {
        let mut mem = mem();
        let head = Address::from(KERNEL + 0x1000);
        for i in 0..len {
            let next = if i + 1 < len { KERNEL + 0x1000 + (i + 1) * 0x100 } else { 0 };
            mem.write_u64(head + (i * 0x100) as usize, next);
        }
        (mem, head)
    }

    #[test]
    fn depth_budget_defers_instead_of_diverging() {
        let (mem, head) = chain_memory(6);
        let cfg = BuildConfig {
            max_threads: 1,
            max_depth: 2,
            ..BuildConfig::default()
        };
        let roots = [RootSpec::new("chain", head, TypeId(50))];
        let (_, stats) = run(chain_registry(), mem, &roots, cfg);

        // depths 0..=2 are materialized, the rest is reported as deferred
        assert_eq!(stats.total_nodes, 3);
        assert_eq!(stats.deferred_tasks, 1);
    }

    #[test]
    fn node_budget_defers_instead_of_diverging() {
        let (mem, head) = chain_memory(6);
        let cfg = BuildConfig {
            max_threads: 1,
            max_nodes: 2,
            ..BuildConfig::default()
        };
        let roots = [RootSpec::new("chain", head, TypeId(50))];
        let (_, stats) = run(chain_registry(), mem, &roots, cfg);

        assert_eq!(stats.total_nodes, 2);
        assert!(stats.deferred_tasks >= 1);
    }

    #[test]
    fn parallel_build_is_deterministic() {
        let run_once = || {
            let (mem, head) = chain_memory(6);
            let roots = [RootSpec::new("chain", head, TypeId(50))];
            let (handle, _) = run(chain_registry(), mem, &roots, config(4));
            let mut nodes: Vec<_> = handle
                .nodes()
                .iter()
                .map(|n| (n.address, n.type_id, n.probability.to_bits()))
                .collect();
            nodes.sort_unstable();
            nodes
        };
        assert_eq!(run_once(), run_once());
    }

    #[test]
    fn unresolved_pointee_is_recorded_not_dropped() {
        let mut reg = catalog();
        reg.insert(
            TypeId(60),
            TypeDesc::new(
                "struct owner",
                8,
                TypeKind::Struct {
                    members: vec![MemberDesc::new("p", 0, TypeId(61))],
                },
            ),
        );
        // the pointee type is absent from the catalog
        reg.insert(
            TypeId(61),
            TypeDesc::new("struct missing *", 8, TypeKind::Pointer { target: TypeId(999) }),
        );
        let mut mem = mem();
        let base = Address::from(KERNEL + 0x1000);
        mem.write_u64(base, KERNEL + 0x2000);

        let roots = [RootSpec::new("owner", base, TypeId(60))];
        let (handle, stats) = run(reg, mem, &roots, config(1));

        assert_eq!(stats.total_nodes, 2);
        assert_eq!(stats.unresolved_nodes, 1);
        let nodes = handle.nodes();
        let pointee = nodes
            .iter()
            .find(|n| n.address == Address::from(KERNEL + 0x2000))
            .unwrap();
        assert_eq!(pointee.type_id, TypeId(999));
        assert_eq!(pointee.probability, PROB_UNRESOLVED);
    }

    #[test]
    fn range_queries_on_a_finished_map() {
        let (mem, head) = chain_memory(4);
        let roots = [RootSpec::new("chain", head, TypeId(50))];
        let (handle, _) = run(chain_registry(), mem, &roots, config(1));

        let hits = handle.query(head, head + 0x200usize);
        assert_eq!(hits.len(), 2);
        assert!(hits.windows(2).all(|w| w[0].address <= w[1].address));

        let props = handle.range_props(head, head + 0x400usize);
        assert_eq!(props.object_count, 4);
        assert!(props.min_probability > 0.0);
    }

    #[test]
    fn empty_or_unresolvable_roots_are_preconditions() {
        let err = build(
            Arc::new(catalog()),
            Arc::new(mem()),
            Arc::new(NoOverrides),
            &[],
            config(1),
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::Precondition(_)));

        let roots = [RootSpec::new("ghost", Address::from(KERNEL), TypeId(999))];
        let err = build(
            Arc::new(catalog()),
            Arc::new(mem()),
            Arc::new(NoOverrides),
            &roots,
            config(1),
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[test]
    fn cancellation_leaves_a_valid_partial_map() {
        let (mem, head) = chain_memory(6);
        let roots = [RootSpec::new("chain", head, TypeId(50))];
        let mut handle = build(
            Arc::new(chain_registry()),
            Arc::new(mem),
            Arc::new(NoOverrides),
            &roots,
            config(2),
        )
        .unwrap();
        handle.cancel();
        let stats = handle.wait();
        assert!(handle.is_finished());
        assert!(stats.total_nodes <= 6);
        // every surviving node is internally consistent
        for node in handle.nodes() {
            assert!(node.probability >= 0.0 && node.probability <= 1.0);
        }
    }

    #[test]
    fn stats_track_every_task_outcome() {
        let (mem, head) = chain_memory(3);
        let roots = [RootSpec::new("chain", head, TypeId(50))];
        let (_, stats) = run(chain_registry(), mem, &roots, config(1));

        assert_eq!(stats.total_nodes, 3);
        assert_eq!(stats.processed_tasks, 3);
        assert_eq!(stats.rejected_tasks, 0);
        assert_eq!(stats.deferred_tasks, 0);
        assert_eq!(stats.unresolved_nodes, 0);
    }
}
