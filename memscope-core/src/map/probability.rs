/*!
Heuristic plausibility scoring of candidate instances.

Scores are a pure function of the memory snapshot, the type catalog and
the instance under test: no hidden state, so repeated runs over the same
snapshot reproduce identical probabilities.

The degradation weights were tuned against real kernel images; the
acceptance threshold and the overlap penalty weight are configuration
inputs, not constants.
*/

use crate::instance::Instance;
use crate::mem::AddressSpace;
use crate::symbols::{TypeCatalog, TypeKind};
use crate::types::Address;

/// Degradation for an instance at an invalid address.
pub const DEG_INVALID_INSTANCE: f32 = 0.99;
/// Degradation for a pointer member with an implausible target.
pub const DEG_INVALID_POINTER: f32 = 0.9;
/// Maximum degradation for invalid pointer children of an aggregate.
pub const DEG_INVALID_CHILD: f32 = 0.5;
/// Degradation for an address that misses its type's natural alignment.
pub const DEG_UNALIGNED: f32 = 0.3;
/// Fixed lowered score for instances whose type the catalog cannot
/// resolve; such nodes are recorded, not dropped, so the gap stays
/// visible to consumers.
pub const PROB_UNRESOLVED: f32 = 0.25;

/// Embedded aggregates are scored recursively down to this depth.
const MAX_SCORE_DEPTH: usize = 8;
/// Number of leading array elements probed when scoring an array of
/// aggregates.
const MAX_ARRAY_PROBE: usize = 4;

/// Checks whether `addr` is a plausible location for a kernel object:
/// non-null, not all-ones, canonical, kernel-owned, at least 4-byte
/// aligned and actually mapped in the snapshot.
pub fn valid_address<A: AddressSpace>(mem: &A, addr: Address) -> bool {
    addr_shape_ok(addr) && mem.is_kernel(addr) && addr.is_aligned(4) && mem.read_u8(addr).is_ok()
}

fn addr_shape_ok(addr: Address) -> bool {
    !addr.is_null() && addr.is_valid() && addr.is_canonical()
}

/// Null and all-ones are legitimate default pointer values, not errors.
fn is_default_ptr(value: Address) -> bool {
    value.is_null() || !value.is_valid()
}

/// Clamps the configured overlap weight and applies it once.
///
/// The clamp guarantees the penalty can only reduce a score, never zero
/// out a structurally sound object.
pub fn apply_overlap_penalty(base: f32, weight: f32) -> f32 {
    let weight = weight.max(0.0).min(0.95);
    base * (1.0 - weight)
}

/// Checks whether two extents overlap without either fully containing
/// the other. Containment is the normal layout of a member embedded in
/// its parent object and carries no penalty; a partial overlap means at
/// least one of the two interpretations describes an allocation of the
/// wrong size.
pub fn incompatible_extent(a: Address, a_size: usize, b: Address, b_size: usize) -> bool {
    let (a_start, a_end) = (a.as_u64(), a.as_u64().saturating_add(a_size.max(1) as u64));
    let (b_start, b_end) = (b.as_u64(), b.as_u64().saturating_add(b_size.max(1) as u64));
    if a_start >= b_end || b_start >= a_end {
        return false;
    }
    let a_in_b = b_start <= a_start && a_end <= b_end;
    let b_in_a = a_start <= b_start && b_end <= a_end;
    !a_in_b && !b_in_a
}

/// Scores the plausibility that `inst` is a genuine live object.
pub fn score_instance<C: TypeCatalog, A: AddressSpace>(
    catalog: &C,
    mem: &A,
    inst: &Instance,
) -> f32 {
    score_depth(catalog, mem, inst, 0)
}

fn score_depth<C: TypeCatalog, A: AddressSpace>(
    catalog: &C,
    mem: &A,
    inst: &Instance,
    depth: usize,
) -> f32 {
    // userspace, obviously invalid or unmapped addresses score zero
    // outright
    if !addr_shape_ok(inst.address) || !mem.is_kernel(inst.address) {
        return 0.0;
    }
    if mem.read_u8(inst.address).is_err() {
        return 0.0;
    }

    let desc = match catalog.strip(inst.type_id) {
        Ok((_, desc)) => desc,
        Err(_) => return PROB_UNRESOLVED,
    };

    let mut prob = 1.0f32;

    // natural-alignment penalty; packed structures are tolerated, not
    // rejected
    let align = catalog.align_of(inst.type_id) as u64;
    if align > 1 && !inst.address.is_aligned(align) {
        prob *= 1.0 - DEG_UNALIGNED;
    }

    match &desc.kind {
        TypeKind::Pointer { .. } | TypeKind::FuncPointer => {
            let ptr_size = if desc.size == 0 { 8 } else { desc.size };
            match mem.read_ptr(inst.address, ptr_size) {
                Ok(value) if is_default_ptr(value) => prob,
                Ok(value) if valid_address(mem, value) => prob,
                _ => prob * (1.0 - DEG_INVALID_POINTER),
            }
        }
        TypeKind::Struct { members } | TypeKind::Union { members } => {
            if is_list_head_shape(catalog, &desc.name, members)
                && !valid_list_head(catalog, mem, inst, members)
            {
                return prob * (1.0 - DEG_INVALID_INSTANCE);
            }
            score_members(catalog, mem, inst, members, prob, depth)
        }
        TypeKind::Array { elem, count } => {
            let probe = count.unwrap_or(0).min(MAX_ARRAY_PROBE);
            if probe == 0 || depth >= MAX_SCORE_DEPTH {
                return prob;
            }
            let elem_aggregate = matches!(
                catalog.strip(*elem).map(|(_, d)| d.kind.is_struct_or_union()),
                Ok(true)
            );
            if !elem_aggregate {
                return prob;
            }
            for i in 0..probe {
                if let Ok(e) = inst.array_elem(catalog, i) {
                    let child = score_depth(catalog, mem, &e, depth + 1);
                    prob *= 1.0 - (1.0 - child) * DEG_INVALID_CHILD;
                }
            }
            prob
        }
        // purely numeric leaves bottom out at a neutral score
        _ => prob,
    }
}

fn score_members<C: TypeCatalog, A: AddressSpace>(
    catalog: &C,
    mem: &A,
    inst: &Instance,
    members: &[crate::symbols::MemberDesc],
    mut prob: f32,
    depth: usize,
) -> f32 {
    let mut tested = 0usize;
    let mut invalid = 0usize;

    for member in members {
        let view = match inst.member(catalog, &member.name) {
            Ok(view) => view,
            Err(_) => {
                // member with an unresolved type counts against the parent
                tested += 1;
                invalid += 1;
                continue;
            }
        };
        let kind = match catalog.strip(view.type_id) {
            Ok((_, desc)) => &desc.kind,
            Err(_) => {
                tested += 1;
                invalid += 1;
                continue;
            }
        };
        match kind {
            TypeKind::Pointer { .. } | TypeKind::FuncPointer => {
                tested += 1;
                let ptr_size = match catalog.size_of(view.type_id) {
                    Ok(4) => 4,
                    _ => 8,
                };
                match mem.read_ptr(view.address, ptr_size) {
                    Ok(value) if is_default_ptr(value) => {}
                    Ok(value) if valid_address(mem, value) => {}
                    _ => invalid += 1,
                }
            }
            TypeKind::Struct { .. } | TypeKind::Union { .. } if depth < MAX_SCORE_DEPTH => {
                // embedded aggregate: recurse and blend; a hopeless child
                // degrades the parent by at most DEG_INVALID_CHILD
                let child = score_depth(catalog, mem, &view, depth + 1);
                prob *= 1.0 - (1.0 - child) * DEG_INVALID_CHILD;
            }
            _ => {}
        }
    }

    if tested > 0 && invalid > 0 {
        let invalid_pct = invalid as f32 / tested as f32;
        prob *= invalid_pct * (1.0 - DEG_INVALID_CHILD) + (1.0 - invalid_pct);
    }
    prob
}

/// A `struct list_head` with two pointer members at offsets 0 and
/// pointer-size. The ring check is reserved for the named kernel type;
/// other two-pointer structs keep the general member scoring.
fn is_list_head_shape<C: TypeCatalog>(
    catalog: &C,
    name: &str,
    members: &[crate::symbols::MemberDesc],
) -> bool {
    if name != "struct list_head" || members.len() != 2 {
        return false;
    }
    let ptr_size = match catalog.size_of(members[0].type_id) {
        Ok(s) => s as u64,
        Err(_) => return false,
    };
    members.iter().all(|m| {
        matches!(
            catalog.strip(m.type_id).map(|(_, d)| &d.kind),
            Ok(TypeKind::Pointer { .. })
        )
    }) && members[0].byte_offset() == 0
        && members[1].byte_offset() == ptr_size
}

/// Validates the `next->prev == self` invariant of a list head.
///
/// Default next values (null, all-ones) and self-referential empty lists
/// pass; an unreadable or inconsistent back-pointer fails.
fn valid_list_head<C: TypeCatalog, A: AddressSpace>(
    catalog: &C,
    mem: &A,
    inst: &Instance,
    members: &[crate::symbols::MemberDesc],
) -> bool {
    let ptr_size = match catalog.size_of(members[0].type_id) {
        Ok(s) => s,
        Err(_) => return false,
    };
    let next = match mem.read_ptr(inst.address, ptr_size) {
        Ok(v) => v,
        Err(_) => return false,
    };
    let prev = match mem.read_ptr(inst.address + ptr_size, ptr_size) {
        Ok(v) => v,
        Err(_) => return false,
    };
    if is_default_ptr(next) || next == prev {
        return true;
    }
    // next->prev must point back at this list head
    match mem.read_ptr(next + ptr_size, ptr_size) {
        Ok(back) => back == inst.address,
        Err(_) => false,
    }
}
