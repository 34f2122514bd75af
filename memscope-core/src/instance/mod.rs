/*!
Typed, lazily-evaluated views of snapshot memory.

An [`Instance`] is a value object describing how to interpret the bytes at
an address according to a catalog type. It produces member sub-instances,
dereferenced pointees and array elements on demand; bytes are read afresh
from the address space on every access and never cached, so instances stay
valid even if the underlying dump is swapped between revisions.
*/

use crate::error::{Error, Result};
use crate::mem::AddressSpace;
use crate::symbols::{MemberDesc, TypeCatalog, TypeId, TypeKind, TypeOverrides};
use crate::types::Address;

use smallvec::SmallVec;

/// How an instance was discovered.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde_derive", derive(::serde::Serialize, ::serde::Deserialize))]
pub enum Origin {
    /// A global kernel variable (a traversal root).
    Variable,
    /// A member of a struct or union.
    StructMember,
    /// An element of an array.
    ArrayElement,
    /// The target of a dereferenced pointer.
    Pointee,
    /// One of several candidate interpretations of an ambiguous field.
    Candidate,
}

/// A typed view of the bytes at an address.
///
/// Identity for graph purposes is the (address, type) pair returned by
/// [`Instance::key`], not instance identity.
#[derive(Clone, Debug)]
pub struct Instance {
    pub address: Address,
    pub type_id: TypeId,
    pub origin: Origin,
    /// Unqualified name of this object (variable or member name).
    pub name: String,
    /// Fully-qualified name path, e.g. `init_task.tasks.next`.
    pub path: String,
    /// Bit-field geometry when this instance views a bit-field member.
    pub bit_size: Option<u8>,
    pub bit_offset: Option<u8>,
}

impl Instance {
    /// Creates a root instance for a global variable.
    pub fn variable(name: &str, address: Address, type_id: TypeId) -> Self {
        Self {
            address,
            type_id,
            origin: Origin::Variable,
            name: name.to_string(),
            path: name.to_string(),
            bit_size: None,
            bit_offset: None,
        }
    }

    /// Creates an instance at an externally known address, e.g. a slab
    /// object root supplied by the caller.
    pub fn at(address: Address, type_id: TypeId, origin: Origin) -> Self {
        Self {
            address,
            type_id,
            origin,
            name: String::new(),
            path: String::new(),
            bit_size: None,
            bit_offset: None,
        }
    }

    /// Graph identity of this view.
    pub fn key(&self) -> (Address, TypeId) {
        (self.address, self.type_id)
    }

    /// Effective byte size of the viewed type.
    pub fn size<C: TypeCatalog>(&self, catalog: &C) -> Result<usize> {
        catalog.size_of(self.type_id)
    }

    /// The members of this instance's (stripped) struct or union type.
    pub fn members<'a, C: TypeCatalog>(&self, catalog: &'a C) -> Result<&'a [MemberDesc]> {
        let (_, desc) = catalog.strip(self.type_id)?;
        match &desc.kind {
            TypeKind::Struct { members } | TypeKind::Union { members } => Ok(members),
            _ => Err(Error::InvalidTypeTag("members of a non-aggregate")),
        }
    }

    /// Resolves a member sub-instance by name.
    pub fn member<C: TypeCatalog>(&self, catalog: &C, name: &str) -> Result<Instance> {
        let members = self.members(catalog)?;
        let member = members
            .iter()
            .find(|m| m.name == name)
            .ok_or(Error::Other("no such member"))?;
        self.member_view(catalog, member)
    }

    /// Resolves a member sub-instance by index.
    pub fn member_at<C: TypeCatalog>(&self, catalog: &C, idx: usize) -> Result<Instance> {
        let members = self.members(catalog)?;
        let member = members.get(idx).ok_or(Error::Bounds)?;
        self.member_view(catalog, member)
    }

    fn member_view<C: TypeCatalog>(&self, catalog: &C, member: &MemberDesc) -> Result<Instance> {
        // the member's type must be known to the catalog
        if catalog.type_of(member.type_id).is_none() {
            return Err(Error::UnresolvedType);
        }
        Ok(Instance {
            address: self.address + member.byte_offset(),
            type_id: member.type_id,
            origin: Origin::StructMember,
            name: member.name.clone(),
            path: join_path(&self.path, &member.name),
            bit_size: member.bit_size,
            bit_offset: member.bit_offset,
        })
    }

    /// Dereferences a pointer instance.
    ///
    /// Returns `Ok(None)` for a null or all-ones pointer value: that is an
    /// explicit "no object" result, not an error. Fails with `Unmapped`
    /// only if the pointer cell itself cannot be read from the snapshot.
    pub fn deref<C: TypeCatalog, A: AddressSpace>(
        &self,
        catalog: &C,
        mem: &A,
    ) -> Result<Option<Instance>> {
        let (_, desc) = catalog.strip(self.type_id)?;
        let target = match desc.kind {
            TypeKind::Pointer { target } => target,
            _ => return Err(Error::InvalidTypeTag("dereference of a non-pointer")),
        };
        let ptr_size = if desc.size == 0 { 8 } else { desc.size };
        let pointee = mem.read_ptr(self.address, ptr_size)?;
        if pointee.is_null() || !pointee.is_valid() {
            return Ok(None);
        }
        Ok(Some(Instance {
            address: pointee,
            type_id: target,
            origin: Origin::Pointee,
            name: self.name.clone(),
            path: self.path.clone(),
            bit_size: None,
            bit_offset: None,
        }))
    }

    /// Resolves the `i`-th element of an array instance.
    ///
    /// Declared element counts are bounds-checked; arrays of unknown or
    /// zero length are treated as flexible and indexed unbounded.
    pub fn array_elem<C: TypeCatalog>(&self, catalog: &C, i: usize) -> Result<Instance> {
        let (_, desc) = catalog.strip(self.type_id)?;
        let (elem, count) = match desc.kind {
            TypeKind::Array { elem, count } => (elem, count),
            _ => return Err(Error::InvalidTypeTag("indexing of a non-array")),
        };
        if let Some(count) = count {
            if i >= count {
                return Err(Error::Bounds);
            }
        }
        let elem_size = catalog.size_of(elem)?;
        Ok(Instance {
            address: self.address + i * elem_size,
            type_id: elem,
            origin: Origin::ArrayElement,
            name: self.name.clone(),
            path: format!("{}[{}]", self.path, i),
            bit_size: None,
            bit_offset: None,
        })
    }

    /// Produces the candidate interpretations of a member of this
    /// instance, one sibling instance per alternative type at the same
    /// address.
    ///
    /// A rule-engine override short-circuits the ambiguity: only the
    /// overridden type is returned. Candidate types unknown to the
    /// catalog are skipped here; the gap shows up when the member's
    /// declared type is interpreted.
    pub fn member_candidates<C: TypeCatalog, O: TypeOverrides>(
        &self,
        catalog: &C,
        overrides: &O,
        member_name: &str,
    ) -> Result<SmallVec<[Instance; 4]>> {
        let (struct_id, _) = catalog.strip(self.type_id)?;
        let member = self.member(catalog, member_name)?;

        if let Some(over) = overrides.override_for(struct_id, member_name) {
            if catalog.type_of(over).is_some() {
                let mut inst = member;
                inst.type_id = over;
                inst.origin = Origin::Candidate;
                return Ok(smallvec![inst]);
            }
        }

        let mut out = SmallVec::new();
        for &cand in catalog.candidates_for(struct_id, member_name) {
            if catalog.type_of(cand).is_none() {
                continue;
            }
            let mut inst = member.clone();
            inst.type_id = cand;
            inst.origin = Origin::Candidate;
            out.push(inst);
        }
        Ok(out)
    }

    /// Reads this instance as an unsigned integer, honoring the declared
    /// size and any bit-field geometry.
    pub fn read_uint<C: TypeCatalog, A: AddressSpace>(&self, catalog: &C, mem: &A) -> Result<u64> {
        let size = self.storage_size(catalog)?;
        let raw = mem.read_uint(self.address, size)?;
        Ok(self.extract_bits(raw, size))
    }

    /// Reads this instance as a signed integer (sign-extended from the
    /// declared width or bit-field width).
    pub fn read_int<C: TypeCatalog, A: AddressSpace>(&self, catalog: &C, mem: &A) -> Result<i64> {
        let size = self.storage_size(catalog)?;
        let raw = self.extract_bits(mem.read_uint(self.address, size)?, size);
        let bits = self.bit_size.map(u64::from).unwrap_or(size as u64 * 8);
        if bits >= 64 {
            return Ok(raw as i64);
        }
        let sign = 1u64 << (bits - 1);
        Ok(((raw ^ sign).wrapping_sub(sign)) as i64)
    }

    /// Decodes an enum instance to its declared name, falling back to
    /// `"(out of range)"` for values without a mapping.
    pub fn enum_name<C: TypeCatalog, A: AddressSpace>(&self, catalog: &C, mem: &A) -> Result<String> {
        let (_, desc) = catalog.strip(self.type_id)?;
        let variants = match &desc.kind {
            TypeKind::Enum { variants } => variants,
            _ => return Err(Error::InvalidTypeTag("enum decode of a non-enum")),
        };
        let raw = self.read_int(catalog, mem)?;
        Ok(variants
            .iter()
            .find(|(v, _)| *v == raw)
            .map(|(_, name)| name.clone())
            .unwrap_or_else(|| "(out of range)".to_string()))
    }

    fn storage_size<C: TypeCatalog>(&self, catalog: &C) -> Result<usize> {
        let size = catalog.size_of(self.type_id)?;
        if size == 0 || size > 8 {
            return Err(Error::Other("unsupported integer width"));
        }
        Ok(size)
    }

    fn extract_bits(&self, raw: u64, size: usize) -> u64 {
        match (self.bit_size, self.bit_offset) {
            (Some(bits), offset) => {
                let offset = offset.unwrap_or(0) as u64;
                let mask = if bits >= 64 { !0 } else { (1u64 << bits) - 1 };
                (raw >> offset) & mask
            }
            _ => {
                if size >= 8 {
                    raw
                } else {
                    raw & ((1u64 << (size * 8)) - 1)
                }
            }
        }
    }
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", parent, name)
    }
}
