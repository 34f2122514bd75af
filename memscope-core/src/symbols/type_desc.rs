/*!
Type descriptors as consumed from a debug-symbol catalog.

Every type is a [`TypeDesc`] with a [`TypeKind`] tag and all traversal
logic matches on the tag explicitly; there is no dispatch through the
catalog beyond plain id lookups.
*/

use crate::error::{Error, Result};

use std::fmt;

/// Maximum length of a `Const`/`Volatile`/`Typedef` chain that is followed
/// before the referenced type is treated as unresolved. Inconsistent debug
/// info can contain referencing cycles.
const MAX_LEXICAL_DEPTH: usize = 32;

/// Opaque identifier of a type within the catalog.
///
/// The ordering of type ids is the deterministic tie-break rule when two
/// equally probable types compete for the same address.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde_derive", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct TypeId(pub u32);

impl fmt::Debug for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TypeId({})", self.0)
    }
}

impl From<u32> for TypeId {
    fn from(item: u32) -> Self {
        Self(item)
    }
}

/// A member of a struct or union type.
///
/// Offsets are given in bits to support bit-fields; for ordinary members
/// `offset_bits` is a multiple of 8 and `bit_size`/`bit_offset` are `None`.
#[derive(Clone, Debug, PartialEq)]
pub struct MemberDesc {
    pub name: String,
    pub offset_bits: u64,
    pub bit_size: Option<u8>,
    pub bit_offset: Option<u8>,
    pub type_id: TypeId,
}

impl MemberDesc {
    /// Creates an ordinary (non-bit-field) member at a byte offset.
    pub fn new(name: &str, offset: u64, type_id: TypeId) -> Self {
        Self {
            name: name.to_string(),
            offset_bits: offset * 8,
            bit_size: None,
            bit_offset: None,
            type_id,
        }
    }

    /// Creates a bit-field member.
    pub fn bitfield(name: &str, offset_bits: u64, bit_size: u8, bit_offset: u8, type_id: TypeId) -> Self {
        Self {
            name: name.to_string(),
            offset_bits,
            bit_size: Some(bit_size),
            bit_offset: Some(bit_offset),
            type_id,
        }
    }

    /// Byte offset of the member's storage unit within its parent.
    pub fn byte_offset(&self) -> u64 {
        self.offset_bits / 8
    }

    pub fn is_bitfield(&self) -> bool {
        self.bit_size.is_some()
    }
}

/// The tag of a type description.
///
/// A referencing kind whose target id is not present in the catalog is
/// representable; the gap surfaces as [`Error::UnresolvedType`] at the
/// point of use, never as a hard failure.
#[derive(Clone, Debug, PartialEq)]
pub enum TypeKind {
    /// Integer or floating point value of the given byte size.
    Numeric { size: usize, signed: bool },
    /// Pointer to another type; the pointer cell itself is `TypeDesc::size`
    /// bytes wide (4 or 8, architecture-dependent).
    Pointer { target: TypeId },
    /// Array of elements; `count == None` means the declared length is
    /// zero or unknown (flexible array members are common in kernel
    /// headers) and indexing is unbounded.
    Array { elem: TypeId, count: Option<usize> },
    Struct { members: Vec<MemberDesc> },
    Union { members: Vec<MemberDesc> },
    /// Enumeration with its integer-to-name mapping.
    Enum { variants: Vec<(i64, String)> },
    Const { target: TypeId },
    Volatile { target: TypeId },
    Typedef { target: TypeId },
    FuncPointer,
    Function,
    Void,
}

impl TypeKind {
    /// Returns the referenced type id for lexical (transparent) kinds.
    pub fn lexical_target(&self) -> Option<TypeId> {
        match self {
            TypeKind::Const { target }
            | TypeKind::Volatile { target }
            | TypeKind::Typedef { target } => Some(*target),
            _ => None,
        }
    }

    pub fn is_struct_or_union(&self) -> bool {
        matches!(self, TypeKind::Struct { .. } | TypeKind::Union { .. })
    }
}

bitflags! {
    /// OR-able category set of type tags, aggregated per subtree by the
    /// range index.
    #[cfg_attr(feature = "serde_derive", derive(::serde::Serialize, ::serde::Deserialize))]
    pub struct TypeCategory: u16 {
        const NUMERIC      = 0b0000_0000_0001;
        const POINTER      = 0b0000_0000_0010;
        const ARRAY        = 0b0000_0000_0100;
        const STRUCT       = 0b0000_0000_1000;
        const UNION        = 0b0000_0001_0000;
        const ENUM         = 0b0000_0010_0000;
        const LEXICAL      = 0b0000_0100_0000;
        const FUNC_POINTER = 0b0000_1000_0000;
        const FUNCTION     = 0b0001_0000_0000;
        const VOID         = 0b0010_0000_0000;
        const UNRESOLVED   = 0b0100_0000_0000;
    }
}

impl Default for TypeCategory {
    fn default() -> Self {
        TypeCategory::empty()
    }
}

/// A single type description as provided by the catalog.
#[derive(Clone, Debug, PartialEq)]
pub struct TypeDesc {
    pub name: String,
    /// Size in bytes. For lexical kinds a size of 0 means "inherit from
    /// the referenced type".
    pub size: usize,
    pub kind: TypeKind,
}

impl TypeDesc {
    pub fn new(name: &str, size: usize, kind: TypeKind) -> Self {
        Self {
            name: name.to_string(),
            size,
            kind,
        }
    }

    /// The category bit corresponding to this description's tag.
    pub fn category(&self) -> TypeCategory {
        match self.kind {
            TypeKind::Numeric { .. } => TypeCategory::NUMERIC,
            TypeKind::Pointer { .. } => TypeCategory::POINTER,
            TypeKind::Array { .. } => TypeCategory::ARRAY,
            TypeKind::Struct { .. } => TypeCategory::STRUCT,
            TypeKind::Union { .. } => TypeCategory::UNION,
            TypeKind::Enum { .. } => TypeCategory::ENUM,
            TypeKind::Const { .. } | TypeKind::Volatile { .. } | TypeKind::Typedef { .. } => {
                TypeCategory::LEXICAL
            }
            TypeKind::FuncPointer => TypeCategory::FUNC_POINTER,
            TypeKind::Function => TypeCategory::FUNCTION,
            TypeKind::Void => TypeCategory::VOID,
        }
    }
}

/// Immutable lookup service over debug-symbol type information.
///
/// Implementations must be safe for concurrent reads from multiple worker
/// threads; a catalog is never mutated for the duration of a build.
pub trait TypeCatalog {
    /// Looks up a type description by id.
    fn type_of(&self, id: TypeId) -> Option<&TypeDesc>;

    /// Returns the alternative candidate type ids for an ambiguous member
    /// (e.g. a `void *` field), as provided by source analysis. May be
    /// empty.
    fn candidates_for(&self, id: TypeId, member: &str) -> &[TypeId];

    /// Peels `Const`/`Volatile`/`Typedef` wrappers and returns the
    /// underlying type. Fails with `UnresolvedType` if the chain leaves
    /// the catalog or exceeds the cycle bound.
    fn strip(&self, id: TypeId) -> Result<(TypeId, &TypeDesc)> {
        let mut id = id;
        for _ in 0..MAX_LEXICAL_DEPTH {
            let desc = self.type_of(id).ok_or(Error::UnresolvedType)?;
            match desc.kind.lexical_target() {
                Some(target) => id = target,
                None => return Ok((id, desc)),
            }
        }
        Err(Error::UnresolvedType)
    }

    /// Effective byte size of a type, resolved through lexical wrappers.
    fn size_of(&self, id: TypeId) -> Result<usize> {
        let desc = self.type_of(id).ok_or(Error::UnresolvedType)?;
        if desc.size != 0 {
            return Ok(desc.size);
        }
        match desc.kind {
            // flexible arrays and void have a genuine size of zero
            TypeKind::Array { .. } | TypeKind::Void | TypeKind::Function => Ok(0),
            _ => {
                let (_, stripped) = self.strip(id)?;
                Ok(stripped.size)
            }
        }
    }

    /// Natural alignment of a type: scalars align to their size (capped
    /// at 8), aggregates to the largest member alignment.
    fn align_of(&self, id: TypeId) -> usize {
        self.align_of_depth(id, 0)
    }

    #[doc(hidden)]
    fn align_of_depth(&self, id: TypeId, depth: usize) -> usize {
        if depth > MAX_LEXICAL_DEPTH {
            return 1;
        }
        let (_, desc) = match self.strip(id) {
            Ok(t) => t,
            Err(_) => return 1,
        };
        match &desc.kind {
            TypeKind::Numeric { size, .. } => (*size).max(1).min(8),
            TypeKind::Pointer { .. } | TypeKind::FuncPointer => desc.size.max(1).min(8),
            TypeKind::Enum { .. } => desc.size.max(1).min(8),
            TypeKind::Array { elem, .. } => self.align_of_depth(*elem, depth + 1),
            TypeKind::Struct { members } | TypeKind::Union { members } => members
                .iter()
                .map(|m| self.align_of_depth(m.type_id, depth + 1))
                .max()
                .unwrap_or(1),
            _ => 1,
        }
    }

    /// The category bit of a type, `UNRESOLVED` if the id is unknown.
    fn category_of(&self, id: TypeId) -> TypeCategory {
        self.type_of(id)
            .map(|d| d.category())
            .unwrap_or(TypeCategory::UNRESOLVED)
    }
}

/// Provider of per-member type overrides from the rule engine.
///
/// An override short-circuits candidate evaluation: the member is
/// interpreted with the returned type and no alternatives are scored.
pub trait TypeOverrides {
    fn override_for(&self, id: TypeId, member: &str) -> Option<TypeId>;
}
