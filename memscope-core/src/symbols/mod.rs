/*!
Module with the debug-symbol type catalog interface.

The catalog itself is produced elsewhere (parsed from compiler debug
output); memscope only consumes it as an immutable lookup service. This
module contains the type descriptors, the [`TypeCatalog`] and
[`TypeOverrides`] traits and an in-memory [`TypeRegistry`] implementation.
*/

pub mod type_desc;
#[doc(hidden)]
pub use type_desc::{
    MemberDesc, TypeCatalog, TypeCategory, TypeDesc, TypeId, TypeKind, TypeOverrides,
};

pub mod registry;
#[doc(hidden)]
pub use registry::{NoOverrides, RuleOverrides, TypeRegistry};
