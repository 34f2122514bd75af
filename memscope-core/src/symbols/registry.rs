/*!
In-memory implementations of the catalog and override interfaces.

`TypeRegistry` is the concrete [`TypeCatalog`] used by consumers that load
a parsed symbol file into memory, and by the test suites.
*/

use super::type_desc::{TypeCatalog, TypeDesc, TypeId, TypeOverrides};

use hashbrown::HashMap;

/// A HashMap-backed type catalog.
///
/// The registry is populated up front and treated as immutable for the
/// duration of a build; all lookups go through `&self`.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    types: HashMap<TypeId, TypeDesc>,
    candidates: HashMap<(TypeId, String), Vec<TypeId>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a type description.
    pub fn insert(&mut self, id: TypeId, desc: TypeDesc) {
        self.types.insert(id, desc);
    }

    /// Registers analysis-provided candidate types for an ambiguous member.
    pub fn add_candidates(&mut self, id: TypeId, member: &str, candidates: Vec<TypeId>) {
        self.candidates.insert((id, member.to_string()), candidates);
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl TypeCatalog for TypeRegistry {
    fn type_of(&self, id: TypeId) -> Option<&TypeDesc> {
        self.types.get(&id)
    }

    fn candidates_for(&self, id: TypeId, member: &str) -> &[TypeId] {
        self.candidates
            .get(&(id, member.to_string()))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

/// Override provider that never overrides anything.
#[derive(Copy, Clone, Default)]
pub struct NoOverrides;

impl TypeOverrides for NoOverrides {
    fn override_for(&self, _id: TypeId, _member: &str) -> Option<TypeId> {
        None
    }
}

/// A HashMap-backed override provider, fed from the rule engine.
#[derive(Clone, Default)]
pub struct RuleOverrides {
    rules: HashMap<(TypeId, String), TypeId>,
}

impl RuleOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: TypeId, member: &str, override_type: TypeId) {
        self.rules.insert((id, member.to_string()), override_type);
    }
}

impl TypeOverrides for RuleOverrides {
    fn override_for(&self, id: TypeId, member: &str) -> Option<TypeId> {
        self.rules.get(&(id, member.to_string())).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::type_desc::TypeKind;

    #[test]
    fn candidates_default_to_empty() {
        let mut reg = TypeRegistry::new();
        reg.insert(TypeId(1), TypeDesc::new("void *", 8, TypeKind::Pointer { target: TypeId(2) }));
        assert!(reg.candidates_for(TypeId(1), "data").is_empty());

        reg.add_candidates(TypeId(1), "data", vec![TypeId(3), TypeId(4)]);
        assert_eq!(reg.candidates_for(TypeId(1), "data"), &[TypeId(3), TypeId(4)]);
    }

    #[test]
    fn overrides_short_circuit() {
        let mut rules = RuleOverrides::new();
        rules.insert(TypeId(1), "private", TypeId(7));
        assert_eq!(rules.override_for(TypeId(1), "private"), Some(TypeId(7)));
        assert_eq!(rules.override_for(TypeId(1), "other"), None);
        assert_eq!(NoOverrides.override_for(TypeId(1), "private"), None);
    }
}
