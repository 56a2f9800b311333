//! Explicit type registry.
//!
//! Maps a stable type tag to the members that detach for that type. This is
//! the typed counterpart of the `@` key convention: an embedding application
//! registers its domain types once at startup and the serializer consults
//! the registry during the walk. There is no runtime type introspection;
//! a tag is just the string the application registered.

use std::collections::{BTreeSet, HashMap};

/// Per-type serialization spec: which members detach.
#[derive(Debug, Clone, Default)]
pub struct TypeSpec {
    detached_members: BTreeSet<String>,
}

impl TypeSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a member of this type as detachable.
    pub fn detach(mut self, member: impl Into<String>) -> Self {
        self.detached_members.insert(member.into());
        self
    }

    pub fn is_detached(&self, member: &str) -> bool {
        self.detached_members.contains(member)
    }

    pub fn detached_members(&self) -> impl Iterator<Item = &str> {
        self.detached_members.iter().map(String::as_str)
    }
}

/// Registry of type tags to their serialization specs.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    specs: HashMap<String, TypeSpec>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a spec for a tag, replacing any previous registration.
    pub fn register(&mut self, tag: impl Into<String>, spec: TypeSpec) -> &mut Self {
        self.specs.insert(tag.into(), spec);
        self
    }

    pub fn spec(&self, tag: &str) -> Option<&TypeSpec> {
        self.specs.get(tag)
    }

    /// Whether the given member of the given type detaches. Unregistered
    /// tags fall back to the key-prefix convention alone.
    pub fn is_detached(&self, tag: &str, member: &str) -> bool {
        self.specs
            .get(tag)
            .is_some_and(|spec| spec.is_detached(member))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let mut registry = TypeRegistry::new();
        registry.register("Model", TypeSpec::new().detach("elements").detach("views"));

        assert!(registry.is_detached("Model", "elements"));
        assert!(registry.is_detached("Model", "views"));
        assert!(!registry.is_detached("Model", "name"));
        assert!(!registry.is_detached("Other", "elements"));
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = TypeRegistry::new();
        registry.register("Model", TypeSpec::new().detach("a"));
        registry.register("Model", TypeSpec::new().detach("b"));

        assert!(!registry.is_detached("Model", "a"));
        assert!(registry.is_detached("Model", "b"));
    }
}
