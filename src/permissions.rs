//! Static category-to-capability permission registry

use std::collections::HashMap;

use crate::error::SpawnError;
use crate::protocol::{CapabilitySet, Category};

/// Maps each session category to the capability names it may invoke
///
/// Built once at process start and immutable thereafter; every lookup for
/// an unregistered category is a configuration error, not a runtime
/// condition.
#[derive(Debug, Clone, Default)]
pub struct PermissionRegistry {
    grants: HashMap<Category, CapabilitySet>,
}

impl PermissionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            grants: HashMap::new(),
        }
    }

    /// Register the capability set for a category
    ///
    /// Consumes and returns `self` so registries are assembled in one
    /// expression and never mutated afterwards.
    pub fn grant(
        mut self,
        category: Category,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.grants
            .insert(category, capabilities.into_iter().map(Into::into).collect());
        self
    }

    /// Look up the full capability set for a category
    pub fn capabilities_for(&self, category: Category) -> Result<&CapabilitySet, SpawnError> {
        self.grants
            .get(&category)
            .ok_or(SpawnError::UnknownCategory(category))
    }

    /// Registered categories
    pub fn categories(&self) -> Vec<Category> {
        self.grants.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> PermissionRegistry {
        PermissionRegistry::new()
            .grant(Category::Root, ["lookup", "compute", "execute"])
            .grant(Category::Scoped, ["lookup", "compute"])
    }

    #[test]
    fn test_lookup_registered_category() {
        let registry = registry();
        let caps = registry.capabilities_for(Category::Root).unwrap();
        assert_eq!(caps.len(), 3);
        assert!(caps.contains("execute"));
    }

    #[test]
    fn test_unknown_category() {
        let registry = PermissionRegistry::new().grant(Category::Root, ["lookup"]);
        let err = registry.capabilities_for(Category::Scoped).unwrap_err();
        assert!(matches!(err, SpawnError::UnknownCategory(Category::Scoped)));
    }

    #[test]
    fn test_empty_registry() {
        let registry = PermissionRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.capabilities_for(Category::Root).is_err());
    }

    #[test]
    fn test_categories() {
        let registry = registry();
        let mut categories = registry.categories();
        categories.sort_by_key(|c| format!("{c:?}"));
        assert_eq!(categories.len(), 2);
    }
}
