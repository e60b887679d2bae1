use std::collections::HashMap;

use shared::domain::{Instance, InstanceId};

/// Volatile cache of live instances. Lazily populated from storage on the
/// first join after startup, never explicitly evicted. The cached object is
/// the authoritative working copy: handlers mutate it in place, so every
/// lookup for a given id must return the same object.
#[derive(Default)]
pub struct Registry {
    instances: HashMap<InstanceId, Instance>,
}

impl Registry {
    pub fn contains(&self, id: &InstanceId) -> bool {
        self.instances.contains_key(id)
    }

    /// Cache-only lookup used by mutation handlers. A miss means the
    /// caller's session predates a restart and must be reset; handlers never
    /// fall through to storage here.
    pub fn resolve_live(&mut self, id: &InstanceId) -> Option<&mut Instance> {
        self.instances.get_mut(id)
    }

    /// Register a freshly created instance, or one just loaded from storage
    /// with its stale presence list already reset.
    pub fn insert(&mut self, instance: Instance) {
        self.instances.insert(instance.id.clone(), instance);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str) -> Instance {
        Instance::new(InstanceId(id.into()), "alice", 3, false, false)
    }

    #[test]
    fn resolve_live_returns_the_registered_object() {
        let mut registry = Registry::default();
        registry.insert(instance("sprint1"));

        let id = InstanceId("sprint1".into());
        registry
            .resolve_live(&id)
            .expect("live")
            .users
            .push("bob".into());
        // same object on the next lookup, not a copy
        assert_eq!(registry.resolve_live(&id).expect("live").users.len(), 2);
    }

    #[test]
    fn resolve_live_misses_for_unknown_id() {
        let mut registry = Registry::default();
        assert!(registry.resolve_live(&InstanceId("nope".into())).is_none());
        assert!(!registry.contains(&InstanceId("nope".into())));
    }
}
