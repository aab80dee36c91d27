//! ---
//! actrl_section: "04-node"
//! actrl_subsection: "module"
//! actrl_type: "source"
//! actrl_scope: "code"
//! actrl_description: "UUID-keyed registry of instance controllers."
//! actrl_version: "v0.0.0-prealpha"
//! actrl_owner: "tbd"
//! ---
use std::sync::Arc;

use actrl_lifecycle::InstanceController;
use indexmap::IndexMap;
use parking_lot::Mutex;

/// Instance controllers hosted by the node, in creation order.
///
/// The map lock is only held for lookups and inserts, never while an
/// activity operation runs.
#[derive(Debug, Default)]
pub struct ActivityRegistry {
    controllers: Mutex<IndexMap<String, Arc<InstanceController>>>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, uuid: &str) -> Option<Arc<InstanceController>> {
        self.controllers.lock().get(uuid).cloned()
    }

    /// Insert `controller` unless one is already registered for its UUID.
    ///
    /// Returns the registered controller and whether it is the one passed in.
    pub fn insert_if_absent(
        &self,
        controller: Arc<InstanceController>,
    ) -> (Arc<InstanceController>, bool) {
        let mut controllers = self.controllers.lock();
        if let Some(existing) = controllers.get(controller.uuid()) {
            return (existing.clone(), false);
        }
        controllers.insert(controller.uuid().to_owned(), controller.clone());
        (controller, true)
    }

    pub fn remove(&self, uuid: &str) -> Option<Arc<InstanceController>> {
        self.controllers.lock().shift_remove(uuid)
    }

    pub fn snapshot(&self) -> Vec<Arc<InstanceController>> {
        self.controllers.lock().values().cloned().collect()
    }

    pub fn uuids(&self) -> Vec<String> {
        self.controllers.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.controllers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.lock().is_empty()
    }
}
