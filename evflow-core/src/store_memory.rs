//! In-memory `FsmStateStore` for embedding and tests, grounded on the
//! teacher's `MemoryStore` (`RwLock<Inner>` over plain `HashMap`s).

use crate::store::FsmStateStore;
use crate::types::FsmRuntimeState;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

struct Inner {
    instances: HashMap<Uuid, FsmRuntimeState>,
    by_machine: HashMap<String, HashSet<Uuid>>,
}

/// In-memory implementation of `FsmStateStore`. Never degrades (it has no
/// back-end to lose); used directly in tests and as the default when no
/// external store is configured.
pub struct MemoryFsmStateStore {
    inner: RwLock<Inner>,
}

impl MemoryFsmStateStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                instances: HashMap::new(),
                by_machine: HashMap::new(),
            }),
        }
    }
}

impl Default for MemoryFsmStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FsmStateStore for MemoryFsmStateStore {
    async fn save(&self, state: &FsmRuntimeState) {
        let mut w = self.inner.write().await;
        w.by_machine
            .entry(state.machine_id.clone())
            .or_default()
            .insert(state.instance_id);
        w.instances.insert(state.instance_id, state.clone());
    }

    async fn load(&self, instance_id: Uuid) -> Option<FsmRuntimeState> {
        let r = self.inner.read().await;
        r.instances.get(&instance_id).cloned()
    }

    async fn load_all_for_machine(&self, machine_id: &str) -> Vec<FsmRuntimeState> {
        let r = self.inner.read().await;
        match r.by_machine.get(machine_id) {
            Some(ids) => ids.iter().filter_map(|id| r.instances.get(id).cloned()).collect(),
            None => Vec::new(),
        }
    }

    async fn remove(&self, instance_id: Uuid, machine_id: &str) {
        let mut w = self.inner.write().await;
        w.instances.remove(&instance_id);
        if let Some(ids) = w.by_machine.get_mut(machine_id) {
            ids.remove(&instance_id);
        }
    }
}
