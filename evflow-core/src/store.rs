//! FSM State Store (C2, spec.md §4.2).
//!
//! Key-value persistence for FSM runtime state with graceful degradation to
//! no-op when the back-end is unavailable. The trait mirrors the teacher's
//! `ProcessStore`: the runtime operates exclusively through this interface,
//! so a pluggable backend (in-memory for tests/embedding, Redis-shaped KV in
//! production) can be swapped without touching `fsm`.
//!
//! Keys (spec.md §6): `fsm:instance:{instance_id}` (~24h TTL, advisory —
//! backends that don't support TTL natively may ignore it) and
//! `fsm:machine:{machine_id}:instances` (no TTL).

use crate::types::FsmRuntimeState;
use async_trait::async_trait;
use uuid::Uuid;

pub const INSTANCE_TTL_SECS: u64 = 24 * 60 * 60;

pub fn instance_key(instance_id: Uuid) -> String {
    format!("fsm:instance:{instance_id}")
}

pub fn machine_index_key(machine_id: &str) -> String {
    format!("fsm:machine:{machine_id}:instances")
}

#[async_trait]
pub trait FsmStateStore: Send + Sync {
    /// Full replace. Write-through, fire-and-forget: implementations log
    /// errors rather than returning them to callers that can't act on them
    /// (the runtime calls this from the hot transition path and must not
    /// block state progress on a degraded store).
    async fn save(&self, state: &FsmRuntimeState);

    async fn load(&self, instance_id: Uuid) -> Option<FsmRuntimeState>;

    async fn load_all_for_machine(&self, machine_id: &str) -> Vec<FsmRuntimeState>;

    async fn remove(&self, instance_id: Uuid, machine_id: &str);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryFsmStateStore;

    #[tokio::test]
    async fn save_then_load_round_trips_modulo_timer_handles() {
        let store = MemoryFsmStateStore::new();
        let state = FsmRuntimeState::new("m1", "wf1", None, "INIT");
        let id = state.instance_id;
        store.save(&state).await;
        let loaded = store.load(id).await.expect("loaded");
        assert_eq!(loaded.instance_id, state.instance_id);
        assert_eq!(loaded.current_state, state.current_state);
        assert_eq!(loaded.machine_id, state.machine_id);
    }

    #[tokio::test]
    async fn remove_drops_instance_and_index_entry() {
        let store = MemoryFsmStateStore::new();
        let state = FsmRuntimeState::new("m1", "wf1", None, "INIT");
        let id = state.instance_id;
        store.save(&state).await;
        store.remove(id, "m1").await;
        assert!(store.load(id).await.is_none());
        assert!(store.load_all_for_machine("m1").await.is_empty());
    }

    #[tokio::test]
    async fn load_all_for_machine_indexes_by_machine() {
        let store = MemoryFsmStateStore::new();
        let a = FsmRuntimeState::new("m1", "wf1", None, "INIT");
        let b = FsmRuntimeState::new("m2", "wf1", None, "INIT");
        store.save(&a).await;
        store.save(&b).await;
        let m1 = store.load_all_for_machine("m1").await;
        assert_eq!(m1.len(), 1);
        assert_eq!(m1[0].instance_id, a.instance_id);
    }
}
