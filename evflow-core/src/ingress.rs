//! Trigger ingress and remote-command egress boundaries (SPEC_FULL.md §4.11).
//!
//! spec.md §6 describes the wire shapes the transport layer produces/consumes
//! but leaves the Rust trait boundary implicit. These three traits are the
//! seams the runtime depends on instead of concrete transports:
//!
//! - `TriggerSource` is the injected event stream C10 consumes.
//! - `RemoteCommandEmitter` is the hook C9/C10 use to emit `remote_command`
//!   messages (and `deploy_fsm` dispatches) to edge nodes.
//! - `EventSink` is the abstraction C10 depends on for propagated-event
//!   publication; C9's `PropagatedEventDispatcher` satisfies it, breaking the
//!   cyclic reference spec.md §9 calls out.
//!
//! Production adapters (real Kafka/webhook/MQTT sources, a gRPC-backed
//! command emitter) live in the transport layer, which is explicitly out of
//! scope for this crate (spec.md §1). The in-memory implementations here are
//! for embedding and tests.

use crate::types::{PropagatedEvent, RemoteCommand, TriggerEvent};
use async_trait::async_trait;
use tokio::sync::broadcast;

/// The general trigger bus C10 subscribes to (spec.md §4.10 step 1).
pub trait TriggerSource: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<TriggerEvent>;
}

/// Thin `broadcast::Sender` wrapper for embedding/tests. Production trigger
/// sources (Kafka consumers, webhook receivers, MQTT subscribers) publish
/// onto the same channel via `sender()`.
pub struct ChannelTriggerSource {
    tx: broadcast::Sender<TriggerEvent>,
}

impl ChannelTriggerSource {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn sender(&self) -> broadcast::Sender<TriggerEvent> {
        self.tx.clone()
    }

    pub fn publish(&self, event: TriggerEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for ChannelTriggerSource {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl TriggerSource for ChannelTriggerSource {
    fn subscribe(&self) -> broadcast::Receiver<TriggerEvent> {
        self.tx.subscribe()
    }
}

/// Emits `remote_command` messages (spec.md §6) to a target edge node.
/// Satisfies C9's `dispatch_remote_command` handler action and C10's
/// `deploy_fsm` remote path.
#[async_trait]
pub trait RemoteCommandEmitter: Send + Sync {
    async fn emit(&self, target_node_id: &str, command: RemoteCommand) -> anyhow::Result<()>;
}

/// Logging-only default. Production wiring swaps in a transport-backed
/// emitter (the remote transport itself is out of scope, spec.md §1).
pub struct NullEmitter;

#[async_trait]
impl RemoteCommandEmitter for NullEmitter {
    async fn emit(&self, target_node_id: &str, command: RemoteCommand) -> anyhow::Result<()> {
        tracing::info!(target_node_id, command = %command.command, command_id = %command.command_id, "ingress: remote command emitted (null emitter, no transport configured)");
        Ok(())
    }
}

/// Publication sink for full/partial FSM matches. `PropagatedEventDispatcher`
/// (C9) is the production implementation; C10 depends only on this trait.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: PropagatedEvent) -> anyhow::Result<()>;
}
