//! Correlation Window Manager (C3, spec.md §4.3).
//!
//! Owns a `instance_id -> {machine_id, started_at, expires_at, window_ms}`
//! map and schedules single-shot expiry callbacks. Starting a window twice
//! for the same instance is idempotent — the first timer is never replaced
//! (spec.md §8 boundary behaviour). Cancellation is immediate: the spawned
//! timer task races the sleep against a cancellation signal and simply
//! never fires if cancelled first.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{oneshot, RwLock};
use uuid::Uuid;

pub type ExpiryFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type ExpiryCallback = Arc<dyn Fn(Uuid) -> ExpiryFuture + Send + Sync>;

#[derive(Clone, Debug)]
pub struct WindowInfo {
    pub machine_id: String,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub window_ms: u64,
}

struct Entry {
    info: WindowInfo,
    cancel: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
pub struct WindowManager {
    windows: RwLock<HashMap<Uuid, Entry>>,
}

impl WindowManager {
    pub fn new() -> Self {
        Self { windows: RwLock::new(HashMap::new()) }
    }

    /// Start a window for `instance_id`. If one is already active, returns
    /// the existing entry unchanged (idempotent — the original timer keeps
    /// running).
    pub async fn start_window(
        &self,
        instance_id: Uuid,
        machine_id: &str,
        window_ms: u64,
        on_expired: ExpiryCallback,
    ) -> WindowInfo {
        let mut windows = self.windows.write().await;
        if let Some(existing) = windows.get(&instance_id) {
            return existing.info.clone();
        }

        let started_at = Utc::now();
        let expires_at = started_at + chrono::Duration::milliseconds(window_ms as i64);
        let info = WindowInfo { machine_id: machine_id.to_string(), started_at, expires_at, window_ms };

        let (cancel_tx, cancel_rx) = oneshot::channel();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_millis(window_ms)) => {
                    on_expired(instance_id).await;
                }
                _ = cancel_rx => {
                    tracing::debug!(%instance_id, "window: cancelled before expiry");
                }
            }
        });

        windows.insert(instance_id, Entry { info: info.clone(), cancel: Some(cancel_tx) });
        info
    }

    /// Cancel a window. Returns whether one existed. Idempotent: cancelling
    /// twice is a no-op on the second call.
    pub async fn cancel_window(&self, instance_id: Uuid) -> bool {
        let mut windows = self.windows.write().await;
        match windows.remove(&instance_id) {
            Some(entry) => {
                if let Some(tx) = entry.cancel {
                    let _ = tx.send(());
                }
                true
            }
            None => false,
        }
    }

    pub async fn is_window_active(&self, instance_id: Uuid) -> bool {
        let windows = self.windows.read().await;
        match windows.get(&instance_id) {
            Some(entry) => Utc::now() < entry.info.expires_at,
            None => false,
        }
    }

    pub async fn remaining_ms(&self, instance_id: Uuid) -> Option<i64> {
        let windows = self.windows.read().await;
        windows.get(&instance_id).map(|e| (e.info.expires_at - Utc::now()).num_milliseconds())
    }

    pub async fn get_window(&self, instance_id: Uuid) -> Option<WindowInfo> {
        let windows = self.windows.read().await;
        windows.get(&instance_id).map(|e| e.info.clone())
    }

    /// Cancel every outstanding timer. Called on shutdown.
    pub async fn cancel_all(&self) {
        let mut windows = self.windows.write().await;
        for (_, entry) in windows.drain() {
            if let Some(tx) = entry.cancel {
                let _ = tx.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn noop_callback() -> ExpiryCallback {
        Arc::new(|_id| Box::pin(async {}))
    }

    #[tokio::test]
    async fn duplicate_start_returns_existing_entry() {
        let wm = WindowManager::new();
        let id = Uuid::new_v4();
        let first = wm.start_window(id, "m1", 10_000, noop_callback()).await;
        let second = wm.start_window(id, "m1", 999_999, noop_callback()).await;
        assert_eq!(first.started_at, second.started_at);
        assert_eq!(first.window_ms, 10_000);
    }

    #[tokio::test]
    async fn cancel_then_is_active_returns_false_immediately() {
        let wm = WindowManager::new();
        let id = Uuid::new_v4();
        wm.start_window(id, "m1", 10_000, noop_callback()).await;
        assert!(wm.cancel_window(id).await);
        assert!(!wm.is_window_active(id).await);
    }

    #[tokio::test]
    async fn cancel_of_unknown_instance_returns_false() {
        let wm = WindowManager::new();
        assert!(!wm.cancel_window(Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn expiry_callback_fires_after_window_elapses() {
        let wm = WindowManager::new();
        let id = Uuid::new_v4();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let cb: ExpiryCallback = Arc::new(move |_id| {
            let fired = fired2.clone();
            Box::pin(async move {
                fired.store(true, Ordering::SeqCst);
            })
        });
        wm.start_window(id, "m1", 20, cb).await;
        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancelled_window_never_fires() {
        let wm = WindowManager::new();
        let id = Uuid::new_v4();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let cb: ExpiryCallback = Arc::new(move |_id| {
            let fired = fired2.clone();
            Box::pin(async move {
                fired.store(true, Ordering::SeqCst);
            })
        });
        wm.start_window(id, "m1", 30, cb).await;
        wm.cancel_window(id).await;
        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
