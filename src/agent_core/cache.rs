//! AgentCache — one lazily built [`AgentSession`] per model identifier.
//!
//! Each model id owns a slot guarded by its own async mutex. The first caller
//! builds the session while holding the slot; concurrent first callers wait
//! on the same slot and then reuse the result, so a session is built at most
//! once per slot generation. Slots for different models never block each
//! other.
//!
//! ```text
//! Uninitialized ──build──▶ Initializing ──ok──▶ Ready ──invalidate──▶ Uninitialized
//!                                       └─err─▶ Failed ──next use──▶ Initializing
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;

use super::errors::AgentError;
use super::session::{AgentSession, SessionFactory};

enum SlotState {
    Uninitialized,
    /// Left behind only if a build was cancelled mid-flight.
    Initializing,
    Ready(Arc<AgentSession>),
    Failed(String),
}

type Slot = Arc<AsyncMutex<SlotState>>;

/// Observable state of one cache slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum SlotStatus {
    Uninitialized,
    Initializing,
    Ready,
    Failed(String),
}

/// Process-wide cache of agent sessions keyed by model identifier.
pub struct AgentCache {
    factory: Arc<dyn SessionFactory>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl AgentCache {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            factory,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, model_id: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            slots
                .entry(model_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(SlotState::Uninitialized))),
        )
    }

    /// Return the cached session for `model_id`, building it on first use.
    ///
    /// A previous failed build is retried.
    pub async fn get_or_init(&self, model_id: &str) -> Result<Arc<AgentSession>, AgentError> {
        let slot = self.slot(model_id);
        let mut state = slot.lock().await;

        match &*state {
            SlotState::Ready(session) => return Ok(Arc::clone(session)),
            SlotState::Failed(reason) => {
                tracing::info!(model = %model_id, previous_error = %reason, "retrying agent session build");
            }
            SlotState::Initializing => {
                tracing::warn!(model = %model_id, "previous session build was interrupted, rebuilding");
            }
            SlotState::Uninitialized => {}
        }

        *state = SlotState::Initializing;
        match self.factory.build(model_id).await {
            Ok(session) => {
                let session = Arc::new(session);
                *state = SlotState::Ready(Arc::clone(&session));
                tracing::info!(model = %model_id, "agent session ready");
                Ok(session)
            }
            Err(e) => {
                tracing::error!(model = %model_id, error = %e, "agent session build failed");
                *state = SlotState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    /// Drop the cached session for `model_id` if it is still `session`, and
    /// shut it down.
    ///
    /// Returns whether anything was invalidated. A stale handle (the slot was
    /// already rebuilt by someone else) is a no-op.
    pub async fn invalidate(&self, model_id: &str, session: &Arc<AgentSession>) -> bool {
        let slot = self.slot(model_id);
        let removed = {
            let mut state = slot.lock().await;
            let is_current =
                matches!(&*state, SlotState::Ready(current) if Arc::ptr_eq(current, session));
            if is_current {
                match std::mem::replace(&mut *state, SlotState::Uninitialized) {
                    SlotState::Ready(current) => Some(current),
                    _ => None,
                }
            } else {
                None
            }
        };

        match removed {
            Some(session) => {
                tracing::warn!(model = %model_id, "invalidating agent session");
                session.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Snapshot of every slot. Slots busy building report `Initializing`.
    pub fn status(&self) -> Vec<(String, SlotStatus)> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<(String, SlotStatus)> = slots
            .iter()
            .map(|(id, slot)| {
                let status = match slot.try_lock() {
                    Ok(state) => match &*state {
                        SlotState::Uninitialized => SlotStatus::Uninitialized,
                        SlotState::Initializing => SlotStatus::Initializing,
                        SlotState::Ready(_) => SlotStatus::Ready,
                        SlotState::Failed(reason) => SlotStatus::Failed(reason.clone()),
                    },
                    Err(_) => SlotStatus::Initializing,
                };
                (id.clone(), status)
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Shut down every ready session and empty the cache.
    pub async fn shutdown_all(&self) {
        let slots: Vec<Slot> = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.drain().map(|(_, slot)| slot).collect()
        };
        for slot in slots {
            let state = std::mem::replace(&mut *slot.lock().await, SlotState::Uninitialized);
            if let SlotState::Ready(session) = state {
                session.shutdown().await;
            }
        }
    }
}
