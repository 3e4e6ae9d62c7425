//! In-memory action executor for deterministic testing.
//!
//! Targets map to JSON values. `execute` writes the action's parameters to
//! its target; `capture_state` and `restore_state` read and write the same
//! map, so rollback behaviour is observable end to end.

use async_trait::async_trait;
use nexus_core::{ActionExecutor, NexusError, ProposedAction, Result};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Default)]
struct Behaviour {
    delay: Option<Duration>,
    /// Fail after writing the new state.
    fail_execute: Option<String>,
    fail_restore: Option<String>,
}

/// Cloning shares the underlying store.
#[derive(Clone)]
pub struct StateStoreExecutor {
    kind: String,
    store: Arc<Mutex<HashMap<String, Value>>>,
    behaviour: Arc<Mutex<Behaviour>>,
    executions: Arc<AtomicU64>,
    restores: Arc<AtomicU64>,
}

impl StateStoreExecutor {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            store: Arc::default(),
            behaviour: Arc::default(),
            executions: Arc::new(AtomicU64::new(0)),
            restores: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        self.behaviour.lock().delay = Some(delay);
        self
    }

    pub fn failing_execute(&self, reason: impl Into<String>) {
        self.behaviour.lock().fail_execute = Some(reason.into());
    }

    pub fn failing_restore(&self, reason: impl Into<String>) {
        self.behaviour.lock().fail_restore = Some(reason.into());
    }

    pub fn set(&self, target: &str, value: Value) {
        self.store.lock().insert(target.to_string(), value);
    }

    pub fn get(&self, target: &str) -> Option<Value> {
        self.store.lock().get(target).cloned()
    }

    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::SeqCst)
    }

    pub fn restores(&self) -> u64 {
        self.restores.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActionExecutor for StateStoreExecutor {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn execute(&self, action: &ProposedAction) -> Result<Value> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let delay = self.behaviour.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.set(&action.target, action.parameters.clone());
        if let Some(reason) = self.behaviour.lock().fail_execute.clone() {
            return Err(NexusError::ExecutionFailure {
                action_id: action.id,
                reason,
            });
        }
        Ok(json!({ "target": action.target, "applied": action.parameters }))
    }

    async fn capture_state(&self, action: &ProposedAction) -> Result<Value> {
        Ok(self.get(&action.target).unwrap_or(Value::Null))
    }

    async fn restore_state(&self, action: &ProposedAction, state: &Value) -> Result<()> {
        if let Some(reason) = self.behaviour.lock().fail_restore.clone() {
            return Err(NexusError::Storage(reason));
        }
        self.restores.fetch_add(1, Ordering::SeqCst);
        if state.is_null() {
            self.store.lock().remove(&action.target);
        } else {
            self.set(&action.target, state.clone());
        }
        Ok(())
    }
}
