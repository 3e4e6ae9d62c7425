use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::action::{ActionState, DecisionOutcome};
use crate::types::{HealthStatus, Resolution};

/// Notifications for collaborators (UI, NLU layer) that want to react
/// without polling. The audit chain, not this bus, is the record of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    // ── Provider lifecycle ─────────────────────────────────────
    ProviderRegistered {
        provider_id: String,
    },
    ProviderDeregistered {
        provider_id: String,
    },
    ProviderHealthChanged {
        provider_id: String,
        health: HealthStatus,
    },
    ProviderPurged {
        provider_id: String,
    },

    // ── Action lifecycle ───────────────────────────────────────
    ActionAssessed {
        action_id: Uuid,
        outcome: DecisionOutcome,
        risk_score: f64,
    },
    ActionStateChanged {
        action_id: Uuid,
        state: ActionState,
    },
    ApprovalRequested {
        pending_id: Uuid,
        action_id: Uuid,
        reasons: Vec<String>,
    },
    ApprovalResolved {
        pending_id: Uuid,
        action_id: Uuid,
        resolution: Resolution,
        approver: String,
    },
    ApprovalExpired {
        pending_id: Uuid,
        action_id: Uuid,
        allowed: bool,
    },
    RollbackFailed {
        action_id: Uuid,
        reason: String,
    },

    // ── System ─────────────────────────────────────────────────
    AuditHalted {
        reason: String,
    },
    Heartbeat {
        timestamp: DateTime<Utc>,
    },
    Shutdown,
}

/// A broadcast-based event bus for broker-wide pub/sub.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<Event>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn publish(&self, event: Event) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
