//! Multi-step conversational flow state (guided commitment creation, etc.)
//! plus a small per-user context scratchpad. Grounded on the source's
//! `ConversationState`/`ConversationStateManager`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tracing::info;

const DEFAULT_EXPIRY_MINUTES: i64 = 60;

#[derive(Debug, Clone)]
pub struct ConversationState {
    pub flow_type: String,
    pub step: u32,
    pub data: std::collections::HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationState {
    fn new(flow_type: String) -> Self {
        let now = Utc::now();
        Self {
            flow_type,
            step: 0,
            data: std::collections::HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn next_step(&mut self) {
        self.step += 1;
        self.updated_at = Utc::now();
    }

    pub fn set_data(&mut self, key: &str, value: Value) {
        self.data.insert(key.to_string(), value);
        self.updated_at = Utc::now();
    }

    pub fn get_data(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_after(DEFAULT_EXPIRY_MINUTES)
    }

    pub fn is_expired_after(&self, minutes: i64) -> bool {
        Utc::now() - self.updated_at > chrono::Duration::minutes(minutes)
    }
}

/// Manages per-phone conversation state and an adjacent context scratchpad
/// (e.g. "last_commitment_id"). A real deployment would back this with
/// Redis; this in-memory map is sufficient for a single process and is
/// lazily cleaned on read, with a periodic sweep for idle users who never
/// poll again.
pub struct ConversationStateManager {
    states: DashMap<String, ConversationState>,
    context: DashMap<String, std::collections::HashMap<String, Value>>,
}

impl ConversationStateManager {
    pub fn new() -> Self {
        Self { states: DashMap::new(), context: DashMap::new() }
    }

    pub fn create_state(&self, phone: &str, flow_type: &str) -> ConversationState {
        let state = ConversationState::new(flow_type.to_string());
        self.states.insert(phone.to_string(), state.clone());
        info!(phone, flow_type, "started conversation flow");
        state
    }

    /// Returns the active state, evicting and returning `None` if it has
    /// expired since it was last touched.
    pub fn get_state(&self, phone: &str) -> Option<ConversationState> {
        let expired = self.states.get(phone).map(|s| s.is_expired()).unwrap_or(false);
        if expired {
            self.states.remove(phone);
            info!(phone, "expired conversation state");
            return None;
        }
        self.states.get(phone).map(|s| s.value().clone())
    }

    pub fn update_state(&self, phone: &str, state: ConversationState) {
        self.states.insert(phone.to_string(), state);
    }

    pub fn clear_state(&self, phone: &str) {
        if self.states.remove(phone).is_some() {
            info!(phone, "cleared conversation state");
        }
    }

    pub fn has_active_conversation(&self, phone: &str) -> bool {
        self.get_state(phone).is_some()
    }

    pub fn set_context(&self, phone: &str, key: &str, value: Value) {
        self.context.entry(phone.to_string()).or_default().insert(key.to_string(), value);
    }

    pub fn get_context(&self, phone: &str, key: &str) -> Option<Value> {
        self.context.get(phone).and_then(|ctx| ctx.get(key).cloned())
    }

    pub fn clear_context_key(&self, phone: &str, key: &str) {
        if let Some(mut ctx) = self.context.get_mut(phone) {
            ctx.remove(key);
        }
    }

    pub fn clear_context_all(&self, phone: &str) {
        self.context.remove(phone);
    }

    fn sweep_expired(&self) {
        let before = self.states.len();
        self.states.retain(|_, state| !state.is_expired());
        let removed = before - self.states.len();
        if removed > 0 {
            info!(removed, "cleaned up expired conversation states");
        }
    }

    pub fn spawn_sweep_loop(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            loop {
                interval.tick().await;
                manager.sweep_expired();
            }
        });
    }
}

impl Default for ConversationStateManager {
    fn default() -> Self {
        Self::new()
    }
}
