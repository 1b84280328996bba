//! Per-user concurrency controller — one gate per authenticated principal

use super::FlowController;
use crate::error::Result;
use crate::gate::CapacityGate;
use crate::request::RequestContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared key for unauthenticated requests under [`AnonymousPolicy::Shared`]
const ANONYMOUS_KEY: &str = "anonymous";

/// How unauthenticated requests are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AnonymousPolicy {
    /// Unauthenticated requests skip this controller entirely
    Bypass,
    /// Unauthenticated requests share one `anonymous` counter
    #[default]
    Shared,
}

/// Caps concurrent requests per authenticated principal.
/// Gates are created lazily per user and removed once idle.
pub struct UserFlowController {
    capacity_per_user: usize,
    policy: AnonymousPolicy,
    gates: Mutex<HashMap<String, Arc<CapacityGate>>>,
}

impl UserFlowController {
    /// Create a controller admitting at most `capacity_per_user` concurrent
    /// requests per principal; unauthenticated requests share one counter
    pub fn new(capacity_per_user: usize) -> Self {
        Self::with_policy(capacity_per_user, AnonymousPolicy::default())
    }

    /// Create with an explicit policy for unauthenticated requests
    pub fn with_policy(capacity_per_user: usize, policy: AnonymousPolicy) -> Self {
        Self {
            capacity_per_user,
            policy,
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Key for a request, `None` when the request bypasses this controller
    fn key_of(&self, ctx: &RequestContext) -> Option<String> {
        match (&ctx.user, self.policy) {
            (Some(user), _) => Some(user.clone()),
            (None, AnonymousPolicy::Shared) => Some(ANONYMOUS_KEY.to_string()),
            (None, AnonymousPolicy::Bypass) => None,
        }
    }

    fn gate_for(&self, key: &str) -> Arc<CapacityGate> {
        let mut gates = self.gates.lock().unwrap();
        gates
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CapacityGate::new(self.capacity_per_user)))
            .clone()
    }

    /// Number of principals currently tracked
    pub fn tracked_users(&self) -> usize {
        self.gates.lock().unwrap().len()
    }

    /// Requests currently admitted for one principal
    pub fn in_use_for(&self, user: &str) -> usize {
        self.gates
            .lock()
            .unwrap()
            .get(user)
            .map(|gate| gate.in_use())
            .unwrap_or(0)
    }

}

#[async_trait]
impl FlowController for UserFlowController {
    async fn request_incoming(&self, ctx: &mut RequestContext, timeout: Duration) -> Result<bool> {
        let Some(key) = self.key_of(ctx) else {
            return Ok(true);
        };
        let gate = self.gate_for(&key);
        let admitted = gate.acquire(0, timeout).await;
        if !admitted {
            tracing::debug!(user = %key, "per-user admission timed out");
            // `gate` is still held here, so a count of two means ours + map's
            let mut gates = self.gates.lock().unwrap();
            if let Some(entry) = gates.get(&key) {
                if Arc::strong_count(entry) == 2 && entry.is_idle() {
                    gates.remove(&key);
                }
            }
        }
        Ok(admitted)
    }

    fn request_complete(&self, ctx: &RequestContext) {
        let Some(key) = self.key_of(ctx) else {
            return;
        };
        let mut gates = self.gates.lock().unwrap();
        if let Some(gate) = gates.get(&key).cloned() {
            gate.release();
            if Arc::strong_count(&gate) == 2 && gate.is_idle() {
                gates.remove(&key);
            }
        }
    }

    fn chain_priority(&self) -> usize {
        self.capacity_per_user
    }

    fn name(&self) -> &str {
        "per-user"
    }
}
