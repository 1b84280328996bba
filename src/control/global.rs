//! Global concurrency controllers — one shared gate for all requests

use super::FlowController;
use crate::error::Result;
use crate::gate::CapacityGate;
use crate::priority::PriorityProvider;
use crate::request::RequestContext;
use async_trait::async_trait;
use std::time::Duration;

/// Caps the number of requests inside the pipeline at once.
/// All waiters queue at equal priority, so admission order is FIFO.
pub struct GlobalFlowController {
    gate: CapacityGate,
    capacity: usize,
}

impl GlobalFlowController {
    /// Create a controller admitting at most `capacity` concurrent requests
    pub fn new(capacity: usize) -> Self {
        Self {
            gate: CapacityGate::new(capacity),
            capacity,
        }
    }

    /// Requests currently admitted
    pub fn in_use(&self) -> usize {
        self.gate.in_use()
    }

    /// Requests currently queued
    pub fn waiting(&self) -> usize {
        self.gate.waiting()
    }
}

#[async_trait]
impl FlowController for GlobalFlowController {
    async fn request_incoming(&self, _ctx: &mut RequestContext, timeout: Duration) -> Result<bool> {
        Ok(self.gate.acquire(0, timeout).await)
    }

    fn request_complete(&self, _ctx: &RequestContext) {
        self.gate.release();
    }

    fn chain_priority(&self) -> usize {
        self.capacity
    }

    fn name(&self) -> &str {
        "global"
    }
}

/// Global cap whose waiters are ordered by per-request priority.
/// Priority comes from a [`PriorityProvider`] (header, user tier, default);
/// ties admit FIFO.
pub struct PriorityFlowController {
    gate: CapacityGate,
    capacity: usize,
    provider: PriorityProvider,
}

impl PriorityFlowController {
    /// Create a controller admitting at most `capacity` concurrent requests,
    /// ordering waiters by the provider's priority
    pub fn new(capacity: usize, provider: PriorityProvider) -> Self {
        Self {
            gate: CapacityGate::new(capacity),
            capacity,
            provider,
        }
    }

    /// Requests currently admitted
    pub fn in_use(&self) -> usize {
        self.gate.in_use()
    }

    /// Requests currently queued
    pub fn waiting(&self) -> usize {
        self.gate.waiting()
    }
}

#[async_trait]
impl FlowController for PriorityFlowController {
    async fn request_incoming(&self, ctx: &mut RequestContext, timeout: Duration) -> Result<bool> {
        let priority = self.provider.priority_of(ctx);
        Ok(self.gate.acquire(priority, timeout).await)
    }

    fn request_complete(&self, _ctx: &RequestContext) {
        self.gate.release();
    }

    fn chain_priority(&self) -> usize {
        self.capacity
    }

    fn name(&self) -> &str {
        "priority"
    }
}
