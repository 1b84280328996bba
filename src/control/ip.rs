//! Per-IP concurrency controller — one gate per connecting client address

use super::FlowController;
use crate::error::Result;
use crate::gate::CapacityGate;
use crate::key::IpResolver;
use crate::request::RequestContext;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Caps concurrent requests per client address.
///
/// Identity is the directly connecting peer (see [`IpResolver`]): requests
/// arriving through different intermediaries are different clients even when
/// their forwarded-for headers claim the same origin. Gates are created
/// lazily per address and removed once idle, so the map only holds addresses
/// with in-flight or queued requests.
pub struct IpFlowController {
    capacity_per_ip: usize,
    resolver: IpResolver,
    gates: Mutex<HashMap<IpAddr, Arc<CapacityGate>>>,
}

impl IpFlowController {
    /// Create a controller admitting at most `capacity_per_ip` concurrent
    /// requests per client address
    pub fn new(capacity_per_ip: usize) -> Self {
        Self::with_resolver(capacity_per_ip, IpResolver::direct())
    }

    /// Create with a resolver that may unwrap trusted-proxy forwarding
    pub fn with_resolver(capacity_per_ip: usize, resolver: IpResolver) -> Self {
        Self {
            capacity_per_ip,
            resolver,
            gates: Mutex::new(HashMap::new()),
        }
    }

    fn gate_for(&self, ip: IpAddr) -> Arc<CapacityGate> {
        let mut gates = self.gates.lock().unwrap();
        gates
            .entry(ip)
            .or_insert_with(|| Arc::new(CapacityGate::new(self.capacity_per_ip)))
            .clone()
    }

    /// Number of client addresses currently tracked
    pub fn tracked_clients(&self) -> usize {
        self.gates.lock().unwrap().len()
    }

    /// Requests currently admitted for one client address
    pub fn in_use_for(&self, ip: IpAddr) -> usize {
        self.gates
            .lock()
            .unwrap()
            .get(&ip)
            .map(|gate| gate.in_use())
            .unwrap_or(0)
    }
}

#[async_trait]
impl FlowController for IpFlowController {
    async fn request_incoming(&self, ctx: &mut RequestContext, timeout: Duration) -> Result<bool> {
        let ip = self.resolver.client_ip(ctx);
        let gate = self.gate_for(ip);
        let admitted = gate.acquire(0, timeout).await;
        if !admitted {
            tracing::debug!(client = %ip, "per-ip admission timed out");
            // The waiter is gone; drop the gate entry if nothing else uses it
            let mut gates = self.gates.lock().unwrap();
            if let Some(entry) = gates.get(&ip) {
                if Arc::strong_count(entry) == 2 && entry.is_idle() {
                    gates.remove(&ip);
                }
            }
        }
        Ok(admitted)
    }

    fn request_complete(&self, ctx: &RequestContext) {
        let ip = self.resolver.client_ip(ctx);
        let mut gates = self.gates.lock().unwrap();
        if let Some(gate) = gates.get(&ip).cloned() {
            gate.release();
            // New references are only handed out under this lock, so a count
            // of two (map + ours) means no in-flight acquire can exist
            if Arc::strong_count(&gate) == 2 && gate.is_idle() {
                gates.remove(&ip);
            }
        }
    }

    fn chain_priority(&self) -> usize {
        self.capacity_per_ip
    }

    fn name(&self) -> &str {
        "per-ip"
    }
}
