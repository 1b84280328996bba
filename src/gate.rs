//! Capacity gate — bounded admission with priority-ordered wake-up
//!
//! The primitive under every capacity-based flow controller. A gate holds a
//! fixed number of slots; `acquire` resolves once a slot is granted or the
//! timeout expires, and `release` hands the freed slot directly to the best
//! waiter (highest priority, then earliest arrival) so wake-up order is
//! decided by the gate, not by scheduler races.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

/// Queue position of one waiter. `BTreeMap` iterates keys in ascending order,
/// so `Reverse(priority)` puts the highest priority first and `seq` breaks
/// ties FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct WaiterKey {
    priority: Reverse<i32>,
    seq: u64,
}

struct GateState {
    capacity: usize,
    in_use: usize,
    next_seq: u64,
    waiters: BTreeMap<WaiterKey, oneshot::Sender<()>>,
}

impl GateState {
    /// Hand the current slot to the best waiter, or return it to the pool.
    /// Skips waiters that already gave up (their receiver is gone).
    fn grant_next(&mut self) {
        while let Some((_, tx)) = self.waiters.pop_first() {
            if tx.send(()).is_ok() {
                return;
            }
        }
        // Saturating: an unpaired release must never underflow the counter
        self.in_use = self.in_use.saturating_sub(1);
    }
}

/// Capacity-bounded admission gate with priority-then-FIFO wake order
pub struct CapacityGate {
    state: Mutex<GateState>,
}

impl CapacityGate {
    /// Create a gate with the given number of slots.
    ///
    /// A capacity of 0 is allowed and deterministically denies every
    /// `acquire` without queuing (nothing could ever release a slot).
    pub fn new(capacity: usize) -> Self {
        if capacity == 0 {
            tracing::warn!("capacity gate created with capacity 0 — all requests will be denied");
        }
        Self {
            state: Mutex::new(GateState {
                capacity,
                in_use: 0,
                next_seq: 0,
                waiters: BTreeMap::new(),
            }),
        }
    }

    /// Acquire a slot, waiting up to `timeout`.
    ///
    /// Returns `true` once a slot is granted, `false` on timeout — a timed-out
    /// acquire consumes no capacity. New arrivals never overtake queued
    /// waiters, even when a slot is free.
    ///
    /// Cancel-safe: dropping the returned future removes the waiter from the
    /// queue, and a slot handed off concurrently with the cancellation is
    /// passed on to the next waiter instead of leaking.
    pub async fn acquire(&self, priority: i32, timeout: Duration) -> bool {
        let (key, rx) = {
            let mut state = self.state.lock().unwrap();
            if state.capacity == 0 {
                return false;
            }
            if state.in_use < state.capacity && state.waiters.is_empty() {
                state.in_use += 1;
                return true;
            }
            let key = WaiterKey {
                priority: Reverse(priority),
                seq: state.next_seq,
            };
            state.next_seq += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.insert(key, tx);
            (key, rx)
        };

        let mut guard = WaitGuard {
            gate: self,
            key,
            armed: true,
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => {
                guard.armed = false;
                true
            }
            // Timed out, or the gate was dropped while we waited
            _ => {
                guard.armed = false;
                self.abandon(key);
                false
            }
        }
    }

    /// Release a held slot, waking the next eligible waiter.
    /// Calling without a matching `acquire` is a no-op.
    pub fn release(&self) {
        let mut state = self.state.lock().unwrap();
        if state.in_use == 0 {
            return;
        }
        state.grant_next();
    }

    /// Remove a waiter that gave up. If a slot was already handed to it, the
    /// slot is passed along so it cannot leak.
    fn abandon(&self, key: WaiterKey) {
        let mut state = self.state.lock().unwrap();
        if state.waiters.remove(&key).is_none() {
            state.grant_next();
        }
    }

    /// Configured number of slots
    pub fn capacity(&self) -> usize {
        self.state.lock().unwrap().capacity
    }

    /// Slots currently held
    pub fn in_use(&self) -> usize {
        self.state.lock().unwrap().in_use
    }

    /// Waiters currently queued
    pub fn waiting(&self) -> usize {
        self.state.lock().unwrap().waiters.len()
    }

    /// Whether no slot is held and no waiter is queued
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.in_use == 0 && state.waiters.is_empty()
    }
}

/// Cleans up a registered waiter if its future is dropped mid-wait
struct WaitGuard<'a> {
    gate: &'a CapacityGate,
    key: WaiterKey,
    armed: bool,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.gate.abandon(self.key);
        }
    }
}
