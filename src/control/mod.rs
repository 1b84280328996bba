//! Flow controllers — admission policies applied to each request
//!
//! Controllers share one contract: decide whether a request may proceed now
//! (possibly waiting for capacity), and release whatever was granted once the
//! response has been written. The chain applies them in a fixed order and
//! rolls back partial admissions on failure.

mod global;
mod ip;
mod rate;
mod user;

pub use global::{GlobalFlowController, PriorityFlowController};
pub use ip::IpFlowController;
pub use rate::{RateFlowController, RequestMatcher};
pub use user::{AnonymousPolicy, UserFlowController};

use crate::error::Result;
use crate::request::RequestContext;
use async_trait::async_trait;
use std::time::Duration;

/// Admission policy applied to each incoming request
#[async_trait]
pub trait FlowController: Send + Sync {
    /// Decide whether this request may proceed, waiting up to `timeout` for
    /// capacity. Returns `Ok(true)` when admitted, `Ok(false)` when the wait
    /// budget expired (the caller rejects with a 503-style error), or
    /// `Err(FlowError::RateLimited)` for rate rejections.
    async fn request_incoming(&self, ctx: &mut RequestContext, timeout: Duration) -> Result<bool>;

    /// Release whatever `request_incoming` granted to this request. Must be
    /// safe to call when nothing was granted (no-op), and must never push an
    /// occupancy counter below zero.
    fn request_complete(&self, ctx: &RequestContext);

    /// Chain ordering weight — controllers with smaller values are consulted
    /// first. Capacity controllers report their capacity so the tightest
    /// queue is tried before wider ones; rate controllers report 0 so cheap
    /// rejections happen before any slot is held.
    fn chain_priority(&self) -> usize;

    /// Controller name for logging
    fn name(&self) -> &str;
}
