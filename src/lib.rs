//! # Flowgate
//!
//! Request flow control for API gateways: an ordered chain of admission
//! controllers gating a request pipeline before any service logic runs.
//!
//! ## Architecture
//!
//! ```text
//! Request → ControllerChain → [rate | per-ip | per-user | global] → pipeline
//!                ↑                                                      │
//!                └───────────── AdmissionTicket::complete ──────────────┘
//! ```
//!
//! ## Core Features
//!
//! - **Bounded concurrency**: global, per-IP, and per-user caps backed by a
//!   capacity gate with priority-then-FIFO wake order and per-request timeouts
//! - **Priority admission**: numeric priorities from a request header or
//!   per-user tiers decide who wakes first when capacity frees
//! - **Rate limiting**: per-client token windows with bounded refill waits,
//!   429 rejections, and `X-RateLimit-*` response headers
//! - **Rollback**: a denial releases every controller that had already
//!   admitted the request; tickets release on drop
//! - **HCL configuration**: named controller blocks, bound once at startup
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use flowgate::{ControllerChain, FlowConfig, RequestContext};
//!
//! #[tokio::main]
//! async fn main() -> flowgate::Result<()> {
//!     let config = FlowConfig::from_file("flow.hcl").await?;
//!     let chain = ControllerChain::from_config(&config)?;
//!
//!     let mut ctx = RequestContext::new(peer_ip, method, path);
//!     let ticket = chain.admit(&mut ctx).await?;
//!     // ... run the request through the pipeline ...
//!     ticket.complete();
//!     Ok(())
//! }
//! ```

pub mod chain;
pub mod config;
pub mod control;
pub mod error;
pub mod gate;
pub mod key;
pub mod metrics;
pub mod priority;
pub mod request;

// Re-export main types
pub use chain::{AdmissionTicket, ControllerChain};
pub use config::{ControllerConfig, FlowConfig};
pub use control::{
    AnonymousPolicy, FlowController, GlobalFlowController, IpFlowController,
    PriorityFlowController, RateFlowController, RequestMatcher, UserFlowController,
};
pub use error::{FlowError, Result};
pub use gate::CapacityGate;
pub use key::{IpResolver, KeyGenerator, TrustedProxies};
pub use metrics::{FlowMetrics, MetricsSnapshot};
pub use priority::PriorityProvider;
pub use request::RequestContext;
