//! Controller chain — ordered admission with rollback
//!
//! The chain applies every configured controller to each incoming request, in
//! a fixed order decided once at build time. A request is admitted only when
//! every controller admits it; any denial releases the controllers that had
//! already admitted before the error propagates, so a rejected request never
//! leaves capacity behind.

use crate::config::{ControllerConfig, FlowConfig};
use crate::control::{
    FlowController, GlobalFlowController, IpFlowController, PriorityFlowController,
    RateFlowController, RequestMatcher, UserFlowController,
};
use crate::error::{FlowError, Result};
use crate::key::{IpResolver, KeyGenerator, DEFAULT_COOKIE_NAME};
use crate::metrics::FlowMetrics;
use crate::priority::PriorityProvider;
use crate::request::RequestContext;
use http::Method;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Ordered admission chain
pub struct ControllerChain {
    controllers: Vec<Arc<dyn FlowController>>,
    timeout: Duration,
    metrics: Arc<FlowMetrics>,
}

impl ControllerChain {
    /// Build a chain from controllers and a total admission budget.
    ///
    /// Controllers are reordered by [`FlowController::chain_priority`]
    /// (smallest first): rate checks reject cheaply before any slot is held,
    /// and the tightest concurrency caps queue before wider ones.
    pub fn new(mut controllers: Vec<Arc<dyn FlowController>>, timeout: Duration) -> Self {
        controllers.sort_by_key(|c| c.chain_priority());
        Self {
            controllers,
            timeout,
            metrics: Arc::new(FlowMetrics::new()),
        }
    }

    /// Build a chain from configuration
    pub fn from_config(config: &FlowConfig) -> Result<Self> {
        config.validate()?;

        // Deterministic construction order: block name, then priority sort
        let mut names: Vec<&String> = config.controllers.keys().collect();
        names.sort();

        let mut controllers = Vec::with_capacity(names.len());
        for name in names {
            let controller = build_controller(&config.controllers[name])
                .map_err(|e| FlowError::Config(format!("controller '{}': {}", name, e)))?;
            controllers.push(controller);
        }

        tracing::info!(controllers = controllers.len(), "flow-control chain built");
        Ok(Self::new(controllers, config.timeout()))
    }

    /// Create an empty chain that admits everything
    pub fn empty() -> Self {
        Self::new(Vec::new(), Duration::from_secs(30))
    }

    /// Run the admission decision for one request.
    ///
    /// On success the returned ticket must be completed (or dropped) after
    /// the response is written; it releases every admitting controller
    /// exactly once. On denial, already-admitted controllers have been rolled
    /// back before the error is returned.
    pub async fn admit(&self, ctx: &mut RequestContext) -> Result<AdmissionTicket> {
        self.metrics.record_request();
        let deadline = Instant::now() + self.timeout;
        let mut admitted: Vec<Arc<dyn FlowController>> =
            Vec::with_capacity(self.controllers.len());

        for controller in &self.controllers {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let outcome = if remaining.is_zero() {
                Ok(false)
            } else {
                controller.request_incoming(ctx, remaining).await
            };

            match outcome {
                Ok(true) => admitted.push(controller.clone()),
                Ok(false) => {
                    rollback(&admitted, ctx);
                    self.metrics.record_timeout(controller.name());
                    tracing::debug!(controller = controller.name(), "admission timed out");
                    return Err(FlowError::Timeout {
                        controller: controller.name().to_string(),
                        waited_ms: self.timeout.as_millis() as u64,
                    });
                }
                Err(e) => {
                    rollback(&admitted, ctx);
                    self.metrics.record_rate_limited(controller.name());
                    return Err(e);
                }
            }
        }

        self.metrics.record_admitted();
        Ok(AdmissionTicket {
            admitted,
            ctx: ctx.clone(),
            completed: false,
        })
    }

    /// Number of controllers in the chain
    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    /// Whether the chain has no controllers
    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Total admission budget per request
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Controller names in application order
    pub fn controller_names(&self) -> Vec<&str> {
        self.controllers.iter().map(|c| c.name()).collect()
    }

    /// Admission metrics
    pub fn metrics(&self) -> &Arc<FlowMetrics> {
        &self.metrics
    }
}

fn rollback(admitted: &[Arc<dyn FlowController>], ctx: &RequestContext) {
    for controller in admitted {
        controller.request_complete(ctx);
    }
}

fn build_controller(config: &ControllerConfig) -> Result<Arc<dyn FlowController>> {
    // validate() has run; capacity presence is already guaranteed
    let capacity = config.capacity.unwrap_or(0) as usize;

    let controller: Arc<dyn FlowController> = match config.controller_type.as_str() {
        "global" => Arc::new(GlobalFlowController::new(capacity)),
        "priority" => {
            let mut provider = match &config.priority_header {
                Some(header) => PriorityProvider::new(header.clone()),
                None => PriorityProvider::default(),
            };
            if let Some(default_priority) = config.default_priority {
                provider.default_priority = default_priority;
            }
            provider.user_tiers = config.user_tiers.clone();
            Arc::new(PriorityFlowController::new(capacity, provider))
        }
        "ip" => {
            let resolver = IpResolver::with_trusted_proxies(&config.trusted_proxies)?;
            Arc::new(IpFlowController::with_resolver(capacity, resolver))
        }
        "user" => Arc::new(UserFlowController::with_policy(
            capacity,
            config.anonymous.unwrap_or_default(),
        )),
        "rate" => {
            let mut methods = Vec::with_capacity(config.methods.len());
            for method in &config.methods {
                methods.push(method.parse::<Method>().map_err(|_| {
                    FlowError::Config(format!("invalid method: '{}'", method))
                })?);
            }
            let matcher = RequestMatcher::any()
                .with_methods(methods)
                .with_path_prefixes(config.path_prefixes.clone());
            let keyer = match config.key.as_deref() {
                Some("cookie") => KeyGenerator::cookie(
                    config
                        .cookie_name
                        .clone()
                        .unwrap_or_else(|| DEFAULT_COOKIE_NAME.to_string()),
                ),
                _ => KeyGenerator::Ip(IpResolver::with_trusted_proxies(
                    &config.trusted_proxies,
                )?),
            };
            Arc::new(RateFlowController::new(
                matcher,
                keyer,
                config.capacity.unwrap_or(0) as u32,
                config.refill_period_ms.map(Duration::from_millis),
                Duration::from_millis(config.max_wait_ms.unwrap_or(0)),
            )?)
        }
        other => {
            return Err(FlowError::Config(format!(
                "unknown controller type: '{}'",
                other
            )));
        }
    };

    Ok(controller)
}

/// Records which controllers admitted one request.
///
/// Completing the ticket releases each of them exactly once. A ticket that is
/// dropped without being completed releases on drop, so capacity survives
/// panics and early returns in the downstream pipeline.
pub struct AdmissionTicket {
    admitted: Vec<Arc<dyn FlowController>>,
    ctx: RequestContext,
    completed: bool,
}

impl std::fmt::Debug for AdmissionTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionTicket")
            .field("controllers", &self.admitted.len())
            .field("ctx", &self.ctx)
            .field("completed", &self.completed)
            .finish()
    }
}

impl AdmissionTicket {
    /// Release every admitting controller
    pub fn complete(mut self) {
        self.release();
    }

    /// Number of controllers that admitted the request
    pub fn controllers(&self) -> usize {
        self.admitted.len()
    }

    fn release(&mut self) {
        if self.completed {
            return;
        }
        self.completed = true;
        for controller in &self.admitted {
            controller.request_complete(&self.ctx);
        }
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        if !self.completed {
            tracing::debug!("admission ticket dropped without complete(); releasing");
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(100);

    fn ctx() -> RequestContext {
        RequestContext::new("10.0.0.1".parse().unwrap(), Method::GET, "/api")
    }

    #[test]
    fn test_empty_chain() {
        let chain = ControllerChain::empty();
        assert!(chain.is_empty());
        assert_eq!(chain.len(), 0);
    }

    #[tokio::test]
    async fn test_empty_chain_admits() {
        let chain = ControllerChain::empty();
        let ticket = chain.admit(&mut ctx()).await.unwrap();
        assert_eq!(ticket.controllers(), 0);
        ticket.complete();
    }

    #[tokio::test]
    async fn test_single_controller_round_trip() {
        let global = Arc::new(GlobalFlowController::new(1));
        let chain = ControllerChain::new(vec![global.clone()], SHORT);

        let ticket = chain.admit(&mut ctx()).await.unwrap();
        assert_eq!(global.in_use(), 1);
        ticket.complete();
        assert_eq!(global.in_use(), 0);
    }

    #[tokio::test]
    async fn test_starved_chain_always_denies() {
        // A capacity-0 controller starves the chain; the wide controller must
        // stay untouched after every denial
        let wide = Arc::new(GlobalFlowController::new(5));
        let starved = Arc::new(GlobalFlowController::new(0));
        let chain = ControllerChain::new(vec![wide.clone(), starved], SHORT);

        for _ in 0..3 {
            let err = chain.admit(&mut ctx()).await.unwrap_err();
            assert_eq!(err.status_code(), 503);
            assert_eq!(wide.in_use(), 0);
        }
    }

    #[tokio::test]
    async fn test_timeout_rolls_back_prior_admissions() {
        // Equal capacities keep insertion order, so `first` admits before
        // `full` times out — the denial must release `first`
        let first = Arc::new(GlobalFlowController::new(5));
        let full = Arc::new(GlobalFlowController::new(5));
        for _ in 0..5 {
            assert!(full.request_incoming(&mut ctx(), SHORT).await.unwrap());
        }
        let chain = ControllerChain::new(vec![first.clone(), full.clone()], SHORT);

        let err = chain.admit(&mut ctx()).await.unwrap_err();
        assert_eq!(err.status_code(), 503);
        assert_eq!(first.in_use(), 0);
        assert_eq!(full.in_use(), 5);
    }

    #[tokio::test]
    async fn test_error_rolls_back_prior_admissions() {
        struct Rejecting;

        #[async_trait::async_trait]
        impl FlowController for Rejecting {
            async fn request_incoming(
                &self,
                _ctx: &mut RequestContext,
                _timeout: Duration,
            ) -> Result<bool> {
                Err(FlowError::RateLimited {
                    context: "always".to_string(),
                    retry_after: None,
                })
            }
            fn request_complete(&self, _ctx: &RequestContext) {}
            fn chain_priority(&self) -> usize {
                usize::MAX
            }
            fn name(&self) -> &str {
                "rejecting"
            }
        }

        let wide = Arc::new(GlobalFlowController::new(5));
        let chain =
            ControllerChain::new(vec![wide.clone(), Arc::new(Rejecting)], Duration::from_secs(1));

        let err = chain.admit(&mut ctx()).await.unwrap_err();
        assert_eq!(err.status_code(), 429);
        assert_eq!(wide.in_use(), 0);
    }

    #[tokio::test]
    async fn test_rate_rejection_propagates() {
        let rate = Arc::new(
            RateFlowController::new(
                RequestMatcher::any(),
                KeyGenerator::ip(),
                1,
                None,
                Duration::ZERO,
            )
            .unwrap(),
        );
        let chain = ControllerChain::new(vec![rate], Duration::from_secs(1));

        // First request consumes the only token
        chain.admit(&mut ctx()).await.unwrap().complete();

        let err = chain.admit(&mut ctx()).await.unwrap_err();
        assert_eq!(err.status_code(), 429);
    }

    #[tokio::test]
    async fn test_ticket_drop_releases() {
        let global = Arc::new(GlobalFlowController::new(1));
        let chain = ControllerChain::new(vec![global.clone()], SHORT);

        {
            let _ticket = chain.admit(&mut ctx()).await.unwrap();
            assert_eq!(global.in_use(), 1);
        }
        assert_eq!(global.in_use(), 0);
    }

    #[tokio::test]
    async fn test_chain_orders_by_priority() {
        let chain = ControllerChain::new(
            vec![
                Arc::new(GlobalFlowController::new(100)),
                Arc::new(IpFlowController::new(6)),
                Arc::new(
                    RateFlowController::new(
                        RequestMatcher::any(),
                        KeyGenerator::ip(),
                        10,
                        None,
                        Duration::ZERO,
                    )
                    .unwrap(),
                ),
            ],
            SHORT,
        );
        assert_eq!(chain.controller_names(), vec!["rate", "per-ip", "global"]);
    }

    #[tokio::test]
    async fn test_from_config_builds_and_orders() {
        let hcl = r#"
            timeout_ms = 5000

            controllers "wide" {
              type     = "global"
              capacity = 100
            }

            controllers "per-client" {
              type     = "ip"
              capacity = 6
            }

            controllers "api-rate" {
              type     = "rate"
              capacity = 10
              refill_period_ms = 1000
            }
        "#;
        let config = FlowConfig::from_hcl(hcl).unwrap();
        let chain = ControllerChain::from_config(&config).unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.timeout(), Duration::from_secs(5));
        assert_eq!(chain.controller_names(), vec!["rate", "per-ip", "global"]);
    }

    #[tokio::test]
    async fn test_from_config_rejects_bad_config() {
        let hcl = r#"
            controllers "odd" {
              type = "teleport"
            }
        "#;
        let config = FlowConfig::from_hcl(hcl).unwrap();
        assert!(ControllerChain::from_config(&config).is_err());
    }

    #[tokio::test]
    async fn test_metrics_track_outcomes() {
        let chain = ControllerChain::new(
            vec![Arc::new(GlobalFlowController::new(1))],
            Duration::from_millis(50),
        );

        let ticket = chain.admit(&mut ctx()).await.unwrap();
        // Second admit times out while the first holds the slot
        assert!(chain.admit(&mut ctx()).await.is_err());
        ticket.complete();

        let snapshot = chain.metrics().snapshot();
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.admitted, 1);
        assert_eq!(snapshot.timed_out, 1);
        assert_eq!(snapshot.controller_rejections["global"], 1);
    }

    #[tokio::test]
    async fn test_timeout_error_names_controller() {
        let chain = ControllerChain::new(
            vec![Arc::new(GlobalFlowController::new(0))],
            Duration::from_millis(50),
        );
        match chain.admit(&mut ctx()).await.unwrap_err() {
            FlowError::Timeout { controller, .. } => assert_eq!(controller, "global"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
