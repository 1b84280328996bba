//! Rate controller — per-client token allowance with bounded refill waits
//!
//! Each client key owns a token window: admitted requests consume one token,
//! and tokens refill continuously toward the configured capacity over the
//! refill period. An empty window either waits for its refill (bounded by the
//! controller's wait budget, strict FIFO among waiters via reservations) or
//! rejects with 429 semantics when the wait budget cannot reach the next
//! token.

use super::FlowController;
use crate::error::{FlowError, Result};
use crate::key::KeyGenerator;
use crate::request::RequestContext;
use async_trait::async_trait;
use http::Method;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Window map size above which stale entries are swept
const PRUNE_THRESHOLD: usize = 1024;

/// Selects which requests a rate controller applies to.
/// Empty dimensions are wildcards; requests that don't match pass through
/// the controller untouched.
#[derive(Debug, Clone, Default)]
pub struct RequestMatcher {
    methods: Vec<Method>,
    path_prefixes: Vec<String>,
}

impl RequestMatcher {
    /// Matcher selecting every request
    pub fn any() -> Self {
        Self::default()
    }

    /// Restrict to the given methods
    pub fn with_methods(mut self, methods: Vec<Method>) -> Self {
        self.methods = methods;
        self
    }

    /// Restrict to paths starting with any of the given prefixes
    pub fn with_path_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.path_prefixes = prefixes;
        self
    }

    /// Whether a request falls under this matcher
    pub fn matches(&self, ctx: &RequestContext) -> bool {
        if !self.methods.is_empty() && !self.methods.contains(&ctx.method) {
            return false;
        }
        if !self.path_prefixes.is_empty()
            && !self.path_prefixes.iter().any(|p| ctx.path.starts_with(p))
        {
            return false;
        }
        true
    }

    /// Human-readable description, used in the rate-limit context header
    pub fn describe(&self) -> String {
        if self.methods.is_empty() && self.path_prefixes.is_empty() {
            return "any request".to_string();
        }
        let methods = if self.methods.is_empty() {
            "any".to_string()
        } else {
            self.methods
                .iter()
                .map(Method::as_str)
                .collect::<Vec<_>>()
                .join("|")
        };
        let paths = if self.path_prefixes.is_empty() {
            "/".to_string()
        } else {
            self.path_prefixes.join("|")
        };
        format!("{} {}", methods, paths)
    }
}

struct RateWindow {
    tokens: f64,
    last_refill: Instant,
}

impl RateWindow {
    fn full(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, rate: f64, capacity: f64) {
        let now = Instant::now();
        if rate > 0.0 {
            let elapsed = now.duration_since(self.last_refill).as_secs_f64();
            self.tokens = (self.tokens + elapsed * rate).min(capacity);
        }
        self.last_refill = now;
    }
}

enum Decision {
    Admit { remaining: u32 },
    Wait { wait: Duration },
    Reject { retry_after: Option<Duration> },
}

/// Token-bucket rate controller keyed per client
pub struct RateFlowController {
    matcher: RequestMatcher,
    keyer: KeyGenerator,
    capacity: u32,
    /// Tokens per second; 0 means the allowance never refills
    rate: f64,
    max_wait: Duration,
    windows: Mutex<HashMap<String, RateWindow>>,
}

impl RateFlowController {
    /// Create a rate controller.
    ///
    /// `capacity` tokens refill over `refill_period` (`None` disables refill,
    /// turning the allowance into a hard quota). `max_wait` bounds how long an
    /// empty window may wait for its next token; zero rejects immediately.
    pub fn new(
        matcher: RequestMatcher,
        keyer: KeyGenerator,
        capacity: u32,
        refill_period: Option<Duration>,
        max_wait: Duration,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(FlowError::Config(
                "rate controller requires a capacity of at least 1".to_string(),
            ));
        }
        let rate = match refill_period {
            Some(period) if !period.is_zero() => f64::from(capacity) / period.as_secs_f64(),
            _ => 0.0,
        };
        Ok(Self {
            matcher,
            keyer,
            capacity,
            rate,
            max_wait,
            windows: Mutex::new(HashMap::new()),
        })
    }

    /// Number of client windows currently tracked
    pub fn tracked_clients(&self) -> usize {
        self.windows.lock().unwrap().len()
    }

    fn decide(&self, key: &str, budget: Duration) -> Decision {
        let mut windows = self.windows.lock().unwrap();
        if windows.len() > PRUNE_THRESHOLD {
            self.prune_locked(&mut windows);
        }

        let capacity = f64::from(self.capacity);
        let window = windows
            .entry(key.to_string())
            .or_insert_with(|| RateWindow::full(capacity));
        window.refill(self.rate, capacity);

        if window.tokens >= 1.0 {
            window.tokens -= 1.0;
            return Decision::Admit {
                remaining: window.tokens.floor() as u32,
            };
        }

        if self.rate <= 0.0 {
            // Quota exhausted and nothing will ever refill it
            return Decision::Reject { retry_after: None };
        }

        // Time until this waiter's token exists. Earlier reservations have
        // already been subtracted, so waiters line up strictly FIFO.
        let wait = Duration::from_secs_f64((1.0 - window.tokens) / self.rate);
        if wait <= budget {
            window.tokens -= 1.0;
            Decision::Wait { wait }
        } else {
            Decision::Reject {
                retry_after: Some(wait),
            }
        }
    }

    /// Drop windows that have fully refilled — they carry no state a fresh
    /// window wouldn't. Hard quotas (no refill) are never pruned.
    fn prune_locked(&self, windows: &mut HashMap<String, RateWindow>) {
        if self.rate <= 0.0 {
            return;
        }
        let capacity = f64::from(self.capacity);
        let rate = self.rate;
        let before = windows.len();
        windows.retain(|_, window| {
            let elapsed = window.last_refill.elapsed().as_secs_f64();
            window.tokens + elapsed * rate < capacity
        });
        tracing::debug!(
            removed = before - windows.len(),
            remaining = windows.len(),
            "pruned stale rate windows"
        );
    }

    /// Return a reserved token after a cancelled wait
    fn cancel_reservation(&self, key: &str) {
        let mut windows = self.windows.lock().unwrap();
        if let Some(window) = windows.get_mut(key) {
            window.tokens += 1.0;
        }
    }

    fn set_rate_headers(&self, ctx: &mut RequestContext, remaining: u32) {
        ctx.set_response_header("X-RateLimit-Context", self.matcher.describe());
        ctx.set_response_header("X-RateLimit-Limit", self.capacity.to_string());
        ctx.set_response_header("X-RateLimit-Remaining", remaining.to_string());
    }
}

#[async_trait]
impl FlowController for RateFlowController {
    async fn request_incoming(&self, ctx: &mut RequestContext, timeout: Duration) -> Result<bool> {
        if !self.matcher.matches(ctx) {
            return Ok(true);
        }

        let key = self.keyer.key(ctx);
        let budget = self.max_wait.min(timeout);

        match self.decide(&key, budget) {
            Decision::Admit { remaining } => {
                self.set_rate_headers(ctx, remaining);
                Ok(true)
            }
            Decision::Wait { wait } => {
                // Give the reservation back if this future is dropped mid-wait
                let mut guard = ReservationGuard {
                    controller: self,
                    key: &key,
                    armed: true,
                };
                tokio::time::sleep(wait).await;
                guard.armed = false;
                self.set_rate_headers(ctx, 0);
                Ok(true)
            }
            Decision::Reject { retry_after } => {
                self.set_rate_headers(ctx, 0);
                if let Some(wait) = retry_after {
                    let seconds = wait.as_secs_f64().ceil().max(1.0) as u64;
                    ctx.set_response_header("Retry-After", seconds.to_string());
                }
                tracing::debug!(
                    client = %key,
                    context = %self.matcher.describe(),
                    "rate limit exceeded"
                );
                Err(FlowError::RateLimited {
                    context: self.matcher.describe(),
                    retry_after,
                })
            }
        }
    }

    /// Tokens are replenished by time, not by request completion
    fn request_complete(&self, _ctx: &RequestContext) {}

    fn chain_priority(&self) -> usize {
        0
    }

    fn name(&self) -> &str {
        "rate"
    }
}

struct ReservationGuard<'a> {
    controller: &'a RateFlowController,
    key: &'a str,
    armed: bool,
}

impl Drop for ReservationGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.controller.cancel_reservation(self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_WAIT: Duration = Duration::ZERO;
    const LONG: Duration = Duration::from_secs(5);

    fn ctx(peer: &str) -> RequestContext {
        RequestContext::new(peer.parse().unwrap(), Method::GET, "/api/data")
    }

    fn header<'a>(ctx: &'a RequestContext, name: &str) -> Option<&'a str> {
        ctx.response_headers()
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    fn quota(capacity: u32, max_wait: Duration) -> RateFlowController {
        RateFlowController::new(
            RequestMatcher::any(),
            KeyGenerator::ip(),
            capacity,
            None,
            max_wait,
        )
        .unwrap()
    }

    #[test]
    fn test_zero_capacity_rejected_at_construction() {
        let result = RateFlowController::new(
            RequestMatcher::any(),
            KeyGenerator::ip(),
            0,
            None,
            NO_WAIT,
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_admits_until_capacity_with_remaining_headers() {
        let controller = quota(2, NO_WAIT);

        let mut first = ctx("10.0.0.1");
        assert!(controller.request_incoming(&mut first, LONG).await.unwrap());
        assert_eq!(header(&first, "X-RateLimit-Limit"), Some("2"));
        assert_eq!(header(&first, "X-RateLimit-Remaining"), Some("1"));

        let mut second = ctx("10.0.0.1");
        assert!(controller.request_incoming(&mut second, LONG).await.unwrap());
        assert_eq!(header(&second, "X-RateLimit-Remaining"), Some("0"));
    }

    #[tokio::test]
    async fn test_exhausted_quota_rejects_with_429() {
        let controller = quota(1, NO_WAIT);
        assert!(controller
            .request_incoming(&mut ctx("10.0.0.1"), LONG)
            .await
            .unwrap());

        let err = controller
            .request_incoming(&mut ctx("10.0.0.1"), LONG)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 429);
    }

    #[tokio::test]
    async fn test_no_refill_rejection_has_no_retry_after() {
        let controller = quota(1, Duration::from_secs(10));
        assert!(controller
            .request_incoming(&mut ctx("10.0.0.1"), LONG)
            .await
            .unwrap());

        let mut rejected = ctx("10.0.0.1");
        let err = controller
            .request_incoming(&mut rejected, LONG)
            .await
            .unwrap_err();
        match err {
            FlowError::RateLimited { retry_after, .. } => assert!(retry_after.is_none()),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(header(&rejected, "Retry-After").is_none());
    }

    #[tokio::test]
    async fn test_waits_for_refill_then_admits() {
        let controller = RateFlowController::new(
            RequestMatcher::any(),
            KeyGenerator::ip(),
            1,
            Some(Duration::from_millis(100)),
            Duration::from_secs(2),
        )
        .unwrap();
        assert!(controller
            .request_incoming(&mut ctx("10.0.0.1"), LONG)
            .await
            .unwrap());

        let start = std::time::Instant::now();
        let mut second = ctx("10.0.0.1");
        assert!(controller.request_incoming(&mut second, LONG).await.unwrap());
        assert!(start.elapsed() >= Duration::from_millis(80));
        assert_eq!(header(&second, "X-RateLimit-Remaining"), Some("0"));
    }

    #[tokio::test]
    async fn test_rejects_when_wait_budget_cannot_reach_refill() {
        let controller = RateFlowController::new(
            RequestMatcher::any(),
            KeyGenerator::ip(),
            1,
            Some(Duration::from_secs(60)),
            Duration::from_millis(50),
        )
        .unwrap();
        assert!(controller
            .request_incoming(&mut ctx("10.0.0.1"), LONG)
            .await
            .unwrap());

        let mut rejected = ctx("10.0.0.1");
        let err = controller
            .request_incoming(&mut rejected, LONG)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 429);
        // A refilling window tells the client when to come back
        assert!(header(&rejected, "Retry-After").is_some());
    }

    #[tokio::test]
    async fn test_waiters_admit_in_reservation_order() {
        let controller = std::sync::Arc::new(
            RateFlowController::new(
                RequestMatcher::any(),
                KeyGenerator::ip(),
                1,
                Some(Duration::from_millis(100)),
                Duration::from_secs(5),
            )
            .unwrap(),
        );
        assert!(controller
            .request_incoming(&mut ctx("10.0.0.1"), LONG)
            .await
            .unwrap());

        let order = std::sync::Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for id in [1, 2] {
            let controller = controller.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                assert!(controller
                    .request_incoming(&mut ctx("10.0.0.1"), LONG)
                    .await
                    .unwrap());
                order.lock().unwrap().push(id);
            }));
            // Stagger arrivals so reservations are unambiguous
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_distinct_clients_have_independent_windows() {
        let controller = quota(1, NO_WAIT);
        assert!(controller
            .request_incoming(&mut ctx("10.0.0.1"), LONG)
            .await
            .unwrap());
        assert!(controller
            .request_incoming(&mut ctx("10.0.0.2"), LONG)
            .await
            .unwrap());
        assert_eq!(controller.tracked_clients(), 2);
    }

    #[tokio::test]
    async fn test_unmatched_request_passes_through() {
        let controller = RateFlowController::new(
            RequestMatcher::any().with_methods(vec![Method::POST]),
            KeyGenerator::ip(),
            1,
            None,
            NO_WAIT,
        )
        .unwrap();

        // GET requests don't match: no tokens consumed, no headers set
        for _ in 0..5 {
            let mut request = ctx("10.0.0.1");
            assert!(controller.request_incoming(&mut request, LONG).await.unwrap());
            assert!(request.response_headers().is_empty());
        }
        assert_eq!(controller.tracked_clients(), 0);
    }

    #[tokio::test]
    async fn test_path_prefix_matcher() {
        let matcher = RequestMatcher::any().with_path_prefixes(vec!["/api".to_string()]);
        assert!(matcher.matches(&ctx("10.0.0.1")));
        let other = RequestContext::new("10.0.0.1".parse().unwrap(), Method::GET, "/health");
        assert!(!matcher.matches(&other));
    }

    #[test]
    fn test_matcher_describe() {
        assert_eq!(RequestMatcher::any().describe(), "any request");
        let matcher = RequestMatcher::any()
            .with_methods(vec![Method::GET, Method::POST])
            .with_path_prefixes(vec!["/api".to_string()]);
        assert_eq!(matcher.describe(), "GET|POST /api");
    }

    #[tokio::test]
    async fn test_cookie_keyed_client_gets_identity_cookie() {
        let controller = RateFlowController::new(
            RequestMatcher::any(),
            KeyGenerator::cookie("flow-client-id"),
            2,
            None,
            NO_WAIT,
        )
        .unwrap();

        let mut first = ctx("10.0.0.1");
        assert!(controller.request_incoming(&mut first, LONG).await.unwrap());
        let minted = first.response_cookie("flow-client-id").unwrap().to_string();

        // A returning client presents the cookie and lands in the same window
        let mut second = ctx("10.0.0.2").with_cookie("flow-client-id", minted);
        assert!(controller.request_incoming(&mut second, LONG).await.unwrap());
        assert_eq!(header(&second, "X-RateLimit-Remaining"), Some("0"));
        assert_eq!(controller.tracked_clients(), 1);
    }

    #[tokio::test]
    async fn test_request_complete_does_not_return_tokens() {
        let controller = quota(1, NO_WAIT);
        let mut request = ctx("10.0.0.1");
        assert!(controller.request_incoming(&mut request, LONG).await.unwrap());
        controller.request_complete(&request);

        assert!(controller
            .request_incoming(&mut ctx("10.0.0.1"), LONG)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_refilled_windows_are_pruned() {
        let controller = RateFlowController::new(
            RequestMatcher::any(),
            KeyGenerator::ip(),
            1,
            Some(Duration::from_millis(10)),
            NO_WAIT,
        )
        .unwrap();

        for i in 0..(PRUNE_THRESHOLD + 1) {
            let peer = format!("10.{}.{}.{}", (i >> 16) & 0xff, (i >> 8) & 0xff, i & 0xff);
            assert!(controller
                .request_incoming(&mut ctx(&peer), LONG)
                .await
                .unwrap());
        }
        assert!(controller.tracked_clients() > PRUNE_THRESHOLD);

        // Let every window refill, then trigger the sweep with one more request
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(controller
            .request_incoming(&mut ctx("192.168.0.1"), LONG)
            .await
            .unwrap());
        assert!(controller.tracked_clients() <= 2);
    }
}
