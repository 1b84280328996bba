//! Admission priority — derives a numeric priority from a request
//!
//! Higher values are admitted sooner when a gate has queued waiters.
//! Precedence: explicit priority header, then user tier, then the configured
//! default.

use crate::request::RequestContext;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

fn default_priority_header() -> String {
    "X-Request-Priority".to_string()
}

/// Priority derivation rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityProvider {
    /// Header to read an explicit priority from
    #[serde(default = "default_priority_header")]
    pub header: String,
    /// Priority for requests nothing else classifies
    #[serde(default)]
    pub default_priority: i32,
    /// Per-user priorities, keyed by principal name
    #[serde(default)]
    pub user_tiers: HashMap<String, i32>,
}

impl Default for PriorityProvider {
    fn default() -> Self {
        Self {
            header: default_priority_header(),
            default_priority: 0,
            user_tiers: HashMap::new(),
        }
    }
}

impl PriorityProvider {
    /// Create a provider reading the given header, with default 0
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            ..Default::default()
        }
    }

    /// Set per-user tier priorities
    pub fn with_user_tiers(mut self, tiers: HashMap<String, i32>) -> Self {
        self.user_tiers = tiers;
        self
    }

    /// Derive the admission priority for a request.
    /// An absent or unparseable header falls through to the next rule.
    pub fn priority_of(&self, ctx: &RequestContext) -> i32 {
        if let Some(value) = ctx.header(&self.header) {
            if let Ok(priority) = value.trim().parse::<i32>() {
                return priority;
            }
        }

        if let Some(user) = &ctx.user {
            if let Some(priority) = self.user_tiers.get(user) {
                return *priority;
            }
        }

        self.default_priority
    }
}
