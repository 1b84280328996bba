//! Configuration types for flowgate
//!
//! Uses HCL (HashiCorp Configuration Language) as the configuration format.
//! Each `controllers` block declares one flow controller with a `type`
//! discriminator and type-specific parameters; the chain is bound once at
//! startup from this model and is immutable afterwards.

use crate::control::AnonymousPolicy;
use crate::error::{FlowError, Result};
use crate::key::TrustedProxies;
use http::Method;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

fn default_timeout_ms() -> u64 {
    30_000
}

/// Top-level flow-control configuration
///
/// # HCL Example
///
/// ```hcl
/// timeout_ms = 30000
///
/// controllers "ogc" {
///   type     = "global"
///   capacity = 100
/// }
///
/// controllers "per-client" {
///   type     = "ip"
///   capacity = 6
/// }
///
/// controllers "api-rate" {
///   type             = "rate"
///   capacity         = 60
///   refill_period_ms = 60000
///   max_wait_ms      = 2000
///   key              = "cookie"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Total admission budget per request, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Controllers: named admission policies
    #[serde(default)]
    pub controllers: HashMap<String, ControllerConfig>,
}

/// One controller declaration
///
/// Each controller has a type and type-specific parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Controller type identifier: global, priority, ip, user, rate
    #[serde(rename = "type")]
    pub controller_type: String,

    /// Concurrency cap (global/priority/ip/user) or token capacity (rate)
    #[serde(default)]
    pub capacity: Option<u64>,

    /// Header carrying an explicit numeric priority (priority type)
    #[serde(default)]
    pub priority_header: Option<String>,

    /// Priority for unclassified requests (priority type)
    #[serde(default)]
    pub default_priority: Option<i32>,

    /// Per-user priorities (priority type)
    #[serde(default)]
    pub user_tiers: HashMap<String, i32>,

    /// Policy for unauthenticated requests (user type)
    #[serde(default)]
    pub anonymous: Option<AnonymousPolicy>,

    /// Proxies whose forwarded-for headers may be believed (ip/rate types)
    #[serde(default)]
    pub trusted_proxies: Vec<String>,

    /// Time to refill the full token capacity, in milliseconds; absent or 0
    /// disables refill (rate type)
    #[serde(default)]
    pub refill_period_ms: Option<u64>,

    /// Longest an empty window may wait for its refill (rate type)
    #[serde(default)]
    pub max_wait_ms: Option<u64>,

    /// Client identity for rate windows: "ip" (default) or "cookie"
    #[serde(default)]
    pub key: Option<String>,

    /// Cookie name for cookie identity (rate type)
    #[serde(default)]
    pub cookie_name: Option<String>,

    /// Methods the controller applies to; empty matches all (rate type)
    #[serde(default)]
    pub methods: Vec<String>,

    /// Path prefixes the controller applies to; empty matches all (rate type)
    #[serde(default)]
    pub path_prefixes: Vec<String>,
}

impl FlowConfig {
    /// Load configuration from an HCL file
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_hcl(&content)
    }

    /// Parse configuration from an HCL string
    pub fn from_hcl(content: &str) -> Result<Self> {
        hcl::from_str(content).map_err(|e| FlowError::Config(format!("HCL parse error: {}", e)))
    }

    /// Total admission budget as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Validate the configuration, failing fast on anything that would
    /// misbehave at runtime
    pub fn validate(&self) -> Result<()> {
        for (name, controller) in &self.controllers {
            controller
                .validate()
                .map_err(|e| FlowError::Config(format!("controller '{}': {}", name, e)))?;
        }
        Ok(())
    }
}

impl ControllerConfig {
    fn validate(&self) -> std::result::Result<(), String> {
        match self.controller_type.as_str() {
            "global" | "priority" | "ip" | "user" => {
                let capacity = self.capacity.ok_or("requires 'capacity'")?;
                if capacity == 0 {
                    tracing::warn!(
                        controller_type = self.controller_type,
                        "capacity 0 configured — every request will be denied"
                    );
                }
            }
            "rate" => {
                let capacity = self.capacity.ok_or("requires 'capacity'")?;
                if capacity == 0 {
                    return Err("rate capacity must be at least 1".to_string());
                }
                match self.key.as_deref() {
                    None | Some("ip") | Some("cookie") => {}
                    Some(other) => return Err(format!("unknown key type: '{}'", other)),
                }
                for method in &self.methods {
                    method
                        .parse::<Method>()
                        .map_err(|_| format!("invalid method: '{}'", method))?;
                }
            }
            other => return Err(format!("unknown controller type: '{}'", other)),
        }

        TrustedProxies::new(&self.trusted_proxies).map_err(|e| e.to_string())?;
        Ok(())
    }
}
