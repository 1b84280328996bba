//! Client identity — keys that partition per-client counters
//!
//! Per-client controllers group requests by a stable key. The default identity
//! is the directly connecting peer address: forwarded-for chains are easy to
//! forge, so they are only consulted when the direct peer is an explicitly
//! trusted proxy. Cookie identity is used by rate controllers that need to
//! follow a client across changing addresses.

use crate::error::{FlowError, Result};
use crate::request::RequestContext;
use ipnet::IpNet;
use std::net::IpAddr;

/// Set of proxy addresses whose forwarded-for headers may be believed.
/// Supports CIDR ranges and single IPs, IPv4 and IPv6.
#[derive(Debug, Default)]
pub struct TrustedProxies {
    networks: Vec<IpNet>,
    single_ips: Vec<IpAddr>,
}

impl TrustedProxies {
    /// Parse a list of IP/CIDR entries. Invalid entries fail construction.
    pub fn new(entries: &[String]) -> Result<Self> {
        let mut networks = Vec::new();
        let mut single_ips = Vec::new();

        for entry in entries {
            let trimmed = entry.trim();
            if trimmed.contains('/') {
                let net: IpNet = trimmed
                    .parse()
                    .map_err(|e| FlowError::Config(format!("Invalid CIDR '{}': {}", trimmed, e)))?;
                networks.push(net);
            } else {
                let ip: IpAddr = trimmed.parse().map_err(|e| {
                    FlowError::Config(format!("Invalid IP address '{}': {}", trimmed, e))
                })?;
                single_ips.push(ip);
            }
        }

        Ok(Self {
            networks,
            single_ips,
        })
    }

    /// Check whether an address belongs to the trusted set
    pub fn contains(&self, ip: &IpAddr) -> bool {
        if self.single_ips.contains(ip) {
            return true;
        }
        self.networks.iter().any(|net| net.contains(ip))
    }

    /// Whether this set has any entries
    pub fn is_empty(&self) -> bool {
        self.networks.is_empty() && self.single_ips.is_empty()
    }
}

/// Resolves the client address a request is grouped under.
///
/// With no trusted proxies configured this is always the socket peer address —
/// two requests proxied through different intermediaries stay distinct clients
/// even when their `X-Forwarded-For` claims the same origin.
#[derive(Debug, Default)]
pub struct IpResolver {
    trusted: TrustedProxies,
}

impl IpResolver {
    /// Resolver that always uses the direct peer address
    pub fn direct() -> Self {
        Self::default()
    }

    /// Resolver that unwraps `X-Forwarded-For` hops added by trusted proxies
    pub fn with_trusted_proxies(entries: &[String]) -> Result<Self> {
        Ok(Self {
            trusted: TrustedProxies::new(entries)?,
        })
    }

    /// Client address for grouping purposes.
    ///
    /// Walks the forwarded chain right to left, skipping trusted hops; the
    /// first untrusted address is the client. Malformed entries stop the walk
    /// and fall back to the last good address.
    pub fn client_ip(&self, ctx: &RequestContext) -> IpAddr {
        if self.trusted.is_empty() || !self.trusted.contains(&ctx.peer_addr) {
            return ctx.peer_addr;
        }

        let Some(forwarded) = ctx.header("x-forwarded-for") else {
            return ctx.peer_addr;
        };

        let mut client = ctx.peer_addr;
        for hop in forwarded.rsplit(',') {
            match hop.trim().parse::<IpAddr>() {
                Ok(ip) if self.trusted.contains(&ip) => client = ip,
                Ok(ip) => return ip,
                Err(_) => break,
            }
        }
        client
    }
}

/// Default cookie used to identify clients for cookie-keyed rate limiting
pub const DEFAULT_COOKIE_NAME: &str = "flow-client-id";

/// Derives the client key a counter or rate window is filed under
pub enum KeyGenerator {
    /// Key by resolved client address
    Ip(IpResolver),
    /// Key by a client cookie, minting one on first contact
    Cookie {
        /// Cookie name to read and set
        name: String,
    },
}

impl KeyGenerator {
    /// IP keying with direct-peer identity
    pub fn ip() -> Self {
        Self::Ip(IpResolver::direct())
    }

    /// Cookie keying with the given cookie name
    pub fn cookie(name: impl Into<String>) -> Self {
        Self::Cookie { name: name.into() }
    }

    /// Derive the key for a request.
    ///
    /// For cookie keying on first contact, a fresh UUID-strength value is
    /// generated and queued as a response cookie; repeat derivations within
    /// the same request return the same value.
    pub fn key(&self, ctx: &mut RequestContext) -> String {
        match self {
            Self::Ip(resolver) => resolver.client_ip(ctx).to_string(),
            Self::Cookie { name } => {
                if let Some(value) = ctx.cookie(name) {
                    return value.to_string();
                }
                if let Some(value) = ctx.response_cookie(name) {
                    return value.to_string();
                }
                let value = format!("{:032x}", uuid::Uuid::new_v4().as_u128());
                ctx.set_response_cookie(name.clone(), value.clone());
                value
            }
        }
    }

    /// Short description for logs and rate-limit context headers
    pub fn describe(&self) -> String {
        match self {
            Self::Ip(_) => "ip".to_string(),
            Self::Cookie { name } => format!("cookie:{}", name),
        }
    }
}
