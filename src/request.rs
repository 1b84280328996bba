//! Request context passed through the controller chain
//!
//! The pipeline hands one `RequestContext` to the chain before any service
//! logic runs, and hands the same context back after the response is written
//! so held capacity can be released. Controllers only read the identity and
//! priority attributes and append response headers/cookies; they never touch
//! the request body.

use http::Method;
use std::collections::HashMap;
use std::net::IpAddr;

/// Request context passed through the controller chain
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Address of the directly connecting peer (the socket remote address,
    /// not a forwarded-for claim)
    pub peer_addr: IpAddr,
    /// HTTP method
    pub method: Method,
    /// Request path
    pub path: String,
    /// Authenticated principal, when the pipeline resolved one
    pub user: Option<String>,
    /// Request headers, keys lowercased
    headers: HashMap<String, String>,
    /// Request cookies
    cookies: HashMap<String, String>,
    /// Headers to write onto the response
    response_headers: Vec<(String, String)>,
    /// Cookies to set on the response
    response_cookies: Vec<(String, String)>,
}

impl RequestContext {
    /// Create a context for a request from the given peer
    pub fn new(peer_addr: IpAddr, method: Method, path: impl Into<String>) -> Self {
        Self {
            peer_addr,
            method,
            path: path.into(),
            user: None,
            headers: HashMap::new(),
            cookies: HashMap::new(),
            response_headers: Vec::new(),
            response_cookies: Vec::new(),
        }
    }

    /// Attach a request header (name is stored lowercased)
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    /// Attach a request cookie
    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    /// Attach the authenticated principal
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Look up a request header by name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Look up a request cookie by name
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// Queue a header to be written onto the response
    pub fn set_response_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.response_headers.push((name.into(), value.into()));
    }

    /// Queue a cookie to be set on the response
    pub fn set_response_cookie(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.response_cookies.push((name.into(), value.into()));
    }

    /// Headers queued for the response, in insertion order
    pub fn response_headers(&self) -> &[(String, String)] {
        &self.response_headers
    }

    /// Cookies queued for the response, in insertion order
    pub fn response_cookies(&self) -> &[(String, String)] {
        &self.response_cookies
    }

    /// Value of a cookie already queued for the response, if any
    pub fn response_cookie(&self, name: &str) -> Option<&str> {
        self.response_cookies
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}
