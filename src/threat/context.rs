//! Caller-supplied request metadata.

use std::net::IpAddr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Coarse location of a client, when the caller has it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoInfo {
    pub country: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
}

impl GeoInfo {
    pub fn country(code: impl Into<String>) -> Self {
        Self {
            country: code.into(),
            region: None,
            city: None,
        }
    }
}

/// Everything the protector knows about one inbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestContext {
    pub timestamp: SystemTime,
    pub ip_address: IpAddr,
    pub user_agent: String,
    pub endpoint: String,
    /// Body size in bytes.
    pub request_size: u64,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub geo_info: Option<GeoInfo>,
}

impl RequestContext {
    pub fn new(ip_address: IpAddr) -> Self {
        Self {
            timestamp: SystemTime::now(),
            ip_address,
            user_agent: String::new(),
            endpoint: "/".to_string(),
            request_size: 0,
            user_id: None,
            session_id: None,
            geo_info: None,
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_request_size(mut self, bytes: u64) -> Self {
        self.request_size = bytes;
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_geo(mut self, geo: GeoInfo) -> Self {
        self.geo_info = Some(geo);
        self
    }

    /// `user:<id>` for authenticated requests, `ip:<addr>` otherwise.
    pub fn entity_key(&self) -> String {
        match &self.user_id {
            Some(user) => format!("user:{}", user),
            None => format!("ip:{}", self.ip_address),
        }
    }

    pub fn request_size_mb(&self) -> f64 {
        self.request_size as f64 / (1024.0 * 1024.0)
    }
}
