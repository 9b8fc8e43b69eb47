//! Request metadata extraction.
//!
//! # Responsibilities
//! - Resolve the client address (socket peer, optionally `X-Forwarded-For`)
//! - Build a `RequestContext` from headers the threat detector cares about
//!
//! # Design Decisions
//! - Missing or malformed headers degrade to defaults, never to errors
//! - Body size comes from `Content-Length`; bodies are not buffered

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::{header, HeaderMap, Request};

use crate::threat::{GeoInfo, RequestContext};

pub const X_USER_ID: &str = "x-user-id";
pub const X_SESSION_ID: &str = "x-session-id";
pub const X_GEO_COUNTRY: &str = "x-geo-country";
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Client address for `request`. Falls back to `0.0.0.0` when the server
/// was not started with connect info (e.g. in-process tests).
pub fn client_ip<B>(request: &Request<B>, trust_forwarded_for: bool) -> IpAddr {
    if trust_forwarded_for {
        let forwarded = header_str(request.headers(), X_FORWARDED_FOR)
            .and_then(|v| v.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip;
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

pub fn request_context<B>(request: &Request<B>, trust_forwarded_for: bool) -> RequestContext {
    let headers = request.headers();
    let mut ctx = RequestContext::new(client_ip(request, trust_forwarded_for))
        .with_endpoint(request.uri().path())
        .with_user_agent(header_str(headers, header::USER_AGENT.as_str()).unwrap_or_default())
        .with_request_size(
            header_str(headers, header::CONTENT_LENGTH.as_str())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0),
        );

    if let Some(user) = non_empty(headers, X_USER_ID) {
        ctx = ctx.with_user(user);
    }
    if let Some(session) = non_empty(headers, X_SESSION_ID) {
        ctx = ctx.with_session(session);
    }
    if let Some(country) = non_empty(headers, X_GEO_COUNTRY) {
        ctx = ctx.with_geo(GeoInfo::country(country.to_ascii_uppercase()));
    }
    ctx
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn non_empty<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    header_str(headers, name).map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn extracts_identity_headers() {
        let mut request = Request::builder()
            .uri("/search?q=rust")
            .header("user-agent", "curl/8.0")
            .header("content-length", "512")
            .header(X_USER_ID, "alice")
            .header(X_SESSION_ID, "s-1")
            .header(X_GEO_COUNTRY, "de")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo("203.0.113.7:5555".parse::<SocketAddr>().unwrap()));

        let ctx = request_context(&request, false);
        assert_eq!(ctx.ip_address, "203.0.113.7".parse::<IpAddr>().unwrap());
        assert_eq!(ctx.endpoint, "/search");
        assert_eq!(ctx.user_agent, "curl/8.0");
        assert_eq!(ctx.request_size, 512);
        assert_eq!(ctx.user_id.as_deref(), Some("alice"));
        assert_eq!(ctx.session_id.as_deref(), Some("s-1"));
        assert_eq!(ctx.geo_info.unwrap().country, "DE");
    }

    #[test]
    fn forwarded_for_only_when_trusted() {
        let request = Request::builder()
            .uri("/")
            .header(X_FORWARDED_FOR, "198.51.100.2, 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_ip(&request, true), "198.51.100.2".parse::<IpAddr>().unwrap());
        assert_eq!(client_ip(&request, false), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }
}
