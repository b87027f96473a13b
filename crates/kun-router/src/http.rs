//! Host header extraction for plain HTTP routing

use crate::domain::normalize_domain;
use thiserror::Error;
use tracing::trace;

/// HTTP routing errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HttpRouteError {
    #[error("Host header not found")]
    HostHeaderNotFound,

    #[error("Invalid host header: {0}")]
    InvalidHost(String),

    #[error("Malformed request head")]
    MalformedRequest,
}

/// Offset just past the blank line ending the request head, if complete
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// Extract the routing host from a raw HTTP/1.x request head
pub fn extract_host(head: &[u8]) -> Result<String, HttpRouteError> {
    let text = std::str::from_utf8(head).map_err(|_| HttpRouteError::MalformedRequest)?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().ok_or(HttpRouteError::MalformedRequest)?;
    if request_line.split_whitespace().count() < 3 {
        return Err(HttpRouteError::MalformedRequest);
    }

    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("host") {
            let host = normalize_host(value.trim());
            if host.is_empty() {
                return Err(HttpRouteError::InvalidHost(value.trim().to_string()));
            }
            trace!("Extracted host {}", host);
            return Ok(host);
        }
    }

    Err(HttpRouteError::HostHeaderNotFound)
}

/// Normalize a Host header value: drop the port, lowercase, drop a trailing dot
pub fn normalize_host(host: &str) -> String {
    let without_port = if let Some(rest) = host.strip_prefix('[') {
        // IPv6 literal, e.g. "[::1]:8080"
        rest.split(']').next().unwrap_or(rest)
    } else {
        // Remove port if present (e.g., "example.com:8080" -> "example.com")
        host.split(':').next().unwrap_or(host)
    };
    normalize_domain(without_port)
}
