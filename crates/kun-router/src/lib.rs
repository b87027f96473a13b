//! Routing for kun
//!
//! The upstream registry (domain -> tunnel session), plus the helpers the
//! frontend uses to find the routing key of an inbound connection: the HTTP
//! Host header or the TLS SNI server name.

pub mod domain;
pub mod http;
pub mod registry;
pub mod sni;

pub use domain::{normalize_domain, validate_domain, DomainError};
pub use http::{extract_host, find_head_end, normalize_host, HttpRouteError};
pub use registry::{RegistryEvent, UpsertOutcome, UpstreamRegistry, DEFAULT_EVENT_CAPACITY};
pub use sni::{extract_sni, record_len, SniError};
