//! feed-sync/crates/api-adapters/src/lib.rs
//!
//! Outbound adapters: the reqwest-backed `RemoteTransport` and the session
//! credentials it reads the auth token from.

pub mod credentials;
pub mod http;

pub use credentials::StaticCredentials;
pub use http::{HttpTransport, HttpTransportConfig, TransportError, DEFAULT_AUTH_HEADER};
