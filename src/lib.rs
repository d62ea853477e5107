//! A minimal SOCKS5 server for tests.
//!
//! Clients negotiate "no authentication" and send a connect request whose
//! domain-name field carries an opaque digest. Instead of relaying, the proxy
//! keeps each negotiated socket and hands it to the test by digest, so both
//! ends of the "proxied" connection can be driven directly.

pub mod common;
pub mod net;
pub mod proxy;

pub use common::config::{ConfigError, ProxyConfig};
pub use proxy::{
    connect_with_digest, ClientError, ConnectionRegistry, HandshakeError, ProxyError,
    SessionStream, Socks5TestProxy,
};
