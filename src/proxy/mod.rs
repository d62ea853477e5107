pub mod acceptor;
pub mod client;
pub mod handshake;
pub mod registry;
pub mod server;
pub mod session;
pub mod startup;

pub use client::{connect_with_digest, ClientError};
pub use handshake::{negotiate, HandshakeError};
pub use registry::ConnectionRegistry;
pub use server::{ProxyError, Socks5TestProxy, DEFAULT_STARTUP_TIMEOUT};
pub use session::SessionStream;
