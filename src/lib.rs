//! Minecraft Host Proxy
//!
//! A reverse proxy that reads the handshake packet of each Minecraft client, picks a backend
//! server by the hostname the client connected with, and relays the rest of the connection
//! untouched. Routes can be reloaded while connections are live, and shutdown drains active
//! sessions before exiting.

pub mod codec;
pub mod config;
pub mod drain;
pub mod frame;
pub mod handshake;
pub mod proxy;
pub mod relay;
pub mod routes;
pub mod stream;

// Re-export commonly used types and functions
pub use config::{DEFAULT_CONFIG_PATH, ProxyConfig, ServerConfig, load_config, parse_config};
pub use drain::{DrainCoordinator, SessionGuard};
pub use frame::{DEFAULT_MAX_FRAME_SIZE, Frame, FrameError, FrameReader};
pub use handshake::{HandshakeError, HandshakeMessage, NextState};
pub use proxy::{ConnectionError, ProxyServer};
pub use relay::{BUFFER_SIZE, RelaySession, RelayStats};
pub use routes::{Route, RouteTable, SharedRouteTable};
pub use stream::DuplexStream;
