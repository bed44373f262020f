// NOTE: Based on https://developer.bitcoin.org/devguide/p2p_network.html

//! Bitcoin p2p peer connection: version/verack handshake for BTC_PROTO_VERSION
//! followed by a message dispatch loop that keeps the peer alive.

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod handshake;
pub mod message;
pub mod transport;

use std::time::Duration;

pub use config::{HandshakeConfig, Network, TransportConfig};
pub use connection::Connection;
pub use dispatch::{LogHandler, LoopExit, LoopHandle, LoopStats, MessageHandler, MessageLoop};
pub use error::{HandshakeError, MessageError, TransportError, ValidationFailure};
pub use handshake::{ConnectionState, Role};
pub use message::{Message, RejectCode, RejectMessage, VersionMessage};
pub use transport::{StreamTransport, TcpTransport, Transport};

/// Testnet default port
pub const TEST_NET_PORT: u16 = 18333;
/// Mainnet default port
pub const MAIN_NET_PORT: u16 = 8333;
/// Default dns seed for testing, from bitcoin core client
pub const DEFAULT_DNS_SEED: &str = "seed.bitcoin.sipa.be";
/// Version of the p2p protocol supported by this implementation
pub const BTC_PROTO_VERSION: i32 = 70015;
/// Oldest peer protocol version we accept (BIP37 relay flag support).
pub const MIN_PEER_PROTO_VERSION: i32 = 70001;
/// How far a peer's clock may drift from ours before it gets rejected.
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(70 * 60);
