use std::time::Duration;

use crate::{BTC_PROTO_VERSION, MAIN_NET_PORT, MIN_PEER_PROTO_VERSION, TEST_NET_PORT};

/// The network a connection speaks for, identified on the wire by its magic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
}

impl Network {
    pub fn magic(self) -> [u8; 4] {
        match self {
            Self::Mainnet => [0xf9, 0xbe, 0xb4, 0xd9],
            Self::Testnet => [0x0b, 0x11, 0x09, 0x07],
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Self::Mainnet => MAIN_NET_PORT,
            Self::Testnet => TEST_NET_PORT,
        }
    }
}

/// Knobs of the version/verack exchange.
#[derive(Clone, Debug)]
pub struct HandshakeConfig {
    /// Protocol version we announce.
    pub protocol_version: i32,
    /// Peers announcing less than this get a `reject` with code OBSOLETE.
    pub min_peer_version: i32,
    /// Announced user agent, `None` sends an empty one.
    pub user_agent: Option<String>,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            protocol_version: BTC_PROTO_VERSION,
            min_peer_version: MIN_PEER_PROTO_VERSION,
            user_agent: Some(concat!("/btc_peer:", env!("CARGO_PKG_VERSION"), "/").to_owned()),
        }
    }
}

/// Settings applied once when a transport is set up.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub network: Network,
    /// Upper bound on a single `receive`, `None` waits forever.
    pub read_timeout: Option<Duration>,
    /// Upper bound on a single `send`.
    pub write_timeout: Option<Duration>,
    /// Largest payload accepted from the peer.
    pub max_payload: usize,
}

impl TransportConfig {
    /// 32MiB, the protocol's hard limit.
    pub const MAX_PAYLOAD_WIDTH: usize = 1024 * 1024 * 32;
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            read_timeout: Some(Duration::from_secs(30)),
            write_timeout: Some(Duration::from_secs(30)),
            max_payload: Self::MAX_PAYLOAD_WIDTH,
        }
    }
}
