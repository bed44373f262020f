use btc_peer::message::Service;
use btc_peer::*;
use clap::Parser;
use std::{io, net::SocketAddr, time::Duration};
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(version, about = "Btc peer: handshake and keep-alive", long_about = None)]
struct Cli {
    /// The Bitcoin DNS seed, used for peer discovery.
    #[arg(long, short, default_value_t = DEFAULT_DNS_SEED.to_string())]
    dns_seed: String,

    /// Optionally provide a port other than the network's default.
    #[arg(long, short, value_parser = clap::value_parser!(u16).range(1..))]
    port: Option<u16>,

    /// Outputs the version of the currently supported bitcoin p2p network protocol.
    #[arg(long, short)]
    btc_proto: bool,

    /// Wait for inbound peers on this address instead of dialing the seed.
    #[arg(long, short)]
    listen: Option<SocketAddr>,

    /// Speak testnet magic, default port 18333.
    #[arg(long)]
    testnet: bool,

    /// Only accept a peer once it sent its verack.
    #[arg(long)]
    strict_verack: bool,

    /// Height of our best chain, as announced to the peer.
    #[arg(long, default_value_t = 0)]
    start_height: i32,

    /// Services bitfield announced to the peer, i.e 1 for NODE_NETWORK, 8 for
    /// NODE_WITNESS, 1024 for NODE_NETWORK_LIMITED.
    #[arg(long, default_value_t = Service::NODE_NETWORK)]
    services: u64,

    /// Transaction relay flag. Left off the version message when not given.
    #[arg(long)]
    relay: Option<bool>,

    /// Read and write timeout, in seconds.
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..), default_value_t = 30)]
    timeout_secs: u64,

    /// Oldest peer protocol version to accept.
    #[arg(long, default_value_t = MIN_PEER_PROTO_VERSION)]
    min_version: i32,
}

/// What we announce in our version message.
#[derive(Clone, Copy)]
struct Announce {
    services: u64,
    start_height: i32,
    relay: Option<bool>,
    strict_verack: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if cli.btc_proto {
        println!(
            "This implementation supports the p2p network protocol {}.",
            BTC_PROTO_VERSION
        );
        return;
    }
    tracing_subscriber::fmt::init();

    let network = if cli.testnet {
        Network::Testnet
    } else {
        Network::Mainnet
    };
    let timeout = Duration::from_secs(cli.timeout_secs);
    let transport_config = TransportConfig {
        network,
        read_timeout: Some(timeout),
        write_timeout: Some(timeout),
        ..TransportConfig::default()
    };
    let handshake_config = HandshakeConfig {
        min_peer_version: cli.min_version,
        ..HandshakeConfig::default()
    };
    let announce = Announce {
        services: cli.services,
        start_height: cli.start_height,
        relay: cli.relay,
        strict_verack: cli.strict_verack,
    };

    let run = async {
        match cli.listen {
            Some(addr) => {
                if let Err(e) = listen(addr, transport_config, handshake_config, announce).await {
                    tracing::error!("Listener on {} failed: {}", addr, e);
                }
            }
            None => {
                let port = cli.port.unwrap_or(network.default_port());
                let dns = cli.dns_seed.clone() + ":" + &port.to_string();
                dial(&dns, transport_config, handshake_config, announce).await;
            }
        }
    };

    tokio::select! {
        _ = run => {}
        _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted, shutting down."),
    }
}

/// Connects to the first reachable address behind `dns` and stays with it.
async fn dial(
    dns: &str,
    transport_config: TransportConfig,
    handshake_config: HandshakeConfig,
    announce: Announce,
) {
    tracing::info!("Attempting to resolve DNS: {:?}", dns);

    let addresses: Vec<SocketAddr> = match tokio::net::lookup_host(dns).await {
        Ok(addresses) => addresses.collect(),
        Err(e) => {
            tracing::error!("Unable to resolve the provided dns {}: {}", dns, e);
            return;
        }
    };

    tracing::debug!("addresses {:?}", addresses);

    for addr in addresses {
        match TcpTransport::connect(addr, transport_config.clone()).await {
            Ok(transport) => {
                tracing::info!("Connected to: {:?}", addr);
                let connection = Connection::new(transport, Role::Outbound, handshake_config);
                run_peer(connection, announce).await;
                return;
            }
            Err(e) => tracing::debug!("Could not connect to {}: {}", addr, e),
        }
    }
    tracing::error!("Could not connect to any of the resolved addresses.");
}

/// Accepts peers forever, each one on its own task.
async fn listen(
    addr: SocketAddr,
    transport_config: TransportConfig,
    handshake_config: HandshakeConfig,
    announce: Announce,
) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Listening for peers on {}", listener.local_addr()?);

    loop {
        let (stream, peer) = listener.accept().await?;
        tracing::info!("Inbound connection from {}", peer);

        match TcpTransport::from_stream(stream, transport_config.clone()) {
            Ok(transport) => {
                let connection =
                    Connection::new(transport, Role::Inbound, handshake_config.clone());
                tokio::spawn(run_peer(connection, announce));
            }
            Err(e) => tracing::warn!("Dropping {}: {}", peer, e),
        }
    }
}

/// Handshakes, then keeps answering the peer until it goes away.
async fn run_peer<T: Transport>(mut connection: Connection<T>, announce: Announce) {
    connection
        .connect(
            announce.services,
            announce.start_height,
            announce.relay,
            announce.strict_verack,
        )
        .await;

    if connection.state() != ConnectionState::Established {
        return;
    }
    if let Some(peer) = connection.peer_version() {
        tracing::info!(
            version = peer.version,
            user_agent = %peer.user_agent,
            start_height = peer.start_height,
            offset = ?connection.peer_time_offset(),
            "peer accepted"
        );
    }

    if let Some(stats) = connection.closed().await {
        tracing::info!(
            messages = stats.messages,
            pings = stats.pings_answered,
            decode_errors = stats.decode_errors,
            "connection closed ({:?})",
            stats.exit
        );
    }
}
