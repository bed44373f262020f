use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use btc_peer::{
    message::Service, Connection, ConnectionState, HandshakeConfig, LoopExit, Message,
    MessageHandler, Role, TcpTransport, Transport, TransportConfig, BTC_PROTO_VERSION,
};
use tokio::net::TcpListener;

#[derive(Default)]
struct PongLog(Mutex<Vec<u64>>);

impl MessageHandler for PongLog {
    fn on_pong(&self, nonce: u64) {
        self.0.lock().unwrap().push(nonce);
    }
}

async fn tcp_pair() -> (TcpTransport, TcpTransport) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (dialed, accepted) = tokio::join!(
        TcpTransport::connect(addr, TransportConfig::default()),
        listener.accept()
    );
    let (stream, _) = accepted.unwrap();
    (
        dialed.unwrap(),
        TcpTransport::from_stream(stream, TransportConfig::default()).unwrap(),
    )
}

#[tokio::test]
async fn two_nodes_handshake_over_tcp() {
    for strict_verack in [false, true] {
        let (dialed, accepted) = tcp_pair().await;
        let mut outbound = Connection::new(dialed, Role::Outbound, HandshakeConfig::default());
        let mut inbound = Connection::new(accepted, Role::Inbound, HandshakeConfig::default());

        let (out_ok, in_ok) = tokio::join!(
            outbound.connect(Service::NODE_NETWORK, 10, Some(true), strict_verack),
            inbound.connect(Service::NODE_NETWORK, 20, None, strict_verack),
        );

        assert!(out_ok && in_ok);
        assert_eq!(outbound.state(), ConnectionState::Established);
        assert_eq!(inbound.state(), ConnectionState::Established);

        let seen_by_inbound = inbound.peer_version().unwrap();
        assert_eq!(seen_by_inbound.start_height, 10);
        assert_eq!(seen_by_inbound.relay, Some(true));
        assert_eq!(seen_by_inbound.version, BTC_PROTO_VERSION);
        assert_eq!(outbound.peer_version().unwrap().relay, None);
        assert_eq!(
            seen_by_inbound.sender.port,
            outbound.transport().local_addr().unwrap().port()
        );

        // Both clocks are ours, the offset can only be rounding.
        assert!(outbound.peer_time_offset().unwrap().abs() <= 1);
        assert!(inbound.peer_time_offset().unwrap().abs() <= 1);

        outbound.close().await;
        let stats = tokio::time::timeout(Duration::from_secs(5), inbound.closed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.exit, LoopExit::Disconnected);
        assert_eq!(inbound.state(), ConnectionState::Closed);
    }
}

#[tokio::test]
async fn established_peers_answer_pings() {
    let (dialed, accepted) = tcp_pair().await;
    let pongs = Arc::new(PongLog::default());
    let mut outbound = Connection::new(dialed, Role::Outbound, HandshakeConfig::default())
        .with_handler(pongs.clone());
    let mut inbound = Connection::new(accepted, Role::Inbound, HandshakeConfig::default());

    tokio::join!(
        outbound.connect(Service::NODE_NETWORK, 0, None, false),
        inbound.connect(Service::NODE_NETWORK, 0, None, false),
    );

    // The inbound side's loop answers, the outbound side's loop records it.
    outbound
        .transport()
        .send(&Message::Ping(0xfeed))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while pongs.0.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(*pongs.0.lock().unwrap(), [0xfeed]);

    inbound.close().await;
    let stats = outbound.closed().await.unwrap();
    // The inbound verack, then the pong.
    assert_eq!(stats.messages, 2);
}

#[tokio::test]
async fn picky_inbound_rejects_the_dialer() {
    let (dialed, accepted) = tcp_pair().await;
    let picky = HandshakeConfig {
        min_peer_version: BTC_PROTO_VERSION + 1,
        ..HandshakeConfig::default()
    };
    let mut outbound = Connection::new(dialed, Role::Outbound, HandshakeConfig::default());
    let mut inbound = Connection::new(accepted, Role::Inbound, picky);

    let (out_ok, in_ok) = tokio::join!(
        outbound.connect(Service::NODE_NETWORK, 0, None, true),
        inbound.connect(Service::NODE_NETWORK, 0, None, true),
    );

    assert!(!in_ok);
    assert_eq!(inbound.state(), ConnectionState::Rejected);
    // The dialer got a reject where it wanted a verack.
    assert!(!out_ok);
    assert_eq!(outbound.state(), ConnectionState::Rejected);
}
