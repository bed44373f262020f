//! The byte-stream side of a peer connection.
//!
//! A [`Transport`] turns a connected stream into whole [`Message`]s. Frames are
//! buffered per connection, so a `receive` that times out or gets cancelled
//! keeps whatever part of the next frame already arrived.

use std::{future::Future, io, net::SocketAddr, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{watch, Mutex},
    time::timeout,
};

use crate::{
    config::TransportConfig,
    error::{MessageError, TransportError},
    message::{serialize_message, Header, Message},
};

/// A connected, message-oriented channel to one peer.
///
/// Implementations synchronise internally: every method takes `&self` and may
/// be called from the handshake and the dispatch loop alike.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Serializes and writes a message, returns once it is flushed.
    async fn send(&self, message: &Message) -> Result<(), TransportError>;

    /// Waits for the next whole message.
    async fn receive(&self) -> Result<Message, TransportError>;

    fn is_connected(&self) -> bool;

    /// Closes the channel. Calling it again is a no-op.
    async fn close(&self);

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Transport over any pair of tokio read/write halves.
pub struct StreamTransport<R, W> {
    reader: Mutex<FrameReader<R>>,
    writer: Mutex<W>,
    connected: watch::Sender<bool>,
    config: TransportConfig,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
}

pub type TcpTransport = StreamTransport<OwnedReadHalf, OwnedWriteHalf>;

impl TcpTransport {
    /// Dials `addr`, bounded by the configured write timeout.
    pub async fn connect(addr: SocketAddr, config: TransportConfig) -> Result<Self, TransportError> {
        let stream = with_timeout(config.write_timeout, async {
            Ok::<_, TransportError>(TcpStream::connect(addr).await?)
        })
        .await?;
        Ok(Self::from_stream(stream, config)?)
    }

    /// Wraps an already established stream, i.e one returned by `accept`.
    pub fn from_stream(stream: TcpStream, config: TransportConfig) -> io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        stream.set_nodelay(true)?;

        let (reader, writer) = stream.into_split();
        let mut transport = Self::new(reader, writer, config);
        transport.peer_addr = Some(peer_addr);
        transport.local_addr = Some(local_addr);
        Ok(transport)
    }
}

impl<R, W> StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W, config: TransportConfig) -> Self {
        let (connected, _) = watch::channel(true);
        Self {
            reader: Mutex::new(FrameReader {
                inner: reader,
                buf: Vec::new(),
            }),
            writer: Mutex::new(writer),
            connected,
            config,
            peer_addr: None,
            local_addr: None,
        }
    }

    fn mark_closed(&self) {
        self.connected.send_replace(false);
    }
}

#[async_trait]
impl<R, W> Transport for StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, message: &Message) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        let bytes =
            serialize_message(self.config.network, message).map_err(TransportError::Encode)?;

        let result = with_timeout(self.config.write_timeout, async {
            let mut writer = self.writer.lock().await;
            writer.write_all(&bytes).await?;
            writer.flush().await?;
            Ok::<_, TransportError>(())
        })
        .await;

        // A write cut short leaves the peer mid-frame, the stream is unusable.
        if matches!(
            result,
            Err(TransportError::Io(_) | TransportError::Timeout(_))
        ) {
            self.mark_closed();
        }
        if result.is_ok() {
            tracing::trace!("sent `{}`", message.command());
        }
        result
    }

    async fn receive(&self) -> Result<Message, TransportError> {
        let mut connected = self.connected.subscribe();
        if !*connected.borrow_and_update() {
            return Err(TransportError::Disconnected);
        }

        let read = with_timeout(self.config.read_timeout, async {
            let mut reader = self.reader.lock().await;
            reader.next_message(&self.config).await
        });

        let result = tokio::select! {
            result = read => result,
            _ = connected.wait_for(|connected| !*connected) => Err(TransportError::Disconnected),
        };

        match &result {
            Ok(message) => tracing::debug!("command received: {:?}", message.command()),
            Err(TransportError::Io(_) | TransportError::Disconnected) => self.mark_closed(),
            Err(_) => {}
        }
        result
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    async fn close(&self) {
        // Only the caller that flips the flag tears the stream down.
        if self.connected.send_replace(false) {
            let mut writer = self.writer.lock().await;
            if let Err(err) = writer.shutdown().await {
                tracing::debug!("error while shutting down stream: {}", err);
            }
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

struct FrameReader<R> {
    inner: R,
    /// Bytes read from the stream but not yet consumed as a frame.
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    async fn next_message(&mut self, config: &TransportConfig) -> Result<Message, TransportError> {
        loop {
            if let Some(message) = self.parse_frame(config)? {
                return Ok(message);
            }
            // `read_buf` is cancel safe: bytes land in `buf` or not at all.
            if self.inner.read_buf(&mut self.buf).await? == 0 {
                return Err(TransportError::Disconnected);
            }
        }
    }

    /// Pops one frame off the buffer, `None` until a whole frame is there.
    /// A bad frame is dropped so the next call starts on fresh bytes.
    fn parse_frame(&mut self, config: &TransportConfig) -> Result<Option<Message>, MessageError> {
        if self.buf.len() < Header::HEADER_WIDTH {
            return Ok(None);
        }

        let magic = config.network.magic();
        if self.buf[..4] != magic {
            let mut found = [0u8; 4];
            found.copy_from_slice(&self.buf[..4]);
            let resync_at = self
                .buf
                .windows(4)
                .skip(1)
                .position(|window| window == magic)
                .map(|pos| pos + 1)
                .unwrap_or(self.buf.len() - 3);
            self.buf.drain(..resync_at);
            return Err(MessageError::BadMagic(found));
        }

        let header = match Header::from_bytes(&self.buf[..Header::HEADER_WIDTH]) {
            Ok(header) => header,
            Err(err) => {
                self.buf.drain(..Header::HEADER_WIDTH);
                return Err(err);
            }
        };

        let size = header.payload_size() as usize;
        if size > config.max_payload {
            self.buf.drain(..Header::HEADER_WIDTH);
            return Err(MessageError::PayloadOverSizeLimit {
                size,
                max: config.max_payload,
            });
        }

        let total = Header::HEADER_WIDTH + size;
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }

        let frame: Vec<u8> = self.buf.drain(..total).collect();
        Message::decode(&header, &frame[Header::HEADER_WIDTH..]).map(Some)
    }
}

async fn with_timeout<T, F>(limit: Option<Duration>, fut: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    match limit {
        Some(limit) => timeout(limit, fut)
            .await
            .map_err(|_| TransportError::Timeout(limit))?,
        None => fut.await,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{config::Network, message::RejectCode, message::RejectMessage};
    use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};

    pub(crate) type DuplexTransport =
        StreamTransport<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    pub(crate) fn transport_over(stream: DuplexStream, config: TransportConfig) -> DuplexTransport {
        let (reader, writer) = split(stream);
        StreamTransport::new(reader, writer, config)
    }

    /// Two transports wired to each other.
    pub(crate) fn pair(config: TransportConfig) -> (DuplexTransport, DuplexTransport) {
        let (a, b) = duplex(64 * 1024);
        (transport_over(a, config.clone()), transport_over(b, config))
    }

    fn frame(message: &Message) -> Vec<u8> {
        serialize_message(Network::Mainnet, message).unwrap()
    }

    #[tokio::test]
    async fn delivers_messages_in_order() {
        let (a, b) = pair(TransportConfig::default());
        a.send(&Message::Verack).await.unwrap();
        a.send(&Message::Ping(9)).await.unwrap();

        assert_eq!(b.receive().await.unwrap(), Message::Verack);
        assert_eq!(b.receive().await.unwrap(), Message::Ping(9));
    }

    #[tokio::test]
    async fn reassembles_frames_split_across_writes() {
        let (raw, stream) = duplex(1024);
        let transport = transport_over(stream, TransportConfig::default());
        let (_, mut raw_writer) = split(raw);

        let bytes = frame(&Message::Pong(77));
        let writer = tokio::spawn(async move {
            raw_writer.write_all(&bytes[..10]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            raw_writer.write_all(&bytes[10..]).await.unwrap();
            raw_writer
        });

        assert_eq!(transport.receive().await.unwrap(), Message::Pong(77));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn timed_out_receive_keeps_partial_frame() {
        let config = TransportConfig {
            read_timeout: Some(Duration::from_millis(50)),
            ..TransportConfig::default()
        };
        let (raw, stream) = duplex(1024);
        let transport = transport_over(stream, config);
        let (_, mut raw_writer) = split(raw);

        let bytes = frame(&Message::Ping(5));
        raw_writer.write_all(&bytes[..30]).await.unwrap();
        assert!(matches!(
            transport.receive().await,
            Err(TransportError::Timeout(_))
        ));
        assert!(transport.is_connected());

        raw_writer.write_all(&bytes[30..]).await.unwrap();
        assert_eq!(transport.receive().await.unwrap(), Message::Ping(5));
    }

    #[tokio::test]
    async fn bad_checksum_drops_only_that_frame() {
        let (raw, stream) = duplex(1024);
        let transport = transport_over(stream, TransportConfig::default());
        let (_, mut raw_writer) = split(raw);

        let mut corrupted = frame(&Message::Ping(1));
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0x01;
        raw_writer.write_all(&corrupted).await.unwrap();
        raw_writer.write_all(&frame(&Message::Ping(2))).await.unwrap();

        assert!(matches!(
            transport.receive().await,
            Err(TransportError::Decode(MessageError::ChecksumMismatch { .. }))
        ));
        assert!(transport.is_connected());
        assert_eq!(transport.receive().await.unwrap(), Message::Ping(2));
    }

    #[tokio::test]
    async fn garbage_before_a_frame_is_skipped() {
        let (raw, stream) = duplex(1024);
        let transport = transport_over(stream, TransportConfig::default());
        let (_, mut raw_writer) = split(raw);

        let mut bytes = vec![0xaa; 7];
        bytes.extend(frame(&Message::Reject(RejectMessage::new(
            "tx",
            RejectCode::Dust,
            "dust",
        ))));
        raw_writer.write_all(&bytes).await.unwrap();

        assert!(matches!(
            transport.receive().await,
            Err(TransportError::Decode(MessageError::BadMagic(_)))
        ));
        assert!(matches!(
            transport.receive().await.unwrap(),
            Message::Reject(RejectMessage {
                code: RejectCode::Dust,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn oversized_payload_is_a_decode_error() {
        let config = TransportConfig {
            max_payload: 4,
            ..TransportConfig::default()
        };
        let (a, b) = pair(config);
        a.send(&Message::Ping(3)).await.unwrap();

        assert!(matches!(
            b.receive().await,
            Err(TransportError::Decode(MessageError::PayloadOverSizeLimit { size: 8, max: 4 }))
        ));
        assert!(b.is_connected());
    }

    #[tokio::test]
    async fn peer_hangup_marks_disconnected() {
        let (a, b) = pair(TransportConfig::default());
        a.close().await;

        assert!(matches!(b.receive().await, Err(TransportError::Disconnected)));
        assert!(!b.is_connected());
        assert!(matches!(
            b.send(&Message::Verack).await,
            Err(TransportError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (a, _b) = pair(TransportConfig::default());
        a.close().await;
        a.close().await;
        assert!(!a.is_connected());
    }

    #[tokio::test]
    async fn close_wakes_a_blocked_receive() {
        let (a, _b) = pair(TransportConfig {
            read_timeout: None,
            ..TransportConfig::default()
        });
        let a = std::sync::Arc::new(a);

        let receiver = tokio::spawn({
            let a = a.clone();
            async move { a.receive().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        a.close().await;

        let result = timeout(Duration::from_secs(1), receiver)
            .await
            .expect("receive should return once closed")
            .unwrap();
        assert!(matches!(result, Err(TransportError::Disconnected)));
    }

    #[tokio::test]
    async fn unencodable_message_is_an_encode_error() {
        let (a, b) = pair(TransportConfig::default());
        let oversized = Message::Unknown {
            command: "sendcmpctblocks".to_owned(),
            payload: Vec::new(),
        };

        assert!(matches!(
            a.send(&oversized).await,
            Err(TransportError::Encode(MessageError::InvalidCommandName(_)))
        ));
        assert!(a.is_connected());

        a.send(&Message::Ping(3)).await.unwrap();
        assert_eq!(b.receive().await.unwrap(), Message::Ping(3));
    }

    #[tokio::test]
    async fn tcp_transport_reports_addresses() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (dialed, accepted) = tokio::join!(
            TcpTransport::connect(addr, TransportConfig::default()),
            listener.accept()
        );
        let dialed = dialed.unwrap();
        let (stream, _) = accepted.unwrap();
        let accepted = TcpTransport::from_stream(stream, TransportConfig::default()).unwrap();

        assert_eq!(dialed.peer_addr(), Some(addr));
        assert_eq!(accepted.peer_addr(), dialed.local_addr());

        dialed.send(&Message::Ping(11)).await.unwrap();
        assert_eq!(accepted.receive().await.unwrap(), Message::Ping(11));
    }
}
