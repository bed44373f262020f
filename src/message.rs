use crate::{config::Network, error::MessageError};
use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use sha2::{Digest, Sha256};
use std::{
    io::{self, Cursor, Read, Write},
    net::{IpAddr, SocketAddr},
    time::SystemTime,
};

/// A message's header. Present in all messages.
#[derive(Debug, PartialEq)]
pub struct Header {
    /// Identifies the originating network.
    magic: [u8; 4],
    /// ASCII strings that identifies the message's type. Padded with 0s.
    command_name: [u8; 12],
    /// Width of the payload, max of 32MiB.
    payload_size: u32,
    /// First 4 bytes of SHA256(SHA256(payload)).
    checksum: [u8; 4],
}

impl Header {
    /// Total size of the header
    pub const HEADER_WIDTH: usize = 24;
    const CHECKSUM_WIDTH: usize = 4;
    const MAGIC_WIDTH: usize = 4;
    const COMMAND_NAME_WIDTH: usize = 12;

    // (SHA256(SHA256(""))), avoid computing it when payloads are empty.
    const EMPTY_CHECKSUM: [u8; Self::CHECKSUM_WIDTH] = [0x5d, 0xf6, 0xe0, 0xe2];

    pub fn magic(&self) -> [u8; 4] {
        self.magic
    }

    pub fn payload_size(&self) -> u32 {
        self.payload_size
    }

    /// The command name with its NUL padding stripped.
    pub fn command(&self) -> String {
        let end = self
            .command_name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(Self::COMMAND_NAME_WIDTH);
        String::from_utf8_lossy(&self.command_name[..end]).into_owned()
    }

    /// Generates the Header associated to a Command.
    // NOTE: The header is agnostic to the command/message itself.
    fn new(network: Network, command: &str, payload: &[u8]) -> Result<Self, MessageError> {
        let command_name = Self::command_name_from_str(command)?;

        let payload_size = u32::try_from(payload.len()).map_err(|_| {
            MessageError::PayloadOverSizeLimit {
                size: payload.len(),
                max: u32::MAX as usize,
            }
        })?;

        let checksum = if payload.is_empty() {
            Self::EMPTY_CHECKSUM
        } else {
            Self::checksum_from_payload(payload)
        };

        Ok(Self {
            magic: network.magic(),
            command_name,
            payload_size,
            checksum,
        })
    }

    /// Generates bytes from a header
    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        let mut serialized_header = Vec::with_capacity(Self::HEADER_WIDTH);

        serialized_header
            .write_all(&self.magic)
            .map_err(MessageError::Serialization)?;

        serialized_header
            .write_all(&self.command_name)
            .map_err(MessageError::Serialization)?;

        serialized_header
            .write_u32::<LittleEndian>(self.payload_size)
            .map_err(MessageError::Serialization)?;

        serialized_header
            .write_all(&self.checksum)
            .map_err(MessageError::Serialization)?;

        Ok(serialized_header)
    }

    /// Generates a Header from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
        if bytes.len() != Header::HEADER_WIDTH {
            let err = format!(
                "Can't generate header from byte slice of len {}, expected {}.",
                bytes.len(),
                Header::HEADER_WIDTH
            );
            return Err(MessageError::HeaderFailedParsing(err));
        }

        let mut current_byte: usize = 0;

        let mut magic = [0u8; Self::MAGIC_WIDTH];
        magic.copy_from_slice(&bytes[current_byte..current_byte + Self::MAGIC_WIDTH]);
        current_byte += Self::MAGIC_WIDTH;

        let mut command_name = [0u8; Self::COMMAND_NAME_WIDTH];
        command_name
            .copy_from_slice(&bytes[current_byte..current_byte + Self::COMMAND_NAME_WIDTH]);
        current_byte += Self::COMMAND_NAME_WIDTH;

        if !command_name.is_ascii() {
            return Err(MessageError::HeaderFailedParsing(
                "command name is not ASCII.".to_owned(),
            ));
        }

        let payload_size: u32 =
            LittleEndian::read_u32(&bytes[current_byte..current_byte + std::mem::size_of::<u32>()]);
        current_byte += std::mem::size_of::<u32>();

        let mut checksum = [0u8; Self::CHECKSUM_WIDTH];
        checksum.copy_from_slice(&bytes[current_byte..current_byte + Self::CHECKSUM_WIDTH]);

        Ok(Self {
            magic,
            command_name,
            payload_size,
            checksum,
        })
    }

    /// Checks the payload against the header's checksum.
    pub fn verify(&self, payload: &[u8]) -> Result<(), MessageError> {
        let actual = if payload.is_empty() {
            Self::EMPTY_CHECKSUM
        } else {
            Self::checksum_from_payload(payload)
        };
        if actual != self.checksum {
            return Err(MessageError::ChecksumMismatch {
                expected: self.checksum,
                actual,
            });
        }
        Ok(())
    }

    /// Generates a [u8; 12] from an ascii string, padding with 0s when needed.
    fn command_name_from_str(name: &str) -> Result<[u8; 12], MessageError> {
        const NAME_LEN: usize = 12;

        if !name.is_ascii() {
            return Err(MessageError::InvalidCommandName(format!(
                "command: '{name}' should only contain ASCII characters.",
            )));
        }

        if name.len() > NAME_LEN {
            return Err(MessageError::InvalidCommandName(format!(
                "name: '{name}' has length {} which is more than the allowed max {}.",
                name.len(),
                NAME_LEN
            )));
        }

        let mut formatted_name: [u8; NAME_LEN] = [0; NAME_LEN];
        formatted_name[..name.len()].copy_from_slice(name.as_bytes());

        Ok(formatted_name)
    }

    /// Generates the checksum SHA256(SHA256(payload)).
    fn checksum_from_payload(payload: &[u8]) -> [u8; Self::CHECKSUM_WIDTH] {
        let hash = Sha256::digest(Sha256::digest(payload));

        let mut checksum: [u8; Self::CHECKSUM_WIDTH] = [0; Self::CHECKSUM_WIDTH];
        checksum.clone_from_slice(&hash[..Self::CHECKSUM_WIDTH]);

        checksum
    }
}

/// Every message this node understands. Anything else decodes to `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionMessage),
    /// Version Acknowledgement. Payload-less command.
    Verack,
    Ping(u64),
    Pong(u64),
    Reject(RejectMessage),
    Unknown { command: String, payload: Vec<u8> },
}

impl Message {
    /// The message's name. i.e "verack"
    pub fn command(&self) -> &str {
        match self {
            Self::Version(_) => "version",
            Self::Verack => "verack",
            Self::Ping(_) => "ping",
            Self::Pong(_) => "pong",
            Self::Reject(_) => "reject",
            Self::Unknown { command, .. } => command,
        }
    }

    fn payload(&self) -> Result<Vec<u8>, MessageError> {
        match self {
            Self::Version(version) => version.to_bytes(),
            Self::Verack => Ok(Vec::new()),
            Self::Ping(nonce) | Self::Pong(nonce) => {
                let mut payload = Vec::with_capacity(8);
                payload
                    .write_u64::<LittleEndian>(*nonce)
                    .map_err(MessageError::Serialization)?;
                Ok(payload)
            }
            Self::Reject(reject) => reject.to_bytes(),
            Self::Unknown { payload, .. } => Ok(payload.clone()),
        }
    }

    /// Decodes a message body once its header has been read.
    pub fn decode(header: &Header, payload: &[u8]) -> Result<Self, MessageError> {
        header.verify(payload)?;

        let message = match header.command().as_str() {
            "version" => Self::Version(VersionMessage::from_bytes(payload)?),
            "verack" => Self::Verack,
            "ping" => Self::Ping(read_nonce(payload)?),
            "pong" => Self::Pong(read_nonce(payload)?),
            "reject" => Self::Reject(RejectMessage::from_bytes(payload)?),
            command => Self::Unknown {
                command: command.to_owned(),
                payload: payload.to_vec(),
            },
        };
        Ok(message)
    }
}

/// A serialized message that can be sent over the wire.
pub fn serialize_message(network: Network, message: &Message) -> Result<Vec<u8>, MessageError> {
    let payload = message.payload()?;
    let header = Header::new(network, message.command(), &payload)?;

    let mut serialized_message = header.to_bytes()?;
    serialized_message.extend(payload);
    Ok(serialized_message)
}

fn read_nonce(payload: &[u8]) -> Result<u64, MessageError> {
    Cursor::new(payload)
        .read_u64::<LittleEndian>()
        .map_err(MessageError::Deserialization)
}

/// Current unix time in seconds, according to the local clock.
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}

/// A network address as embedded in the version message (no timestamp).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetAddr {
    pub services: u64,
    /// IPv6, or IPv4-mapped IPv6. Network byte order.
    pub ip: [u8; 16],
    pub port: u16,
}

impl NetAddr {
    pub fn new(addr: SocketAddr, services: u64) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(ip) => ip.to_ipv6_mapped(),
            IpAddr::V6(ip) => ip,
        }
        .octets();

        Self {
            services,
            ip,
            port: addr.port(),
        }
    }

    fn write_to(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        buf.write_u64::<LittleEndian>(self.services)?;
        buf.write_all(&self.ip)?;
        buf.write_u16::<BigEndian>(self.port)
    }

    fn read_from(cursor: &mut Cursor<&[u8]>) -> io::Result<Self> {
        let services = cursor.read_u64::<LittleEndian>()?;
        let mut ip = [0u8; 16];
        cursor.read_exact(&mut ip)?;
        let port = cursor.read_u16::<BigEndian>()?;
        Ok(Self { services, ip, port })
    }
}

/// The first and primary messages in the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    /// The highest protocol version understood by the transmitting node
    pub version: i32,
    /// The services supported by the transmitting node encoded as a bitfield
    pub services: u64,
    /// The current Unix epoch time according to the transmitting node’s clock
    pub timestamp: i64,
    /// The receiving node as perceived by the transmitting node
    pub receiver: NetAddr,
    /// The transmitting node
    pub sender: NetAddr,
    /// A random nonce which can help a node detect a connection to itself.
    /// If the nonce is 0, the nonce field is ignored
    pub nonce: u64,
    pub user_agent: String,
    /// The height of the transmitting node’s best block chain
    pub start_height: i32,
    /// Transaction relay flag. `None` when the field is not on the wire.
    pub relay: Option<bool>,
}

impl VersionMessage {
    /// Builds our own announcement for a connection between `local` and `remote`.
    pub fn announce(
        protocol_version: i32,
        user_agent: Option<&str>,
        remote: SocketAddr,
        local: SocketAddr,
        services: u64,
        start_height: i32,
        relay: Option<bool>,
    ) -> Self {
        Self {
            version: protocol_version,
            services,
            timestamp: unix_timestamp(),
            receiver: NetAddr::new(remote, Service::NODE_NETWORK),
            sender: NetAddr::new(local, services),
            nonce: rand::random(),
            user_agent: user_agent.unwrap_or_default().to_owned(),
            start_height,
            relay,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        let mut payload: Vec<u8> = Vec::with_capacity(86 + self.user_agent.len());
        self.write_to(&mut payload)
            .map_err(MessageError::Serialization)?;
        Ok(payload)
    }

    fn write_to(&self, payload: &mut Vec<u8>) -> io::Result<()> {
        payload.write_i32::<LittleEndian>(self.version)?;
        payload.write_u64::<LittleEndian>(self.services)?;
        payload.write_i64::<LittleEndian>(self.timestamp)?;
        // rx end
        self.receiver.write_to(payload)?;
        // tx end
        self.sender.write_to(payload)?;
        payload.write_u64::<LittleEndian>(self.nonce)?;
        write_var_str(payload, &self.user_agent)?;
        payload.write_i32::<LittleEndian>(self.start_height)?;
        if let Some(relay) = self.relay {
            payload.write_u8(relay.into())?;
        }
        Ok(())
    }

    pub fn from_bytes(payload: &[u8]) -> Result<Self, MessageError> {
        let mut cursor = Cursor::new(payload);
        Self::read_from(&mut cursor).map_err(MessageError::Deserialization)
    }

    fn read_from(cursor: &mut Cursor<&[u8]>) -> io::Result<Self> {
        let version = cursor.read_i32::<LittleEndian>()?;
        let services = cursor.read_u64::<LittleEndian>()?;
        let timestamp = cursor.read_i64::<LittleEndian>()?;
        let receiver = NetAddr::read_from(cursor)?;
        let sender = NetAddr::read_from(cursor)?;
        let nonce = cursor.read_u64::<LittleEndian>()?;
        let user_agent = read_var_str(cursor)?;
        let start_height = cursor.read_i32::<LittleEndian>()?;
        // Older peers stop after the start height.
        let relay = match cursor.read_u8() {
            Ok(flag) => Some(flag != 0),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => None,
            Err(err) => return Err(err),
        };

        Ok(Self {
            version,
            services,
            timestamp,
            receiver,
            sender,
            nonce,
            user_agent,
            start_height,
            relay,
        })
    }
}

/// Service bits a node can announce.
pub struct Service;
impl Service {
    pub const NODE_NETWORK: u64 = 0x01;
    pub const NODE_WITNESS: u64 = 0x08;
    pub const NODE_NETWORK_LIMITED: u64 = 0x0400;
}

/// Machine readable reason attached to a `reject`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectCode {
    Malformed,
    Invalid,
    Obsolete,
    Duplicate,
    Nonstandard,
    Dust,
    InsufficientFee,
    Checkpoint,
    Other(u8),
}

impl From<u8> for RejectCode {
    fn from(code: u8) -> Self {
        match code {
            0x01 => Self::Malformed,
            0x10 => Self::Invalid,
            0x11 => Self::Obsolete,
            0x12 => Self::Duplicate,
            0x40 => Self::Nonstandard,
            0x41 => Self::Dust,
            0x42 => Self::InsufficientFee,
            0x43 => Self::Checkpoint,
            other => Self::Other(other),
        }
    }
}

impl From<RejectCode> for u8 {
    fn from(code: RejectCode) -> Self {
        match code {
            RejectCode::Malformed => 0x01,
            RejectCode::Invalid => 0x10,
            RejectCode::Obsolete => 0x11,
            RejectCode::Duplicate => 0x12,
            RejectCode::Nonstandard => 0x40,
            RejectCode::Dust => 0x41,
            RejectCode::InsufficientFee => 0x42,
            RejectCode::Checkpoint => 0x43,
            RejectCode::Other(other) => other,
        }
    }
}

/// Tells a peer one of its messages was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectMessage {
    /// Command of the refused message, i.e "version".
    pub message: String,
    pub code: RejectCode,
    pub reason: String,
    /// Extra data, usually the hash of the refused object. Often empty.
    pub data: Vec<u8>,
}

impl RejectMessage {
    /// A reject with an empty data field, the shape this node always sends.
    pub fn new(message: impl Into<String>, code: RejectCode, reason: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code,
            reason: reason.into(),
            data: Vec::new(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        let mut payload = Vec::new();
        write_var_str(&mut payload, &self.message).map_err(MessageError::Serialization)?;
        payload
            .write_u8(self.code.into())
            .map_err(MessageError::Serialization)?;
        write_var_str(&mut payload, &self.reason).map_err(MessageError::Serialization)?;
        payload.extend_from_slice(&self.data);
        Ok(payload)
    }

    pub fn from_bytes(payload: &[u8]) -> Result<Self, MessageError> {
        let mut cursor = Cursor::new(payload);
        let message = read_var_str(&mut cursor).map_err(MessageError::Deserialization)?;
        let code = cursor
            .read_u8()
            .map_err(MessageError::Deserialization)?
            .into();
        let reason = read_var_str(&mut cursor).map_err(MessageError::Deserialization)?;
        let mut data = Vec::new();
        cursor
            .read_to_end(&mut data)
            .map_err(MessageError::Deserialization)?;

        Ok(Self {
            message,
            code,
            reason,
            data,
        })
    }
}

/// Writes a CompactSize length prefix.
fn write_compact_size(buf: &mut Vec<u8>, n: u64) -> io::Result<()> {
    match n {
        0..=0xfc => buf.write_u8(n as u8),
        0xfd..=0xffff => {
            buf.write_u8(0xfd)?;
            buf.write_u16::<LittleEndian>(n as u16)
        }
        0x1_0000..=0xffff_ffff => {
            buf.write_u8(0xfe)?;
            buf.write_u32::<LittleEndian>(n as u32)
        }
        _ => {
            buf.write_u8(0xff)?;
            buf.write_u64::<LittleEndian>(n)
        }
    }
}

fn read_compact_size(cursor: &mut Cursor<&[u8]>) -> io::Result<u64> {
    match cursor.read_u8()? {
        0xfd => cursor.read_u16::<LittleEndian>().map(u64::from),
        0xfe => cursor.read_u32::<LittleEndian>().map(u64::from),
        0xff => cursor.read_u64::<LittleEndian>(),
        n => Ok(u64::from(n)),
    }
}

fn write_var_str(buf: &mut Vec<u8>, s: &str) -> io::Result<()> {
    write_compact_size(buf, s.len() as u64)?;
    buf.write_all(s.as_bytes())
}

fn read_var_str(cursor: &mut Cursor<&[u8]>) -> io::Result<String> {
    let len = read_compact_size(cursor)?;
    let remaining = cursor.get_ref().len() as u64 - cursor.position();
    if len > remaining {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("string of {len} bytes but only {remaining} left"),
        ));
    }
    let mut bytes = vec![0u8; len as usize];
    cursor.read_exact(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
