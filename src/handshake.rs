use crate::{
    error::ValidationFailure,
    message::{RejectCode, RejectMessage, VersionMessage},
    MAX_CLOCK_SKEW,
};

/// Which side opened the connection. Decides who speaks first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// The peer dialed us, we wait for its version first.
    Inbound,
    /// We dialed the peer, we send our version first.
    Outbound,
}

/// Externally observable state of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    NotStarted,
    HandshakeInProgress,
    Established,
    /// The handshake failed: protocol violation, refused peer or broken transport.
    Rejected,
    Closed,
}

/// How far the handshake got. Only ever moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Phase {
    NotStarted,
    InProgress,
    Established,
    Rejected,
}

impl ConnectionState {
    /// A failed handshake stays `Rejected`. Otherwise a dead transport wins.
    pub(crate) fn derive(phase: Phase, transport_connected: bool) -> Self {
        match phase {
            Phase::Rejected => Self::Rejected,
            _ if !transport_connected => Self::Closed,
            Phase::NotStarted => Self::NotStarted,
            Phase::InProgress => Self::HandshakeInProgress,
            Phase::Established => Self::Established,
        }
    }
}

/// Steps the handshake goes through (post connection).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Step {
    Init,
    SendVersion,
    RecvVersion,
    /// Check the peer's version, answer with `verack` or `reject`.
    Validate,
    RecvVerack,
    Complete,
}

impl Step {
    pub(crate) fn new() -> Self {
        Self::Init
    }

    /// Steps transitions. An outbound peer reads the peer's `verack` before
    /// validating, an inbound one after answering.
    pub(crate) fn next(self, role: Role, strict_verack: bool) -> Self {
        match (role, self) {
            (Role::Outbound, Self::Init) => Self::SendVersion,
            (Role::Outbound, Self::SendVersion) => Self::RecvVersion,
            (Role::Outbound, Self::RecvVersion) if strict_verack => Self::RecvVerack,
            (Role::Outbound, Self::RecvVersion) => Self::Validate,
            (Role::Outbound, Self::RecvVerack) => Self::Validate,
            (Role::Outbound, Self::Validate) => Self::Complete,

            (Role::Inbound, Self::Init) => Self::RecvVersion,
            (Role::Inbound, Self::RecvVersion) => Self::SendVersion,
            (Role::Inbound, Self::SendVersion) => Self::Validate,
            (Role::Inbound, Self::Validate) if strict_verack => Self::RecvVerack,
            (Role::Inbound, Self::Validate) => Self::Complete,
            (Role::Inbound, Self::RecvVerack) => Self::Complete,

            (_, Self::Complete) => Self::Complete,
        }
    }
}

/// Checks a peer's version against our minimum and our clock.
///
/// Returns the peer clock offset in seconds (peer time minus `now`) when the
/// peer is acceptable.
pub fn validate_peer_version(
    peer: &VersionMessage,
    now: i64,
    min_version: i32,
) -> Result<i64, ValidationFailure> {
    if peer.version < min_version {
        return Err(ValidationFailure::Obsolete {
            version: peer.version,
            minimum: min_version,
        });
    }

    let offset = peer.timestamp.saturating_sub(now);
    let tolerance = MAX_CLOCK_SKEW.as_secs() as i64;
    if offset.unsigned_abs() > tolerance as u64 {
        return Err(ValidationFailure::ClockSkew { offset, tolerance });
    }

    Ok(offset)
}

impl ValidationFailure {
    /// The `reject` telling the peer why its version was refused.
    pub fn reject_message(&self) -> RejectMessage {
        match self {
            Self::Obsolete { minimum, .. } => RejectMessage::new(
                "version",
                RejectCode::Obsolete,
                format!("Client version needs to be at least {minimum}"),
            ),
            Self::ClockSkew { offset, tolerance } => RejectMessage::new(
                "version",
                RejectCode::Invalid,
                format!("Bad timestamp: {offset}s away from our clock, more than {tolerance}s"),
            ),
        }
    }
}
