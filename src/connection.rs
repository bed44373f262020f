use std::{net::SocketAddr, sync::Arc};

use crate::{
    config::HandshakeConfig,
    dispatch::{LogHandler, LoopHandle, LoopStats, MessageHandler, MessageLoop},
    error::HandshakeError,
    handshake::{validate_peer_version, ConnectionState, Phase, Role, Step},
    message::{unix_timestamp, Message, VersionMessage},
    transport::Transport,
};

/// One peer connection: runs the version/verack handshake, then hands the
/// transport over to a [`MessageLoop`].
///
/// A connection is good for a single handshake attempt. To retry, build a new
/// one on a fresh transport.
pub struct Connection<T: Transport> {
    transport: Arc<T>,
    role: Role,
    config: HandshakeConfig,
    handler: Arc<dyn MessageHandler>,
    phase: Phase,
    own_version: Option<VersionMessage>,
    /// Set once, from the first message of the handshake.
    peer_version: Option<VersionMessage>,
    peer_time_offset: Option<i64>,
    message_loop: Option<LoopHandle>,
}

impl<T: Transport> Connection<T> {
    pub fn new(transport: T, role: Role, config: HandshakeConfig) -> Self {
        Self {
            transport: Arc::new(transport),
            role,
            config,
            handler: Arc::new(LogHandler),
            phase: Phase::NotStarted,
            own_version: None,
            peer_version: None,
            peer_time_offset: None,
            message_loop: None,
        }
    }

    /// Replaces the handler the message loop reports to.
    pub fn with_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Runs the handshake and, on success, starts the message loop.
    ///
    /// Returns whether the transport is still connected afterwards. Use
    /// [`Connection::state`] to tell an established peer from a failed one.
    pub async fn connect(
        &mut self,
        services: u64,
        start_height: i32,
        relay: Option<bool>,
        strict_verack: bool,
    ) -> bool {
        match self
            .try_connect(services, start_height, relay, strict_verack)
            .await
        {
            Ok(()) => tracing::info!("Handshake with {} completed.", self.peer_name()),
            Err(err) => tracing::warn!("Handshake with {} failed: {}", self.peer_name(), err),
        }
        self.is_connected()
    }

    /// Same as [`Connection::connect`], but says why a handshake failed.
    ///
    /// Any failure closes the connection, except for a repeated attempt which
    /// leaves the first one untouched.
    pub async fn try_connect(
        &mut self,
        services: u64,
        start_height: i32,
        relay: Option<bool>,
        strict_verack: bool,
    ) -> Result<(), HandshakeError> {
        if self.phase != Phase::NotStarted {
            return Err(HandshakeError::AlreadyAttempted);
        }
        // A closed connection stays closed, the attempt leaves no trace.
        if !self.transport.is_connected() {
            return Err(HandshakeError::NotConnected);
        }
        self.advance(Phase::InProgress);

        match self
            .handshake(services, start_height, relay, strict_verack)
            .await
        {
            Ok(()) => {
                self.advance(Phase::Established);
                self.message_loop = Some(MessageLoop::spawn(
                    self.transport.clone(),
                    self.handler.clone(),
                ));
                Ok(())
            }
            Err(err) => {
                self.advance(Phase::Rejected);
                self.close().await;
                Err(err)
            }
        }
    }

    async fn handshake(
        &mut self,
        services: u64,
        start_height: i32,
        relay: Option<bool>,
        strict_verack: bool,
    ) -> Result<(), HandshakeError> {
        let unspecified = SocketAddr::from(([0, 0, 0, 0], 0));
        let own_version = self.own_version.insert(VersionMessage::announce(
            self.config.protocol_version,
            self.config.user_agent.as_deref(),
            self.transport.peer_addr().unwrap_or(unspecified),
            self.transport.local_addr().unwrap_or(unspecified),
            services,
            start_height,
            relay,
        ));
        let announcement = Message::Version(own_version.clone());

        let mut step = Step::new().next(self.role, strict_verack);
        while step != Step::Complete {
            tracing::debug!(?step, role = ?self.role, "handshake");
            match step {
                Step::SendVersion => self.transport.send(&announcement).await?,
                Step::RecvVersion => {
                    let version = self.expect_version().await?;
                    if self.peer_version.is_none() {
                        self.peer_version = Some(version);
                    }
                }
                Step::RecvVerack => self.expect_verack().await?,
                Step::Validate => self.validate_peer().await?,
                Step::Init | Step::Complete => {}
            }
            step = step.next(self.role, strict_verack);
        }
        Ok(())
    }

    async fn expect_version(&self) -> Result<VersionMessage, HandshakeError> {
        match self.transport.receive().await? {
            Message::Version(version) => Ok(version),
            other => Err(HandshakeError::UnexpectedMessage {
                expected: "version",
                received: other.command().to_owned(),
            }),
        }
    }

    async fn expect_verack(&self) -> Result<(), HandshakeError> {
        match self.transport.receive().await? {
            Message::Verack => Ok(()),
            other => Err(HandshakeError::UnexpectedMessage {
                expected: "verack",
                received: other.command().to_owned(),
            }),
        }
    }

    /// Answers the peer's version with exactly one `verack` or `reject`.
    /// Nothing is sent without a peer version or a live transport.
    async fn validate_peer(&mut self) -> Result<(), HandshakeError> {
        let peer_version = self
            .peer_version
            .as_ref()
            .ok_or(HandshakeError::MissingPeerVersion)?;
        if !self.transport.is_connected() {
            return Err(HandshakeError::NotConnected);
        }

        match validate_peer_version(peer_version, unix_timestamp(), self.config.min_peer_version) {
            Ok(offset) => {
                self.transport.send(&Message::Verack).await?;
                self.peer_time_offset = Some(offset);
                Ok(())
            }
            Err(failure) => {
                tracing::warn!("Rejecting {}: {}", self.peer_name(), failure);
                self.transport
                    .send(&Message::Reject(failure.reject_message()))
                    .await?;
                Err(failure.into())
            }
        }
    }

    fn advance(&mut self, phase: Phase) {
        self.phase = self.phase.max(phase);
    }

    /// Stops the message loop and closes the transport. Safe to repeat.
    pub async fn close(&self) {
        if let Some(message_loop) = &self.message_loop {
            message_loop.stop();
        }
        self.transport.close().await;
    }

    /// Waits until the message loop ends, i.e the peer went away or
    /// [`Connection::close`] was called. `None` if no loop is running.
    pub async fn closed(&mut self) -> Option<LoopStats> {
        self.message_loop.take()?.join().await
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::derive(self.phase, self.transport.is_connected())
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_inbound(&self) -> bool {
        self.role == Role::Inbound
    }

    /// The version we announced, once the handshake started.
    pub fn own_version(&self) -> Option<&VersionMessage> {
        self.own_version.as_ref()
    }

    /// The version the peer announced, if it got that far.
    pub fn peer_version(&self) -> Option<&VersionMessage> {
        self.peer_version.as_ref()
    }

    /// Peer clock minus ours, in seconds. Only set for an accepted peer.
    pub fn peer_time_offset(&self) -> Option<i64> {
        self.peer_time_offset
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    fn peer_name(&self) -> String {
        match self.transport.peer_addr() {
            Some(addr) => addr.to_string(),
            None => "peer".to_owned(),
        }
    }
}
