//! Post-handshake message loop.
//!
//! Once a peer is accepted, one task per connection owns all reads from the
//! transport. `ping`s are answered here; everything else goes to a
//! [`MessageHandler`].

use std::sync::Arc;

use tokio::{sync::watch, task::JoinHandle};

use crate::{
    error::TransportError,
    message::{Message, RejectMessage},
    transport::Transport,
};

/// Hooks for messages received after the handshake.
///
/// Every method has a default that only logs, implementors override what
/// they care about. The `pong` reply to a `ping` is sent by the loop itself.
pub trait MessageHandler: Send + Sync {
    fn on_ping(&self, nonce: u64) {
        tracing::trace!(nonce, "ping");
    }

    fn on_pong(&self, nonce: u64) {
        tracing::info!(nonce, "pong");
    }

    fn on_reject(&self, reject: &RejectMessage) {
        tracing::warn!(
            "peer rejected `{}` ({:?}): {} - {:02x?}",
            reject.message,
            reject.code,
            reject.reason,
            reject.data
        );
    }

    /// Any message without a dedicated hook, including unknown commands.
    fn on_other(&self, message: &Message) {
        tracing::debug!("ignoring `{}`", message.command());
    }

    fn on_decode_error(&self, error: &TransportError) {
        tracing::warn!("dropped malformed message: {}", error);
    }
}

/// The default handler: logs and nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHandler;

impl MessageHandler for LogHandler {}

/// Why the loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The transport reported the connection gone.
    Disconnected,
    /// Stop was requested, or the owning handle went away.
    Stopped,
}

/// What the loop saw over its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopStats {
    /// Successfully decoded messages.
    pub messages: u64,
    pub pings_answered: u64,
    pub decode_errors: u64,
    pub exit: LoopExit,
}

pub struct MessageLoop<T> {
    transport: Arc<T>,
    handler: Arc<dyn MessageHandler>,
    stop: watch::Receiver<bool>,
}

impl<T: Transport> MessageLoop<T> {
    /// The loop stops when `stop` flips to `true` or its sender is dropped.
    pub fn new(
        transport: Arc<T>,
        handler: Arc<dyn MessageHandler>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            transport,
            handler,
            stop,
        }
    }

    /// Runs the loop on its own task.
    pub fn spawn(transport: Arc<T>, handler: Arc<dyn MessageHandler>) -> LoopHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(Self::new(transport, handler, stop_rx).run());
        LoopHandle {
            stop: stop_tx,
            task,
        }
    }

    pub async fn run(mut self) -> LoopStats {
        let mut messages = 0;
        let mut pings_answered = 0;
        let mut decode_errors = 0;

        let exit = loop {
            if *self.stop.borrow_and_update() {
                break LoopExit::Stopped;
            }
            if !self.transport.is_connected() {
                break LoopExit::Disconnected;
            }

            let received = tokio::select! {
                biased;
                changed = self.stop.changed() => {
                    if changed.is_err() {
                        break LoopExit::Stopped;
                    }
                    continue;
                }
                received = self.transport.receive() => received,
            };

            match received {
                Ok(message) => {
                    messages += 1;
                    if self.dispatch(message).await {
                        pings_answered += 1;
                    }
                }
                Err(TransportError::Timeout(_)) => {}
                Err(err @ TransportError::Decode(_)) => {
                    decode_errors += 1;
                    self.handler.on_decode_error(&err);
                }
                // Fatal ones already flipped the transport to disconnected.
                Err(err) => tracing::debug!("receive failed: {}", err),
            }
        };

        tracing::debug!(?exit, messages, decode_errors, "message loop finished");
        LoopStats {
            messages,
            pings_answered,
            decode_errors,
            exit,
        }
    }

    /// Routes one message. Returns whether a `pong` went out.
    async fn dispatch(&self, message: Message) -> bool {
        match message {
            Message::Ping(nonce) => {
                self.handler.on_ping(nonce);
                match self.transport.send(&Message::Pong(nonce)).await {
                    Ok(()) => true,
                    Err(err) => {
                        tracing::warn!("could not answer ping {}: {}", nonce, err);
                        false
                    }
                }
            }
            Message::Pong(nonce) => {
                self.handler.on_pong(nonce);
                false
            }
            Message::Reject(reject) => {
                self.handler.on_reject(&reject);
                false
            }
            other @ (Message::Version(_) | Message::Verack | Message::Unknown { .. }) => {
                self.handler.on_other(&other);
                false
            }
        }
    }
}

/// Owner side of a spawned [`MessageLoop`]. Dropping it stops the loop.
pub struct LoopHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<LoopStats>,
}

impl LoopHandle {
    /// Asks the loop to stop. It notices even while blocked on a read.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Waits for the loop to return, `None` if its task panicked.
    pub async fn join(self) -> Option<LoopStats> {
        match self.task.await {
            Ok(stats) => Some(stats),
            Err(err) => {
                tracing::error!("message loop task failed: {}", err);
                None
            }
        }
    }
}
