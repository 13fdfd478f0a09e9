use crate::message::Envelope;
use crate::Result;
use std::sync::{Arc, Mutex};
use tokio::select;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub type EnvelopeSender = UnboundedSender<Envelope>;
pub type EnvelopeReceiver = UnboundedReceiver<Envelope>;

struct ChannelInner {
    label: String,
    incoming: Mutex<Option<EnvelopeReceiver>>,
    outgoing: EnvelopeSender,
    cancel_token: CancellationToken,
}

/// One half of an ordered duplex envelope conduit between an edge and the
/// hub. Delivery is FIFO per direction; the only loss mode is a close, after
/// which `post` reports `false`. Callers rely on request timeouts for
/// liveness, never on backpressure.
#[derive(Clone)]
pub struct ChannelConnection {
    inner: Arc<ChannelInner>,
}

/// Creates the two linked halves of a channel. Closing either half closes
/// both directions.
pub fn channel_pair(label: &str) -> (ChannelConnection, ChannelConnection) {
    let (left_tx, left_rx) = unbounded_channel();
    let (right_tx, right_rx) = unbounded_channel();
    let cancel_token = CancellationToken::new();
    let left = ChannelConnection {
        inner: Arc::new(ChannelInner {
            label: format!("{}:edge", label),
            incoming: Mutex::new(Some(right_rx)),
            outgoing: left_tx,
            cancel_token: cancel_token.clone(),
        }),
    };
    let right = ChannelConnection {
        inner: Arc::new(ChannelInner {
            label: format!("{}:hub", label),
            incoming: Mutex::new(Some(left_rx)),
            outgoing: right_tx,
            cancel_token,
        }),
    };
    (left, right)
}

impl ChannelConnection {
    /// Non-blocking post. Failure is reported synchronously as `false` and
    /// logged; it is never raised to the caller.
    pub fn post(&self, envelope: Envelope) -> bool {
        if self.inner.cancel_token.is_cancelled() {
            warn!("{}: post on closed channel: {}", self.inner.label, envelope.kind);
            return false;
        }
        match self.inner.outgoing.send(envelope) {
            Ok(()) => true,
            Err(e) => {
                warn!("{}: post failed: {}", self.inner.label, e);
                false
            }
        }
    }

    /// Takes the receive side. Each half has exactly one receiver; a second
    /// take returns `None`.
    pub fn take_receiver(&self) -> Option<EnvelopeReceiver> {
        self.inner.incoming.lock().unwrap().take()
    }

    /// Forwards every inbound envelope to `sender` until the channel closes.
    pub async fn serve_loop(&self, sender: EnvelopeSender) -> Result<()> {
        let incoming = self.take_receiver();
        if incoming.is_none() {
            return Err(crate::Error::Error(
                "ChannelConnection::serve_loop called twice".to_string(),
            ));
        }
        let mut incoming = incoming.unwrap();
        loop {
            select! {
                _ = self.inner.cancel_token.cancelled() => break,
                event = incoming.recv() => match event {
                    Some(envelope) => sender.send(envelope)?,
                    None => break,
                },
            }
        }
        Ok(())
    }

    pub fn close(&self) {
        self.inner.cancel_token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel_token.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel_token.clone()
    }
}

impl std::fmt::Display for ChannelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner.label)
    }
}

impl std::fmt::Debug for ChannelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner.label)
    }
}
