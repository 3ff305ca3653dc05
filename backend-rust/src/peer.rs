//! Player data-channel boundary.
//!
//! The WebRTC offer/answer negotiation and data-channel plumbing are external
//! collaborators. What the session core needs from a player connection is
//! narrow: a way to push text toward the player ([`PeerHandle`]) and a way for
//! whatever hosts the connection to deliver the player's lifecycle and
//! messages back ([`PeerEvent`], routed through the supervisor's event
//! channel). Anything that can do both can host a player; the in-tree host is
//! the controller WebSocket in `handlers`.

use tokio::sync::mpsc;
use uuid::Uuid;

pub type PlayerId = Uuid;

/// What the session pushes toward the hosting transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCommand {
    Text(String),
    Close,
}

/// What the hosting transport reports back about a player connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// The data channel opened; the player becomes active.
    Open,
    /// A text message from the player.
    Message(String),
    /// Transient loss; the player may reconnect and be re-activated.
    Disconnected,
    /// The connection is gone for good.
    Closed,
}

/// Sending half of a player connection, held by the session.
///
/// Sends never fail: once the host is gone the messages are simply dropped,
/// so a slow teardown cannot stall the tick.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    tx: mpsc::UnboundedSender<PeerCommand>,
}

impl PeerHandle {
    /// A handle plus the receiver its host drains.
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<PeerCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, text: impl Into<String>) {
        let _ = self.tx.send(PeerCommand::Text(text.into()));
    }

    pub fn close(&self) {
        let _ = self.tx.send(PeerCommand::Close);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_delivers_in_order_and_survives_dropped_host() {
        let (peer, mut rx) = PeerHandle::pair();
        peer.send("one");
        peer.send("two");
        peer.close();

        assert_eq!(rx.try_recv().unwrap(), PeerCommand::Text("one".into()));
        assert_eq!(rx.try_recv().unwrap(), PeerCommand::Text("two".into()));
        assert_eq!(rx.try_recv().unwrap(), PeerCommand::Close);

        drop(rx);
        peer.send("into the void");
    }
}
