use std::io;
use std::sync::{Arc, RwLock};

use crossbeam_channel::{Receiver, Sender};

use crate::block::Block;
use crate::error::BlockError;

/// Upper-layer callbacks. They run on a state machine's thread and should return quickly.
pub trait Listener: Send + Sync {
    /// A block was fully transmitted and, when acks are negotiated, acknowledged.
    fn on_block_transmit_complete(&self, block: &Block);

    /// A block was received from a peer.
    fn on_inbound_block(&self, block: &Block);

    /// An outbound block will not be delivered.
    fn on_outbound_block_error(&self, block: &Block, error: &BlockError);
}

/// Fans notifications out to every registered listener.
#[derive(Default)]
pub(crate) struct Notifier {
    listeners: RwLock<Vec<Arc<dyn Listener>>>,
}

impl Notifier {
    pub fn register(&self, listener: Arc<dyn Listener>) {
        self.write().push(listener);
    }

    /// Removes a listener, compared by identity. Returns whether it was registered.
    pub fn unregister(&self, listener: &Arc<dyn Listener>) -> bool {
        let mut listeners = self.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn transmitted(&self, block: &Block) {
        for listener in self.snapshot() {
            listener.on_block_transmit_complete(block);
        }
    }

    pub fn received(&self, block: &Block) {
        for listener in self.snapshot() {
            listener.on_inbound_block(block);
        }
    }

    pub fn failed(&self, block: &Block, error: &BlockError) {
        for listener in self.snapshot() {
            listener.on_outbound_block_error(block, error);
        }
    }

    /// Listeners are called on a copy of the list so a callback may (un)register listeners.
    fn snapshot(&self) -> Vec<Arc<dyn Listener>> {
        match self.listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<dyn Listener>>> {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Notification produced by a [`ChannelListener`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// An outbound block was delivered.
    Transmitted(Block),
    /// An inbound block arrived.
    Received(Block),
    /// An outbound block failed.
    Failed(Block, BlockError),
}

/// [`Listener`] that forwards every callback into an unbounded channel.
pub struct ChannelListener {
    sender: Sender<Event>,
}

impl Listener for ChannelListener {
    fn on_block_transmit_complete(&self, block: &Block) {
        let _ = self.sender.send(Event::Transmitted(block.clone()));
    }

    fn on_inbound_block(&self, block: &Block) {
        let _ = self.sender.send(Event::Received(block.clone()));
    }

    fn on_outbound_block_error(&self, block: &Block, error: &BlockError) {
        let _ = self.sender.send(Event::Failed(block.clone(), error.clone()));
    }
}

/// Receiving end of a [`ChannelListener`].
pub struct Events {
    receiver: Receiver<Event>,
}

impl Events {
    /// Blocks until the next notification. Fails once the listener is gone.
    pub fn receive_blocking(&self) -> io::Result<Event> {
        self.receiver
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "channel disconnected"))
    }

    /// Waits for the next notification for at most `timeout`.
    pub fn receive_timeout(&self, timeout: std::time::Duration) -> io::Result<Event> {
        self.receiver
            .recv_timeout(timeout)
            .map_err(|err| match err {
                crossbeam_channel::RecvTimeoutError::Timeout => {
                    io::Error::new(io::ErrorKind::TimedOut, "no event in time")
                }
                crossbeam_channel::RecvTimeoutError::Disconnected => {
                    io::Error::new(io::ErrorKind::BrokenPipe, "channel disconnected")
                }
            })
    }

    /// Exposes the raw receiver.
    pub fn receiver(&self) -> &Receiver<Event> {
        &self.receiver
    }
}

/// Creates a listener that turns callbacks into [`Event`]s, and the handle that receives them.
pub fn channel_listener() -> (Arc<dyn Listener>, Events) {
    let (sender, receiver) = crossbeam_channel::unbounded();
    (Arc::new(ChannelListener { sender }), Events { receiver })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::link::LinkId;
    use crate::peer::PeerId;

    fn block() -> Block {
        Block {
            bytes: vec![1, 2, 3],
            peer: PeerId(1),
            link: LinkId(0),
            client_id: 42,
        }
    }

    #[test]
    fn fan_out_and_unregister() {
        let notifier = Notifier::default();
        let (first, first_events) = channel_listener();
        let (second, second_events) = channel_listener();

        notifier.register(first.clone());
        notifier.register(second.clone());
        notifier.transmitted(&block());

        assert_eq!(
            first_events.receive_blocking().unwrap(),
            Event::Transmitted(block())
        );
        assert_eq!(
            second_events.receive_blocking().unwrap(),
            Event::Transmitted(block())
        );

        assert!(notifier.unregister(&first));
        assert!(!notifier.unregister(&first));

        notifier.failed(&block(), &BlockError::Refused);
        assert!(first_events.receiver().is_empty());
        assert_eq!(
            second_events.receive_blocking().unwrap(),
            Event::Failed(block(), BlockError::Refused)
        );
    }
}
