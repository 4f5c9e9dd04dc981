//! Broadcast bus shared by the tabs of one document.
//!
//! In-process stand-in for the browser's named BroadcastChannel, backed
//! by a tokio broadcast channel. Tabs of the same document clone one bus;
//! every send fans out to every subscriber, sender included, and the
//! coordinator filters its own messages by tab id. A host without a
//! broadcast primitive simply gives each coordinator a private bus,
//! reducing it to a leader-of-one.

use tokio::sync::broadcast;

use crate::error::{Result, TabError};
use crate::messages::TabMessage;

const CHANNEL_CAPACITY: usize = 256;

/// Named broadcast channel for one document's tabs.
#[derive(Debug, Clone)]
pub struct TabBus {
    name: String,
    sender: broadcast::Sender<TabMessage>,
}

impl TabBus {
    /// Create the bus for a document. The channel is named
    /// `synckit-<documentId>`.
    pub fn new(document_id: &str) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            name: format!("synckit-{document_id}"),
            sender,
        }
    }

    /// Channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open a receiving side. Each coordinator holds one.
    pub fn subscribe(&self) -> broadcast::Receiver<TabMessage> {
        self.sender.subscribe()
    }

    /// Broadcast one message to every subscriber.
    pub fn send(&self, message: TabMessage) -> Result<()> {
        self.sender
            .send(message)
            .map(|_| ())
            .map_err(|_| TabError::ChannelClosed(self.name.clone()))
    }

    /// Number of live receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
