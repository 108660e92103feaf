use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::SendTimeoutError};

use crate::message::Message;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Undeliverable {
    #[error("mailbox full")]
    Full,

    #[error("mailbox closed")]
    Closed,
}

/// Write side, held by the registry and used only by the router.
#[derive(Clone)]
pub struct MailboxTx {
    tx: mpsc::Sender<Message>,
}

/// Read side, owned by a connection's sender task.
pub struct MailboxRx {
    rx: mpsc::Receiver<Message>,
}

pub fn mailbox(capacity: usize) -> (MailboxTx, MailboxRx) {
    let (tx, rx) = mpsc::channel(capacity);
    (MailboxTx { tx }, MailboxRx { rx })
}

impl MailboxTx {
    /// Enqueue, waiting at most `wait` for space.
    pub async fn deliver(&self, msg: Message, wait: Duration) -> Result<(), Undeliverable> {
        match self.tx.send_timeout(msg, wait).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(Undeliverable::Full),
            Err(SendTimeoutError::Closed(_)) => Err(Undeliverable::Closed),
        }
    }
}

impl MailboxRx {
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Stop accepting; anything already queued can still be drained.
    pub fn close(&mut self) {
        self.rx.close();
    }
}
