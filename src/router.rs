use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::CloseReason;
use crate::mailbox::Undeliverable;
use crate::message::Message;
use crate::registry::Registry;

/// Outcome of one fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    pub delivered: usize,
    pub evicted: usize,
    pub skipped: usize,
}

/// Broadcast-to-all policy, sender included.
pub struct Router {
    registry: Registry,
    send_timeout: Duration,
}

/// Intake of the router task. Messages are dispatched one at a time in
/// arrival order, so every member sees the same relative order.
#[derive(Clone)]
pub struct RouterHandle {
    tx: mpsc::Sender<Message>,
}

impl Router {
    pub fn new(registry: Registry, send_timeout: Duration) -> Self {
        Self {
            registry,
            send_timeout,
        }
    }

    pub fn spawn(self, capacity: usize) -> RouterHandle {
        let (tx, rx) = mpsc::channel(capacity);
        tokio::spawn(self.run(rx));
        RouterHandle { tx }
    }

    async fn run(self, mut rx: mpsc::Receiver<Message>) {
        while let Some(msg) = rx.recv().await {
            self.dispatch(msg).await;
        }
        debug!("router stopped");
    }

    /// Copy `msg` into the mailbox of every active member of a fresh
    /// snapshot. A member whose mailbox stays full for `send_timeout` is
    /// evicted as a slow consumer; the rest of the broadcast carries on.
    pub async fn dispatch(&self, msg: Message) -> Dispatch {
        let members = self.registry.snapshot().await;
        let mut report = Dispatch::default();

        for member in members.iter() {
            if !member.lifecycle.is_active() {
                report.skipped += 1;
                continue;
            }

            match member.mailbox.deliver(msg.clone(), self.send_timeout).await {
                Ok(()) => report.delivered += 1,
                Err(Undeliverable::Full) => {
                    if member.lifecycle.close(CloseReason::SlowConsumer) {
                        warn!(conn_id = %member.id, name = %member.name, "mailbox full, evicting slow consumer");
                    }
                    report.evicted += 1;
                }
                Err(Undeliverable::Closed) => report.skipped += 1,
            }
        }

        debug!(
            sender = %msg.sender,
            delivered = report.delivered,
            evicted = report.evicted,
            skipped = report.skipped,
            queued_ms = msg.at.elapsed().map(|d| d.as_millis() as u64).unwrap_or(0),
            "dispatched"
        );
        report
    }
}

impl RouterHandle {
    /// Queue a message for broadcast; waits while the intake is full.
    /// `false` once the router has stopped.
    pub async fn submit(&self, msg: Message) -> bool {
        self.tx.send(msg).await.is_ok()
    }
}
