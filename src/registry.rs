use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::error::{CloseReason, RegistryError};
use crate::id::ConnId;
use crate::lifecycle::Lifecycle;
use crate::mailbox::MailboxTx;

const REQUEST_QUEUE: usize = 128;

/// What the registry knows about a live connection.
#[derive(Clone)]
pub struct Member {
    pub id: ConnId,
    pub name: String,
    pub mailbox: MailboxTx,
    pub lifecycle: Lifecycle,
}

/// Immutable, join-ordered view of the members at one instant.
pub type Snapshot = Arc<[Member]>;

enum Request {
    Register {
        member: Member,
        reply: oneshot::Sender<Result<(), RegistryError>>,
    },
    Unregister {
        id: ConnId,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<Snapshot>,
    },
}

/// Handle to the registry task, which owns the member list exclusively.
///
/// Every operation is a request answered by that single task, so a snapshot
/// can never see a half-applied register or unregister.
#[derive(Clone)]
pub struct Registry {
    tx: mpsc::Sender<Request>,
}

impl Registry {
    /// Start the owning task. It stops once every handle is dropped.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE);
        tokio::spawn(run(rx));
        Self { tx }
    }

    pub async fn register(&self, member: Member) -> Result<(), RegistryError> {
        self.request(|reply| Request::Register { member, reply })
            .await?
    }

    /// Idempotent; `false` if the id was not present.
    pub async fn unregister(&self, id: ConnId) -> bool {
        self.request(|reply| Request::Unregister { id, reply })
            .await
            .unwrap_or(false)
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.request(|reply| Request::Snapshot { reply })
            .await
            .unwrap_or_else(|_| Arc::from(Vec::new()))
    }

    pub async fn len(&self) -> usize {
        self.snapshot().await.len()
    }

    /// Force every current member into `Closing`. Returns how many were
    /// still open.
    pub async fn close_all(&self, reason: CloseReason) -> usize {
        self.snapshot()
            .await
            .iter()
            .filter(|m| m.lifecycle.close(reason.clone()))
            .count()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| RegistryError::Stopped)?;

        rx.await.map_err(|_| RegistryError::Stopped)
    }
}

async fn run(mut rx: mpsc::Receiver<Request>) {
    let mut members: Vec<Member> = Vec::new();
    // rebuilt lazily after a membership change
    let mut cached: Option<Snapshot> = None;

    while let Some(req) = rx.recv().await {
        match req {
            Request::Register { member, reply } => {
                let result = if members.iter().any(|m| m.id == member.id) {
                    error!(conn_id = %member.id, "duplicate connection id, registration rejected");
                    Err(RegistryError::DuplicateId(member.id))
                } else {
                    debug!(conn_id = %member.id, name = %member.name, members = members.len() + 1, "registered");
                    members.push(member);
                    cached = None;
                    Ok(())
                };
                let _ = reply.send(result);
            }

            Request::Unregister { id, reply } => {
                let before = members.len();
                members.retain(|m| m.id != id);
                let removed = members.len() != before;
                if removed {
                    debug!(conn_id = %id, members = members.len(), "unregistered");
                    cached = None;
                }
                let _ = reply.send(removed);
            }

            Request::Snapshot { reply } => {
                let snap = cached
                    .get_or_insert_with(|| Arc::from(members.clone()))
                    .clone();
                let _ = reply.send(snap);
            }
        }
    }

    debug!("registry stopped");
}
