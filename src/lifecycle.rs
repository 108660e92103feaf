use std::sync::{
    Arc, OnceLock,
    atomic::{AtomicU8, Ordering},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::CloseReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum State {
    Handshaking = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl State {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => State::Handshaking,
            1 => State::Active,
            2 => State::Closing,
            _ => State::Closed,
        }
    }
}

/// Shared lifecycle of one connection.
///
/// Any holder may request a close: the connection's own reader and sender
/// tasks, the router evicting a slow consumer, or the registry on shutdown.
/// Only the first request wins; it records the reason and fires the quit
/// token both tasks wait on.
#[derive(Clone)]
pub struct Lifecycle {
    inner: Arc<Inner>,
}

struct Inner {
    state: AtomicU8,
    reason: OnceLock<CloseReason>,
    quit: CancellationToken,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(State::Handshaking as u8),
                reason: OnceLock::new(),
                quit: CancellationToken::new(),
            }),
        }
    }

    pub fn state(&self) -> State {
        State::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == State::Active
    }

    /// `Handshaking -> Active`. Fails if a close already won.
    pub fn activate(&self) -> bool {
        self.inner
            .state
            .compare_exchange(
                State::Handshaking as u8,
                State::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move into `Closing`. Returns `true` only for the call that did it.
    pub fn close(&self, reason: CloseReason) -> bool {
        let mut current = self.inner.state.load(Ordering::Acquire);
        loop {
            if current >= State::Closing as u8 {
                return false;
            }
            match self.inner.state.compare_exchange(
                current,
                State::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(seen) => current = seen,
            }
        }

        debug!(%reason, "closing");
        let _ = self.inner.reason.set(reason);
        self.inner.quit.cancel();
        true
    }

    /// `Closing -> Closed`, once teardown has released everything.
    pub fn finish(&self) {
        self.inner.state.store(State::Closed as u8, Ordering::Release);
    }

    pub fn reason(&self) -> Option<&CloseReason> {
        self.inner.reason.get()
    }

    /// Resolves once a close has been requested.
    pub async fn closing(&self) {
        self.inner.quit.cancelled().await
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
