//! Process-wide broadcast of authorization loss.
//!
//! The HTTP layer publishes on this bus whenever a request made on behalf of a
//! signed-in user is rejected (401/403). Route guards and the session
//! coordinator subscribe and force a sign-out. Each signal carries only its
//! position in the bus's publish sequence, so a subscriber can tell signals
//! raised before a given point from later ones. Nothing is persisted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

const DEFAULT_CAPACITY: usize = 16;

/// Broadcast when an authenticated request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Unauthorized {
    /// 1 for the first signal on a bus, increasing by one per publish.
    pub sequence: u64,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
}

pub type BusResult<T> = Result<T, BusError>;

#[derive(Debug, Clone)]
pub struct UnauthorizedBus {
    sender: broadcast::Sender<Unauthorized>,
    published: Arc<AtomicU64>,
}

impl Default for UnauthorizedBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl UnauthorizedBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Bus shared by everything in the process that does not inject its own.
    pub fn global() -> &'static UnauthorizedBus {
        static GLOBAL: OnceLock<UnauthorizedBus> = OnceLock::new();
        GLOBAL.get_or_init(UnauthorizedBus::new)
    }

    /// Raises the signal. Returns how many subscribers were reached; having
    /// none is not an error.
    pub fn publish(&self) -> usize {
        let sequence = self.published.fetch_add(1, Ordering::SeqCst) + 1;
        match self.sender.send(Unauthorized { sequence }) {
            Ok(reached) => {
                tracing::debug!(target: "beach::auth_bus", sequence, reached, "unauthorized signal published");
                reached
            }
            Err(_) => {
                tracing::debug!(target: "beach::auth_bus", sequence, "unauthorized signal published with no subscribers");
                0
            }
        }
    }

    /// Sequence of the most recent signal, 0 if none was ever published.
    pub fn last_sequence(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            published: self.published.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Receiving side of the bus. Bursts of signals (several requests failing at
/// once) are delivered as a single signal carrying the newest sequence.
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<Unauthorized>,
    published: Arc<AtomicU64>,
}

impl Subscription {
    pub async fn recv(&mut self) -> BusResult<Unauthorized> {
        match self.receiver.recv().await {
            Ok(signal) => Ok(self.drain(signal)),
            Err(RecvError::Lagged(missed)) => {
                tracing::debug!(target: "beach::auth_bus", missed, "subscriber lagged; coalescing signals");
                Ok(self.drain(self.lagged_signal()))
            }
            Err(RecvError::Closed) => Err(BusError::Closed),
        }
    }

    /// Non-blocking poll; coalesces everything pending into one signal.
    pub fn try_recv(&mut self) -> Option<Unauthorized> {
        match self.receiver.try_recv() {
            Ok(signal) => Some(self.drain(signal)),
            Err(TryRecvError::Lagged(_)) => Some(self.drain(self.lagged_signal())),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }

    // Dropped signals are at least as new as whatever is still buffered.
    fn lagged_signal(&self) -> Unauthorized {
        Unauthorized {
            sequence: self.published.load(Ordering::SeqCst),
        }
    }

    fn drain(&mut self, mut latest: Unauthorized) -> Unauthorized {
        loop {
            match self.receiver.try_recv() {
                Ok(signal) => latest = latest.max(signal),
                Err(TryRecvError::Lagged(_)) => latest = latest.max(self.lagged_signal()),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return latest,
            }
        }
    }
}
