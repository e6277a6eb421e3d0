//! Per-connection channel routing
//!
//! The russh callbacks run on the connection's task, so every operation
//! here returns immediately: requests are queued with `try_send` and a full
//! or vanished handler is reported back instead of awaited. Only the reply
//! to a queued request is awaited, by the callback that queued it.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use keel_protocol::ChannelKind;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::bridge::{Origin, Teardown};
use crate::session::Routed;

/// Requests buffered per session channel
pub const REQUEST_QUEUE: usize = 32;

/// Why a channel open was rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Refusal {
    #[error("unknown channel type")]
    UnknownType,

    #[error("too many open channels (limit {limit})")]
    ChannelLimit { limit: usize },
}

/// Outcome of routing one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Not a session channel; requests are ignored
    NoRoute,
    /// The handler is not keeping up
    Full,
    /// The handler already finished
    Closed,
}

enum Route {
    Session(mpsc::Sender<Routed>),
    Tunnel(Teardown),
}

/// Open channels of one connection
pub struct Dispatcher<K> {
    routes: HashMap<K, Route>,
    limit: Option<usize>,
}

impl<K: Eq + Hash + Copy + Debug> Dispatcher<K> {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            routes: HashMap::new(),
            limit,
        }
    }

    /// Whether a channel of `kind` may be opened now
    pub fn check(&self, kind: ChannelKind) -> Result<(), Refusal> {
        if kind == ChannelKind::Unknown {
            return Err(Refusal::UnknownType);
        }
        match self.limit {
            Some(limit) if self.routes.len() >= limit => Err(Refusal::ChannelLimit { limit }),
            _ => Ok(()),
        }
    }

    /// Route a new session channel; the receiver feeds its handler
    pub fn register_session(&mut self, key: K) -> Result<mpsc::Receiver<Routed>, Refusal> {
        self.check(ChannelKind::Session)?;
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE);
        self.routes.insert(key, Route::Session(tx));
        Ok(rx)
    }

    pub fn register_tunnel(&mut self, key: K, teardown: Teardown) -> Result<(), Refusal> {
        self.check(ChannelKind::DirectTcpip)?;
        self.routes.insert(key, Route::Tunnel(teardown));
        Ok(())
    }

    pub fn deliver(&self, key: K, request: Routed) -> Delivery {
        match self.routes.get(&key) {
            Some(Route::Session(tx)) => match tx.try_send(request) {
                Ok(()) => Delivery::Queued,
                Err(mpsc::error::TrySendError::Full(_)) => Delivery::Full,
                Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
            },
            Some(Route::Tunnel(_)) | None => Delivery::NoRoute,
        }
    }

    /// Forget a channel the client closed; its handler sees the close
    pub fn close(&mut self, key: K) -> bool {
        match self.routes.remove(&key) {
            Some(Route::Tunnel(teardown)) => {
                teardown.trigger(Origin::ChannelClosed);
                true
            }
            // dropping the sender ends the handler's request loop
            Some(Route::Session(_)) => true,
            None => {
                tracing::trace!("Close for unrouted channel {:?}", key);
                false
            }
        }
    }

    pub fn open_channels(&self) -> usize {
        self.routes.len()
    }
}
