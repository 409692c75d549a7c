use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::fmt;
use std::future::{poll_fn, Future};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, Sleep};

use crate::network::Transport;
use crate::utils::{P2PError, Result};

/// How long accepting pauses after the listener reports a non-transient
/// error such as descriptor exhaustion.
pub const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Handle for an accepted connection. Ids grow monotonically and are never
/// handed out twice in one process run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_raw(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Owns the listening socket and every accepted connection, and reports
/// which connections have bytes (or EOF) waiting.
///
/// Readiness comes from the tokio reactor, which is edge-triggered epoll or
/// kqueue underneath, so there is no highest-descriptor bookkeeping.
pub struct ConnectionMultiplexer {
    listener: TcpListener,
    connections: BTreeMap<ConnectionId, TcpStream>,
    next_id: u64,
    accept_backoff: Option<Pin<Box<Sleep>>>,
}

impl ConnectionMultiplexer {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = Transport::listen(addr).await?;
        Ok(Self::from_listener(listener))
    }

    pub fn from_listener(listener: TcpListener) -> Self {
        Self {
            listener,
            connections: BTreeMap::new(),
            next_id: 1,
            accept_backoff: None,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait until at least one managed connection is readable.
    ///
    /// New connections are accepted and registered along the way but are
    /// not part of the result. The result is sorted by id. Accept failures
    /// never end the wait: after a non-transient one the listener is left
    /// alone for `ACCEPT_BACKOFF` while existing connections keep being
    /// served.
    pub async fn await_ready(&mut self) -> Vec<ConnectionId> {
        poll_fn(|cx| self.poll_ready(cx)).await
    }

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Vec<ConnectionId>> {
        self.poll_accept(cx);

        let mut ready = Vec::new();
        for (id, stream) in &self.connections {
            match stream.poll_read_ready(cx) {
                Poll::Ready(Ok(())) => ready.push(*id),
                Poll::Ready(Err(e)) => {
                    // Let the caller's read surface the error for this
                    // connection alone.
                    debug!("Readiness error on {}: {}", id, e);
                    ready.push(*id);
                }
                Poll::Pending => {}
            }
        }

        if ready.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(ready)
        }
    }

    /// Drain pending accepts until the listener would block or starts a
    /// backoff. Either way a waker is registered before returning.
    fn poll_accept(&mut self, cx: &mut Context<'_>) {
        loop {
            if let Some(delay) = self.accept_backoff.as_mut() {
                if delay.as_mut().poll(cx).is_pending() {
                    return;
                }
                self.accept_backoff = None;
                debug!("Resuming accepts");
            }

            match self.listener.poll_accept(cx) {
                Poll::Ready(Ok((stream, addr))) => {
                    self.register(stream, addr);
                }
                Poll::Ready(Err(e)) if is_transient_accept_error(&e) => {
                    warn!("Dropped incoming connection during accept: {}", e);
                }
                Poll::Ready(Err(e)) => {
                    error!(
                        "Failed to accept connection: {} (pausing accepts for {:?})",
                        e, ACCEPT_BACKOFF
                    );
                    self.accept_backoff = Some(Box::pin(sleep(ACCEPT_BACKOFF)));
                }
                Poll::Pending => return,
            }
        }
    }

    /// True while accepting is paused after a listener error.
    pub fn accept_paused(&self) -> bool {
        self.accept_backoff.is_some()
    }

    fn register(&mut self, stream: TcpStream, addr: SocketAddr) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on {}: {}", id, e);
        }

        self.connections.insert(id, stream);
        info!("Accepted {} from {} ({} open)", id, addr, self.connections.len());
        id
    }

    /// Stop tracking `id` and close its socket. Returns false if it was not
    /// managed.
    pub fn release(&mut self, id: ConnectionId) -> bool {
        match self.connections.remove(&id) {
            Some(stream) => {
                drop(stream);
                info!("Released {} ({} open)", id, self.connections.len());
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Remote address as reported by the OS for this connection.
    pub fn peer_addr(&self, id: ConnectionId) -> Result<SocketAddr> {
        let stream = self
            .connections
            .get(&id)
            .ok_or_else(|| P2PError::AddressUnavailable(format!("{} is not open", id)))?;
        stream
            .peer_addr()
            .map_err(|e| P2PError::AddressUnavailable(format!("{}: {}", id, e)))
    }

    pub fn stream_mut(&mut self, id: ConnectionId) -> Option<&mut TcpStream> {
        self.connections.get_mut(&id)
    }
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
