//! Path listeners
//!
//! A listener owns one bound local path. It runs the secure-transport
//! handshake with the first peer that reaches it and then hands each decoded
//! media packet to the stream for its source, obtained from a
//! [`PacketRouter`].

mod udp;

pub use udp::UdpListenerFactory;

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tandem_media::{MediaError, PacketSender, RtpPacket};
use thiserror::Error;
use tokio::sync::watch;

use crate::dtls::{DtlsError, SecureContext};
use crate::ice::LocalPath;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no established peer on this path")]
    NotEstablished,

    #[error("media error: {0}")]
    Media(#[from] MediaError),

    #[error("secure transport error: {0}")]
    Dtls(#[from] DtlsError),
}

/// Source-identifier routing, as seen from a listener
pub trait PacketRouter: Send + Sync {
    /// Stream for `ssrc`, created on first sight. `None` means the packet
    /// must be discarded.
    fn route(&self, ssrc: u32) -> Option<PacketSender>;

    /// The stream for `ssrc` has ended; later packets are discarded
    fn release(&self, ssrc: u32);
}

/// Everything a listener needs for one path
#[derive(Clone)]
pub struct PathRequest {
    pub path: LocalPath,
    /// Session password, used to validate the handshake
    pub validation_secret: String,
    pub context: Arc<SecureContext>,
    pub router: Arc<dyn PacketRouter>,
}

#[async_trait]
pub trait PathListenerFactory: Send + Sync {
    /// Bind a listener on `request.path`. The listener keeps running until the
    /// returned handle is shut down or dropped.
    async fn listen(&self, request: PathRequest) -> Result<ListenerHandle, TransportError>;
}

/// Outbound side of a path, once a peer is locked
#[async_trait]
pub trait MediaLink: Send + Sync {
    fn is_established(&self) -> bool;

    async fn send(&self, packet: &RtpPacket) -> Result<(), TransportError>;
}

/// Owner's handle on a running listener
pub struct ListenerHandle {
    local_port: u16,
    shutdown: watch::Sender<bool>,
    link: Option<Arc<dyn MediaLink>>,
}

impl ListenerHandle {
    pub fn new(local_port: u16, shutdown: watch::Sender<bool>) -> Self {
        Self {
            local_port,
            shutdown,
            link: None,
        }
    }

    pub fn with_link(mut self, link: Arc<dyn MediaLink>) -> Self {
        self.link = Some(link);
        self
    }

    /// Port the listener is reachable on
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn link(&self) -> Option<&Arc<dyn MediaLink>> {
        self.link.as_ref()
    }

    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("local_port", &self.local_port)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dropping_handle_signals_shutdown() {
        let (tx, rx) = watch::channel(false);
        let handle = ListenerHandle::new(5000, tx);
        assert_eq!(handle.local_port(), 5000);
        assert!(!*rx.borrow());

        drop(handle);
        assert!(*rx.borrow());
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let (tx, rx) = watch::channel(false);
        let handle = ListenerHandle::new(5001, tx);
        handle.shutdown();
        handle.shutdown();
        assert!(handle.is_shut_down());
        assert!(*rx.borrow());
        assert!(handle.link().is_none());
    }
}
