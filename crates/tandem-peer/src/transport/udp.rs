//! UDP path listener
//!
//! One socket per path carries handshake records and media, told apart by
//! their first byte. The first peer to send a handshake record (or media, once
//! the handshake is established) is locked in; everything from other
//! addresses is ignored.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tandem_media::{Delivery, PacketClass, PacketSender, RtpPacket, classify, decode_rtp, encode_rtp};
use tokio::net::UdpSocket;
use tokio::sync::watch;

use super::{ListenerHandle, MediaLink, PacketRouter, PathListenerFactory, PathRequest, TransportError};
use crate::dtls::{Handshake, HandshakeFactory, Passthrough};

/// Binds one UDP socket per requested path
pub struct UdpListenerFactory {
    handshakes: Arc<dyn HandshakeFactory>,
    recv_buffer_size: usize,
}

impl UdpListenerFactory {
    pub fn new(handshakes: Arc<dyn HandshakeFactory>, recv_buffer_size: usize) -> Self {
        Self {
            handshakes,
            recv_buffer_size: recv_buffer_size.max(1),
        }
    }

    pub fn passthrough(recv_buffer_size: usize) -> Self {
        Self::new(Arc::new(Passthrough), recv_buffer_size)
    }
}

#[async_trait]
impl PathListenerFactory for UdpListenerFactory {
    async fn listen(&self, request: PathRequest) -> Result<ListenerHandle, TransportError> {
        let addr = SocketAddr::new(request.path.ip, 0);
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);

        let session = Arc::new(Mutex::new(PathSession {
            remote: None,
            handshake: self
                .handshakes
                .start(&request.context, &request.validation_secret),
        }));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = PathListener {
            socket: socket.clone(),
            session: session.clone(),
            router: request.router,
            senders: HashMap::new(),
        };
        tokio::spawn(listener.run(shutdown_rx, self.recv_buffer_size));

        tracing::info!(path = %request.path, %local_addr, "Path listener bound");

        let link = Arc::new(UdpLink { socket, session });
        Ok(ListenerHandle::new(local_addr.port(), shutdown_tx).with_link(link))
    }
}

struct PathSession {
    remote: Option<SocketAddr>,
    handshake: Box<dyn Handshake>,
}

impl PathSession {
    /// Whether `from` may talk on this path, locking it in if nobody is yet
    fn admit(&mut self, from: SocketAddr) -> bool {
        match self.remote {
            Some(remote) => remote == from,
            None => {
                tracing::info!(peer = %from, "Locked remote peer");
                self.remote = Some(from);
                true
            }
        }
    }
}

fn lock(session: &Mutex<PathSession>) -> std::sync::MutexGuard<'_, PathSession> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

struct PathListener {
    socket: Arc<UdpSocket>,
    session: Arc<Mutex<PathSession>>,
    router: Arc<dyn PacketRouter>,
    /// Streams already resolved on this path. Misses are never cached so a
    /// handler registered later still sees the source.
    senders: HashMap<u32, PacketSender>,
}

impl PathListener {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>, buffer_size: usize) {
        let mut buf = vec![0u8; buffer_size];

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, from)) => self.handle_datagram(&buf[..len], from).await,
                        Err(e) => {
                            tracing::warn!("Path listener read failed: {}", e);
                            break;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        for ssrc in self.senders.keys() {
            self.router.release(*ssrc);
        }
        tracing::debug!(streams = self.senders.len(), "Path listener stopped");
    }

    async fn handle_datagram(&mut self, datagram: &[u8], from: SocketAddr) {
        match classify(datagram) {
            PacketClass::Dtls => {
                let replies = {
                    let mut session = lock(&self.session);
                    if !session.admit(from) {
                        tracing::trace!(peer = %from, "Ignoring handshake from unlocked peer");
                        return;
                    }
                    match session.handshake.handle_record(datagram) {
                        Ok(replies) => replies,
                        Err(e) => {
                            tracing::warn!(peer = %from, "Handshake record rejected: {}", e);
                            return;
                        }
                    }
                };

                for reply in replies {
                    if let Err(e) = self.socket.send_to(&reply, from).await {
                        tracing::warn!(peer = %from, "Failed to send handshake record: {}", e);
                    }
                }
            }
            PacketClass::Rtp => {
                let plain = {
                    let mut session = lock(&self.session);
                    if !session.handshake.is_established() || !session.admit(from) {
                        tracing::trace!(peer = %from, "Dropping media before handshake");
                        return;
                    }
                    match session.handshake.unprotect(datagram) {
                        Ok(plain) => plain,
                        Err(e) => {
                            tracing::trace!("Failed to unprotect media: {}", e);
                            return;
                        }
                    }
                };

                match decode_rtp(&plain) {
                    Ok(packet) => self.deliver(packet),
                    Err(e) => tracing::trace!("Undecodable media packet: {}", e),
                }
            }
            // Connectivity checks and receiver reports are not handled here
            PacketClass::Stun | PacketClass::Rtcp => {}
            PacketClass::Unknown => {
                tracing::trace!(len = datagram.len(), "Unclassified datagram");
            }
        }
    }

    fn deliver(&mut self, packet: RtpPacket) {
        let ssrc = packet.header.ssrc;

        if !self.senders.contains_key(&ssrc) {
            match self.router.route(ssrc) {
                Some(sender) => {
                    self.senders.insert(ssrc, sender);
                }
                None => return,
            }
        }

        let Some(sender) = self.senders.get(&ssrc) else {
            return;
        };
        if sender.deliver(packet) == Delivery::Closed {
            tracing::debug!(ssrc, "Stream closed by application");
            self.senders.remove(&ssrc);
            self.router.release(ssrc);
        }
    }
}

struct UdpLink {
    socket: Arc<UdpSocket>,
    session: Arc<Mutex<PathSession>>,
}

#[async_trait]
impl MediaLink for UdpLink {
    fn is_established(&self) -> bool {
        let session = lock(&self.session);
        session.remote.is_some() && session.handshake.is_established()
    }

    async fn send(&self, packet: &RtpPacket) -> Result<(), TransportError> {
        let raw = encode_rtp(packet)?;
        let (remote, protected) = {
            let session = lock(&self.session);
            match session.remote {
                Some(remote) if session.handshake.is_established() => {
                    (remote, session.handshake.protect(&raw)?)
                }
                _ => return Err(TransportError::NotEstablished),
            }
        };

        self.socket.send_to(&protected, remote).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtls::{DtlsError, SecureContext};
    use crate::ice::LocalPath;
    use bytes::Bytes;
    use std::time::Duration;
    use tandem_media::{TrackStream, stream_channel};
    use tandem_protocol::TrackType;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    /// Opens one stream per source and forwards the read side to the test
    struct ChannelRouter {
        streams: mpsc::UnboundedSender<TrackStream>,
        routes: Mutex<HashMap<u32, PacketSender>>,
    }

    impl PacketRouter for ChannelRouter {
        fn route(&self, ssrc: u32) -> Option<PacketSender> {
            let mut routes = self.routes.lock().unwrap();
            if let Some(sender) = routes.get(&ssrc) {
                return Some(sender.clone());
            }
            let (sender, stream) = stream_channel(ssrc, TrackType::Vp8, 15);
            self.streams.send(stream).ok()?;
            routes.insert(ssrc, sender.clone());
            Some(sender)
        }

        fn release(&self, ssrc: u32) {
            self.routes.lock().unwrap().remove(&ssrc);
        }
    }

    /// Requires one handshake record before media flows
    struct OneRecord;

    struct OneRecordHandshake {
        established: bool,
    }

    impl HandshakeFactory for OneRecord {
        fn start(&self, _context: &SecureContext, _secret: &str) -> Box<dyn Handshake> {
            Box::new(OneRecordHandshake { established: false })
        }
    }

    impl Handshake for OneRecordHandshake {
        fn handle_record(&mut self, _record: &[u8]) -> Result<Vec<Bytes>, DtlsError> {
            self.established = true;
            Ok(vec![Bytes::from_static(&[20, 0xfe, 0xfd])])
        }

        fn is_established(&self) -> bool {
            self.established
        }

        fn protect(&self, packet: &[u8]) -> Result<Bytes, DtlsError> {
            Ok(Bytes::copy_from_slice(packet))
        }

        fn unprotect(&self, packet: &[u8]) -> Result<Bytes, DtlsError> {
            Ok(Bytes::copy_from_slice(packet))
        }
    }

    fn request(router: Arc<dyn PacketRouter>) -> PathRequest {
        PathRequest {
            path: LocalPath::new("lo", "127.0.0.1".parse().unwrap()),
            validation_secret: "secret".to_string(),
            context: Arc::new(SecureContext::generate().unwrap()),
            router,
        }
    }

    fn router() -> (Arc<ChannelRouter>, mpsc::UnboundedReceiver<TrackStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let router = Arc::new(ChannelRouter {
            streams: tx,
            routes: Mutex::new(HashMap::new()),
        });
        (router, rx)
    }

    fn rtp(ssrc: u32, sequence_number: u16) -> Bytes {
        encode_rtp(&RtpPacket {
            header: tandem_media::packet::RtpHeader {
                version: 2,
                payload_type: 96,
                sequence_number,
                ssrc,
                ..Default::default()
            },
            payload: Bytes::from_static(b"payload"),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_media_waits_for_handshake() {
        let (router, mut streams) = router();
        let factory = UdpListenerFactory::new(Arc::new(OneRecord), 1500);
        let handle = factory.listen(request(router)).await.unwrap();
        let target = SocketAddr::from(([127, 0, 0, 1], handle.local_port()));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&rtp(1, 0), target).await.unwrap();
        assert!(
            timeout(Duration::from_millis(100), streams.recv())
                .await
                .is_err()
        );

        client.send_to(&[22, 0xfe, 0xfd, 0], target).await.unwrap();
        let mut reply = [0u8; 16];
        let (len, _) = timeout(Duration::from_secs(2), client.recv_from(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&reply[..len], &[20, 0xfe, 0xfd]);

        client.send_to(&rtp(1, 1), target).await.unwrap();
        let mut stream = timeout(Duration::from_secs(2), streams.recv())
            .await
            .unwrap()
            .unwrap();
        let packet = timeout(Duration::from_secs(2), stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet.header.sequence_number, 1);
        assert!(handle.link().unwrap().is_established());
    }

    #[tokio::test]
    async fn test_shutdown_ends_streams() {
        let (router, mut streams) = router();
        let factory = UdpListenerFactory::passthrough(1500);
        let handle = factory.listen(request(router.clone())).await.unwrap();
        let target = SocketAddr::from(([127, 0, 0, 1], handle.local_port()));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&rtp(7, 0), target).await.unwrap();
        let mut stream = timeout(Duration::from_secs(2), streams.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(stream.recv().await.is_some());

        handle.shutdown();
        let ended = timeout(Duration::from_secs(2), stream.recv()).await.unwrap();
        assert!(ended.is_none());
        assert!(router.routes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_link_requires_locked_peer() {
        let (router, _streams) = router();
        let factory = UdpListenerFactory::passthrough(1500);
        let handle = factory.listen(request(router)).await.unwrap();

        let link = handle.link().unwrap().clone();
        assert!(!link.is_established());
        let packet = decode_rtp(&rtp(3, 0)).unwrap();
        assert!(matches!(
            link.send(&packet).await,
            Err(TransportError::NotEstablished)
        ));
    }
}
