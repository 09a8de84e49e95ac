//! Shared fakes for peer connection tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use tandem_media::RtpPacket;
use tandem_media::packet::RtpHeader;
use tandem_peer::credentials::RandomSource;
use tandem_peer::ice::{LocalPath, PathEnumerator};
use tandem_peer::transport::{
    ListenerHandle, PacketRouter, PathListenerFactory, PathRequest, TransportError,
};
use tandem_peer::{Config, PeerConnection};
use tokio::sync::watch;

pub fn path(index: u8) -> LocalPath {
    LocalPath::new(format!("eth{index}"), IpAddr::from([10, 0, 0, index + 1]))
}

/// Enumerator returning a fixed list, or a fixed error
pub struct FixedPaths {
    paths: Vec<LocalPath>,
    fail: bool,
}

impl FixedPaths {
    pub fn new(paths: Vec<LocalPath>) -> Self {
        Self { paths, fail: false }
    }

    pub fn failing() -> Self {
        Self {
            paths: Vec::new(),
            fail: true,
        }
    }
}

impl PathEnumerator for FixedPaths {
    fn enumerate(&self) -> io::Result<Vec<LocalPath>> {
        if self.fail {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "no access"));
        }
        Ok(self.paths.clone())
    }
}

/// Listener factory with a scripted outcome per address: `Some(port)` binds,
/// `None` fails. Records every request and keeps a shutdown observer per
/// bound listener.
#[derive(Default)]
pub struct FakeListeners {
    outcomes: Mutex<HashMap<IpAddr, Option<u16>>>,
    requests: Mutex<Vec<PathRequest>>,
    shutdowns: Mutex<Vec<watch::Receiver<bool>>>,
}

impl FakeListeners {
    pub fn new(outcomes: impl IntoIterator<Item = (LocalPath, Option<u16>)>) -> Arc<Self> {
        let listeners = Self::default();
        for (path, outcome) in outcomes {
            listeners.set_outcome(&path, outcome);
        }
        Arc::new(listeners)
    }

    pub fn set_outcome(&self, path: &LocalPath, outcome: Option<u16>) {
        self.outcomes.lock().unwrap().insert(path.ip, outcome);
    }

    pub fn requests(&self) -> Vec<PathRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Router handed to the first bound listener
    pub fn router(&self) -> Arc<dyn PacketRouter> {
        self.requests
            .lock()
            .unwrap()
            .first()
            .expect("no listener was requested")
            .router
            .clone()
    }

    pub fn all_shut_down(&self) -> bool {
        self.shutdowns.lock().unwrap().iter().all(|rx| *rx.borrow())
    }

    pub fn bound_count(&self) -> usize {
        self.shutdowns.lock().unwrap().len()
    }
}

#[async_trait]
impl PathListenerFactory for FakeListeners {
    async fn listen(&self, request: PathRequest) -> Result<ListenerHandle, TransportError> {
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .get(&request.path.ip)
            .copied()
            .flatten();
        let ip = request.path.ip;
        self.requests.lock().unwrap().push(request);

        match outcome {
            Some(port) => {
                let (tx, rx) = watch::channel(false);
                self.shutdowns.lock().unwrap().push(rx);
                Ok(ListenerHandle::new(port, tx))
            }
            None => Err(TransportError::Bind {
                addr: SocketAddr::new(ip, 0),
                source: io::Error::new(io::ErrorKind::AddrInUse, "address in use"),
            }),
        }
    }
}

/// Connection over the given fakes with a seeded random source
pub fn peer(config: Config, paths: Vec<LocalPath>, listeners: Arc<FakeListeners>) -> PeerConnection {
    PeerConnection::builder(config)
        .path_enumerator(FixedPaths::new(paths))
        .shared_listener_factory(listeners)
        .random_source(RandomSource::seeded(42))
        .build()
}

pub fn rtp(ssrc: u32, sequence_number: u16) -> RtpPacket {
    RtpPacket {
        header: RtpHeader {
            version: 2,
            payload_type: 96,
            sequence_number,
            timestamp: sequence_number as u32 * 3000,
            ssrc,
            ..Default::default()
        },
        payload: Bytes::from_static(b"frame"),
    }
}
