//! Peer connection
//!
//! Owns one session identity (credentials plus secure-transport context), the
//! path listeners opened for it and the routing of inbound streams to the
//! application. Initiation is a one-shot transition guarded by a single async
//! lock, so concurrent `create_offer` calls resolve to one winner.

use bytes::Bytes;
use futures_util::future::join_all;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tandem_media::{Packetizer, RouteStats, TrackStream};
use tandem_protocol::{Candidate, MediaSection, SessionDescription, SessionDescriptionBuilder, TrackType};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::router::{NegotiatedClassifier, StreamRouter, track_handler};
use crate::config::{BindPolicy, Config};
use crate::credentials::{RandomSource, SessionCredentials};
use crate::dtls::SecureContext;
use crate::error::{PathBindFailure, PeerError, Result};
use crate::ice::{HostInterfaces, LocalPath, PathEnumerator, StaticPaths};
use crate::transport::{
    ListenerHandle, MediaLink, PacketRouter, PathListenerFactory, PathRequest, UdpListenerFactory,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    /// Paths are being bound and the description assembled
    Offering,
    /// Local description produced
    Ready,
    Closed,
}

/// Result of a successful initiation
#[derive(Debug, Clone)]
pub struct Offer {
    pub description: SessionDescription,
    /// Paths that were enumerated but could not be bound
    pub failures: Vec<PathBindFailure>,
}

impl Offer {
    /// Session description text
    pub fn sdp(&self) -> String {
        self.description.to_string()
    }

    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Identity and listeners of the one initiated session
struct Session {
    credentials: SessionCredentials,
    context: Arc<SecureContext>,
    description: SessionDescription,
    listeners: Vec<ListenerHandle>,
}

#[derive(Debug, Clone, Copy)]
struct LocalTrack {
    ssrc: u32,
    track_type: TrackType,
}

type Links = Arc<RwLock<Vec<Arc<dyn MediaLink>>>>;

pub struct PeerConnection {
    id: Uuid,
    config: Config,
    enumerator: Arc<dyn PathEnumerator>,
    listener_factory: Arc<dyn PathListenerFactory>,
    random: Arc<RandomSource>,
    session: tokio::sync::Mutex<Option<Session>>,
    remote_description: Mutex<Option<SessionDescription>>,
    state: watch::Sender<PeerState>,
    router: Arc<StreamRouter>,
    tracks: Arc<Mutex<Vec<LocalTrack>>>,
    links: Links,
    unsent: Arc<AtomicU64>,
}

impl PeerConnection {
    /// Connection over host interfaces (or `bind_addresses`) and UDP listeners
    pub fn new(config: Config) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: Config) -> PeerConnectionBuilder {
        PeerConnectionBuilder {
            config,
            enumerator: None,
            listener_factory: None,
            random: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> PeerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PeerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: PeerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::info!(peer = %self.id, ?previous, ?state, "Peer state changed");
        }
    }

    /// Register the handler for inbound streams. Sources first seen while no
    /// handler is registered are discarded, not buffered.
    pub fn on_track<F, Fut>(&self, handler: F)
    where
        F: Fn(TrackType, TrackStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.router.set_handler(track_handler(handler));
    }

    /// Initiate the session: generate credentials and context, bind one
    /// listener per enumerated path and assemble the local description.
    ///
    /// Succeeds at most once per connection. A failed attempt leaves nothing
    /// behind and may be retried.
    pub async fn create_offer(&self) -> Result<Offer> {
        let mut session = self.session.lock().await;
        if self.state() == PeerState::Closed {
            return Err(PeerError::Closed);
        }
        if session.is_some() {
            return Err(PeerError::Reinitiation);
        }

        self.set_state(PeerState::Offering);
        match self.initiate().await {
            Ok((initiated, failures)) => {
                let description = initiated.description.clone();
                *self.links.write().unwrap_or_else(PoisonError::into_inner) = initiated
                    .listeners
                    .iter()
                    .filter_map(|listener| listener.link().cloned())
                    .collect();
                *session = Some(initiated);
                self.set_state(PeerState::Ready);

                Ok(Offer {
                    description,
                    failures,
                })
            }
            Err(e) => {
                tracing::warn!(peer = %self.id, "Session initiation failed: {}", e);
                self.set_state(PeerState::Idle);
                Err(e)
            }
        }
    }

    async fn initiate(&self) -> Result<(Session, Vec<PathBindFailure>)> {
        let credentials = self.random.credentials();
        let context = Arc::new(SecureContext::generate()?);
        let paths = self.enumerator.enumerate().map_err(PeerError::Enumeration)?;
        let priority_base = self.random.priority_base(paths.len());

        tracing::debug!(peer = %self.id, paths = paths.len(), "Binding path listeners");

        let router: Arc<dyn PacketRouter> = self.router.clone();
        let attempts = paths.into_iter().map(|path| {
            let request = PathRequest {
                path: path.clone(),
                validation_secret: credentials.pwd.clone(),
                context: context.clone(),
                router: router.clone(),
            };
            async move { (path, self.listener_factory.listen(request).await) }
        });

        let mut bound: Vec<(usize, LocalPath, ListenerHandle)> = Vec::new();
        let mut failures = Vec::new();
        for (index, (path, result)) in join_all(attempts).await.into_iter().enumerate() {
            match result {
                Ok(listener) => bound.push((index, path, listener)),
                Err(e) => {
                    tracing::warn!(peer = %self.id, %path, "Path bind failed: {}", e);
                    failures.push(PathBindFailure {
                        index,
                        path,
                        reason: e.to_string(),
                    });
                }
            }
        }

        if self.config.bind_policy == BindPolicy::AbortOnFirstFailure && !failures.is_empty() {
            // Dropping the handles stops the listeners that did bind
            drop(bound);
            return Err(PeerError::PathBind(failures.swap_remove(0)));
        }
        if bound.is_empty() {
            return Err(PeerError::NoPathsAvailable { failures });
        }

        let candidates: Vec<Candidate> = bound
            .iter()
            .enumerate()
            .map(|(rank, (index, path, listener))| Candidate {
                foundation: *index,
                priority: candidate_priority(priority_base, rank),
                address: path.ip,
                port: listener.local_port(),
            })
            .collect();

        let mut builder = SessionDescriptionBuilder::new(self.random.session_id())
            .ice_credentials(&credentials.ufrag, &credentials.pwd)
            .fingerprint(context.fingerprint().clone())
            .candidates(candidates);
        for section in media_sections(&self.tracks.lock().unwrap_or_else(PoisonError::into_inner)) {
            builder = builder.media(section);
        }
        let description = builder.build();

        tracing::info!(
            peer = %self.id,
            candidates = description.candidates.len(),
            failed = failures.len(),
            "Local description ready"
        );

        Ok((
            Session {
                credentials,
                context,
                description,
                listeners: bound.into_iter().map(|(_, _, listener)| listener).collect(),
            },
            failures,
        ))
    }

    /// Accept the remote peer's description. Sources it announces are
    /// classified by their negotiated codec from then on.
    pub fn set_remote_description(&self, sdp: &str) -> Result<()> {
        if self.state() == PeerState::Closed {
            return Err(PeerError::Closed);
        }

        let mut remote = self
            .remote_description
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if remote.is_some() {
            return Err(PeerError::RemoteDescriptionAlreadySet);
        }

        let description = SessionDescription::parse(sdp)?;
        let classifier = NegotiatedClassifier::from_description(&description);
        tracing::info!(
            peer = %self.id,
            announced = classifier.len(),
            candidates = description.candidates.len(),
            "Remote description set"
        );

        self.router.set_classifier(Arc::new(classifier));
        *remote = Some(description);
        Ok(())
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote_description
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The description produced by the successful initiation
    pub async fn local_description(&self) -> Option<SessionDescription> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| session.description.clone())
    }

    pub async fn local_credentials(&self) -> Option<SessionCredentials> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| session.credentials.clone())
    }

    pub async fn secure_context(&self) -> Option<Arc<SecureContext>> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| session.context.clone())
    }

    /// Add an outbound track. Payloads written to the returned channel are
    /// packetized and sent to the first path with an established peer;
    /// dropping every sender ends the track.
    pub async fn add_track(&self, track_type: TrackType) -> Result<mpsc::Sender<Bytes>> {
        if self.state() == PeerState::Closed {
            return Err(PeerError::Closed);
        }

        let ssrc = self.random.ssrc();
        let packetizer = Packetizer::new(ssrc, track_type)
            .with_start(self.random.sequence_start(), self.random.timestamp_start());
        let (tx, rx) = mpsc::channel(self.config.track_capacity.max(1));

        self.tracks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(LocalTrack { ssrc, track_type });
        tracing::info!(peer = %self.id, ssrc, %track_type, "Outbound track added");

        tokio::spawn(run_track(
            rx,
            packetizer,
            self.links.clone(),
            self.tracks.clone(),
            self.unsent.clone(),
        ));

        Ok(tx)
    }

    /// Release every listener and route. Idempotent.
    pub async fn close(&self) {
        let mut session = self.session.lock().await;
        if self.state() == PeerState::Closed {
            return;
        }

        if let Some(session) = session.as_mut() {
            for listener in session.listeners.drain(..) {
                listener.shutdown();
            }
        }
        self.links
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.router.clear();
        self.set_state(PeerState::Closed);
    }

    /// Per-route delivery counters
    pub fn route_stats(&self) -> Vec<RouteStats> {
        self.router.stats()
    }

    /// Inbound packets dropped on full stream channels this session, ended
    /// routes included
    pub fn dropped_packets(&self) -> u64 {
        self.route_stats().iter().map(|s| s.dropped).sum()
    }

    /// Outbound payloads discarded for lack of an established path
    pub fn unsent_packets(&self) -> u64 {
        self.unsent.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Media sections advertising the outbound tracks, one per media kind
/// Priority of the bound path at `rank`, counting down from `base`, never zero
fn candidate_priority(base: u32, rank: usize) -> u32 {
    let rank = u32::try_from(rank).unwrap_or(u32::MAX);
    base.saturating_sub(rank).max(1)
}

fn media_sections(tracks: &[LocalTrack]) -> Vec<MediaSection> {
    let mut sections: Vec<MediaSection> = Vec::new();

    for track in tracks {
        let kind = track.track_type.kind();
        let index = match sections.iter().position(|s| s.kind == kind) {
            Some(index) => index,
            None => {
                sections.push(MediaSection::new(kind, sections.len().to_string()));
                sections.len() - 1
            }
        };

        let section = &mut sections[index];
        if !section.codecs.contains(&track.track_type) {
            section.codecs.push(track.track_type);
        }
        section.ssrcs.push(track.ssrc);
    }

    sections
}

async fn run_track(
    mut payloads: mpsc::Receiver<Bytes>,
    mut packetizer: Packetizer,
    links: Links,
    tracks: Arc<Mutex<Vec<LocalTrack>>>,
    unsent: Arc<AtomicU64>,
) {
    let ssrc = packetizer.ssrc();

    while let Some(payload) = payloads.recv().await {
        let packet = packetizer.packetize(payload);
        let link = links
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|link| link.is_established())
            .cloned();

        let sent = match link {
            Some(link) => match link.send(&packet).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::trace!(ssrc, "Outbound packet not sent: {}", e);
                    false
                }
            },
            None => false,
        };
        if !sent {
            unsent.fetch_add(1, Ordering::Relaxed);
        }
    }

    tracks
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .retain(|track| track.ssrc != ssrc);
    tracing::debug!(ssrc, "Outbound track ended");
}

pub struct PeerConnectionBuilder {
    config: Config,
    enumerator: Option<Arc<dyn PathEnumerator>>,
    listener_factory: Option<Arc<dyn PathListenerFactory>>,
    random: Option<RandomSource>,
}

impl PeerConnectionBuilder {
    pub fn path_enumerator(mut self, enumerator: impl PathEnumerator + 'static) -> Self {
        self.enumerator = Some(Arc::new(enumerator));
        self
    }

    pub fn listener_factory(mut self, factory: impl PathListenerFactory + 'static) -> Self {
        self.listener_factory = Some(Arc::new(factory));
        self
    }

    pub fn shared_listener_factory(mut self, factory: Arc<dyn PathListenerFactory>) -> Self {
        self.listener_factory = Some(factory);
        self
    }

    pub fn random_source(mut self, random: RandomSource) -> Self {
        self.random = Some(random);
        self
    }

    pub fn build(self) -> PeerConnection {
        let config = self.config;
        let enumerator = self.enumerator.unwrap_or_else(|| {
            if config.bind_addresses.is_empty() {
                Arc::new(HostInterfaces::from_config(&config))
            } else {
                Arc::new(StaticPaths::from_addresses(
                    config.bind_addresses.iter().copied(),
                ))
            }
        });
        let listener_factory = self.listener_factory.unwrap_or_else(|| {
            Arc::new(UdpListenerFactory::passthrough(config.recv_buffer_size))
        });
        let (state, _) = watch::channel(PeerState::Idle);

        PeerConnection {
            id: Uuid::new_v4(),
            router: Arc::new(StreamRouter::new(config.stream_capacity)),
            config,
            enumerator,
            listener_factory,
            random: Arc::new(self.random.unwrap_or_default()),
            session: tokio::sync::Mutex::new(None),
            remote_description: Mutex::new(None),
            state,
            tracks: Arc::new(Mutex::new(Vec::new())),
            links: Arc::new(RwLock::new(Vec::new())),
            unsent: Arc::new(AtomicU64::new(0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_priority_counts_down_without_underflow() {
        assert_eq!(candidate_priority(900, 0), 900);
        assert_eq!(candidate_priority(900, 2), 898);
        assert_eq!(candidate_priority(65535, 65534), 1);
        assert_eq!(candidate_priority(65535, 65535), 1);
        assert_eq!(candidate_priority(65535, 70000), 1);
    }

    #[test]
    fn test_media_sections_group_by_kind() {
        let sections = media_sections(&[
            LocalTrack {
                ssrc: 1,
                track_type: TrackType::Opus,
            },
            LocalTrack {
                ssrc: 2,
                track_type: TrackType::Vp8,
            },
            LocalTrack {
                ssrc: 3,
                track_type: TrackType::Opus,
            },
        ]);

        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].mid, "0");
        assert_eq!(sections[0].codecs, vec![TrackType::Opus]);
        assert_eq!(sections[0].ssrcs, vec![1, 3]);
        assert_eq!(sections[1].mid, "1");
        assert_eq!(sections[1].codecs, vec![TrackType::Vp8]);
    }

    #[test]
    fn test_no_tracks_no_sections() {
        assert!(media_sections(&[]).is_empty());
    }

    #[test]
    fn test_offer_partial_flag() {
        let offer = Offer {
            description: SessionDescriptionBuilder::new(1).build(),
            failures: Vec::new(),
        };
        assert!(!offer.is_partial());
        assert!(offer.sdp().starts_with("v=0\r\n"));
    }
}
