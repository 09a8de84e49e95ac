//! Source-identifier routing
//!
//! Maps each stream source seen on the wire to exactly one delivery channel.
//! The first listener to see a new source creates the route; the application
//! handler then runs on its own task, so the listener's read loop never waits
//! on application code.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tandem_media::{PacketSender, RouteStats, TrackStream, stream_channel};
use tandem_protocol::{SessionDescription, TrackType};
use tokio::runtime::Handle;

use crate::transport::PacketRouter;

pub type TrackHandlerFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Application handler for a newly observed inbound stream
pub type OnTrackHdlrFn = dyn Fn(TrackType, TrackStream) -> TrackHandlerFuture + Send + Sync;

/// Box an async closure into a track handler
pub fn track_handler<F, Fut>(f: F) -> Arc<OnTrackHdlrFn>
where
    F: Fn(TrackType, TrackStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |track_type: TrackType, stream: TrackStream| {
        Box::pin(f(track_type, stream)) as TrackHandlerFuture
    })
}

/// Decides the media classification of a newly observed source
pub trait TrackClassifier: Send + Sync {
    fn classify(&self, ssrc: u32) -> TrackType;
}

/// Same classification for every source
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedClassifier(pub TrackType);

impl TrackClassifier for FixedClassifier {
    fn classify(&self, _ssrc: u32) -> TrackType {
        self.0
    }
}

/// Classification from the sources the remote description announced
#[derive(Debug, Clone, Default)]
pub struct NegotiatedClassifier {
    announced: HashMap<u32, TrackType>,
    fallback: TrackType,
}

impl NegotiatedClassifier {
    pub fn from_description(description: &SessionDescription) -> Self {
        let mut announced = HashMap::new();
        for (ssrc, track_type) in description.ssrc_track_types() {
            announced.entry(ssrc).or_insert(track_type);
        }

        Self {
            announced,
            fallback: TrackType::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.announced.len()
    }

    pub fn is_empty(&self) -> bool {
        self.announced.is_empty()
    }
}

impl TrackClassifier for NegotiatedClassifier {
    fn classify(&self, ssrc: u32) -> TrackType {
        self.announced.get(&ssrc).copied().unwrap_or(self.fallback)
    }
}

/// One entry per source seen this session. Ended routes stay as tombstones
/// holding their final counters, so the map is bounded by the number of
/// distinct sources the remote sends, and is dropped with the connection.
enum Route {
    Open(PacketSender),
    /// Ended by the application or by close; never reopened
    Closed(RouteStats),
}

impl Route {
    fn stats(&self) -> RouteStats {
        match self {
            Route::Open(sender) => sender.stats(),
            Route::Closed(stats) => *stats,
        }
    }

    fn end(&mut self) {
        if let Route::Open(sender) = self {
            let stats = sender.stats();
            *self = Route::Closed(stats);
        }
    }
}

pub struct StreamRouter {
    capacity: usize,
    handler: RwLock<Option<Arc<OnTrackHdlrFn>>>,
    classifier: RwLock<Arc<dyn TrackClassifier>>,
    routes: Mutex<HashMap<u32, Route>>,
    closed: AtomicBool,
}

impl StreamRouter {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            handler: RwLock::new(None),
            classifier: RwLock::new(Arc::new(FixedClassifier::default())),
            routes: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn set_handler(&self, handler: Arc<OnTrackHdlrFn>) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    pub fn has_handler(&self) -> bool {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Replace the classification step; existing routes keep their type
    pub fn set_classifier(&self, classifier: Arc<dyn TrackClassifier>) {
        *self.classifier.write().unwrap_or_else(PoisonError::into_inner) = classifier;
    }

    /// Number of routes still delivering
    pub fn open_routes(&self) -> usize {
        self.routes()
            .values()
            .filter(|route| matches!(route, Route::Open(_)))
            .count()
    }

    /// Number of routes ended and kept as tombstones
    pub fn ended_routes(&self) -> usize {
        self.routes()
            .values()
            .filter(|route| matches!(route, Route::Closed(_)))
            .count()
    }

    /// Delivery counters of every route this session, open or ended,
    /// ordered by source
    pub fn stats(&self) -> Vec<RouteStats> {
        let mut stats: Vec<RouteStats> = self.routes().values().map(Route::stats).collect();
        stats.sort_by_key(|s| s.ssrc);
        stats
    }

    /// End every route and refuse new ones. Counters are kept.
    pub fn clear(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.routes().values_mut().for_each(Route::end);
    }

    fn routes(&self) -> std::sync::MutexGuard<'_, HashMap<u32, Route>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PacketRouter for StreamRouter {
    fn route(&self, ssrc: u32) -> Option<PacketSender> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }

        let mut routes = self.routes();
        if let Some(route) = routes.get(&ssrc) {
            return match route {
                Route::Open(sender) => Some(sender.clone()),
                Route::Closed(_) => None,
            };
        }

        let handler = self
            .handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()?;
        let Ok(runtime) = Handle::try_current() else {
            tracing::warn!(ssrc, "No runtime to run the track handler on, discarding");
            return None;
        };

        let track_type = self
            .classifier
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .classify(ssrc);
        let (sender, stream) = stream_channel(ssrc, track_type, self.capacity);
        routes.insert(ssrc, Route::Open(sender.clone()));
        drop(routes);

        tracing::info!(ssrc, %track_type, "New inbound stream");
        runtime.spawn(async move { handler(track_type, stream).await });

        Some(sender)
    }

    fn release(&self, ssrc: u32) {
        if let Some(route) = self.routes().get_mut(&ssrc) {
            route.end();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tandem_media::{Delivery, RtpPacket};
    use tandem_protocol::{MediaKind, MediaSection, SessionDescriptionBuilder};
    use tokio::sync::mpsc;

    fn forwarding_router(
        capacity: usize,
    ) -> (
        StreamRouter,
        mpsc::UnboundedReceiver<(TrackType, TrackStream)>,
    ) {
        let router = StreamRouter::new(capacity);
        let (tx, rx) = mpsc::unbounded_channel();
        router.set_handler(track_handler(move |track_type, stream| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((track_type, stream));
            }
        }));
        (router, rx)
    }

    #[tokio::test]
    async fn test_same_source_reuses_route() {
        let (router, mut handled) = forwarding_router(15);

        let first = router.route(42).unwrap();
        let second = router.route(42).unwrap();
        assert_eq!(first.deliver(RtpPacket::default()), Delivery::Delivered);
        assert_eq!(second.deliver(RtpPacket::default()), Delivery::Delivered);

        let (track_type, mut stream) = handled.recv().await.unwrap();
        assert_eq!(track_type, TrackType::Vp8);
        assert!(stream.try_recv().is_some());
        assert!(stream.try_recv().is_some());

        tokio::task::yield_now().await;
        assert!(handled.try_recv().is_err());
        assert_eq!(router.open_routes(), 1);
    }

    #[tokio::test]
    async fn test_no_handler_keeps_no_state() {
        let router = StreamRouter::new(15);
        assert!(!router.has_handler());
        assert!(router.route(1).is_none());
        assert!(router.route(1).is_none());
        assert_eq!(router.open_routes(), 0);
        assert!(router.stats().is_empty());
    }

    #[tokio::test]
    async fn test_released_route_is_not_reopened() {
        let (router, _handled) = forwarding_router(15);
        assert!(router.route(9).is_some());

        router.release(9);
        assert!(router.route(9).is_none());
        assert_eq!(router.open_routes(), 0);
        assert_eq!(router.ended_routes(), 1);
    }

    #[tokio::test]
    async fn test_drop_count_survives_release() {
        let (router, mut handled) = forwarding_router(15);
        let sender = router.route(9).unwrap();
        for _ in 0..20 {
            sender.deliver(RtpPacket::default());
        }
        assert_eq!(router.stats()[0].dropped, 5);

        let (_, mut stream) = handled.recv().await.unwrap();
        stream.close();
        assert_eq!(sender.deliver(RtpPacket::default()), Delivery::Closed);
        router.release(9);
        router.release(9);

        assert_eq!(
            router.stats(),
            vec![RouteStats {
                ssrc: 9,
                delivered: 15,
                dropped: 5
            }]
        );
    }

    #[tokio::test]
    async fn test_clear_keeps_counters() {
        let (router, _handled) = forwarding_router(15);
        router.route(1).unwrap().deliver(RtpPacket::default());
        router.route(2).unwrap().deliver(RtpPacket::default());
        router.release(2);

        router.clear();
        assert_eq!(router.open_routes(), 0);
        assert_eq!(router.ended_routes(), 2);
        let delivered: Vec<_> = router.stats().iter().map(|s| (s.ssrc, s.delivered)).collect();
        assert_eq!(delivered, vec![(1, 1), (2, 1)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_sight_creates_one_route() {
        for _ in 0..50 {
            let invocations = Arc::new(AtomicUsize::new(0));
            let (tx, mut handled) = mpsc::unbounded_channel();
            let router = Arc::new(StreamRouter::new(15));
            let counter = invocations.clone();
            router.set_handler(track_handler(move |_track_type, stream| {
                counter.fetch_add(1, Ordering::SeqCst);
                let tx = tx.clone();
                async move {
                    let _ = tx.send(stream);
                }
            }));

            let listeners: Vec<_> = (0..8)
                .map(|_| {
                    let router = router.clone();
                    tokio::spawn(async move {
                        router
                            .route(7)
                            .map(|sender| sender.deliver(RtpPacket::default()))
                    })
                })
                .collect();
            for listener in listeners {
                assert_eq!(listener.await.unwrap(), Some(Delivery::Delivered));
            }

            let mut stream = handled.recv().await.unwrap();
            let mut received = 0;
            while stream.try_recv().is_some() {
                received += 1;
            }
            assert_eq!(received, 8);
            assert_eq!(invocations.load(Ordering::SeqCst), 1);
            assert_eq!(router.open_routes(), 1);
        }
    }

    #[tokio::test]
    async fn test_clear_refuses_new_routes() {
        let (router, _handled) = forwarding_router(15);
        let sender = router.route(3).unwrap();
        drop(sender);

        router.clear();
        assert!(router.route(3).is_none());
        assert!(router.route(4).is_none());
    }

    #[test]
    fn test_route_outside_runtime_is_discarded() {
        let (router, _handled) = forwarding_router(15);
        assert!(router.route(5).is_none());
        assert_eq!(router.open_routes(), 0);
    }

    #[test]
    fn test_negotiated_classifier() {
        let description = SessionDescriptionBuilder::new(1)
            .media(
                MediaSection::new(MediaKind::Audio, "0")
                    .with_codec(TrackType::Opus)
                    .with_codec(TrackType::G711)
                    .with_ssrc(1111),
            )
            .media(
                MediaSection::new(MediaKind::Video, "1")
                    .with_codec(TrackType::H264)
                    .with_ssrc(2222),
            )
            .build();

        let classifier = NegotiatedClassifier::from_description(&description);
        assert_eq!(classifier.len(), 2);
        assert_eq!(classifier.classify(1111), TrackType::Opus);
        assert_eq!(classifier.classify(2222), TrackType::H264);
        assert_eq!(classifier.classify(3333), TrackType::Vp8);
    }

    #[tokio::test]
    async fn test_classifier_swap_applies_to_new_routes() {
        let (router, mut handled) = forwarding_router(15);
        router.route(1).unwrap();
        router.set_classifier(Arc::new(FixedClassifier(TrackType::G722)));
        router.route(2).unwrap();

        let mut types = vec![
            handled.recv().await.unwrap(),
            handled.recv().await.unwrap(),
        ]
        .into_iter()
        .map(|(track_type, stream)| (stream.ssrc(), track_type))
        .collect::<Vec<_>>();
        types.sort_by_key(|(ssrc, _)| *ssrc);
        assert_eq!(types, vec![(1, TrackType::Vp8), (2, TrackType::G722)]);
    }
}
