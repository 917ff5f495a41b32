//! Abstract contract of the out-of-process media engine.
//!
//! §1 scopes the media engine itself out — only the contract the core uses
//! against it is specified here. A production build wires a real mediasoup
//! binding (the shape mirrors `dfrankland-mediasoup`'s worker/router split);
//! tests and this crate's own development wire [`mock`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque identifier types. Newtypes rather than bare `String`s so a
/// `TransportId` can never be passed where a `ProducerId` is expected.
macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
            Serialize,
        )]
        pub struct $name(pub String);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(WorkerId);
id_newtype!(RouterId);
id_newtype!(TransportId);
id_newtype!(ProducerId);
id_newtype!(ConsumerId);

/// Role a transport was created for. A client owns at most one of each
/// (§3 `Connection` invariant).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportRole {
    Producer,
    Consumer,
}

/// A single media worker process, as handed out by [`super::worker_pool::WorkerPool`].
#[async_trait]
pub trait Worker: Send + Sync + std::fmt::Debug {
    fn id(&self) -> WorkerId;

    /// OS process id, used only to break ties deterministically in
    /// [`super::worker_pool::WorkerPool::least_loaded`].
    fn pid(&self) -> u32;

    /// Creates a new router on this worker.
    async fn create_router(&self) -> Result<Box<dyn Router>, EngineError>;

    /// Number of routers currently allocated on this worker.
    fn router_count(&self) -> usize;
}

/// A routing domain: either a room's source router or one of its
/// distribution routers.
#[async_trait]
pub trait Router: Send + Sync + std::fmt::Debug {
    fn id(&self) -> RouterId;
    fn worker_id(&self) -> WorkerId;

    fn rtp_capabilities(&self) -> Value;

    async fn create_transport(
        &self,
        role: TransportRole,
    ) -> Result<Box<dyn Transport>, EngineError>;

    /// Pipes `producer_id` (living on a different router) onto this router,
    /// returning the local piped producer id.
    ///
    /// Must be awaited before any "new producer" notification reaches
    /// clients of this router — the pipe-then-notify invariant (§4.2, §9).
    async fn pipe_producer(
        &self,
        producer_id: &ProducerId,
    ) -> Result<ProducerId, EngineError>;

    /// Registers a callback invoked with the producer id whenever this
    /// router's dominant-speaker observer fires.
    fn on_dominant_speaker(&self, callback: DominantSpeakerCallback);

    async fn close(&self) -> Result<(), EngineError>;
}

pub type DominantSpeakerCallback = Box<dyn Fn(ProducerId) + Send + Sync>;

/// A producer or consumer transport on some [`Router`].
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    fn id(&self) -> TransportId;
    fn role(&self) -> TransportRole;

    async fn connect(&self, dtls_parameters: Value) -> Result<(), EngineError>;

    async fn produce(
        &self,
        kind: &str,
        rtp_parameters: Value,
        app_data: Value,
    ) -> Result<Box<dyn Producer>, EngineError>;

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: Value,
    ) -> Result<Box<dyn Consumer>, EngineError>;

    /// Registers a callback invoked when the transport closes, so its owner
    /// can release derived bookkeeping (e.g. a distribution router's
    /// listener count).
    fn on_close(&self, callback: Box<dyn Fn() + Send + Sync>);

    async fn close(&self) -> Result<(), EngineError>;
}

#[async_trait]
pub trait Producer: Send + Sync + std::fmt::Debug {
    fn id(&self) -> ProducerId;
    fn kind(&self) -> String;
    async fn pause(&self) -> Result<(), EngineError>;
    async fn resume(&self) -> Result<(), EngineError>;
    async fn close(&self) -> Result<(), EngineError>;
}

#[async_trait]
pub trait Consumer: Send + Sync + std::fmt::Debug {
    fn id(&self) -> ConsumerId;
    fn producer_id(&self) -> ProducerId;
    fn rtp_parameters(&self) -> Value;
    async fn pause(&self) -> Result<(), EngineError>;
    async fn resume(&self) -> Result<(), EngineError>;
    async fn close(&self) -> Result<(), EngineError>;
}

#[derive(Debug, derive_more::Display)]
pub enum EngineError {
    #[display(fmt = "no media workers available")]
    NoWorkersAvailable,
    #[display(fmt = "media engine operation failed: {}", _0)]
    Operation(String),
}

impl std::error::Error for EngineError {}

/// An in-process mock of the media engine, for unit and integration tests.
///
/// Grounded on the "external collaborator, abstract contract only"
/// framing from §1: a real binding is a deployment concern, not something
/// this crate needs to ship to satisfy the spec's core.
pub mod mock {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;

    fn next_id(counter: &AtomicU64, prefix: &str) -> String {
        format!("{}-{}", prefix, counter.fetch_add(1, Ordering::Relaxed))
    }

    #[derive(Debug, Default)]
    pub struct MockEngine {
        counter: AtomicU64,
    }

    impl MockEngine {
        #[must_use]
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        #[must_use]
        pub fn spawn_worker(self: &Arc<Self>, pid: u32) -> Box<dyn Worker> {
            Box::new(MockWorker {
                id: WorkerId(next_id(&self.counter, "worker")),
                pid,
                engine: Arc::clone(self),
                router_count: Arc::new(AtomicU64::new(0)),
            })
        }
    }

    #[derive(Debug)]
    struct MockWorker {
        id: WorkerId,
        pid: u32,
        engine: Arc<MockEngine>,
        router_count: Arc<AtomicU64>,
    }

    #[async_trait]
    impl Worker for MockWorker {
        fn id(&self) -> WorkerId {
            self.id.clone()
        }

        fn pid(&self) -> u32 {
            self.pid
        }

        async fn create_router(&self) -> Result<Box<dyn Router>, EngineError> {
            self.router_count.fetch_add(1, Ordering::Relaxed);
            Ok(Box::new(MockRouter {
                id: RouterId(next_id(&self.engine.counter, "router")),
                worker_id: self.id.clone(),
                engine: Arc::clone(&self.engine),
                worker_router_count: Arc::clone(&self.router_count),
                piped: Mutex::new(std::collections::HashMap::new()),
                dominant_speaker_cb: Mutex::new(None),
            }))
        }

        fn router_count(&self) -> usize {
            self.router_count.load(Ordering::Relaxed) as usize
        }
    }

    #[derive(Debug)]
    struct MockRouter {
        id: RouterId,
        worker_id: WorkerId,
        engine: Arc<MockEngine>,
        worker_router_count: Arc<AtomicU64>,
        piped: Mutex<std::collections::HashMap<ProducerId, ProducerId>>,
        dominant_speaker_cb: Mutex<Option<DominantSpeakerCallback>>,
    }

    impl Drop for MockRouter {
        fn drop(&mut self) {
            self.worker_router_count.fetch_sub(1, Ordering::Relaxed);
        }
    }

    #[async_trait]
    impl Router for MockRouter {
        fn id(&self) -> RouterId {
            self.id.clone()
        }

        fn worker_id(&self) -> WorkerId {
            self.worker_id.clone()
        }

        fn rtp_capabilities(&self) -> Value {
            json!({ "codecs": [{ "kind": "audio", "mimeType": "audio/opus" }] })
        }

        async fn create_transport(
            &self,
            role: TransportRole,
        ) -> Result<Box<dyn Transport>, EngineError> {
            Ok(Box::new(MockTransport {
                id: TransportId(next_id(&self.engine.counter, "transport")),
                role,
                engine: Arc::clone(&self.engine),
                on_close: Mutex::new(None),
            }))
        }

        async fn pipe_producer(
            &self,
            producer_id: &ProducerId,
        ) -> Result<ProducerId, EngineError> {
            let piped_id =
                ProducerId(next_id(&self.engine.counter, "piped-producer"));
            self.piped
                .lock()
                .unwrap()
                .insert(producer_id.clone(), piped_id.clone());
            Ok(piped_id)
        }

        fn on_dominant_speaker(&self, callback: DominantSpeakerCallback) {
            *self.dominant_speaker_cb.lock().unwrap() = Some(callback);
        }

        async fn close(&self) -> Result<(), EngineError> {
            Ok(())
        }
    }

    impl MockRouter {
        /// Test helper: simulates the router's dominant-speaker observer
        /// firing for `producer_id`.
        pub fn fire_dominant_speaker(&self, producer_id: ProducerId) {
            if let Some(cb) = self.dominant_speaker_cb.lock().unwrap().as_ref() {
                cb(producer_id);
            }
        }

        /// Test helper: the piped producer id for a source producer, if any.
        pub fn piped_id_for(&self, producer_id: &ProducerId) -> Option<ProducerId> {
            self.piped.lock().unwrap().get(producer_id).cloned()
        }
    }

    #[derive(Debug)]
    struct MockTransport {
        id: TransportId,
        role: TransportRole,
        engine: Arc<MockEngine>,
        on_close: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        fn id(&self) -> TransportId {
            self.id.clone()
        }

        fn role(&self) -> TransportRole {
            self.role
        }

        async fn connect(&self, _dtls_parameters: Value) -> Result<(), EngineError> {
            Ok(())
        }

        async fn produce(
            &self,
            kind: &str,
            _rtp_parameters: Value,
            _app_data: Value,
        ) -> Result<Box<dyn Producer>, EngineError> {
            Ok(Box::new(MockProducer {
                id: ProducerId(next_id(&self.engine.counter, "producer")),
                kind: kind.to_string(),
                paused: Mutex::new(false),
            }))
        }

        async fn consume(
            &self,
            producer_id: &ProducerId,
            _rtp_capabilities: Value,
        ) -> Result<Box<dyn Consumer>, EngineError> {
            Ok(Box::new(MockConsumer {
                id: ConsumerId(next_id(&self.engine.counter, "consumer")),
                producer_id: producer_id.clone(),
                paused: Mutex::new(true),
            }))
        }

        fn on_close(&self, callback: Box<dyn Fn() + Send + Sync>) {
            *self.on_close.lock().unwrap() = Some(callback);
        }

        async fn close(&self) -> Result<(), EngineError> {
            if let Some(cb) = self.on_close.lock().unwrap().take() {
                cb();
            }
            Ok(())
        }
    }

    #[derive(Debug)]
    struct MockProducer {
        id: ProducerId,
        kind: String,
        paused: Mutex<bool>,
    }

    #[async_trait]
    impl Producer for MockProducer {
        fn id(&self) -> ProducerId {
            self.id.clone()
        }

        fn kind(&self) -> String {
            self.kind.clone()
        }

        async fn pause(&self) -> Result<(), EngineError> {
            *self.paused.lock().unwrap() = true;
            Ok(())
        }

        async fn resume(&self) -> Result<(), EngineError> {
            *self.paused.lock().unwrap() = false;
            Ok(())
        }

        async fn close(&self) -> Result<(), EngineError> {
            Ok(())
        }
    }

    #[derive(Debug)]
    pub struct MockConsumer {
        id: ConsumerId,
        producer_id: ProducerId,
        paused: Mutex<bool>,
    }

    impl MockConsumer {
        #[must_use]
        pub fn is_paused(&self) -> bool {
            *self.paused.lock().unwrap()
        }
    }

    #[async_trait]
    impl Consumer for MockConsumer {
        fn id(&self) -> ConsumerId {
            self.id.clone()
        }

        fn producer_id(&self) -> ProducerId {
            self.producer_id.clone()
        }

        fn rtp_parameters(&self) -> Value {
            json!({})
        }

        async fn pause(&self) -> Result<(), EngineError> {
            *self.paused.lock().unwrap() = true;
            Ok(())
        }

        async fn resume(&self) -> Result<(), EngineError> {
            *self.paused.lock().unwrap() = false;
            Ok(())
        }

        async fn close(&self) -> Result<(), EngineError> {
            Ok(())
        }
    }
}
