//! §4.2 `MediaCluster` — one source router plus K distribution routers,
//! scaling listener fan-out past a single media worker.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::Value;
use slog::{debug, o, warn, Logger};
use tokio::sync::{Mutex, RwLock};

use crate::error::{AppError, InternalError};
use crate::media::detector::ActiveSpeakerDetector;
use crate::media::engine::{
    Consumer, ConsumerId, EngineError, Producer, ProducerId, Router, Transport,
    TransportId, TransportRole,
};
use crate::media::worker_pool::WorkerPool;

impl From<EngineError> for InternalError {
    fn from(e: EngineError) -> Self {
        Self(failure::format_err!("{}", e))
    }
}

struct DistributionRouter {
    router: Box<dyn Router>,
    listener_count: Arc<AtomicUsize>,
    /// source producer id -> piped producer id on this router.
    piped: RwLock<HashMap<ProducerId, ProducerId>>,
}

/// One source router `S` plus zero or more distribution routers
/// `D_1..D_k`. Speakers produce on `S`; every `D_i` gets a piped copy so
/// listeners on `D_i` never touch `S` directly.
pub struct MediaCluster {
    room_id: String,
    log: Logger,
    worker_pool: Arc<WorkerPool>,

    source_router: Box<dyn Router>,
    distribution_routers: RwLock<Vec<DistributionRouter>>,
    new_distribution_router_lock: Mutex<()>,

    transports: RwLock<HashMap<TransportId, TransportEntry>>,
    producers: RwLock<HashMap<ProducerId, Box<dyn Producer>>>,
    consumers: RwLock<HashMap<ConsumerId, ConsumerEntry>>,

    source_producer_ids: RwLock<HashSet<ProducerId>>,
    consumer_to_source:
        RwLock<HashMap<ConsumerId, ProducerId>>,
    active_speaker_set: RwLock<HashSet<ProducerId>>,
    detector_has_fired: std::sync::atomic::AtomicBool,

    pub detector: ActiveSpeakerDetector,
    max_listeners_per_router: usize,
}

struct TransportEntry {
    transport: Box<dyn Transport>,
    router_index: Option<usize>, // None => source router
}

struct ConsumerEntry {
    consumer: Box<dyn Consumer>,
}

/// What a client needs back from `create_transport`/`consume` to drive the
/// media-engine handshake on its own side.
#[derive(Debug, serde::Serialize)]
pub struct TransportInfo {
    pub id: String,
    pub ice_parameters: Value,
}

#[derive(Debug, serde::Serialize)]
pub struct ConsumerInfo {
    pub id: String,
    pub producer_id: String,
    pub rtp_parameters: Value,
}

impl MediaCluster {
    /// Allocates the source router on the least-loaded worker and wires up
    /// the [`ActiveSpeakerDetector`] against its dominant-speaker observer.
    ///
    /// # Errors
    ///
    /// [`EngineError::NoWorkersAvailable`] if the pool is empty.
    pub async fn new(
        room_id: String,
        worker_pool: Arc<WorkerPool>,
        max_active_speakers: usize,
        active_speaker_window: std::time::Duration,
        max_listeners_per_router: usize,
        log: Logger,
    ) -> Result<Arc<Self>, EngineError> {
        let log = log.new(o!("room_id" => room_id.clone()));
        let worker = worker_pool.least_loaded().await?;
        let source_router = worker_pool.create_router_on(&worker.id).await?;

        let cluster = Arc::new(Self {
            room_id,
            log: log.clone(),
            worker_pool,
            source_router,
            distribution_routers: RwLock::new(Vec::new()),
            new_distribution_router_lock: Mutex::new(()),
            transports: RwLock::new(HashMap::new()),
            producers: RwLock::new(HashMap::new()),
            consumers: RwLock::new(HashMap::new()),
            source_producer_ids: RwLock::new(HashSet::new()),
            consumer_to_source: RwLock::new(HashMap::new()),
            active_speaker_set: RwLock::new(HashSet::new()),
            detector_has_fired: std::sync::atomic::AtomicBool::new(false),
            detector: ActiveSpeakerDetector::new(
                max_active_speakers,
                active_speaker_window,
            ),
            max_listeners_per_router,
        });

        let weak = Arc::downgrade(&cluster);
        cluster.source_router.on_dominant_speaker(Box::new(move |producer_id| {
            if let Some(cluster) = weak.upgrade() {
                tokio::spawn(async move {
                    cluster.on_dominant_speaker(producer_id).await;
                });
            }
        }));

        Ok(cluster)
    }

    pub fn rtp_capabilities(&self) -> Value {
        self.source_router.rtp_capabilities()
    }

    /// §4.2 `createTransport`. Producers always land on the source router;
    /// consumers land on the least-loaded distribution router under
    /// capacity, allocating a new one (piped to every existing source
    /// producer first) when all are full.
    pub async fn create_transport(
        self: &Arc<Self>,
        role: TransportRole,
    ) -> Result<TransportInfo, InternalError> {
        let (transport, router_index) = match role {
            TransportRole::Producer => {
                (self.source_router.create_transport(role).await?, None)
            }
            TransportRole::Consumer => {
                let index = self.distribution_router_with_capacity().await?;
                let routers = self.distribution_routers.read().await;
                let dr = &routers[index];
                let transport = dr.router.create_transport(role).await?;
                let listener_count = Arc::clone(&dr.listener_count);
                listener_count.fetch_add(1, Ordering::SeqCst);
                transport.on_close(Box::new(move || {
                    listener_count.fetch_sub(1, Ordering::SeqCst);
                }));
                (transport, Some(index))
            }
        };

        let info = TransportInfo {
            id: transport.id().to_string(),
            ice_parameters: Value::Null,
        };
        self.transports.write().await.insert(
            transport.id(),
            TransportEntry {
                transport,
                router_index,
            },
        );
        Ok(info)
    }

    /// Returns the index of a distribution router with spare capacity,
    /// allocating one (on a worker other than the source router's) if
    /// every existing one is full. Concurrent callers serialize on
    /// `new_distribution_router_lock` so at most one new router is
    /// created per capacity-exhaustion event (§4.2 ordering notes).
    async fn distribution_router_with_capacity(
        &self,
    ) -> Result<usize, InternalError> {
        {
            let routers = self.distribution_routers.read().await;
            if let Some(index) = routers.iter().position(|dr| {
                dr.listener_count.load(Ordering::SeqCst)
                    < self.max_listeners_per_router
            }) {
                return Ok(index);
            }
        }

        let _guard = self.new_distribution_router_lock.lock().await;
        // Re-check: another task may have created one while we waited.
        {
            let routers = self.distribution_routers.read().await;
            if let Some(index) = routers.iter().position(|dr| {
                dr.listener_count.load(Ordering::SeqCst)
                    < self.max_listeners_per_router
            }) {
                return Ok(index);
            }
        }

        debug!(self.log, "allocating new distribution router");
        let source_worker_id = self.source_router.worker_id().to_string();
        let worker = self
            .worker_pool
            .least_loaded_excluding(Some(&source_worker_id))
            .await?;
        let router = self.worker_pool.create_router_on(&worker.id).await?;

        let mut piped = HashMap::new();
        for producer_id in self.source_producer_ids.read().await.iter() {
            let piped_id = router.pipe_producer(producer_id).await?;
            piped.insert(producer_id.clone(), piped_id);
        }

        let mut routers = self.distribution_routers.write().await;
        routers.push(DistributionRouter {
            router,
            listener_count: Arc::new(AtomicUsize::new(0)),
            piped: RwLock::new(piped),
        });
        Ok(routers.len() - 1)
    }

    /// §4.2 `connectTransport`.
    pub async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: Value,
    ) -> Result<(), AppError> {
        let transports = self.transports.read().await;
        let entry = transports
            .get(transport_id)
            .ok_or(AppError::TransportNotFound)?;
        entry
            .transport
            .connect(dtls_parameters)
            .await
            .map_err(|e| AppError::from(InternalError::from(e)))
    }

    /// §4.2 `produce`. Rejects a produce call on a consumer-role transport
    /// rather than letting the engine binding interpret it ambiguously.
    pub async fn produce(
        &self,
        transport_id: &TransportId,
        kind: &str,
        rtp_parameters: Value,
        app_data: Value,
    ) -> Result<ProducerId, AppError> {
        let producer = {
            let transports = self.transports.read().await;
            let entry = transports
                .get(transport_id)
                .ok_or(AppError::TransportNotFound)?;
            if entry.transport.role() != TransportRole::Producer {
                return Err(AppError::InvalidPayload);
            }
            entry
                .transport
                .produce(kind, rtp_parameters, app_data)
                .await
                .map_err(|e| AppError::from(InternalError::from(e)))?
        };
        let producer_id = producer.id();
        self.register_producer(producer)
            .await
            .map_err(AppError::from)?;
        Ok(producer_id)
    }

    /// §4.6 `consumer:resume`.
    pub async fn resume_consumer(&self, consumer_id: &ConsumerId) -> Result<(), AppError> {
        let consumers = self.consumers.read().await;
        let entry = consumers.get(consumer_id).ok_or(AppError::ConsumerNotFound)?;
        entry
            .consumer
            .resume()
            .await
            .map_err(|e| AppError::from(InternalError::from(e)))
    }

    /// §4.2 `registerProducer`. Must complete — including every pipe —
    /// before the caller broadcasts a "new producer" notification.
    pub async fn register_producer(
        &self,
        producer: Box<dyn Producer>,
    ) -> Result<(), InternalError> {
        let producer_id = producer.id();
        self.source_producer_ids
            .write()
            .await
            .insert(producer_id.clone());

        let routers = self.distribution_routers.read().await;
        for dr in routers.iter() {
            let piped_id = dr.router.pipe_producer(&producer_id).await?;
            dr.piped.write().await.insert(producer_id.clone(), piped_id);
        }
        drop(routers);

        self.producers.write().await.insert(producer_id, producer);
        Ok(())
    }

    pub async fn producer(
        &self,
        producer_id: &ProducerId,
    ) -> Option<()> {
        self.producers.read().await.get(producer_id).map(|_| ())
    }

    pub async fn pause_producer(&self, producer_id: &ProducerId) -> Result<(), InternalError> {
        if let Some(p) = self.producers.read().await.get(producer_id) {
            p.pause().await?;
        }
        Ok(())
    }

    pub async fn resume_producer(&self, producer_id: &ProducerId) -> Result<(), InternalError> {
        if let Some(p) = self.producers.read().await.get(producer_id) {
            p.resume().await?;
        }
        Ok(())
    }

    pub async fn close_producer(&self, producer_id: &ProducerId) -> Result<(), InternalError> {
        if let Some(p) = self.producers.write().await.remove(producer_id) {
            p.close().await?;
        }
        self.source_producer_ids.write().await.remove(producer_id);
        Ok(())
    }

    /// §4.2 `consume`. Resolves which distribution router owns
    /// `transport_id`, resolves `source_producer_id` to its piped producer
    /// there, and creates a paused consumer.
    pub async fn consume(
        &self,
        transport_id: &TransportId,
        source_producer_id: &ProducerId,
        rtp_capabilities: Value,
    ) -> Result<ConsumerInfo, AppError> {
        let transports = self.transports.read().await;
        let entry = transports
            .get(transport_id)
            .ok_or(AppError::TransportNotFound)?;
        let router_index = entry.router_index.ok_or(AppError::CannotConsume)?;

        let routers = self.distribution_routers.read().await;
        let dr = routers.get(router_index).ok_or(AppError::CannotConsume)?;
        let piped_id = dr
            .piped
            .read()
            .await
            .get(source_producer_id)
            .cloned()
            .ok_or(AppError::ProducerNotFound)?;

        let consumer = entry
            .transport
            .consume(&piped_id, rtp_capabilities)
            .await
            .map_err(|e| AppError::from(InternalError::from(e)))?;

        let info = ConsumerInfo {
            id: consumer.id().to_string(),
            producer_id: piped_id.to_string(),
            rtp_parameters: consumer.rtp_parameters(),
        };

        let consumer_id = consumer.id();
        self.consumer_to_source
            .write()
            .await
            .insert(consumer_id.clone(), source_producer_id.clone());
        self.consumers
            .write()
            .await
            .insert(consumer_id, ConsumerEntry { consumer });

        Ok(info)
    }

    /// §4.3 drives this: pause every consumer whose source dropped out of
    /// `new_set`, resume every consumer whose source entered it. Issued
    /// concurrently; returns only once all complete.
    pub async fn update_active_speakers(
        &self,
        new_set: HashSet<ProducerId>,
    ) {
        self.detector_has_fired
            .store(true, Ordering::SeqCst);
        let previous = {
            let mut guard = self.active_speaker_set.write().await;
            std::mem::replace(&mut *guard, new_set.clone())
        };

        let consumer_to_source = self.consumer_to_source.read().await.clone();
        let consumers = self.consumers.read().await;

        let mut futures = Vec::new();
        for (consumer_id, source) in consumer_to_source.iter() {
            let was_active = previous.contains(source);
            let now_active = new_set.contains(source);
            if was_active == now_active {
                continue;
            }
            if let Some(entry) = consumers.get(consumer_id) {
                let consumer = &entry.consumer;
                if now_active {
                    futures.push(consumer.resume());
                } else {
                    futures.push(consumer.pause());
                }
            }
        }
        let results = futures::future::join_all(futures).await;
        for result in results {
            if let Err(e) = result {
                warn!(self.log, "failed to pause/resume consumer"; "error" => %e);
            }
        }
    }

    /// §4.2 `isActiveSpeaker`. Before the detector has ever fired, every
    /// producer is treated as active (§9 "initialization gate").
    pub async fn is_active_speaker(&self, producer_id: &ProducerId) -> bool {
        if !self.detector_has_fired.load(Ordering::SeqCst) {
            return true;
        }
        self.active_speaker_set.read().await.contains(producer_id)
    }

    async fn on_dominant_speaker(self: Arc<Self>, producer_id: ProducerId) {
        if let Some(new_set) = self.detector.on_dominant_speaker(producer_id).await {
            self.update_active_speakers(new_set).await;
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Every worker id this cluster currently has a router on. Used by
    /// `RoomRegistry` to decide whether a dead worker touched a room
    /// (§4.1, §4.5).
    pub async fn worker_ids(&self) -> Vec<String> {
        let mut ids = vec![self.source_router.worker_id().to_string()];
        for dr in self.distribution_routers.read().await.iter() {
            ids.push(dr.router.worker_id().to_string());
        }
        ids
    }

    pub async fn close(&self) {
        for (_, entry) in self.transports.write().await.drain() {
            let _ = entry.transport.close().await;
        }
        for dr in self.distribution_routers.write().await.drain(..) {
            let _ = dr.router.close().await;
        }
        let _ = self.source_router.close().await;
    }
}

impl std::fmt::Debug for MediaCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaCluster")
            .field("room_id", &self.room_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::engine::mock::MockEngine;
    use serde_json::json;
    use std::time::Duration;

    fn test_logger() -> Logger {
        slog::Logger::root(slog::Discard, o!())
    }

    async fn new_cluster(max_listeners: usize) -> (Arc<MediaCluster>, Arc<WorkerPool>) {
        let engine = MockEngine::new();
        let workers: Vec<_> = (0..4).map(|i| engine.spawn_worker(i)).collect();
        let pool = WorkerPool::new(test_logger(), workers);
        let cluster = MediaCluster::new(
            "room1".to_string(),
            Arc::clone(&pool),
            3,
            Duration::from_millis(10_000),
            max_listeners,
            test_logger(),
        )
        .await
        .unwrap();
        (cluster, pool)
    }

    #[tokio::test]
    async fn pipe_then_notify_producer_available_on_distribution_router() {
        let (cluster, _pool) = new_cluster(10).await;

        let producer_transport = cluster
            .create_transport(TransportRole::Producer)
            .await
            .unwrap();
        let transports = cluster.transports.read().await;
        let entry = transports
            .get(&TransportId(producer_transport.id.clone()))
            .unwrap();
        let producer = entry
            .transport
            .produce("audio", json!({}), json!({}))
            .await
            .unwrap();
        let producer_id = producer.id();
        drop(transports);

        cluster.register_producer(producer).await.unwrap();

        let consumer_transport = cluster
            .create_transport(TransportRole::Consumer)
            .await
            .unwrap();
        let info = cluster
            .consume(
                &TransportId(consumer_transport.id),
                &producer_id,
                json!({}),
            )
            .await
            .unwrap();
        assert_ne!(info.producer_id, producer_id.to_string());
    }

    #[tokio::test]
    async fn consume_without_distribution_router_is_rejected() {
        let (cluster, _pool) = new_cluster(10).await;
        let producer_transport = cluster
            .create_transport(TransportRole::Producer)
            .await
            .unwrap();
        // No consumer transport created yet, so no distribution router
        // exists.
        let err = cluster
            .consume(
                &TransportId(producer_transport.id),
                &ProducerId("nope".to_string()),
                json!({}),
            )
            .await
            .unwrap_err();
        assert_eq!(err, AppError::CannotConsume);
    }

    #[tokio::test]
    async fn capacity_exhaustion_allocates_new_distribution_router() {
        let (cluster, _pool) = new_cluster(1).await;
        let t1 = cluster.create_transport(TransportRole::Consumer).await.unwrap();
        let t2 = cluster.create_transport(TransportRole::Consumer).await.unwrap();

        let transports = cluster.transports.read().await;
        let r1 = transports.get(&TransportId(t1.id)).unwrap().router_index;
        let r2 = transports.get(&TransportId(t2.id)).unwrap().router_index;
        assert_ne!(r1, r2);
    }

    #[tokio::test]
    async fn initial_state_treats_every_producer_as_active() {
        let (cluster, _pool) = new_cluster(10).await;
        assert!(
            cluster
                .is_active_speaker(&ProducerId("anything".to_string()))
                .await
        );
    }
}
