//! Pool of decoder workers.
//!
//! Idle workers wait in an [`AffinityQueue`]. Callers `acquire` one, use it,
//! and `release` it. A worker found dead on release is handed to a
//! supervisor task over a channel; the supervisor closes it, returns its
//! device to the [`Placement`] and relaunches the slot in the background.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::handle::{CheckpointMap, WorkerHandle};
use super::placement::Placement;
use super::queue::AffinityQueue;
use crate::config::{DecoderConfig, RespawnPolicy};
use crate::error::{DecoderError, Result};
use crate::metrics::{MetricsCollector, RespawnOutcome};
use crate::model::{Device, LanguageDirection};
use crate::process::ProcessLauncher;

/// Notified whenever the number of alive workers changes.
pub trait AvailabilityListener: Send + Sync {
    fn on_availability_changed(&self, available: usize, capacity: usize);
}

/// A worker found dead on release.
struct SlotDied {
    handle: Arc<WorkerHandle>,
}

/// State shared between the pool and its supervisor.
struct PoolShared {
    queue: AffinityQueue<Arc<WorkerHandle>>,
    placement: Mutex<Placement>,
    capacity: usize,
    alive: AtomicUsize,
    active: AtomicBool,
    listener: RwLock<Option<Arc<dyn AvailabilityListener>>>,
    /// Wakes callers blocked in `acquire` once no worker is alive.
    starved: Notify,
    launcher: Arc<dyn ProcessLauncher>,
    checkpoints: Arc<CheckpointMap>,
    respawn: RespawnPolicy,
    metrics: MetricsCollector,
}

impl PoolShared {
    fn placement(&self) -> MutexGuard<'_, Placement> {
        self.placement.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn notify(&self, available: usize) {
        self.metrics.set_alive_workers(available);
        if available == 0 {
            self.starved.notify_waiters();
        }
        let listener = self
            .listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(listener) = listener {
            listener.on_availability_changed(available, self.capacity);
        }
    }

    fn worker_died(&self) -> usize {
        let previous = self
            .alive
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        let available = previous.saturating_sub(1);
        self.notify(available);
        available
    }

    fn worker_born(&self) -> usize {
        let available = self.alive.fetch_add(1, Ordering::SeqCst) + 1;
        self.notify(available);
        available
    }
}

/// Pool of decoder worker processes with a fixed capacity.
pub struct DecoderPool {
    shared: Arc<PoolShared>,
    deaths: mpsc::UnboundedSender<SlotDied>,
    shutdown_tx: broadcast::Sender<()>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    acquire_timeout: Option<Duration>,
}

impl DecoderPool {
    /// Starts `capacity` workers and waits until all of them are ready.
    ///
    /// GPU workers are launched concurrently, one per device; CPU workers
    /// one after the other to limit contention while models load.
    ///
    /// # Errors
    ///
    /// Returns [`DecoderError::Initialization`] if any worker fails to
    /// start. Workers that did start are closed again.
    pub async fn initialize(
        config: &DecoderConfig,
        launcher: Arc<dyn ProcessLauncher>,
        checkpoints: CheckpointMap,
    ) -> Result<Self> {
        let mut placement = config.placement();
        let capacity = placement.capacity();
        if capacity == 0 {
            return Err(DecoderError::Initialization(
                "decoder pool capacity is zero".to_string(),
            ));
        }

        let devices = (0..capacity)
            .map(|_| placement.claim())
            .collect::<Option<Vec<Device>>>()
            .ok_or_else(|| {
                DecoderError::Initialization("not enough devices for pool capacity".to_string())
            })?;

        let checkpoints = Arc::new(checkpoints);
        let begin = Instant::now();
        info!(capacity = capacity, placement = %placement, "Starting decoder workers");

        let launches = devices.iter().enumerate().map(|(slot, &device)| {
            WorkerHandle::launch(slot, device, Arc::clone(&launcher), Arc::clone(&checkpoints))
        });

        let results = if placement.is_gpu() {
            join_all(launches).await
        } else {
            let mut results = Vec::with_capacity(capacity);
            for launch in launches {
                let result = launch.await;
                let failed = result.is_err();
                results.push(result);
                if failed {
                    break;
                }
            }
            results
        };

        let mut handles = Vec::with_capacity(capacity);
        let mut failure = None;
        for (result, device) in results.into_iter().zip(&devices) {
            match result {
                Ok(handle) => handles.push(Arc::new(handle)),
                Err(e) => {
                    error!(device = %device, error = %e, "Decoder worker failed to start");
                    failure.get_or_insert((*device, e));
                }
            }
        }

        if let Some((device, e)) = failure {
            for handle in handles {
                handle.close().await;
            }
            return Err(DecoderError::Initialization(format!(
                "worker on {} failed to start: {}",
                device, e
            )));
        }

        let queue = AffinityQueue::new(capacity, config.affinity_streak_limit);
        for handle in handles {
            if queue.offer(handle).is_err() {
                return Err(DecoderError::Initialization(
                    "idle queue rejected a new worker".to_string(),
                ));
            }
        }

        let shared = Arc::new(PoolShared {
            queue,
            placement: Mutex::new(placement),
            capacity,
            alive: AtomicUsize::new(capacity),
            active: AtomicBool::new(true),
            listener: RwLock::new(None),
            starved: Notify::new(),
            launcher,
            checkpoints,
            respawn: config.respawn.clone(),
            metrics: MetricsCollector::new(),
        });
        shared.metrics.set_alive_workers(capacity);

        let (deaths, deaths_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let supervisor = tokio::spawn(supervise(Arc::clone(&shared), deaths_rx, shutdown_rx));

        info!(
            capacity = capacity,
            elapsed_ms = begin.elapsed().as_millis() as u64,
            "Decoder pool ready"
        );

        Ok(Self {
            shared,
            deaths,
            shutdown_tx,
            supervisor: Mutex::new(Some(supervisor)),
            acquire_timeout: config.acquire_timeout(),
        })
    }

    /// Fixed number of worker slots.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Workers currently alive, idle or busy.
    pub fn availability(&self) -> usize {
        self.shared.alive.load(Ordering::SeqCst)
    }

    /// Workers waiting in the idle queue.
    pub fn idle(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    pub fn set_availability_listener(&self, listener: Arc<dyn AvailabilityListener>) {
        *self
            .shared
            .listener
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    /// Takes an idle worker, preferring one that last served the checkpoint
    /// `direction` resolves to.
    ///
    /// Waits up to `timeout`, falling back to the configured acquire
    /// timeout, or indefinitely when neither is set.
    ///
    /// # Errors
    ///
    /// Returns [`DecoderError::NoWorkersAvailable`] if the pool is shut
    /// down, has no alive worker, or the wait timed out. A pending wait
    /// also ends with it when the last alive worker dies.
    pub async fn acquire(
        &self,
        direction: &LanguageDirection,
        timeout: Option<Duration>,
    ) -> Result<Arc<WorkerHandle>> {
        let preferred = self.shared.checkpoints.get(direction);
        let timeout = timeout.or(self.acquire_timeout);
        let begin = Instant::now();

        loop {
            // registered before the check so a death in between still wakes us
            let starved = self.shared.starved.notified();
            tokio::pin!(starved);
            starved.as_mut().enable();

            if !self.is_active() || self.availability() == 0 {
                return Err(DecoderError::NoWorkersAvailable);
            }

            let take = async {
                match timeout {
                    Some(limit) => {
                        let remaining = limit.saturating_sub(begin.elapsed());
                        self.shared.queue.poll_timeout(preferred, remaining).await
                    }
                    None => self.shared.queue.take(preferred).await,
                }
            };

            let handle = tokio::select! {
                handle = take => handle,
                _ = &mut starved => None,
            };

            let Some(handle) = handle else {
                return Err(DecoderError::NoWorkersAvailable);
            };

            if handle.mark_in_use() {
                self.shared.metrics.record_acquire_wait(begin.elapsed());
                debug!(slot = handle.slot(), direction = %direction, "Worker acquired");
                return Ok(handle);
            }

            error!(slot = handle.slot(), "Idle queue returned a worker already in use");
        }
    }

    /// Returns a worker to the pool. Never blocks.
    ///
    /// Alive workers go back to the idle queue. Dead workers are reported
    /// to the supervisor, which relaunches the slot. During shutdown every
    /// released worker is closed.
    pub fn release(&self, handle: Arc<WorkerHandle>) {
        if !handle.mark_free() {
            warn!(slot = handle.slot(), "Worker released twice");
            return;
        }

        if !self.is_active() {
            close_detached(handle);
            return;
        }

        if handle.is_alive() {
            if let Err(handle) = self.shared.queue.offer(handle) {
                warn!(slot = handle.slot(), "Idle queue refused released worker, closing it");
                close_detached(handle);
            }
            return;
        }

        self.shared.metrics.record_worker_death();
        let available = self.shared.worker_died();
        warn!(
            slot = handle.slot(),
            device = %handle.device(),
            available = available,
            capacity = self.shared.capacity,
            "Decoder worker died"
        );

        if let Err(mpsc::error::SendError(event)) = self.deaths.send(SlotDied { handle }) {
            close_detached(event.handle);
        }
    }

    /// Stops the pool and cancels pending relaunches. Idle workers are
    /// closed now, workers in use when they are released.
    pub async fn shutdown(&self) {
        if !self.shared.active.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down decoder pool");

        // the supervisor may already be gone
        let _ = self.shutdown_tx.send(());
        self.shared.queue.close();

        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(supervisor) = supervisor {
            if let Err(e) = supervisor.await {
                error!(error = %e, "Pool supervisor panicked");
            }
        }

        let mut closed = 0;
        while let Some(handle) = self.shared.queue.poll() {
            handle.close().await;
            closed += 1;
        }

        self.shared.alive.store(0, Ordering::SeqCst);
        self.shared.notify(0);
        info!(closed = closed, "Decoder pool shut down");
    }
}

fn close_detached(handle: Arc<WorkerHandle>) {
    tokio::spawn(async move { handle.close().await });
}

/// Consumes death reports until shutdown. Recovery tasks still running at
/// that point are aborted when the set is dropped.
async fn supervise(
    shared: Arc<PoolShared>,
    mut deaths: mpsc::UnboundedReceiver<SlotDied>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut recoveries = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            event = deaths.recv() => match event {
                Some(SlotDied { handle }) => {
                    recoveries.spawn(recover(Arc::clone(&shared), handle));
                }
                None => break,
            },
            Some(joined) = recoveries.join_next(), if !recoveries.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "Worker recovery task failed");
                }
            }
        }
    }

    recoveries.abort_all();
    while let Ok(SlotDied { handle }) = deaths.try_recv() {
        handle.close().await;
    }
    debug!("Pool supervisor stopped");
}

/// Closes a dead worker and relaunches its slot with bounded retries.
async fn recover(shared: Arc<PoolShared>, dead: Arc<WorkerHandle>) {
    let slot = dead.slot();
    dead.close().await;
    shared.placement().reclaim(dead.device());
    drop(dead);

    let policy = &shared.respawn;
    for attempt in 1..=policy.max_attempts {
        let delay = policy.delay_before(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !shared.is_active() {
            return;
        }

        let Some(device) = shared.placement().claim() else {
            error!(slot = slot, "No free device to relaunch worker");
            break;
        };

        let launched = WorkerHandle::launch(
            slot,
            device,
            Arc::clone(&shared.launcher),
            Arc::clone(&shared.checkpoints),
        )
        .await;

        match launched {
            Ok(handle) => {
                let handle = Arc::new(handle);
                if let Err(handle) = shared.queue.offer(Arc::clone(&handle)) {
                    // pool closed while launching
                    handle.close().await;
                    shared.placement().reclaim(device);
                    return;
                }
                shared.metrics.record_respawn(RespawnOutcome::Success);
                let available = shared.worker_born();
                info!(
                    slot = slot,
                    device = %device,
                    attempt = attempt,
                    available = available,
                    capacity = shared.capacity,
                    "Decoder worker relaunched"
                );
                return;
            }
            Err(e) => {
                shared.placement().reclaim(device);
                shared.metrics.record_respawn(RespawnOutcome::Failure);
                warn!(
                    slot = slot,
                    device = %device,
                    attempt = attempt,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "Failed to relaunch decoder worker"
                );
            }
        }
    }

    shared.metrics.record_respawn(RespawnOutcome::Exhausted);
    error!(
        slot = slot,
        available = shared.alive.load(Ordering::SeqCst),
        capacity = shared.capacity,
        "Decoder worker slot lost until restart"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Sentence, Suggestion, Translation};
    use crate::process::DecoderProcess;
    use async_trait::async_trait;

    struct NullProcess {
        device: Device,
        alive: bool,
    }

    #[async_trait]
    impl DecoderProcess for NullProcess {
        fn device(&self) -> Device {
            self.device
        }

        fn is_alive(&mut self) -> bool {
            self.alive
        }

        async fn translate(
            &mut self,
            _direction: &LanguageDirection,
            sentence: &Sentence,
            _suggestions: &[Suggestion],
        ) -> Result<Translation> {
            Ok(Translation::from_tokens(&sentence.tokens()))
        }

        async fn align(
            &mut self,
            _direction: &LanguageDirection,
            _sentence: &Sentence,
            target: &[String],
        ) -> Result<Translation> {
            Ok(Translation::from_tokens(target))
        }

        async fn close(&mut self) {
            self.alive = false;
        }
    }

    /// Fails every launch on the listed GPU.
    struct NullLauncher {
        broken_gpu: Option<u32>,
    }

    #[async_trait]
    impl ProcessLauncher for NullLauncher {
        async fn launch(&self, device: Device) -> Result<Box<dyn DecoderProcess>> {
            if matches!(device, Device::Gpu(id) if Some(id) == self.broken_gpu) {
                return Err(DecoderError::WorkerUnavailable("CUDA error".to_string()));
            }
            Ok(Box::new(NullProcess {
                device,
                alive: true,
            }))
        }
    }

    fn launcher(broken_gpu: Option<u32>) -> Arc<dyn ProcessLauncher> {
        Arc::new(NullLauncher { broken_gpu })
    }

    fn en_it() -> LanguageDirection {
        LanguageDirection::new("en", "it")
    }

    #[tokio::test]
    async fn test_initialize_fills_queue() {
        let config = DecoderConfig::gpu(vec![0, 1, 2]);
        let pool = DecoderPool::initialize(&config, launcher(None), CheckpointMap::new())
            .await
            .unwrap();

        assert_eq!(pool.capacity(), 3);
        assert_eq!(pool.availability(), 3);
        assert_eq!(pool.idle(), 3);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_initialize_failure_is_fatal() {
        let config = DecoderConfig::gpu(vec![0, 1]);
        let result = DecoderPool::initialize(&config, launcher(Some(1)), CheckpointMap::new()).await;
        assert!(matches!(result, Err(DecoderError::Initialization(_))));
    }

    #[tokio::test]
    async fn test_acquire_timeout_when_all_busy() {
        let config = DecoderConfig::cpu(1);
        let pool = DecoderPool::initialize(&config, launcher(None), CheckpointMap::new())
            .await
            .unwrap();

        let held = pool.acquire(&en_it(), None).await.unwrap();
        let err = pool
            .acquire(&en_it(), Some(Duration::from_millis(30)))
            .await
            .unwrap_err();
        assert!(matches!(err, DecoderError::NoWorkersAvailable));

        pool.release(held);
        assert_eq!(pool.idle(), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_double_release_is_ignored() {
        let config = DecoderConfig::cpu(2);
        let pool = DecoderPool::initialize(&config, launcher(None), CheckpointMap::new())
            .await
            .unwrap();

        let handle = pool.acquire(&en_it(), None).await.unwrap();
        pool.release(Arc::clone(&handle));
        pool.release(handle);

        assert_eq!(pool.idle(), 2);
        assert_eq!(pool.availability(), 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_rejects_acquire() {
        let config = DecoderConfig::cpu(2);
        let pool = DecoderPool::initialize(&config, launcher(None), CheckpointMap::new())
            .await
            .unwrap();

        let held = pool.acquire(&en_it(), None).await.unwrap();
        pool.shutdown().await;

        assert!(!pool.is_active());
        assert_eq!(pool.idle(), 0);
        assert!(matches!(
            pool.acquire(&en_it(), None).await,
            Err(DecoderError::NoWorkersAvailable)
        ));

        // released after shutdown: closed, not requeued
        pool.release(held);
        assert_eq!(pool.idle(), 0);
    }

    fn detached_state(launcher: Arc<dyn ProcessLauncher>, alive: usize) -> Arc<PoolShared> {
        Arc::new(PoolShared {
            queue: AffinityQueue::new(2, 0),
            placement: Mutex::new(Placement::gpu(vec![0, 1])),
            capacity: 2,
            alive: AtomicUsize::new(alive),
            active: AtomicBool::new(true),
            listener: RwLock::new(None),
            starved: Notify::new(),
            launcher,
            checkpoints: Arc::new(CheckpointMap::new()),
            respawn: RespawnPolicy {
                max_attempts: 2,
                backoff_ms: 1,
            },
            metrics: MetricsCollector::new(),
        })
    }

    async fn dead_worker_on(shared: &PoolShared) -> Arc<WorkerHandle> {
        let device = shared.placement().claim().unwrap();
        let handle = WorkerHandle::launch(0, device, launcher(None), Arc::new(CheckpointMap::new()))
            .await
            .unwrap();
        handle.mark_dead();
        Arc::new(handle)
    }

    #[tokio::test]
    async fn test_recover_relaunches_slot() {
        let shared = detached_state(launcher(None), 1);
        shared.placement().claim();
        let dead = dead_worker_on(&shared).await;

        recover(Arc::clone(&shared), dead).await;

        assert_eq!(shared.queue.len(), 1);
        assert_eq!(shared.alive.load(Ordering::SeqCst), 2);
        // relaunched on the device it died on
        assert!(shared.placement().free_devices().is_empty());
        let relaunched = shared.queue.poll().unwrap();
        assert_eq!(relaunched.device(), Device::Gpu(1));
        assert!(relaunched.is_alive());
    }

    #[tokio::test]
    async fn test_respawn_exhaustion_returns_device() {
        let shared = detached_state(Arc::new(FailingLauncher), 1);
        shared.placement().claim();
        let dead = dead_worker_on(&shared).await;
        let device = dead.device();

        recover(Arc::clone(&shared), dead).await;

        assert!(shared.queue.is_empty());
        assert_eq!(shared.alive.load(Ordering::SeqCst), 1);
        assert_eq!(shared.placement().free_devices(), vec![device]);
    }

    struct FailingLauncher;

    #[async_trait]
    impl ProcessLauncher for FailingLauncher {
        async fn launch(&self, _device: Device) -> Result<Box<dyn DecoderProcess>> {
            Err(DecoderError::WorkerUnavailable("out of memory".to_string()))
        }
    }
}
