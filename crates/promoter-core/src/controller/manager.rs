//! Runs reconcilers against the store.
//!
//! The manager owns one [`WorkQueue`] per registered reconciler and feeds it
//! from three sources: the initial list, store watch events (the object's
//! own kind plus whatever its [`EventMapper`]s translate), and a periodic
//! resync. Workers pull keys, run the reconcile on its own task under a
//! timeout, and requeue according to the result.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use promoter_store::{ObjectKey, ObjectStore, WatchEvent, WatchEventType};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use super::{Action, Reconciler, WorkQueue};
use crate::config::PromoterConfig;
use crate::error::{ErrorClass, PromoterError, Result};
use crate::git::GitPaths;
use crate::metrics::METRICS;
use crate::obs;

/// Translates a change to one kind into keys of the reconciler's kind.
#[async_trait]
pub trait EventMapper: Send + Sync {
    /// Kind whose events this mapper consumes.
    fn source_kind(&self) -> &'static str;

    async fn map(&self, event: &WatchEvent) -> Vec<ObjectKey>;
}

/// Enqueues the controlling owner of a changed object when it is of
/// `owner_kind`.
pub struct OwnerMapper {
    source: &'static str,
    owner_kind: &'static str,
}

impl OwnerMapper {
    pub fn new(source: &'static str, owner_kind: &'static str) -> Self {
        Self { source, owner_kind }
    }
}

#[async_trait]
impl EventMapper for OwnerMapper {
    fn source_kind(&self) -> &'static str {
        self.source
    }

    async fn map(&self, event: &WatchEvent) -> Vec<ObjectKey> {
        event
            .metadata
            .controller_owner()
            .filter(|owner| owner.kind == self.owner_kind)
            .map(|owner| {
                vec![ObjectKey::new(
                    event.metadata.namespace.clone(),
                    owner.name.clone(),
                )]
            })
            .unwrap_or_default()
    }
}

struct Controller {
    reconciler: Arc<dyn Reconciler>,
    queue: Arc<WorkQueue>,
    mappers: Vec<Arc<dyn EventMapper>>,
}

/// Cloneable handle for triggering reconciles and shutdown from outside
/// the manager, e.g. a webhook receiver or a signal handler.
#[derive(Clone)]
pub struct ManagerHandle {
    queues: Arc<HashMap<&'static str, Arc<WorkQueue>>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ManagerHandle {
    /// Queue `key` for the reconciler of `kind`. False if no such reconciler
    /// is registered or the manager is shutting down.
    pub fn enqueue(&self, kind: &str, key: ObjectKey) -> bool {
        match self.queues.get(kind) {
            Some(queue) => queue.add(key),
            None => false,
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

pub struct Manager {
    store: Arc<dyn ObjectStore>,
    config: Arc<PromoterConfig>,
    controllers: Vec<Controller>,
    paths: Option<GitPaths>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Manager {
    pub fn new(store: Arc<dyn ObjectStore>, config: Arc<PromoterConfig>) -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            store,
            config,
            controllers: Vec::new(),
            paths: None,
            shutdown_tx: Arc::new(tx),
            shutdown_rx: rx,
        }
    }

    /// Git directories to remove once shut down.
    pub fn with_git_paths(mut self, paths: GitPaths) -> Self {
        self.paths = Some(paths);
        self
    }

    pub fn register(
        mut self,
        reconciler: Arc<dyn Reconciler>,
        mappers: Vec<Arc<dyn EventMapper>>,
    ) -> Self {
        self.controllers.push(Controller {
            reconciler,
            queue: WorkQueue::new(),
            mappers,
        });
        self
    }

    pub fn handle(&self) -> ManagerHandle {
        ManagerHandle {
            queues: Arc::new(
                self.controllers
                    .iter()
                    .map(|c| (c.reconciler.kind(), Arc::clone(&c.queue)))
                    .collect(),
            ),
            shutdown: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Run until [`ManagerHandle::shutdown`] is called. Fails only if the
    /// initial list against the store fails.
    pub async fn run(self) -> Result<()> {
        let controllers = Arc::new(self.controllers);
        let config = self.config;
        let store = self.store;

        // Subscribe before listing so nothing between the two is missed.
        let events = store.watch();
        enqueue_all(store.as_ref(), &controllers).await?;
        info!(
            controllers = controllers.len(),
            workers = config.workers,
            "controller manager started"
        );

        let mut background = JoinSet::new();
        background.spawn(dispatch_events(
            Arc::clone(&store),
            Arc::clone(&controllers),
            events,
            self.shutdown_rx.clone(),
        ));
        background.spawn(resync(
            Arc::clone(&store),
            Arc::clone(&controllers),
            config.resync(),
            self.shutdown_rx.clone(),
        ));

        // Every reconcile task holds a sender; the channel closes once the
        // last one is gone.
        let (in_flight, mut all_finished) = mpsc::channel::<()>(1);
        let mut workers = JoinSet::new();
        for index in 0..controllers.len() {
            for _ in 0..config.workers {
                workers.spawn(worker(
                    Arc::clone(&controllers),
                    index,
                    Arc::clone(&config),
                    in_flight.clone(),
                ));
            }
        }

        let mut shutdown = self.shutdown_rx;
        while !*shutdown.borrow_and_update() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        info!("shutdown requested, draining in-flight reconciles");
        for controller in controllers.iter() {
            controller.queue.shutdown();
        }

        let grace = config.shutdown_grace();
        let drained = tokio::time::timeout(grace, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(grace_secs = grace.as_secs(), "reconciles still running after grace period, aborting");
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }
        background.abort_all();
        while background.join_next().await.is_some() {}
        drop(in_flight);
        let _ = all_finished.recv().await;

        if let Some(paths) = self.paths {
            let removed = paths.cleanup();
            info!(removed, "removed local git directories");
        }
        METRICS.flush();
        Ok(())
    }
}

async fn enqueue_all(store: &dyn ObjectStore, controllers: &[Controller]) -> Result<()> {
    for controller in controllers {
        let kind = controller.reconciler.kind();
        let objects = store.list(kind, None, None).await?;
        debug!(kind, count = objects.len(), "enqueueing existing objects");
        for object in objects {
            controller.queue.add(object.key());
        }
    }
    Ok(())
}

async fn dispatch_events(
    store: Arc<dyn ObjectStore>,
    controllers: Arc<Vec<Controller>>,
    mut events: broadcast::Receiver<WatchEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    // Last generation seen per object of a reconciled kind. Status-only
    // writes keep the generation and do not retrigger their own reconciler.
    let mut generations: HashMap<(String, ObjectKey), u64> = HashMap::new();
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => return,
            received = events.recv() => received,
        };
        let event = match event {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "watch stream lagged, resyncing");
                if let Err(err) = enqueue_all(store.as_ref(), &controllers).await {
                    warn!(error = %err, "resync after lag failed");
                }
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        for controller in controllers.iter() {
            let kind = controller.reconciler.kind();
            if event.kind == kind {
                let key = event.metadata.key();
                let slot = (event.kind.clone(), key.clone());
                let enqueue = match event.event_type {
                    WatchEventType::Deleted => {
                        generations.remove(&slot);
                        true
                    }
                    _ => generations.insert(slot, event.metadata.generation)
                        != Some(event.metadata.generation),
                };
                if enqueue {
                    controller.queue.add(key);
                }
            }
            for mapper in controller
                .mappers
                .iter()
                .filter(|m| m.source_kind() == event.kind)
            {
                for key in mapper.map(&event).await {
                    debug!(kind, key = %key, source = %event.kind, "mapped watch event");
                    controller.queue.add(key);
                }
            }
        }
    }
}

async fn resync(
    store: Arc<dyn ObjectStore>,
    controllers: Arc<Vec<Controller>>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = ticker.tick() => {}
        }
        if let Err(err) = enqueue_all(store.as_ref(), &controllers).await {
            warn!(error = %err, "periodic resync failed");
        }
        METRICS.flush();
    }
}

async fn worker(
    controllers: Arc<Vec<Controller>>,
    index: usize,
    config: Arc<PromoterConfig>,
    in_flight: mpsc::Sender<()>,
) {
    let controller = &controllers[index];
    while let Some(key) = controller.queue.next().await {
        process(controller, key, &config, &in_flight).await;
    }
}

fn panic_message(err: JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string()),
        Err(err) => err.to_string(),
    }
}

async fn process(
    controller: &Controller,
    key: ObjectKey,
    config: &PromoterConfig,
    in_flight: &mpsc::Sender<()>,
) {
    let reconciler = Arc::clone(&controller.reconciler);
    let kind = reconciler.kind();
    let timeout = config.reconcile_timeout();
    obs::emit_reconcile_started(kind, &key);
    METRICS.inc_reconciles();
    let started = std::time::Instant::now();

    // Own task: a panic ends this reconcile, not the worker. The set aborts
    // the task if the worker is dropped mid-reconcile.
    let mut task = JoinSet::new();
    {
        let reconciler = Arc::clone(&reconciler);
        let key = key.clone();
        let in_flight = in_flight.clone();
        task.spawn(async move {
            let _in_flight = in_flight;
            tokio::time::timeout(timeout, reconciler.reconcile(&key)).await
        });
    }
    let joined = match task.join_next().await {
        Some(joined) => joined,
        None => return,
    };
    let result = match joined {
        Ok(Ok(result)) => result,
        Ok(Err(_elapsed)) => Err(PromoterError::Timeout(timeout)),
        Err(err) if err.is_panic() => Err(PromoterError::Invariant(format!(
            "reconcile panicked: {}",
            panic_message(err)
        ))),
        Err(err) => Err(PromoterError::Invariant(format!(
            "reconcile task failed: {err}"
        ))),
    };
    let duration_ms = started.elapsed().as_millis() as u64;
    controller.queue.done(&key);

    match result {
        Ok(action) => {
            controller.queue.forget(&key);
            obs::emit_reconcile_finished(kind, &key, duration_ms, true);
            if let Action::RequeueAfter(delay) = action {
                controller.queue.add_after(key, delay);
            }
        }
        Err(err) => {
            METRICS.inc_reconcile_errors();
            obs::emit_reconcile_finished(kind, &key, duration_ms, false);
            let class = err.class();
            match class {
                ErrorClass::DependencyNotFound => {
                    debug!(kind, key = %key, error = %err, "dependency not ready")
                }
                ErrorClass::Invariant => {
                    error!(kind, key = %key, error = %err, "reconcile invariant violated")
                }
                ErrorClass::Transient | ErrorClass::Configuration => {
                    obs::emit_reconcile_failed(kind, &key, &err)
                }
            }
            if let Err(record_err) = reconciler.record_failure(&key, &err).await {
                warn!(kind, key = %key, error = %record_err, "failed to record reconcile failure");
            }
            match class {
                ErrorClass::Transient | ErrorClass::Invariant => {
                    let delay = controller.queue.backoff(&key);
                    controller.queue.add_after(key, delay);
                }
                ErrorClass::DependencyNotFound => {
                    controller.queue.add_after(key, config.dependency_retry());
                }
                // Waits for the next change to the object.
                ErrorClass::Configuration => {}
            }
        }
    }
}
