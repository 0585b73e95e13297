//! The coordinator: owns the queue, the request store, jobs with their
//! worker pools and handler pipelines, and drives lifecycle, completion,
//! and shutdown.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{Config, JobConfig};
use crate::handler::{new_resource_handlers, HandlerError, ResourceHandler};
use crate::job::{Job, JobError};
use crate::queue::{MemQueue, Queue};
use crate::request::{Request, RequestStatus};
use crate::request_store::{MemRequestStore, RequestStore, SledRequestStore, StoreError};
use crate::resource::Resource;
use crate::url_norm::normalize_url_string;
use crate::worker::{new_workers, WorkCoordinator, Worker, WorkerError};

/// How long the backoff tuner waits between recovery steps.
const BACKOFF_RECOVERY_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum CoordError {
    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("config: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("job: {0}")]
    Job(#[from] JobError),

    #[error("worker: {0}")]
    Worker(#[from] WorkerError),

    #[error("handler: {0}")]
    Handler(#[from] HandlerError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("database: {0}")]
    Db(#[from] sled::Error),

    #[error("errors occurred during finalization:\n{0}")]
    Finalize(String),
}

/// Create a coordinator and register one job from a config. The usual
/// single-call path for a configured walk.
pub fn new_walk(cfg: &Config) -> Result<(Coordinator, Arc<Job>), CoordError> {
    let coord = Coordinator::new(cfg)?;
    let job = coord.new_job(cfg.job.clone())?;
    Ok((coord, job))
}

/// Process-wide owner of jobs, workers, and the shared queue and store.
/// Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    queue: Arc<dyn Queue>,
    store: Arc<dyn RequestStore>,
    db: Option<sled::Db>,

    jobs: RwLock<Vec<Arc<Job>>>,
    job_handlers: RwLock<HashMap<String, Vec<Arc<dyn ResourceHandler>>>>,
    job_workers: RwLock<HashMap<String, Vec<Arc<dyn Worker>>>>,

    /// Sender feeding the in-flight counter task. The counter itself is
    /// owned by that task; `in_flight` mirrors it for readers.
    deltas: mpsc::UnboundedSender<i64>,
    in_flight: Arc<AtomicI64>,
    drained: Arc<Notify>,

    /// Serializes the completion algorithm so the lookup-then-enqueue dedup
    /// step is race-free across workers.
    completion_lock: tokio::sync::Mutex<()>,

    /// Tracks spawned handler invocations so shutdown can wait for them
    /// before finalizing.
    handler_tasks: TaskTracker,

    stopping: Arc<AtomicBool>,
    cancel: CancellationToken,
    shutdown_started: AtomicBool,
    /// Flips to true once shutdown has fully finished, so concurrent
    /// callers can wait for the first one.
    shutdown_state: tokio::sync::watch::Sender<bool>,
}

impl Coordinator {
    /// Build a coordinator from a config: opens the database when one is
    /// configured and instantiates the queue and request store it names.
    pub fn new(cfg: &Config) -> Result<Self, CoordError> {
        let db = match &cfg.db {
            Some(db_cfg) => Some(sled::open(&db_cfg.path)?),
            None => None,
        };

        let queue: Arc<dyn Queue> = match cfg.queue.kind.as_str() {
            "mem" | "" => Arc::new(MemQueue::new()),
            other => {
                return Err(crate::config::ConfigError::UnknownType {
                    kind: "queue",
                    value: other.to_string(),
                }
                .into())
            }
        };

        let store: Arc<dyn RequestStore> = match cfg.request_store.kind.as_str() {
            "mem" | "" => Arc::new(MemRequestStore::new()),
            "sled" => {
                let db = db.clone().ok_or_else(|| {
                    crate::config::ConfigError::Validation(
                        "request_store type \"sled\" requires a configured db".to_string(),
                    )
                })?;
                Arc::new(SledRequestStore::new(db))
            }
            other => {
                return Err(crate::config::ConfigError::UnknownType {
                    kind: "request_store",
                    value: other.to_string(),
                }
                .into())
            }
        };

        Ok(Self::with_parts(queue, store, db))
    }

    /// Assemble a coordinator from explicit parts. Tests use this to inject
    /// instrumented queues and stores.
    pub fn with_parts(
        queue: Arc<dyn Queue>,
        store: Arc<dyn RequestStore>,
        db: Option<sled::Db>,
    ) -> Self {
        let (deltas, delta_rx) = mpsc::unbounded_channel();
        let in_flight = Arc::new(AtomicI64::new(0));
        let drained = Arc::new(Notify::new());
        let stopping = Arc::new(AtomicBool::new(false));

        let coord = Self {
            inner: Arc::new(Inner {
                queue,
                store,
                db,
                jobs: RwLock::new(Vec::new()),
                job_handlers: RwLock::new(HashMap::new()),
                job_workers: RwLock::new(HashMap::new()),
                deltas,
                in_flight: Arc::clone(&in_flight),
                drained: Arc::clone(&drained),
                completion_lock: tokio::sync::Mutex::new(()),
                handler_tasks: TaskTracker::new(),
                stopping: Arc::clone(&stopping),
                cancel: CancellationToken::new(),
                shutdown_started: AtomicBool::new(false),
                shutdown_state: tokio::sync::watch::channel(false).0,
            }),
        };

        // The counter task is the single owner of the in-flight count; all
        // +1/-1 updates arrive over the channel, so the drained predicate
        // has one writer.
        tokio::spawn(run_counter(
            delta_rx,
            in_flight,
            drained,
            stopping,
            Arc::clone(&coord.inner.queue),
        ));

        coord
    }

    /// Instantiate workers and handlers for a job config and register the
    /// job. The job starts in `New`; nothing runs until
    /// [`Coordinator::start_job`].
    pub fn new_job(&self, cfg: JobConfig) -> Result<Arc<Job>, CoordError> {
        let job = Arc::new(Job::new(cfg)?);
        self.inner.jobs.write().push(Arc::clone(&job));

        let workers = match new_workers(&job.config().workers, &self.inner.cancel) {
            Ok(ws) => ws,
            Err(e) => {
                job.errored(&e);
                return Err(e.into());
            }
        };
        self.inner
            .job_workers
            .write()
            .insert(job.id().to_string(), workers);

        let handlers = match new_resource_handlers(
            self.inner.db.as_ref(),
            &job.config().resource_handlers,
        ) {
            Ok(hs) => hs,
            Err(e) => {
                job.errored(&e);
                return Err(e.into());
            }
        };
        self.inner
            .job_handlers
            .write()
            .insert(job.id().to_string(), handlers);

        Ok(job)
    }

    /// All jobs this coordinator owns.
    pub fn jobs(&self) -> Vec<Arc<Job>> {
        self.inner.jobs.read().clone()
    }

    /// Fetch a single job by id.
    pub fn job(&self, id: &str) -> Option<Arc<Job>> {
        self.inner.jobs.read().iter().find(|j| j.id() == id).cloned()
    }

    /// The shared queue of requests needing fetches.
    pub fn queue(&self) -> Arc<dyn Queue> {
        Arc::clone(&self.inner.queue)
    }

    /// The shared request store.
    pub fn request_store(&self) -> Arc<dyn RequestStore> {
        Arc::clone(&self.inner.store)
    }

    /// Handlers registered for a job. Mostly useful to tests inspecting
    /// in-memory sinks.
    pub fn job_handlers(&self, job_id: &str) -> Vec<Arc<dyn ResourceHandler>> {
        self.inner
            .job_handlers
            .read()
            .get(job_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Register an additional handler for a job.
    pub fn add_resource_handler(&self, job_id: &str, handler: Arc<dyn ResourceHandler>) {
        self.inner
            .job_handlers
            .write()
            .entry(job_id.to_string())
            .or_default()
            .push(handler);
    }

    /// Begin executing a job: start its workers, drain its seeds into the
    /// queue, install the done-scan and backoff tickers, and block until
    /// the job completes or the coordinator shuts down.
    #[tracing::instrument(skip(self))]
    pub async fn start_job(&self, id: &str) -> Result<(), CoordError> {
        let job = self
            .job(id)
            .ok_or_else(|| CoordError::JobNotFound(id.to_string()))?;

        let workers = self
            .inner
            .job_workers
            .read()
            .get(job.id())
            .cloned()
            .unwrap_or_default();
        let work_coord: Arc<dyn WorkCoordinator> = Arc::new(self.clone());
        for w in &workers {
            w.start(Arc::clone(&work_coord))?;
        }

        if job.status() == crate::job::JobStatus::New {
            job.start();
            self.spawn_seed_drain(Arc::clone(&job));
        }

        if job.config().done_scan_ms > 0 {
            self.spawn_done_scan(Arc::clone(&job));
        }

        if !job.config().backoff_response_codes.is_empty() {
            self.spawn_backoff_recovery(Arc::clone(&job));
        }

        tracing::info!(job_id = %job.id(), "job started");
        job.wait_stopped().await;

        if let Some(err) = job.error() {
            tracing::error!(job_id = %job.id(), "job finished with error: {}", err);
        }
        Ok(())
    }

    /// Submit completed resources. Updates request records, fans resources
    /// out to the job's handlers, and enqueues newly discovered in-scope
    /// links.
    pub async fn completed_resources(&self, resources: Vec<Resource>) -> Result<(), CoordError> {
        let _guard = self.inner.completion_lock.lock().await;

        // Candidate links across the whole batch, first discovery wins.
        let mut seen = HashSet::new();
        let mut links: Vec<(String, String)> = Vec::new();

        for resource in &resources {
            let Some(job) = self.job(&resource.job_id) else {
                tracing::error!(url = %resource.url, "no job for completed resource");
                continue;
            };

            self.settle_resource(&job, resource).await;

            if job.config().crawl {
                for link in &resource.links {
                    if job.is_candidate(link) && seen.insert(link.clone()) {
                        links.push((link.clone(), resource.job_id.clone()));
                    }
                }
            }
        }

        tracing::debug!(
            resources = resources.len(),
            candidates = links.len(),
            "completed batch"
        );

        for (url, job_id) in links {
            match self.inner.store.get(&url) {
                Err(StoreError::NotFound) => self.enqueue(Request::new(job_id, url)),
                Ok(_) => {} // already known, never enqueue twice
                Err(e) => tracing::debug!(url = %url, "link lookup: {}", e),
            }
        }

        Ok(())
    }

    /// Settle one resource against its request record: bump attempts, mark
    /// done/failed or re-enqueue, fan out to handlers, and drive the
    /// termination rules.
    async fn settle_resource(&self, job: &Arc<Job>, resource: &Resource) {
        let mut request = match self.inner.store.get(&resource.url) {
            Ok(r) => r,
            Err(StoreError::NotFound) => Request::new(resource.job_id.clone(), resource.url.clone()),
            Err(e) => {
                tracing::debug!(url = %resource.url, "request lookup: {}", e);
                Request::new(resource.job_id.clone(), resource.url.clone())
            }
        };

        request.prev_response_status = resource.status;
        request.attempts_made += 1;

        if job
            .config()
            .backoff_response_codes
            .contains(&resource.status)
        {
            self.slow_down(job);
        }

        if job.is_ok_response(resource.status) {
            tracing::debug!(url = %resource.url, status = resource.status, "request done");
            request.status = RequestStatus::Done;
            if let Err(e) = self.inner.store.put(&request) {
                tracing::error!(url = %request.url, "persisting request: {}", e);
            }

            let finished = job.inc_finished();
            for handler in self.job_handlers(job.id()) {
                let resource = resource.clone();
                self.inner.handler_tasks.spawn(async move {
                    handler.handle(&resource).await;
                });
            }

            let stop_after = job.config().stop_after_entries;
            if stop_after > 0 && finished >= stop_after {
                tracing::info!(job_id = %job.id(), finished, "entry limit reached, stopping");
                self.spawn_shutdown();
            }

            if job.stop_url() == Some(resource.url.as_str()) {
                tracing::info!(url = %resource.url, "stop url encountered, stopping");
                self.spawn_shutdown();
            }
        } else if request.attempts_made <= job.config().max_attempts {
            self.enqueue(request);
        } else {
            tracing::info!(url = %request.url, attempts = request.attempts_made, "giving up");
            request.status = RequestStatus::Failed;
            if let Err(e) = self.inner.store.put(&request) {
                tracing::error!(url = %request.url, "persisting request: {}", e);
            }
        }

        let _ = self.inner.deltas.send(-1);
    }

    /// Put a request on the queue. Once the coordinator is stopping, new
    /// requests short-circuit straight to `Failed`.
    pub fn enqueue(&self, mut request: Request) {
        if self.inner.stopping.load(Ordering::SeqCst) {
            request.status = RequestStatus::Failed;
            if let Err(e) = self.inner.store.put(&request) {
                tracing::debug!(url = %request.url, "persisting failed request: {}", e);
            }
            return;
        }

        tracing::debug!(url = %request.url, "enqueue");
        request.status = RequestStatus::Queued;
        if let Err(e) = self.inner.store.put(&request) {
            tracing::error!(url = %request.url, "persisting queued request: {}", e);
        }

        match self.inner.queue.push(request) {
            Ok(()) => {
                let _ = self.inner.deltas.send(1);
            }
            Err(e) => tracing::debug!("queue push: {}", e),
        }
    }

    /// Halt the coordinator: stop intake, let in-flight work finish, drain
    /// the queue, then run every handler finalizer. Returns an aggregate
    /// error if any finalizer fails. Idempotent; concurrent callers return
    /// immediately.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), CoordError> {
        if self.inner.shutdown_started.swap(true, Ordering::SeqCst) {
            // Another caller got here first; wait until it finishes.
            let mut rx = self.inner.shutdown_state.subscribe();
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
            return Ok(());
        }
        tracing::debug!("shutting down");

        self.inner.stopping.store(true, Ordering::SeqCst);
        self.inner.cancel.cancel();

        // Join workers; their in-flight requests complete and report first.
        let all_workers: Vec<Arc<dyn Worker>> = {
            let map = self.inner.job_workers.read();
            map.values().flatten().cloned().collect()
        };
        for worker in all_workers {
            worker.stop().await;
        }

        // Whatever is still queued will never be fetched.
        self.inner.queue.close();
        while let Some(mut request) = self.inner.queue.pop().await {
            request.status = RequestStatus::Failed;
            if let Err(e) = self.inner.store.put(&request) {
                tracing::debug!(url = %request.url, "persisting drained request: {}", e);
            }
            let _ = self.inner.deltas.send(-1);
        }

        // Force one more drain evaluation, then wait for the counter task
        // to agree everything settled.
        let _ = self.inner.deltas.send(0);
        while self.inner.in_flight.load(Ordering::SeqCst) > 0 {
            self.inner.drained.notified().await;
        }

        // Handlers may still be processing fan-outs; wait before finalizing.
        self.inner.handler_tasks.close();
        self.inner.handler_tasks.wait().await;

        let mut finalizer_errs = Vec::new();
        let all_handlers: Vec<Arc<dyn ResourceHandler>> = {
            let map = self.inner.job_handlers.read();
            map.values().flatten().cloned().collect()
        };
        for handler in all_handlers {
            tracing::info!("finalizing: {}", handler.kind());
            if let Err(e) = handler.finalize().await {
                finalizer_errs.push(format!("{}: {}", handler.kind(), e));
            }
        }

        for job in self.jobs() {
            if !job.is_terminal() {
                job.complete();
            }
        }

        self.inner.shutdown_state.send_replace(true);

        if finalizer_errs.is_empty() {
            Ok(())
        } else {
            Err(CoordError::Finalize(finalizer_errs.join("\n")))
        }
    }

    fn spawn_shutdown(&self) {
        let coord = self.clone();
        tokio::spawn(async move {
            if let Err(e) = coord.shutdown().await {
                tracing::error!("shutdown: {}", e);
            }
        });
    }

    /// Read the job's seed stream into the queue.
    fn spawn_seed_drain(&self, job: Arc<Job>) {
        let coord = self.clone();
        tokio::spawn(async move {
            let mut seeds = job.seeds();
            while let Some(item) = seeds.next().await {
                match item {
                    Ok(raw) => match normalize_url_string(&raw) {
                        Ok(url) => coord.enqueue(Request::new(job.id(), url)),
                        Err(e) => tracing::warn!(url = %raw, "skipping seed: {}", e),
                    },
                    Err(e) => {
                        tracing::error!(job_id = %job.id(), "reading seeds: {}", e);
                        job.errored(format!("reading seeds: {}", e));
                        return;
                    }
                }
            }
        });
    }

    /// Periodically check whether a job's crawl is finished: nothing queued,
    /// nothing in flight, and every request the job owns is terminal.
    fn spawn_done_scan(&self, job: Arc<Job>) {
        let coord = self.clone();
        let period = Duration::from_millis(job.config().done_scan_ms);
        tracing::debug!(job_id = %job.id(), ?period, "done-scan installed");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick is immediate

            loop {
                tokio::select! {
                    _ = coord.inner.cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                if !coord.inner.queue.is_empty()
                    || coord.inner.in_flight.load(Ordering::SeqCst) > 0
                {
                    continue;
                }

                let requests = match coord.inner.store.list(0, 0) {
                    Ok(reqs) => reqs,
                    Err(e) => {
                        tracing::error!("listing requests: {}", e);
                        continue;
                    }
                };
                let job_requests: Vec<&Request> = requests
                    .iter()
                    .filter(|r| r.job_id == job.id())
                    .collect();
                if job_requests.is_empty()
                    || !job_requests.iter().all(|r| r.status.is_terminal())
                {
                    continue;
                }

                tracing::info!(job_id = %job.id(), "nothing queued or in flight, crawl done");
                job.complete();
                if coord.jobs().iter().all(|j| j.is_terminal()) {
                    coord.spawn_shutdown();
                }
                return;
            }
        });
    }

    /// Backoff recovery: every minute, halve the extra delay back toward
    /// the configured baseline.
    fn spawn_backoff_recovery(&self, job: Arc<Job>) {
        let coord = self.clone();
        tokio::spawn(async move {
            let baseline = Duration::from_millis(job.config().delay_ms);
            let mut ticker = tokio::time::interval(BACKOFF_RECOVERY_INTERVAL);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = coord.inner.cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                let current = job.crawl_delay();
                if current > baseline {
                    tracing::info!(job_id = %job.id(), "speeding crawler back up");
                    let reduced = baseline + (current - baseline) / 2;
                    coord.set_job_delay(&job, reduced);
                }
            }
        });
    }

    /// Increase the job's delay in response to a backoff status.
    fn slow_down(&self, job: &Arc<Job>) {
        let bump = Duration::from_millis(job.config().delay_ms) / 2;
        let delay = job.crawl_delay() + bump;
        tracing::info!(job_id = %job.id(), ?delay, "backing off");
        self.set_job_delay(job, delay);
    }

    fn set_job_delay(&self, job: &Arc<Job>, delay: Duration) {
        job.set_crawl_delay(delay);
        if let Some(workers) = self.inner.job_workers.read().get(job.id()) {
            for w in workers {
                w.set_delay(delay);
            }
        }
    }
}

#[async_trait::async_trait]
impl WorkCoordinator for Coordinator {
    fn queue(&self) -> Arc<dyn Queue> {
        Coordinator::queue(self)
    }

    fn request_store(&self) -> Arc<dyn RequestStore> {
        Coordinator::request_store(self)
    }

    async fn completed(&self, resources: Vec<Resource>) {
        if let Err(e) = self.completed_resources(resources).await {
            tracing::error!("coordinator: {}", e);
        }
    }
}

/// The single-owner counter loop. Applies deltas, mirrors the count, and
/// signals drain completion once the coordinator is stopping with an empty
/// queue and nothing in flight.
async fn run_counter(
    mut deltas: mpsc::UnboundedReceiver<i64>,
    in_flight: Arc<AtomicI64>,
    drained: Arc<Notify>,
    stopping: Arc<AtomicBool>,
    queue: Arc<dyn Queue>,
) {
    let mut count: i64 = 0;
    while let Some(delta) = deltas.recv().await {
        count += delta;
        in_flight.store(count, Ordering::SeqCst);
        if stopping.load(Ordering::SeqCst) && count <= 0 && queue.is_empty() {
            drained.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ResourceHandlerConfig, StoreConfig};

    fn mem_coordinator() -> Coordinator {
        Coordinator::with_parts(
            Arc::new(MemQueue::new()),
            Arc::new(MemRequestStore::new()),
            None,
        )
    }

    #[tokio::test]
    async fn test_new_job_registers_workers_and_handlers() {
        let coord = mem_coordinator();
        let cfg = JobConfig {
            resource_handlers: vec![ResourceHandlerConfig {
                kind: "MEM".to_string(),
                ..ResourceHandlerConfig::default()
            }],
            ..JobConfig::default()
        };
        let job = coord.new_job(cfg).unwrap();

        assert_eq!(coord.jobs().len(), 1);
        assert!(coord.job(job.id()).is_some());
        assert_eq!(coord.job_handlers(job.id()).len(), 1);
        assert_eq!(coord.job_handlers(job.id())[0].kind(), "MEM");
    }

    #[tokio::test]
    async fn test_unknown_handler_type_errors_job() {
        let coord = mem_coordinator();
        let cfg = JobConfig {
            resource_handlers: vec![ResourceHandlerConfig {
                kind: "WARC".to_string(),
                ..ResourceHandlerConfig::default()
            }],
            ..JobConfig::default()
        };
        assert!(coord.new_job(cfg).is_err());
        assert_eq!(coord.jobs()[0].status(), crate::job::JobStatus::Errored);
    }

    #[tokio::test]
    async fn test_enqueue_persists_and_pushes() {
        let coord = mem_coordinator();
        coord.enqueue(Request::new("j", "http://a.local/x"));

        let stored = coord.request_store().get("http://a.local/x").unwrap();
        assert_eq!(stored.status, RequestStatus::Queued);
        assert_eq!(coord.queue().len(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_while_stopping_fails_request() {
        let coord = mem_coordinator();
        coord.inner.stopping.store(true, Ordering::SeqCst);
        coord.enqueue(Request::new("j", "http://a.local/x"));

        let stored = coord.request_store().get("http://a.local/x").unwrap();
        assert_eq!(stored.status, RequestStatus::Failed);
        assert_eq!(coord.queue().len(), 0);
    }

    #[tokio::test]
    async fn test_unknown_store_type_is_config_error() {
        let cfg = Config {
            request_store: StoreConfig {
                kind: "dynamo".to_string(),
            },
            ..Config::default()
        };
        assert!(matches!(
            Coordinator::new(&cfg),
            Err(CoordError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_sled_store_requires_db() {
        let cfg = Config {
            request_store: StoreConfig {
                kind: "sled".to_string(),
            },
            ..Config::default()
        };
        assert!(Coordinator::new(&cfg).is_err());
    }
}
