//! Workers: turn queued requests into resources by fetching.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use robotstxt::DefaultMatcher;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::WorkerConfig;
use crate::queue::Queue;
use crate::request::{Request, RequestStatus};
use crate::request_store::RequestStore;
use crate::resource::Resource;
use crate::url_norm::{authority, normalize_url};

const DEFAULT_USER_AGENT: &str = concat!("sitewalker/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT_SECS: u64 = 30;
const MAX_REDIRECT_HOPS: usize = 10;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("unrecognized worker type: {0}")]
    UnknownType(String),

    #[error("building http client: {0}")]
    Client(String),

    #[error("worker already started")]
    AlreadyStarted,
}

/// The narrow capability a worker needs from the coordinator: work intake,
/// request bookkeeping, and a place to post finished resources.
#[async_trait]
pub trait WorkCoordinator: Send + Sync {
    fn queue(&self) -> Arc<dyn Queue>;
    fn request_store(&self) -> Arc<dyn RequestStore>;
    /// Submit one or more constructed resources.
    async fn completed(&self, resources: Vec<Resource>);
}

/// The interface turning [`Request`]s into [`Resource`]s by performing
/// fetches.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Adjust the delay applied before each subsequent request.
    fn set_delay(&self, delay: Duration);

    /// Start pulling from the coordinator's queue.
    fn start(&self, coord: Arc<dyn WorkCoordinator>) -> Result<(), WorkerError>;

    /// Stop fetching and wait for in-flight requests to finish.
    async fn stop(&self);
}

/// Create workers from a slice of worker configs. The `type` string selects
/// the implementation; only `local` runs in-process.
pub fn new_workers(
    cfgs: &[WorkerConfig],
    cancel: &CancellationToken,
) -> Result<Vec<Arc<dyn Worker>>, WorkerError> {
    cfgs.iter().map(|cfg| new_worker(cfg, cancel)).collect()
}

pub fn new_worker(
    cfg: &WorkerConfig,
    cancel: &CancellationToken,
) -> Result<Arc<dyn Worker>, WorkerError> {
    match cfg.kind.as_str() {
        "local" | "" => Ok(Arc::new(LocalWorker::new(cfg.clone(), cancel.child_token())?)),
        other => Err(WorkerError::UnknownType(other.to_string())),
    }
}

/// In-process worker. Runs `parallelism` fetch tasks against the shared
/// queue, each applying the politeness delay before every request.
pub struct LocalWorker {
    cfg: WorkerConfig,
    client: reqwest::Client,
    delay_tx: watch::Sender<Duration>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// robots.txt body per authority; `None` records an unavailable file.
    robots: Arc<DashMap<String, Option<String>>>,
}

impl LocalWorker {
    pub fn new(mut cfg: WorkerConfig, cancel: CancellationToken) -> Result<Self, WorkerError> {
        if cfg.parallelism == 0 {
            cfg.parallelism = 1;
        }
        if cfg.user_agent.is_empty() {
            cfg.user_agent = DEFAULT_USER_AGENT.to_string();
        }

        // Redirects are followed manually so hops can be recorded.
        let client = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| WorkerError::Client(e.to_string()))?;

        let (delay_tx, _) = watch::channel(Duration::from_millis(cfg.delay_ms));

        Ok(Self {
            cfg,
            client,
            delay_tx,
            cancel,
            tasks: Mutex::new(Vec::new()),
            robots: Arc::new(DashMap::new()),
        })
    }
}

#[async_trait]
impl Worker for LocalWorker {
    fn set_delay(&self, delay: Duration) {
        self.delay_tx.send_replace(delay);
    }

    fn start(&self, coord: Arc<dyn WorkCoordinator>) -> Result<(), WorkerError> {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return Err(WorkerError::AlreadyStarted);
        }

        for n in 0..self.cfg.parallelism {
            let fetcher = FetchTask {
                cfg: self.cfg.clone(),
                client: self.client.clone(),
                delay: self.delay_tx.subscribe(),
                cancel: self.cancel.clone(),
                robots: Arc::clone(&self.robots),
                coord: Arc::clone(&coord),
            };
            tasks.push(tokio::spawn(fetcher.run(n)));
        }

        Ok(())
    }

    async fn stop(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::error!("fetch task join error: {}", e);
                }
            }
        }
    }
}

/// One fetch loop: pop, wait out the politeness delay, fetch, emit.
struct FetchTask {
    cfg: WorkerConfig,
    client: reqwest::Client,
    delay: watch::Receiver<Duration>,
    cancel: CancellationToken,
    robots: Arc<DashMap<String, Option<String>>>,
    coord: Arc<dyn WorkCoordinator>,
}

impl FetchTask {
    async fn run(self, n: usize) {
        let queue = self.coord.queue();
        tracing::debug!(task = n, "fetch task started");

        loop {
            let request = tokio::select! {
                _ = self.cancel.cancelled() => break,
                popped = queue.pop() => match popped {
                    Some(r) => r,
                    None => break,
                },
            };

            // Politeness window. Cancellation during the wait hands the
            // request back unfetched.
            let delay = *self.delay.borrow();
            if !delay.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        self.coord
                            .completed(vec![Resource::errored(
                                &request.job_id,
                                &request.url,
                                "fetch cancelled before request",
                            )])
                            .await;
                        continue;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            self.process(request).await;
        }

        tracing::debug!(task = n, "fetch task stopped");
    }

    async fn process(&self, mut request: Request) {
        request.status = RequestStatus::Requesting;
        if let Err(e) = self.coord.request_store().put(&request) {
            tracing::debug!(url = %request.url, "marking request in-flight: {}", e);
        }

        if self.cfg.polite && !self.robots_allowed(&request.url).await {
            tracing::debug!(url = %request.url, "disallowed by robots.txt");
            self.coord
                .completed(vec![Resource::errored(
                    &request.job_id,
                    &request.url,
                    "disallowed by robots.txt",
                )])
                .await;
            return;
        }

        self.fetch(&request).await;
    }

    /// Issue the GET, following redirects manually. When `record_redirects`
    /// is set each hop whose normalized URL changes produces an interim
    /// resource, and the terminal resource carries the previous hop in
    /// `redirect_from`. Chains stop with a transport error after
    /// [`MAX_REDIRECT_HOPS`].
    async fn fetch(&self, request: &Request) {
        let job_id = request.job_id.as_str();
        let mut current = request.url.clone();
        let mut redirect_from: Option<String> = None;
        let mut hops = 0usize;

        loop {
            let started = Instant::now();
            let response = match self.client.get(&current).send().await {
                Ok(r) => r,
                Err(e) => {
                    tracing::info!(url = %current, "fetch error: {}", e);
                    // Errors keep the identity of the request being served
                    // so its record can be retried or failed.
                    self.coord
                        .completed(vec![Resource::errored(job_id, &request.url, e.to_string())])
                        .await;
                    return;
                }
            };

            let status = response.status().as_u16();
            if response.status().is_redirection() {
                if let Some(target) = redirect_target(&current, &response) {
                    hops += 1;
                    if hops >= MAX_REDIRECT_HOPS {
                        tracing::info!(url = %current, "redirect chain too long");
                        self.coord
                            .completed(vec![Resource::errored(
                                job_id,
                                &request.url,
                                format!("stopped after {} redirects", MAX_REDIRECT_HOPS),
                            )])
                            .await;
                        return;
                    }

                    if self.cfg.record_redirects && current != target {
                        tracing::info!(status, from = %current, to = %target, "redirect");
                        self.coord
                            .completed(vec![Resource::redirect(job_id, &current, status, &target)])
                            .await;
                    }

                    redirect_from = Some(current.clone());
                    current = target;
                    continue;
                }
                // A redirect status without a usable Location falls through
                // as a terminal response.
            }

            let headers = response.headers().clone();
            let body = match response.bytes().await {
                Ok(b) => b.to_vec(),
                Err(e) => {
                    self.coord
                        .completed(vec![Resource::errored(job_id, &request.url, e.to_string())])
                        .await;
                    return;
                }
            };

            // Without redirect recording the resource keeps the identity it
            // was requested under.
            let url = if self.cfg.record_redirects {
                current.clone()
            } else {
                request.url.clone()
            };

            let mut resource = Resource::from_response(
                job_id,
                &url,
                Some(started.elapsed()),
                status,
                &headers,
                body,
                self.cfg.record_response_headers,
            );
            if self.cfg.record_redirects {
                if let Some(from) = redirect_from.take() {
                    resource.redirect_from = from;
                }
            }

            tracing::info!(status, url = %resource.url, links = resource.links.len(), "fetched");
            self.coord.completed(vec![resource]).await;
            return;
        }
    }

    /// Check robots.txt for the URL's authority, fetching and caching the
    /// file on first contact with the host.
    async fn robots_allowed(&self, raw: &str) -> bool {
        let Ok(url) = Url::parse(raw) else {
            return true;
        };
        let host = authority(&url);

        if !self.robots.contains_key(&host) {
            let robots_url = format!("{}://{}/robots.txt", url.scheme(), host);
            let body = match self.client.get(&robots_url).send().await {
                Ok(r) if r.status().is_success() => r.text().await.ok(),
                _ => None,
            };
            self.robots.insert(host.clone(), body);
        }

        let entry = self.robots.get(&host).and_then(|r| r.value().clone());
        match entry {
            Some(robots) => {
                let mut matcher = DefaultMatcher::default();
                matcher.one_agent_allowed_by_robots(&robots, &self.cfg.user_agent, raw)
            }
            None => true,
        }
    }
}

/// Resolve a redirect response's Location against the current URL,
/// normalized. Returns `None` when the header is missing or unparsable.
fn redirect_target(current: &str, response: &reqwest::Response) -> Option<String> {
    let location = response
        .headers()
        .get(reqwest::header::LOCATION)?
        .to_str()
        .ok()?;
    let base = Url::parse(current).ok()?;
    let target = base.join(location).ok()?;
    Some(normalize_url(&target))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_worker_type() {
        let cfg = WorkerConfig {
            kind: "remote".to_string(),
            ..WorkerConfig::default()
        };
        let cancel = CancellationToken::new();
        assert!(matches!(
            new_worker(&cfg, &cancel),
            Err(WorkerError::UnknownType(_))
        ));
    }

    #[test]
    fn test_local_worker_defaults() {
        let cfg = WorkerConfig {
            parallelism: 0,
            user_agent: String::new(),
            ..WorkerConfig::default()
        };
        let w = LocalWorker::new(cfg, CancellationToken::new()).unwrap();
        assert_eq!(w.cfg.parallelism, 1);
        assert!(w.cfg.user_agent.starts_with("sitewalker/"));
    }

    #[test]
    fn test_set_delay_observed_by_subscribers() {
        let w = LocalWorker::new(WorkerConfig::default(), CancellationToken::new()).unwrap();
        let rx = w.delay_tx.subscribe();
        w.set_delay(Duration::from_millis(1234));
        assert_eq!(*rx.borrow(), Duration::from_millis(1234));
    }
}
