//! Jobs: configuration-scoped crawl units with a lifecycle.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::Stream;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use thiserror::Error;
use tokio::sync::Notify;
use url::Url;

use crate::config::JobConfig;
use crate::url_norm::{authority, normalize_url_string};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("parsing configured domain {domain}: {source}")]
    Domain {
        domain: String,
        source: url::ParseError,
    },

    #[error("parsing stop url: {0}")]
    StopUrl(#[from] crate::url_norm::NormalizeError),

    #[error("reading seeds path: {0}")]
    SeedsIo(#[from] std::io::Error),

    #[error("fetching seeds path: {0}")]
    SeedsHttp(#[from] reqwest::Error),
}

/// Execution state of a job. Progress is monotonic; `Errored` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    New,
    Running,
    Paused,
    Complete,
    Errored,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::New => "new",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Complete => "complete",
            JobStatus::Errored => "errored",
        };
        write!(f, "{}", s)
    }
}

/// Lazy, finite stream of seed URLs.
pub type SeedStream = Pin<Box<dyn Stream<Item = Result<String, JobError>> + Send>>;

/// One crawl job: scope rules, seed source, status, and acceptance rules.
/// The coordinator owns the job's workers and handlers; the job itself holds
/// only what scope and lifecycle decisions need.
pub struct Job {
    id: String,
    cfg: JobConfig,
    status: Mutex<JobStatus>,
    error: Mutex<Option<String>>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    finished: AtomicU64,
    /// Parsed scope: (authority, path prefix) per configured domain.
    domains: Vec<(String, String)>,
    /// Normalized form of the configured stop URL, when set.
    stop_url: Option<String>,
    /// Current effective delay; can exceed the configured baseline while
    /// backoff is active.
    crawl_delay: Mutex<Duration>,
    stopped: Notify,
}

impl Job {
    /// Build a job from its configuration. Malformed domain or stop URLs
    /// are fatal.
    pub fn new(cfg: JobConfig) -> Result<Self, JobError> {
        let mut domains = Vec::with_capacity(cfg.domains.len());
        for raw in &cfg.domains {
            let u = Url::parse(raw).map_err(|source| JobError::Domain {
                domain: raw.clone(),
                source,
            })?;
            let mut prefix = u.path().to_string();
            while prefix.ends_with('/') {
                prefix.pop();
            }
            domains.push((authority(&u), prefix));
        }

        let stop_url = if cfg.stop_url.is_empty() {
            None
        } else {
            Some(normalize_url_string(&cfg.stop_url)?)
        };

        let delay = Duration::from_millis(cfg.delay_ms);

        Ok(Self {
            id: new_job_id(),
            cfg,
            status: Mutex::new(JobStatus::New),
            error: Mutex::new(None),
            started_at: Mutex::new(None),
            finished: AtomicU64::new(0),
            domains,
            stop_url,
            crawl_delay: Mutex::new(delay),
            stopped: Notify::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &JobConfig {
        &self.cfg
    }

    pub fn status(&self) -> JobStatus {
        *self.status.lock()
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.lock()
    }

    pub fn finished_count(&self) -> u64 {
        self.finished.load(Ordering::SeqCst)
    }

    /// Record one more finished URL, returning the new total.
    pub fn inc_finished(&self) -> u64 {
        self.finished.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn crawl_delay(&self) -> Duration {
        *self.crawl_delay.lock()
    }

    pub fn set_crawl_delay(&self, delay: Duration) {
        *self.crawl_delay.lock() = delay;
        tracing::info!(job_id = %self.id, ?delay, "crawl delay adjusted");
    }

    /// The normalized stop URL, when one is configured.
    pub fn stop_url(&self) -> Option<&str> {
        self.stop_url.as_deref()
    }

    /// Transition New → Running.
    pub fn start(&self) {
        let mut status = self.status.lock();
        if *status == JobStatus::New {
            *status = JobStatus::Running;
            *self.started_at.lock() = Some(Utc::now());
        }
    }

    /// Absorbing error state; retains the error message.
    pub fn errored(&self, err: impl std::fmt::Display) {
        *self.status.lock() = JobStatus::Errored;
        *self.error.lock() = Some(err.to_string());
        self.stopped.notify_one();
    }

    /// Mark the job finished. A job that already errored stays errored.
    pub fn complete(&self) {
        let mut status = self.status.lock();
        if *status != JobStatus::Errored {
            *status = JobStatus::Complete;
        }
        drop(status);
        self.stopped.notify_one();
    }

    /// Whether no new work may enter the queue under this job.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status(), JobStatus::Complete | JobStatus::Errored)
    }

    /// Resolve once the job completes or errors.
    pub async fn wait_stopped(&self) {
        if self.is_terminal() {
            return;
        }
        self.stopped.notified().await;
    }

    /// Whether a response status counts as success. Permanent redirects are
    /// included so recorded hops complete their requests.
    pub fn is_ok_response(&self, status: u16) -> bool {
        (200..=308).contains(&status)
    }

    /// Whether a discovered URL is in scope for this job.
    ///
    /// Ignore patterns are substring matches against the raw URL. A URL is
    /// accepted by the first configured domain whose authority matches
    /// exactly and whose path prefix (possibly empty) leads the URL's path.
    pub fn is_candidate(&self, raw: &str) -> bool {
        for pattern in &self.cfg.ignore_patterns {
            if raw.contains(pattern.as_str()) {
                return false;
            }
        }

        let Ok(u) = Url::parse(raw) else {
            return false;
        };
        let host = authority(&u);
        let mut path = u.path().to_string();
        while path.ends_with('/') {
            path.pop();
        }

        for (domain, prefix) in &self.domains {
            if *domain != host {
                continue;
            }
            return prefix.is_empty() || path.starts_with(prefix.as_str());
        }
        false
    }

    /// Stream of seed URLs: the inline list in order, then each line of
    /// `seeds_path` (an HTTP URL or a local file). The stream is finite and
    /// not restartable.
    pub fn seeds(&self) -> SeedStream {
        let inline = self.cfg.seeds.clone();
        let seeds_path = self.cfg.seeds_path.clone();

        Box::pin(async_stream::try_stream! {
            for url in inline {
                yield url;
            }

            if !seeds_path.is_empty() {
                let body = if is_http_url(&seeds_path) {
                    tracing::info!(path = %seeds_path, "fetching seeds list");
                    reqwest::get(&seeds_path).await?.text().await?
                } else {
                    tracing::info!(path = %seeds_path, "reading seeds file");
                    tokio::fs::read_to_string(&seeds_path).await?
                };

                for line in body.lines() {
                    let line = line.trim();
                    if !line.is_empty() {
                        yield line.to_string();
                    }
                }
            }
        })
    }
}

fn is_http_url(s: &str) -> bool {
    Url::parse(s)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false)
}

fn new_job_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn job_with(domains: Vec<&str>, ignore: Vec<&str>) -> Job {
        let cfg = JobConfig {
            domains: domains.into_iter().map(String::from).collect(),
            ignore_patterns: ignore.into_iter().map(String::from).collect(),
            ..JobConfig::default()
        };
        Job::new(cfg).unwrap()
    }

    #[test]
    fn test_is_candidate_domain_scope() {
        let job = job_with(vec!["http://site.local/"], vec![]);
        assert!(job.is_candidate("http://site.local/a"));
        assert!(job.is_candidate("http://site.local"));
        assert!(!job.is_candidate("http://other.local/a"));
        assert!(!job.is_candidate("not a url"));
    }

    #[test]
    fn test_is_candidate_path_prefix() {
        let job = job_with(vec!["http://site.local/docs"], vec![]);
        assert!(job.is_candidate("http://site.local/docs/page"));
        assert!(job.is_candidate("http://site.local/docs"));
        assert!(!job.is_candidate("http://site.local/blog/page"));
    }

    #[test]
    fn test_is_candidate_port_distinguishes() {
        let job = job_with(vec!["http://site.local:8080/"], vec![]);
        assert!(job.is_candidate("http://site.local:8080/a"));
        assert!(!job.is_candidate("http://site.local/a"));
    }

    #[test]
    fn test_ignore_patterns() {
        let job = job_with(vec!["http://site.local/"], vec!["logout", "?sort="]);
        assert!(!job.is_candidate("http://site.local/logout"));
        assert!(!job.is_candidate("http://site.local/list?sort=asc"));
        assert!(job.is_candidate("http://site.local/list"));
    }

    #[test]
    fn test_ok_response_range() {
        let job = job_with(vec![], vec![]);
        assert!(job.is_ok_response(200));
        assert!(job.is_ok_response(301));
        assert!(job.is_ok_response(308));
        assert!(!job.is_ok_response(199));
        assert!(!job.is_ok_response(404));
        assert!(!job.is_ok_response(503));
        assert!(!job.is_ok_response(0));
    }

    #[test]
    fn test_lifecycle() {
        let job = job_with(vec![], vec![]);
        assert_eq!(job.status(), JobStatus::New);
        job.start();
        assert_eq!(job.status(), JobStatus::Running);
        job.complete();
        assert_eq!(job.status(), JobStatus::Complete);

        let job = job_with(vec![], vec![]);
        job.errored("boom");
        job.complete();
        // Errored is absorbing.
        assert_eq!(job.status(), JobStatus::Errored);
        assert_eq!(job.error().unwrap(), "boom");
    }

    #[test]
    fn test_bad_domain_is_fatal() {
        let cfg = JobConfig {
            domains: vec![":not-a-url".to_string()],
            ..JobConfig::default()
        };
        assert!(Job::new(cfg).is_err());
    }

    #[tokio::test]
    async fn test_seeds_inline_order() {
        let cfg = JobConfig {
            seeds: vec!["http://a.local/1".into(), "http://a.local/2".into()],
            ..JobConfig::default()
        };
        let job = Job::new(cfg).unwrap();
        let seeds: Vec<String> = job
            .seeds()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(seeds, vec!["http://a.local/1", "http://a.local/2"]);
    }

    #[tokio::test]
    async fn test_seeds_from_file() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "http://a.local/3\n\nhttp://a.local/4").unwrap();

        let cfg = JobConfig {
            seeds: vec!["http://a.local/1".into()],
            seeds_path: f.path().to_string_lossy().into_owned(),
            ..JobConfig::default()
        };
        let job = Job::new(cfg).unwrap();
        let seeds: Vec<String> = job.seeds().map(|r| r.unwrap()).collect().await;
        assert_eq!(
            seeds,
            vec!["http://a.local/1", "http://a.local/3", "http://a.local/4"]
        );
    }
}
