//! Configuration for the coordinator and its jobs, loadable from JSON.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parsing config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("unrecognized {kind} type: {value}")]
    UnknownType { kind: &'static str, value: String },

    #[error("{0}")]
    Validation(String),
}

/// Top-level configuration: the coordinator's shared infrastructure plus one
/// job definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Embedded database location. Required by the persistent request store
    /// and the sitemap handler.
    pub db: Option<DbConfig>,
    pub request_store: StoreConfig,
    pub queue: QueueConfig,
    pub collection: CollectionConfig,
    /// Optional rescan interval for unfetched links. Parsed for
    /// compatibility, no in-process behavior is attached.
    pub unfetched_scan_freq_ms: u64,
    pub job: JobConfig,
}

impl Config {
    /// Read a JSON config file. Any parse failure is fatal at startup.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// `"mem"` or `"sled"`.
    #[serde(rename = "type")]
    pub kind: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: "mem".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// `"mem"` is the only in-process variant.
    #[serde(rename = "type")]
    pub kind: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            kind: "mem".to_string(),
        }
    }
}

/// Read-side collection locations. Consumed by external tooling only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    pub local_dirs: Vec<String>,
}

/// One crawl job: seeds, scope, politeness, termination, and outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// URLs to seed the crawl with.
    pub seeds: Vec<String>,
    /// Filepath or URL of a newline-delimited list of additional seeds.
    pub seeds_path: String,
    /// When true, in-scope links from completed resources are enqueued.
    pub crawl: bool,
    /// Domains to crawl, as URLs carrying a host and optional path prefix.
    pub domains: Vec<String>,
    /// Substring patterns; matching URLs are never candidates.
    pub ignore_patterns: Vec<String>,
    /// Baseline delay between fetches, in milliseconds.
    pub delay_ms: u64,
    /// Stop after this many completed entries. 0 = unlimited. Advisory:
    /// resources already in flight may still complete.
    pub stop_after_entries: u64,
    /// Stop the crawl after fetching this URL.
    pub stop_url: String,
    /// Response codes that slow the crawl down when observed.
    pub backoff_response_codes: Vec<u16>,
    /// Give up on a URL after this many attempts.
    pub max_attempts: u32,
    /// How often to check whether the crawl is done, in milliseconds.
    /// 0 disables the check.
    pub done_scan_ms: u64,
    pub workers: Vec<WorkerConfig>,
    pub resource_handlers: Vec<ResourceHandlerConfig>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            seeds_path: String::new(),
            crawl: true,
            domains: Vec::new(),
            ignore_patterns: Vec::new(),
            delay_ms: 500,
            stop_after_entries: 0,
            stop_url: String::new(),
            backoff_response_codes: Vec::new(),
            max_attempts: 3,
            done_scan_ms: 30_000,
            workers: vec![WorkerConfig::default()],
            resource_handlers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// `"local"` is the only in-process implementation; the field reserves
    /// room for remote variants.
    #[serde(rename = "type")]
    pub kind: String,
    /// Concurrent fetch tasks this worker runs.
    pub parallelism: usize,
    /// Delay between requests per fetch task, in milliseconds.
    pub delay_ms: u64,
    /// Whether to respect robots.txt.
    pub polite: bool,
    /// Whether to keep the response header sequence on resources.
    pub record_response_headers: bool,
    /// Whether redirect hops are recorded as interim resources.
    pub record_redirects: bool,
    pub user_agent: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            kind: "local".to_string(),
            parallelism: 2,
            delay_ms: 500,
            polite: true,
            record_response_headers: false,
            record_redirects: true,
            user_agent: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceHandlerConfig {
    /// `"MEM"`, `"CBOR"`, or `"SITEMAP"` (case-insensitive).
    #[serde(rename = "type")]
    pub kind: String,
    /// Input site file from a previous crawl, where a handler supports one.
    pub src_path: String,
    /// Output location: a directory for archives, a file for sitemaps.
    pub dest_path: String,
    /// Key namespace for handlers staging records in the shared database.
    pub prefix: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.request_store.kind, "mem");
        assert_eq!(cfg.queue.kind, "mem");
        assert!(cfg.job.crawl);
        assert_eq!(cfg.job.max_attempts, 3);
        assert_eq!(cfg.job.workers.len(), 1);
        assert_eq!(cfg.job.workers[0].kind, "local");
    }

    #[test]
    fn test_from_json_file() {
        let mut f = NamedTempFile::new().unwrap();
        write!(
            f,
            r#"{{
                "db": {{"path": "/tmp/walkdb"}},
                "request_store": {{"type": "sled"}},
                "job": {{
                    "seeds": ["http://site.local/"],
                    "domains": ["http://site.local/"],
                    "stop_url": "http://site.local/e",
                    "workers": [{{"type": "local", "parallelism": 1, "delay_ms": 10}}],
                    "resource_handlers": [{{"type": "SITEMAP", "dest_path": "out.json", "prefix": "sm"}}]
                }}
            }}"#
        )
        .unwrap();

        let cfg = Config::from_json_file(f.path()).unwrap();
        assert_eq!(cfg.request_store.kind, "sled");
        assert_eq!(cfg.job.seeds, vec!["http://site.local/"]);
        assert_eq!(cfg.job.workers[0].parallelism, 1);
        assert_eq!(cfg.job.resource_handlers[0].kind, "SITEMAP");
        // Unset fields fall back to defaults.
        assert_eq!(cfg.job.max_attempts, 3);
    }

    #[test]
    fn test_bad_json_is_fatal() {
        let mut f = NamedTempFile::new().unwrap();
        write!(f, "{{not json").unwrap();
        assert!(matches!(
            Config::from_json_file(f.path()),
            Err(ConfigError::Parse { .. })
        ));
    }
}
