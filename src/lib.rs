//! sitewalker: a coordinated web crawler.
//!
//! A [`coordinator::Coordinator`] accepts crawl jobs (seed URLs, scope
//! rules, politeness parameters, output handlers), schedules fetches across
//! a pool of workers, deduplicates work through a shared request store, and
//! hands completed resources to handlers that build on-disk artifacts.

pub mod cbor_writer;
pub mod cdxj;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod handler;
pub mod job;
pub mod queue;
pub mod request;
pub mod request_store;
pub mod resource;
pub mod sitemap_gen;
pub mod url_norm;
pub mod worker;

// Re-export main types for library usage
pub use config::{Config, JobConfig, ResourceHandlerConfig, WorkerConfig};
pub use coordinator::{new_walk, CoordError, Coordinator};
pub use handler::{MemHandler, ResourceHandler};
pub use job::{Job, JobStatus};
pub use queue::{MemQueue, Queue};
pub use request::{Request, RequestStatus};
pub use request_store::{MemRequestStore, RequestStore, SledRequestStore, StoreError};
pub use resource::Resource;
pub use url_norm::{normalize_url, normalize_url_string};
pub use worker::{LocalWorker, WorkCoordinator, Worker};
