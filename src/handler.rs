//! Resource handlers: fan-out sinks for completed resources.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use crate::cbor_writer::CborResourceWriter;
use crate::config::ResourceHandlerConfig;
use crate::resource::Resource;
use crate::sitemap_gen::SitemapGenerator;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("unrecognized resource handler type: {0}")]
    UnknownType(String),

    #[error("handler {0} requires a configured database")]
    MissingDb(&'static str),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("database: {0}")]
    Db(#[from] sled::Error),

    #[error("encoding: {0}")]
    Encoding(String),
}

/// Something done with a resource just after it is created. Handlers for
/// the same job run concurrently and must be order-independent; `handle`
/// failures are logged by the implementation, never surfaced.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Short type tag, mirrors the config `type` string.
    fn kind(&self) -> &'static str;

    async fn handle(&self, resource: &Resource);

    /// Called once when the crawl concludes, before shutdown returns.
    async fn finalize(&self) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Create handlers from a config slice. The `type` string selects the
/// implementation; an unrecognized type is a config error.
pub fn new_resource_handlers(
    db: Option<&sled::Db>,
    cfgs: &[ResourceHandlerConfig],
) -> Result<Vec<Arc<dyn ResourceHandler>>, HandlerError> {
    cfgs.iter().map(|cfg| new_resource_handler(db, cfg)).collect()
}

pub fn new_resource_handler(
    db: Option<&sled::Db>,
    cfg: &ResourceHandlerConfig,
) -> Result<Arc<dyn ResourceHandler>, HandlerError> {
    match cfg.kind.to_uppercase().as_str() {
        "MEM" => Ok(Arc::new(MemHandler::new())),
        "CBOR" => Ok(Arc::new(CborResourceWriter::new(cfg.dest_path.as_ref())?)),
        "SITEMAP" => {
            let db = db.ok_or(HandlerError::MissingDb("SITEMAP"))?;
            Ok(Arc::new(SitemapGenerator::new(
                &cfg.prefix,
                cfg.dest_path.as_ref(),
                db.clone(),
            )))
        }
        other => Err(HandlerError::UnknownType(other.to_string())),
    }
}

/// Appends resources to an in-memory list. Test instrumentation.
pub struct MemHandler {
    resources: Mutex<Vec<Resource>>,
}

impl MemHandler {
    pub fn new() -> Self {
        Self {
            resources: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of everything handled so far.
    pub fn resources(&self) -> Vec<Resource> {
        self.resources.lock().clone()
    }
}

impl Default for MemHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceHandler for MemHandler {
    fn kind(&self) -> &'static str {
        "MEM"
    }

    async fn handle(&self, resource: &Resource) {
        self.resources.lock().push(resource.clone());
    }
}
