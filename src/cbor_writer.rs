//! Archive handler: per-URL CBOR metadata, content-addressed CBOR bodies,
//! and a CDXJ index.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::json;

use crate::cdxj::CdxjWriter;
use crate::handler::{HandlerError, ResourceHandler};
use crate::resource::Resource;

/// Directory split point for base64url metadata file names.
const META_SPLIT: usize = 12;

/// Writes one walk archive under `dest_path`:
///
/// - `meta/<b64url(url)[..12]>/<b64url(url)[12..]>`: CBOR resource
///   metadata (everything but the body)
/// - `body/<hash[..2]>/<hash[2..]>`: CBOR body bytes, content-addressed so
///   identical bodies share a file
/// - `index.cdxj`: one record per handled resource
pub struct CborResourceWriter {
    base: PathBuf,
    index: CdxjWriter,
}

impl CborResourceWriter {
    pub fn new(dir: &Path) -> Result<Self, HandlerError> {
        std::fs::create_dir_all(dir.join("meta"))?;
        std::fs::create_dir_all(dir.join("body"))?;
        let index = CdxjWriter::new(dir.join("index.cdxj"))
            .map_err(|e| HandlerError::Encoding(e.to_string()))?;
        Ok(Self {
            base: dir.to_path_buf(),
            index,
        })
    }

    fn write_resource(&self, r: &Resource) -> Result<(), HandlerError> {
        let encoded = URL_SAFE_NO_PAD.encode(&r.url);
        let split = encoded.len().min(META_SPLIT);
        let (dir, file) = encoded.split_at(split);
        let file = if file.is_empty() { "_" } else { file };

        let meta_dir = self.base.join("meta").join(dir);
        std::fs::create_dir_all(&meta_dir)?;
        let meta =
            serde_cbor::to_vec(&r.meta()).map_err(|e| HandlerError::Encoding(e.to_string()))?;
        std::fs::write(meta_dir.join(file), meta)?;

        if !r.hash.is_empty() {
            let (shard, rest) = r.hash.split_at(2);
            let body_dir = self.base.join("body").join(shard);
            std::fs::create_dir_all(&body_dir)?;
            let body = serde_cbor::to_vec(&serde_bytes::Bytes::new(&r.body))
                .map_err(|e| HandlerError::Encoding(e.to_string()))?;
            std::fs::write(body_dir.join(rest), body)?;
        }

        let mut meta = json!({
            "url": r.url,
            "hash": r.hash,
            "size": r.body.len(),
        });
        if !r.redirect_to.is_empty() {
            meta["redirectTo"] = json!(r.redirect_to);
        }
        if !r.redirect_from.is_empty() {
            meta["redirectFrom"] = json!(r.redirect_from);
        }
        self.index
            .write_record(&r.url, r.timestamp, &meta)
            .map_err(|e| HandlerError::Encoding(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl ResourceHandler for CborResourceWriter {
    fn kind(&self) -> &'static str {
        "CBOR"
    }

    async fn handle(&self, resource: &Resource) {
        if resource.url.is_empty() {
            tracing::info!("skipping resource without a url");
            return;
        }
        if let Err(e) = self.write_resource(resource) {
            tracing::error!(url = %resource.url, "writing archive record: {}", e);
        }
    }

    async fn finalize(&self) -> Result<(), HandlerError> {
        self.index
            .close()
            .map_err(|e| HandlerError::Encoding(e.to_string()))
    }
}
