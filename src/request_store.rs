//! Durable `url → Request` mapping with in-memory and sled-backed variants.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use thiserror::Error;

use crate::request::Request;

/// Byte prefix isolating request keys from unrelated data sharing the same
/// database.
const KEY_PREFIX: &[u8] = b"rs.";

#[derive(Debug, Error)]
pub enum StoreError {
    /// Distinguished sentinel: the URL has no record. Enqueue and dedup
    /// paths branch on this, it is not a failure.
    #[error("not found")]
    NotFound,

    #[error("database: {0}")]
    Db(#[from] sled::Error),

    #[error("encoding: {0}")]
    Encoding(String),
}

/// Store of requests keyed by their normalized URL string. `put` is an
/// upsert; `list` iterates in lexicographic URL order.
pub trait RequestStore: Send + Sync {
    fn put(&self, req: &Request) -> Result<(), StoreError>;

    /// Fetch the request for a URL, `StoreError::NotFound` when absent.
    fn get(&self, url: &str) -> Result<Request, StoreError>;

    /// List stored requests in lexicographic URL order, skipping `offset`
    /// records and returning at most `limit` (0 = no limit).
    fn list(&self, limit: usize, offset: usize) -> Result<Vec<Request>, StoreError>;
}

/// In-memory request store. A `BTreeMap` keeps `list` ordering stable.
pub struct MemRequestStore {
    reqs: Mutex<BTreeMap<String, Request>>,
}

impl MemRequestStore {
    pub fn new() -> Self {
        Self {
            reqs: Mutex::new(BTreeMap::new()),
        }
    }
}

impl Default for MemRequestStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestStore for MemRequestStore {
    fn put(&self, req: &Request) -> Result<(), StoreError> {
        self.reqs.lock().insert(req.url.clone(), req.clone());
        Ok(())
    }

    fn get(&self, url: &str) -> Result<Request, StoreError> {
        self.reqs.lock().get(url).cloned().ok_or(StoreError::NotFound)
    }

    fn list(&self, limit: usize, offset: usize) -> Result<Vec<Request>, StoreError> {
        let limit = if limit == 0 { usize::MAX } else { limit };
        Ok(self
            .reqs
            .lock()
            .values()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Sled-backed request store. Values are CBOR so the database stays
/// self-describing and can be shared with other record types.
pub struct SledRequestStore {
    db: sled::Db,
}

impl SledRequestStore {
    pub fn new(db: sled::Db) -> Self {
        Self { db }
    }

    fn key(url: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(KEY_PREFIX.len() + url.len());
        key.extend_from_slice(KEY_PREFIX);
        key.extend_from_slice(url.as_bytes());
        key
    }

    fn decode(value: &[u8]) -> Result<Request, StoreError> {
        serde_cbor::from_slice(value).map_err(|e| StoreError::Encoding(e.to_string()))
    }
}

impl RequestStore for SledRequestStore {
    fn put(&self, req: &Request) -> Result<(), StoreError> {
        let value = serde_cbor::to_vec(req).map_err(|e| StoreError::Encoding(e.to_string()))?;
        self.db.insert(Self::key(&req.url), value)?;
        Ok(())
    }

    fn get(&self, url: &str) -> Result<Request, StoreError> {
        match self.db.get(Self::key(url))? {
            Some(value) => Self::decode(&value),
            None => Err(StoreError::NotFound),
        }
    }

    fn list(&self, limit: usize, offset: usize) -> Result<Vec<Request>, StoreError> {
        let limit = if limit == 0 { usize::MAX } else { limit };
        let mut out = Vec::new();
        // scan_prefix yields keys in lexicographic order; the cursor advances
        // past every visited record so offset pagination stays correct.
        for item in self.db.scan_prefix(KEY_PREFIX).skip(offset) {
            if out.len() == limit {
                break;
            }
            let (_, value) = item?;
            out.push(Self::decode(&value)?);
        }
        Ok(out)
    }
}
