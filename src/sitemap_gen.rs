//! Sitemap handler: stages per-URL entries in the shared database and
//! writes an aggregated JSON document at finalize.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::handler::{HandlerError, ResourceHandler};
use crate::resource::Resource;

/// A subset of a resource relevant to a sitemap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub url: String,
    pub title: String,
    pub timestamp: DateTime<Utc>,
    pub status: u16,
    pub redirects: Vec<String>,
    pub resources: Vec<String>,
    pub links: Vec<String>,
}

impl Entry {
    fn from_resource(r: &Resource) -> Self {
        let mut redirects = Vec::new();
        if !r.redirect_to.is_empty() {
            redirects.push(r.redirect_to.clone());
        }
        Self {
            url: r.url.clone(),
            title: r.title.clone(),
            timestamp: r.timestamp,
            status: r.status,
            redirects,
            resources: Vec::new(),
            links: r.links.clone(),
        }
    }
}

/// Records resource entries under a key prefix in the shared database, then
/// renders them as a single `{normalized_url → Entry}` JSON document.
pub struct SitemapGenerator {
    prefix: String,
    dest: PathBuf,
    db: sled::Db,
}

impl SitemapGenerator {
    pub fn new(prefix: &str, dest: &Path, db: sled::Db) -> Self {
        Self {
            prefix: prefix.to_string(),
            dest: dest.to_path_buf(),
            db,
        }
    }

    fn key_prefix(&self) -> String {
        format!("{}:", self.prefix)
    }

    fn key(&self, url: &str) -> Vec<u8> {
        format!("{}{}", self.key_prefix(), url).into_bytes()
    }

    fn put_entry(&self, r: &Resource) -> Result<(), HandlerError> {
        let key = self.key(&r.url);

        // Merge with any earlier capture so observed redirects accumulate.
        let mut entry = Entry::from_resource(r);
        if let Some(prev) = self.db.get(&key)? {
            if let Ok(prev) = serde_json::from_slice::<Entry>(&prev) {
                for redirect in prev.redirects {
                    if !entry.redirects.contains(&redirect) {
                        entry.redirects.push(redirect);
                    }
                }
                if entry.links.is_empty() {
                    entry.links = prev.links;
                }
                if entry.title.is_empty() {
                    entry.title = prev.title;
                }
            }
        }

        let value = serde_json::to_vec(&entry).map_err(|e| HandlerError::Encoding(e.to_string()))?;
        self.db.insert(key, value)?;
        Ok(())
    }

    /// Render the staged entries, lexicographically ordered by URL, to the
    /// destination path.
    pub fn generate(&self, path: &Path) -> Result<(), HandlerError> {
        let prefix = self.key_prefix();
        let mut sitemap: BTreeMap<String, Entry> = BTreeMap::new();

        for item in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, value) = item?;
            let url = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
            let entry: Entry = serde_json::from_slice(&value)
                .map_err(|e| HandlerError::Encoding(e.to_string()))?;
            sitemap.insert(url, entry);
        }

        let data = serde_json::to_vec_pretty(&sitemap)
            .map_err(|e| HandlerError::Encoding(e.to_string()))?;
        std::fs::write(path, data)?;
        Ok(())
    }
}

#[async_trait]
impl ResourceHandler for SitemapGenerator {
    fn kind(&self) -> &'static str {
        "SITEMAP"
    }

    async fn handle(&self, resource: &Resource) {
        if resource.url.is_empty() {
            return;
        }
        if let Err(e) = self.put_entry(resource) {
            tracing::error!(url = %resource.url, "staging sitemap entry: {}", e);
        }
    }

    async fn finalize(&self) -> Result<(), HandlerError> {
        self.generate(&self.dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn resource(url: &str, title: &str, links: Vec<&str>) -> Resource {
        Resource {
            url: url.to_string(),
            title: title.to_string(),
            timestamp: Utc::now(),
            status: 200,
            links: links.into_iter().map(String::from).collect(),
            ..Resource::default()
        }
    }

    #[tokio::test]
    async fn test_finalize_writes_sorted_entries() {
        let dir = TempDir::new().unwrap();
        let db = sled::open(dir.path().join("db")).unwrap();
        let dest = dir.path().join("sitemap.json");
        let g = SitemapGenerator::new("sm", &dest, db);

        g.handle(&resource("https://www.a.com/a", "A page", vec!["https://www.a.com"]))
            .await;
        g.handle(&resource("https://www.a.com", "Home", vec!["https://www.a.com/a"]))
            .await;
        g.finalize().await.unwrap();

        let data = std::fs::read_to_string(&dest).unwrap();
        let sitemap: BTreeMap<String, Entry> = serde_json::from_str(&data).unwrap();
        let keys: Vec<&String> = sitemap.keys().collect();
        assert_eq!(keys, vec!["https://www.a.com", "https://www.a.com/a"]);

        let home = &sitemap["https://www.a.com"];
        assert_eq!(home.title, "Home");
        assert_eq!(home.links, vec!["https://www.a.com/a"]);
        assert_eq!(home.status, 200);
    }

    #[tokio::test]
    async fn test_redirects_accumulate() {
        let dir = TempDir::new().unwrap();
        let db = sled::open(dir.path().join("db")).unwrap();
        let dest = dir.path().join("sitemap.json");
        let g = SitemapGenerator::new("sm", &dest, db);

        let mut hop = Resource {
            url: "https://www.a.com/old".to_string(),
            timestamp: Utc::now(),
            status: 301,
            redirect_to: "https://www.a.com/new".to_string(),
            ..Resource::default()
        };
        g.handle(&hop).await;
        hop.redirect_to = "https://www.a.com/newer".to_string();
        g.handle(&hop).await;
        g.finalize().await.unwrap();

        let data = std::fs::read_to_string(&dest).unwrap();
        let sitemap: BTreeMap<String, Entry> = serde_json::from_str(&data).unwrap();
        let entry = &sitemap["https://www.a.com/old"];
        assert_eq!(entry.redirects.len(), 2);
    }

    #[tokio::test]
    async fn test_prefix_isolates_namespaces() {
        let dir = TempDir::new().unwrap();
        let db = sled::open(dir.path().join("db")).unwrap();
        db.insert(b"rs.https://www.a.com", b"unrelated").unwrap();

        let dest = dir.path().join("sitemap.json");
        let g = SitemapGenerator::new("sm", &dest, db);
        g.handle(&resource("https://www.a.com", "Home", vec![])).await;
        g.finalize().await.unwrap();

        let data = std::fs::read_to_string(&dest).unwrap();
        let sitemap: BTreeMap<String, Entry> = serde_json::from_str(&data).unwrap();
        assert_eq!(sitemap.len(), 1);
    }
}
