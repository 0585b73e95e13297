//! CDXJ index records: `<SURT-key> <RFC3339-timestamp> <json>` per line,
//! sorted by key.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum CdxjError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid record url: {0}")]
    Url(#[from] url::ParseError),

    #[error("encoding record: {0}")]
    Json(#[from] serde_json::Error),
}

/// Sort-friendly URL reordered transform, the CDXJ sort key.
///
/// `http://www.example.com:8080/path?b=2` → `com,example,www:8080)/path?b=2`.
pub fn surt_key(raw: &str) -> Result<String, CdxjError> {
    let u = Url::parse(raw)?;

    let mut key = String::new();
    if let Some(host) = u.host_str() {
        let mut labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
        labels.reverse();
        key.push_str(&labels.join(",").to_ascii_lowercase());
    }
    if let Some(port) = u.port() {
        key.push(':');
        key.push_str(&port.to_string());
    }
    key.push(')');
    key.push_str(u.path());
    if let Some(query) = u.query() {
        key.push('?');
        key.push_str(query);
    }

    Ok(key)
}

/// Writer for a CDXJ index file. Records accumulate in memory and are
/// written sorted by key when the writer closes; the file itself is created
/// eagerly so a crawl directory is recognizable from the start.
pub struct CdxjWriter {
    path: PathBuf,
    records: Mutex<Vec<String>>,
}

impl CdxjWriter {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CdxjError> {
        let path = path.as_ref().to_path_buf();
        std::fs::File::create(&path)?;
        Ok(Self {
            path,
            records: Mutex::new(Vec::new()),
        })
    }

    /// Append a record for `uri` with its capture timestamp and JSON
    /// metadata block.
    pub fn write_record(
        &self,
        uri: &str,
        timestamp: DateTime<Utc>,
        meta: &serde_json::Value,
    ) -> Result<(), CdxjError> {
        let line = format!(
            "{} {} {}",
            surt_key(uri)?,
            timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            serde_json::to_string(meta)?
        );
        self.records.lock().push(line);
        Ok(())
    }

    /// Sort and flush all records to the index file.
    pub fn close(&self) -> Result<(), CdxjError> {
        let mut records = self.records.lock();
        records.sort_unstable();

        let mut f = std::fs::File::create(&self.path)?;
        for line in records.iter() {
            writeln!(f, "{}", line)?;
        }
        f.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_surt_key() {
        assert_eq!(
            surt_key("http://www.example.com/path?b=2").unwrap(),
            "com,example,www)/path?b=2"
        );
        assert_eq!(surt_key("http://example.com/").unwrap(), "com,example)/");
        assert_eq!(
            surt_key("http://site.local:8080/a").unwrap(),
            "local,site:8080)/a"
        );
    }

    #[test]
    fn test_records_sorted_on_close() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.cdxj");
        let w = CdxjWriter::new(&path).unwrap();

        let ts = Utc::now();
        w.write_record("http://example.com/b", ts, &json!({"url": "http://example.com/b"}))
            .unwrap();
        w.write_record("http://example.com/a", ts, &json!({"url": "http://example.com/a"}))
            .unwrap();
        w.close().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("com,example)/a "));
        assert!(lines[1].starts_with("com,example)/b "));
        // key, timestamp, then a json object
        let parts: Vec<&str> = lines[0].splitn(3, ' ').collect();
        assert_eq!(parts.len(), 3);
        assert!(serde_json::from_str::<serde_json::Value>(parts[2]).is_ok());
    }

    #[test]
    fn test_file_exists_before_close() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.cdxj");
        let _w = CdxjWriter::new(&path).unwrap();
        assert!(path.exists());
    }
}
