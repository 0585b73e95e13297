//! Resources: the record produced from one completed fetch.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::url_norm::{is_webpage_url, normalize_url};

/// Sniffed content types that get HTML processing. XHTML documents sometimes
/// sniff as text/plain, hence the second entry.
const HTML_SNIFF_TYPES: &[&str] = &["text/html; charset=utf-8", "text/plain; charset=utf-8"];

/// Data associated with a URL at a point in time. Immutable once emitted to
/// the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Resource {
    /// Job that produced this resource.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub job_id: String,
    /// Normalized absolute URL.
    pub url: String,
    /// Time the request completed.
    pub timestamp: DateTime<Utc>,
    /// Time the remote server took to transfer content, in milliseconds.
    #[serde(rename = "duration", skip_serializing_if = "Option::is_none")]
    pub request_duration: Option<u64>,
    /// Returned HTTP status code.
    #[serde(skip_serializing_if = "is_zero_u16")]
    pub status: u16,
    /// Returned `Content-Type` header.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub content_type: String,
    /// Result of mime-sniffing the response body.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub content_sniff: String,
    /// Length of the returned body in bytes.
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub content_length: u64,
    /// HTML `<title>` text, when the body parsed as HTML.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub title: String,
    /// Response headers as a flat `[key, value, key, value, …]` sequence.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<String>,
    /// Base58 multihash (SHA-256) of the body.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub hash: String,
    /// Outbound links, normalized and deduplicated in discovery order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<String>,
    /// Where this URL redirects to, normalized.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub redirect_to: String,
    /// The normalized URL of the hop that redirected here.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub redirect_from: String,
    /// Fetch error, when the request failed at the transport level.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    /// Raw response body.
    #[serde(skip_serializing_if = "Vec::is_empty", with = "serde_bytes")]
    pub body: Vec<u8>,
}

impl Default for Resource {
    fn default() -> Self {
        Resource {
            job_id: String::new(),
            url: String::new(),
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            request_duration: None,
            status: 0,
            content_type: String::new(),
            content_sniff: String::new(),
            content_length: 0,
            title: String::new(),
            headers: Vec::new(),
            hash: String::new(),
            links: Vec::new(),
            redirect_to: String::new(),
            redirect_from: String::new(),
            error: String::new(),
            body: Vec::new(),
        }
    }
}

fn is_zero_u16(v: &u16) -> bool {
    *v == 0
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

impl Resource {
    /// Build a resource from a completed HTTP exchange. Computes length,
    /// sniff, hash, and, for HTML bodies, title and outbound links.
    pub fn from_response(
        job_id: &str,
        url: &str,
        duration: Option<Duration>,
        status: u16,
        headers: &reqwest::header::HeaderMap,
        body: Vec<u8>,
        record_headers: bool,
    ) -> Self {
        let mut r = Resource {
            job_id: job_id.to_string(),
            url: url.to_string(),
            timestamp: Utc::now(),
            request_duration: duration.map(|d| d.as_millis() as u64),
            status,
            content_type: headers
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string(),
            content_sniff: detect_content_type(&body),
            content_length: body.len() as u64,
            hash: multihash_b58(&body),
            body,
            ..Resource::default()
        };

        if record_headers {
            r.headers = flatten_headers(headers);
        }

        if HTML_SNIFF_TYPES.contains(&r.content_sniff.as_str()) {
            if let Ok(base) = Url::parse(&r.url) {
                let (title, links) = parse_html(&base, &r.body);
                r.title = title;
                r.links = links;
            }
        }

        r
    }

    /// An interim record for a redirect hop observed mid-fetch.
    pub fn redirect(job_id: &str, from: &str, status: u16, to: &str) -> Self {
        Resource {
            job_id: job_id.to_string(),
            url: from.to_string(),
            timestamp: Utc::now(),
            status,
            redirect_to: to.to_string(),
            ..Resource::default()
        }
    }

    /// A record for a fetch that failed before producing a response.
    pub fn errored(job_id: &str, url: &str, error: impl Into<String>) -> Self {
        Resource {
            job_id: job_id.to_string(),
            url: url.to_string(),
            timestamp: Utc::now(),
            error: error.into(),
            ..Resource::default()
        }
    }

    /// The flat header sequence as a map.
    pub fn headers_map(&self) -> HashMap<String, String> {
        self.headers
            .chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect()
    }

    /// Metadata view: every field except the body. This is what archive
    /// handlers persist alongside the content-addressed body.
    pub fn meta(&self) -> Resource {
        let mut m = self.clone();
        m.body = Vec::new();
        m
    }
}

/// Parse an HTML body for its title and `[href]` links. Links are resolved
/// against `base`, gated by [`is_webpage_url`], normalized, and deduplicated
/// preserving first-seen order.
fn parse_html(base: &Url, body: &[u8]) -> (String, Vec<String>) {
    let text = String::from_utf8_lossy(body);
    let doc = Html::parse_document(&text);

    let title_sel = Selector::parse("title").unwrap();
    let title = doc
        .select(&title_sel)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .unwrap_or_default();

    let href_sel = Selector::parse("[href]").unwrap();
    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for el in doc.select(&href_sel) {
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        let Ok(resolved) = base.join(href) else {
            continue;
        };
        if !is_webpage_url(&resolved) {
            continue;
        }
        let normalized = normalize_url(&resolved);
        if seen.insert(normalized.clone()) {
            links.push(normalized);
        }
    }

    (title, links)
}

/// Base58-encoded SHA-256 multihash (`0x12 0x20` prefix + digest).
pub fn multihash_b58(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut bytes = Vec::with_capacity(2 + digest.len());
    bytes.push(0x12);
    bytes.push(0x20);
    bytes.extend_from_slice(&digest);
    bs58::encode(bytes).into_string()
}

fn flatten_headers(headers: &reqwest::header::HeaderMap) -> Vec<String> {
    let mut out = Vec::with_capacity(headers.len() * 2);
    for (name, value) in headers {
        out.push(name.as_str().to_string());
        out.push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    out
}

/// HTML tag probes from the WHATWG mime-sniff table. A match must be
/// followed by a tag-terminating byte (space or `>`).
const HTML_PROBES: &[&str] = &[
    "<!DOCTYPE HTML", "<HTML", "<HEAD", "<SCRIPT", "<IFRAME", "<H1", "<DIV", "<FONT", "<TABLE",
    "<A", "<STYLE", "<TITLE", "<B", "<BODY", "<BR", "<P", "<!--",
];

/// Sniff a body's content type from its leading bytes.
///
/// Covers the subset of WHATWG mime-sniffing the crawler relies on: HTML
/// tag probes, a short magic-number table, and the binary-vs-text fallback.
pub fn detect_content_type(body: &[u8]) -> String {
    let sample = &body[..body.len().min(512)];
    let trimmed = trim_start_ws(sample);

    for probe in HTML_PROBES {
        if let Some(rest) = strip_prefix_ignore_case(trimmed, probe) {
            if matches!(rest.first(), Some(b' ') | Some(b'>')) {
                return "text/html; charset=utf-8".to_string();
            }
        }
    }

    let magic: &[(&[u8], &str)] = &[
        (b"%PDF-", "application/pdf"),
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"\xff\xd8\xff", "image/jpeg"),
        (b"PK\x03\x04", "application/zip"),
        (b"\x1f\x8b\x08", "application/x-gzip"),
    ];
    for (sig, mime) in magic {
        if sample.starts_with(sig) {
            return mime.to_string();
        }
    }

    if sample.iter().any(|b| is_binary_byte(*b)) {
        return "application/octet-stream".to_string();
    }
    "text/plain; charset=utf-8".to_string()
}

fn trim_start_ws(data: &[u8]) -> &[u8] {
    let start = data
        .iter()
        .position(|b| !matches!(b, b'\t' | b'\n' | b'\x0c' | b'\r' | b' '))
        .unwrap_or(data.len());
    &data[start..]
}

fn strip_prefix_ignore_case<'a>(data: &'a [u8], prefix: &str) -> Option<&'a [u8]> {
    let p = prefix.as_bytes();
    if data.len() < p.len() {
        return None;
    }
    let matches = data[..p.len()]
        .iter()
        .zip(p)
        .all(|(a, b)| a.eq_ignore_ascii_case(b));
    matches.then(|| &data[p.len()..])
}

fn is_binary_byte(b: u8) -> bool {
    matches!(b, 0x00..=0x08 | 0x0b | 0x0e..=0x1a | 0x1c..=0x1f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_content_type_html() {
        assert_eq!(
            detect_content_type(b"  <!doctype html><html></html>"),
            "text/html; charset=utf-8"
        );
        assert_eq!(detect_content_type(b"<HTML><body>hi</body>"), "text/html; charset=utf-8");
        assert_eq!(detect_content_type(b"plain words here"), "text/plain; charset=utf-8");
        assert_eq!(detect_content_type(b"%PDF-1.4 stuff"), "application/pdf");
        assert_eq!(detect_content_type(b"\x00\x01\x02"), "application/octet-stream");
        assert_eq!(detect_content_type(b""), "text/plain; charset=utf-8");
    }

    #[test]
    fn test_multihash_b58_stable() {
        let h = multihash_b58(b"hello");
        // SHA-256 multihash of "hello", base58.
        assert_eq!(h, "QmRN6wdp1S2A5EtjW9A3M1vKSBuQQGcgvuhoMUoEz4iiT5");
        assert_eq!(multihash_b58(b"hello"), h);
        assert_ne!(multihash_b58(b"other"), h);
    }

    #[test]
    fn test_parse_html_links_deduped_in_order() {
        let base = Url::parse("http://site.local/page").unwrap();
        let html = br#"<html><head><title> My Page </title></head><body>
            <a href="/a">a</a>
            <a href="/b">b</a>
            <a href="/a">a again</a>
            <a href="mailto:x@y.z">mail</a>
            <a href="/img.png">img</a>
            <a href="http://other.local/">other</a>
        </body></html>"#;
        let (title, links) = parse_html(&base, html);
        assert_eq!(title, "My Page");
        assert_eq!(
            links,
            vec![
                "http://site.local/a",
                "http://site.local/b",
                "http://other.local",
            ]
        );
    }

    #[test]
    fn test_headers_map() {
        let r = Resource {
            headers: vec![
                "content-type".to_string(),
                "text/html".to_string(),
                "server".to_string(),
                "test".to_string(),
            ],
            ..Resource::default()
        };
        let m = r.headers_map();
        assert_eq!(m.get("content-type").unwrap(), "text/html");
        assert_eq!(m.get("server").unwrap(), "test");
    }

    #[test]
    fn test_meta_drops_body() {
        let r = Resource {
            url: "http://a.local".to_string(),
            body: b"content".to_vec(),
            hash: multihash_b58(b"content"),
            ..Resource::default()
        };
        let m = r.meta();
        assert!(m.body.is_empty());
        assert_eq!(m.hash, r.hash);
        assert_eq!(m.url, r.url);
    }
}
