//! URL canonicalization used as the identity for requests and resources.
//!
//! Every store key, link-dedup comparison, and scope test operates on the
//! output of [`normalize_url`]. The transform is "unsafe-greedy": two URL
//! strings that refer to the same resource under common web conventions
//! normalize to equal strings, even where RFC 3986 would keep them distinct
//! (trailing slashes, sorted queries, collapsed duplicate slashes).

use percent_encoding::percent_decode_str;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("invalid url: {0}")]
    Parse(#[from] url::ParseError),
}

/// Canonicalize a raw URL string.
pub fn normalize_url_string(raw: &str) -> Result<String, NormalizeError> {
    let url = Url::parse(raw)?;
    Ok(normalize_url(&url))
}

/// Canonicalize a parsed URL.
///
/// Lowercases scheme and host, strips default ports, removes the fragment,
/// decodes unreserved percent-escapes, removes dot-segments (done by the
/// parser), collapses duplicate slashes, strips the trailing slash, and
/// sorts query parameters. Idempotent: normalizing the output returns it
/// unchanged.
pub fn normalize_url(u: &Url) -> String {
    // Non-web schemes are left as parsed; they never become store keys.
    if !matches!(u.scheme(), "http" | "https") {
        return u.as_str().to_string();
    }

    let mut out = String::with_capacity(u.as_str().len());
    out.push_str(u.scheme());
    out.push_str("://");

    if !u.username().is_empty() {
        out.push_str(u.username());
        if let Some(pass) = u.password() {
            out.push(':');
            out.push_str(pass);
        }
        out.push('@');
    }

    if let Some(host) = u.host_str() {
        out.push_str(&host.to_ascii_lowercase());
    }
    // The url crate already reports None for scheme-default ports.
    if let Some(port) = u.port() {
        out.push(':');
        out.push_str(&port.to_string());
    }

    let mut path = decode_unreserved(u.path());
    path = collapse_slashes(&path);
    while path.ends_with('/') {
        path.pop();
    }
    out.push_str(&path);

    if let Some(query) = u.query() {
        let sorted = sort_query(query);
        if !sorted.is_empty() {
            out.push('?');
            out.push_str(&sorted);
        }
    }

    out
}

/// Authority (`host` or `host:port`) of a URL, used for robots caches and
/// domain scoping. Ports survive here so test servers on localhost scope
/// correctly.
pub fn authority(u: &Url) -> String {
    let host = u.host_str().unwrap_or_default().to_ascii_lowercase();
    match u.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    }
}

/// Decode percent-escapes that encode unreserved characters (ALPHA / DIGIT /
/// `-` / `.` / `_` / `~`). All other escapes are kept verbatim.
fn decode_unreserved(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let bytes = path.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = &path[i + 1..i + 3];
            if let Ok(b) = u8::from_str_radix(hex, 16) {
                if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
                    out.push(b as char);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

fn collapse_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut prev_slash = false;
    for c in path.chars() {
        if c == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.push(c);
    }
    out
}

fn sort_query(query: &str) -> String {
    let mut parts: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
    parts.sort_unstable();
    parts.join("&")
}

/// File extensions that normally serve HTML content.
const HTML_EXTENSIONS: &[&str] = &[".asp", ".aspx", ".cfm", ".html", ".net", ".php", ".xhtml"];

/// Schemes a crawler has no business fetching.
const INVALID_SCHEMES: &[&str] = &["data", "mailto", "ftp"];

/// Whether a URL plausibly points at a web page worth fetching.
///
/// Rejects non-web schemes and filenames with extensions outside the HTML
/// set. URLs without a filename extension pass.
pub fn is_webpage_url(u: &Url) -> bool {
    if INVALID_SCHEMES.contains(&u.scheme()) {
        return false;
    }

    let filename = u
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or("");
    let ext = match filename.rfind('.') {
        Some(idx) => &filename[idx..],
        None => "",
    };

    ext.is_empty() || ext == "." || HTML_EXTENSIONS.contains(&ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(raw: &str) -> String {
        normalize_url_string(raw).unwrap()
    }

    #[test]
    fn test_normalize_basic() {
        assert_eq!(norm("HTTP://Example.COM/"), "http://example.com");
        assert_eq!(norm("http://example.com:80/a/"), "http://example.com/a");
        assert_eq!(norm("https://example.com:443/a"), "https://example.com/a");
        assert_eq!(norm("http://example.com:8080/a"), "http://example.com:8080/a");
    }

    #[test]
    fn test_normalize_fragment_and_dots() {
        assert_eq!(norm("http://example.com/a#frag"), "http://example.com/a");
        assert_eq!(norm("http://example.com/a/../b"), "http://example.com/b");
        assert_eq!(norm("http://example.com/a/./b"), "http://example.com/a/b");
    }

    #[test]
    fn test_normalize_escapes_and_slashes() {
        assert_eq!(norm("http://example.com/%41bc"), "http://example.com/Abc");
        assert_eq!(norm("http://example.com//a///b"), "http://example.com/a/b");
        // Reserved escapes are kept.
        assert_eq!(norm("http://example.com/a%2Fb"), "http://example.com/a%2Fb");
    }

    #[test]
    fn test_normalize_sorts_query() {
        assert_eq!(
            norm("http://example.com/a?z=1&a=2&m=3"),
            "http://example.com/a?a=2&m=3&z=1"
        );
        assert_eq!(norm("http://example.com/a?"), "http://example.com/a");
    }

    #[test]
    fn test_normalize_idempotent() {
        let inputs = [
            "HTTP://Example.COM:80//x/./y/../z/?b=2&a=1#frag",
            "https://example.com/%7Euser/",
            "http://example.com",
            "http://example.com/a?z=1&a=2",
        ];
        for raw in inputs {
            let once = norm(raw);
            assert_eq!(norm(&once), once, "not idempotent for {}", raw);
        }
    }

    #[test]
    fn test_authority() {
        let u = Url::parse("http://Example.com:8080/x").unwrap();
        assert_eq!(authority(&u), "example.com:8080");
        let u = Url::parse("http://example.com/x").unwrap();
        assert_eq!(authority(&u), "example.com");
    }

    #[test]
    fn test_is_webpage_url() {
        let ok = ["http://a.com/", "http://a.com/page", "http://a.com/p.html", "http://a.com/p.php"];
        for raw in ok {
            assert!(is_webpage_url(&Url::parse(raw).unwrap()), "{}", raw);
        }
        let bad = ["mailto:x@a.com", "ftp://a.com/f", "http://a.com/img.png", "http://a.com/doc.pdf"];
        for raw in bad {
            assert!(!is_webpage_url(&Url::parse(raw).unwrap()), "{}", raw);
        }
    }
}
