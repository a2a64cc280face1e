//! URL canonicalization: cache paths, ignored params and query distance
//!
//! A recorded body lives at `method/scheme/host/file_path` under a cache
//! layer. The mapping is a pure function of method and URL, so the same
//! request always lands on the same file.

use std::collections::BTreeMap;

use hyper::Uri;
use sha2::{Digest, Sha256};

use crate::{ProxyError, Result};

/// Document name appended to directory-like paths
pub const DIRECTORY_INDEX: &str = "index.html";

/// Longest filename stem kept before the uniqueness hash is appended
pub const MAX_FILENAME_LENGTH: usize = 196;

/// Hex characters of the SHA-256 digest appended to truncated stems
pub const FILE_UNIQ_HASH_LENGTH: usize = 8;

/// Longest extension kept apart from the stem; longer ones are part of it
pub const MAX_EXTENSION_LENGTH: usize = 32;

/// Parsed query string: key to every value it was given, in order
pub type QueryParams = BTreeMap<String, Vec<String>>;

/// Immutable parsed absolute URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyUrl {
    scheme: String,
    host: String,
    pathname: String,
    search: String,
}

impl ProxyUrl {
    /// Parse an absolute `scheme://host[:port]/path?query` URL
    ///
    /// # Errors
    ///
    /// Returns error if the URL is not absolute or cannot be parsed
    pub fn parse(url: &str) -> Result<Self> {
        let invalid = |reason: &str| ProxyError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let uri: Uri = url.parse().map_err(|e| invalid(&format!("{e}")))?;

        let scheme = uri
            .scheme_str()
            .ok_or_else(|| invalid("missing scheme"))?
            .to_ascii_lowercase();
        let hostname = uri.host().ok_or_else(|| invalid("missing host"))?;

        let host = match uri.port_u16() {
            Some(port) if Some(port) != default_port(&scheme) => {
                format!("{}:{port}", hostname.to_ascii_lowercase())
            }
            _ => hostname.to_ascii_lowercase(),
        };

        let pathname = match uri.path() {
            "" => "/".to_string(),
            path => path.to_string(),
        };

        Ok(Self {
            scheme,
            host,
            pathname,
            search: uri.query().unwrap_or_default().to_string(),
        })
    }

    /// Scheme without the trailing colon, lowercased
    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Host, including the port when it is not the scheme default
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Path component, always starting with `/`
    #[must_use]
    pub fn pathname(&self) -> &str {
        &self.pathname
    }

    /// Query string without the leading `?`
    #[must_use]
    pub fn search(&self) -> &str {
        &self.search
    }

    /// Path plus `?query` when there is one
    #[must_use]
    pub fn path_query(&self) -> String {
        if self.search.is_empty() {
            self.pathname.clone()
        } else {
            format!("{}?{}", self.pathname, self.search)
        }
    }

    /// Parsed query parameters
    #[must_use]
    pub fn query_params(&self) -> QueryParams {
        parse_query(&self.search)
    }

    /// Lowercased extension of the last path segment, with its dot
    #[must_use]
    pub fn extension(&self) -> String {
        let segment = self.pathname.rsplit('/').next().unwrap_or_default();
        split_extension(segment).1.to_ascii_lowercase()
    }

    /// Relative file path for the body, starting with `/`
    ///
    /// Directory-like paths get `index.html`, and the query string is
    /// folded into the stem after a `~`, with `%` and `/` escaped so it
    /// stays inside the filename. Every over-long component is cut and
    /// suffixed with a short digest of the part that was cut.
    #[must_use]
    pub fn file_path(&self) -> String {
        let last = self.pathname.rsplit('/').next().unwrap_or_default();
        let mut segments = normalize_segments(&self.pathname);

        let named = !matches!(last, "" | "." | "..")
            && segments
                .last()
                .is_some_and(|segment| !split_extension(segment).1.is_empty());
        let base = if named {
            segments.pop().unwrap_or(DIRECTORY_INDEX)
        } else {
            DIRECTORY_INDEX
        };

        let (stem, ext) = match split_extension(base) {
            (_, ext) if ext.chars().count() > MAX_EXTENSION_LENGTH => (base, ""),
            split => split,
        };

        let mut filename = stem.to_string();
        if !self.search.is_empty() {
            filename.push('~');
            filename.push_str(&escape_query(&self.search));
        }
        let mut filename = shorten_filename(&filename);
        filename.push_str(ext);

        let mut path = String::new();
        for segment in segments {
            path.push('/');
            path.push_str(&shorten_filename(segment));
        }
        path.push('/');
        path.push_str(&filename);
        path
    }

    /// Deterministic storage path: `method/scheme/host/file_path`
    ///
    /// The method is lowercased and a `:` in the host becomes `~`.
    #[must_use]
    pub fn pathnize(&self, method: &str) -> String {
        let file_path = self.file_path();
        let mut parts = vec![
            method.to_lowercase(),
            self.scheme.clone(),
            self.host.replace(':', "~"),
        ];
        parts.extend(
            file_path
                .split('/')
                .filter(|part| !part.is_empty())
                .map(str::to_string),
        );
        parts.join("/")
    }
}

/// Storage path for a method and URL
///
/// # Errors
///
/// Returns error if the URL cannot be parsed
pub fn pathnize(url: &str, method: &str) -> Result<String> {
    Ok(ProxyUrl::parse(url)?.pathnize(method))
}

/// Blank the values of the named query parameters
///
/// Keys stay in place so the request still shows which parameters it
/// carried; everything else in the URL is left verbatim.
#[must_use]
pub fn clear_params(url: &str, names: &[String]) -> String {
    if names.is_empty() {
        return url.to_string();
    }

    let (without_fragment, fragment) = match url.find('#') {
        Some(pos) => (&url[..pos], &url[pos..]),
        None => (url, ""),
    };
    let Some(qpos) = without_fragment.find('?') else {
        return url.to_string();
    };

    let base = &without_fragment[..qpos];
    let query = &without_fragment[qpos + 1..];

    let cleared: Vec<String> = query
        .split('&')
        .map(|pair| {
            let key = pair.split('=').next().unwrap_or_default();
            if !key.is_empty() && names.iter().any(|name| *name == decode_component(key)) {
                format!("{key}=")
            } else {
                pair.to_string()
            }
        })
        .collect();

    format!("{base}?{}{fragment}", cleared.join("&"))
}

/// Parse a query string (without `?`) into a key/values map
#[must_use]
pub fn parse_query(search: &str) -> QueryParams {
    let mut params = QueryParams::new();
    for pair in search.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params
            .entry(decode_component(key))
            .or_default()
            .push(decode_component(value));
    }
    params
}

/// Dissimilarity of two query strings in `[0, 1]`
///
/// `(unmatched + only_in_b) / (matched + unmatched + only_in_b)` where a
/// key of `a` matches only if `b` has it with identical values.
#[must_use]
pub fn query_string_distance(a: &QueryParams, b: &QueryParams) -> f64 {
    let mut matched = 0usize;
    let mut unmatched = 0usize;
    for (key, values) in a {
        if b.get(key) == Some(values) {
            matched += 1;
        } else {
            unmatched += 1;
        }
    }
    let only_in_b = b.keys().filter(|key| !a.contains_key(*key)).count();

    let total = matched + unmatched + only_in_b;
    if total == 0 {
        return 0.0;
    }
    (unmatched + only_in_b) as f64 / total as f64
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" | "ws" => Some(80),
        "https" | "wss" => Some(443),
        _ => None,
    }
}

fn decode_component(s: &str) -> String {
    let plus_decoded = s.replace('+', " ");
    match urlencoding::decode(&plus_decoded) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => plus_decoded,
    }
}

/// Split `name.ext` into `("name", ".ext")`; dotfiles have no extension
fn split_extension(segment: &str) -> (&str, &str) {
    match segment.rfind('.') {
        Some(pos) if pos > 0 => (&segment[..pos], &segment[pos..]),
        _ => (segment, ""),
    }
}

/// Make a query safe as part of a single path component
fn escape_query(search: &str) -> String {
    search.replace('%', "%25").replace('/', "%2F")
}

fn shorten_filename(filename: &str) -> String {
    let Some((cut, _)) = filename.char_indices().nth(MAX_FILENAME_LENGTH) else {
        return filename.to_string();
    };

    let digest = hex::encode(Sha256::digest(filename[cut..].as_bytes()));
    format!(
        "{}_{}",
        &filename[..cut],
        &digest[..FILE_UNIQ_HASH_LENGTH]
    )
}

/// Drop empty and `.` segments and resolve `..` without leaving the root
fn normalize_segments(path: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    segments
}
