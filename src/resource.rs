//! Recorded exchanges and their derived index facets

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::url::{ProxyUrl, QueryParams};
use crate::Result;

/// A header value as recorded: one string or a list of them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    /// Single value
    Single(String),
    /// Repeated header
    Multi(Vec<String>),
}

impl HeaderValue {
    /// First value, if any
    #[must_use]
    pub fn first(&self) -> Option<&str> {
        match self {
            Self::Single(value) => Some(value),
            Self::Multi(values) => values.first().map(String::as_str),
        }
    }

    /// Every value in order
    pub fn values(&self) -> impl Iterator<Item = &str> {
        let slice: &[String] = match self {
            Self::Single(value) => std::slice::from_ref(value),
            Self::Multi(values) => values,
        };
        slice.iter().map(String::as_str)
    }
}

/// Response headers in the order they were received, names case preserved
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, HeaderValue)>);

impl Headers {
    /// Empty header list
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value; repeated names collapse into a `Multi` value
    pub fn append(&mut self, name: &str, value: &str) {
        if let Some((_, existing)) = self
            .0
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            let values = match std::mem::replace(existing, HeaderValue::Multi(Vec::new())) {
                HeaderValue::Single(first) => vec![first, value.to_string()],
                HeaderValue::Multi(mut values) => {
                    values.push(value.to_string());
                    values
                }
            };
            *existing = HeaderValue::Multi(values);
        } else {
            self.0
                .push((name.to_string(), HeaderValue::Single(value.to_string())));
        }
    }

    /// Set a header, replacing any existing value
    pub fn insert(&mut self, name: &str, value: HeaderValue) {
        self.remove(name);
        self.0.push((name.to_string(), value));
    }

    /// Case-insensitive lookup
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// First value of a header, case-insensitive
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(HeaderValue::first)
    }

    /// Remove a header, case-insensitive
    pub fn remove(&mut self, name: &str) -> Option<HeaderValue> {
        let pos = self.0.iter().position(|(n, _)| n.eq_ignore_ascii_case(name))?;
        Some(self.0.remove(pos).1)
    }

    /// Iterate `(name, value)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Number of distinct header names
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no headers
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for Headers {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Headers {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct HeadersVisitor;

        impl<'de> Visitor<'de> for HeadersVisitor {
            type Value = Headers;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of header names to a string or list of strings")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Headers, A::Error> {
                let mut headers = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, value)) = access.next_entry::<String, HeaderValue>()? {
                    headers.push((name, value));
                }
                Ok(Headers(headers))
            }
        }

        deserializer.deserialize_map(HeadersVisitor)
    }
}

/// Timing and size of the original origin response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OriginMetrics {
    /// Milliseconds from request start to the response head
    pub ttfb: f64,
    /// Decoded body length
    pub size: u64,
    /// Bytes on the wire, before decompression
    pub transfer: u64,
    /// Milliseconds spent streaming the body after TTFB
    pub duration: f64,
    /// `content-encoding` as sent by the origin
    pub content_encoding: String,
}

impl OriginMetrics {
    /// `x-origin-*` response headers describing these metrics
    #[must_use]
    pub fn debug_headers(&self) -> [(&'static str, String); 5] {
        [
            ("x-origin-content-encoding", self.content_encoding.clone()),
            ("x-origin-transfer-size", self.transfer.to_string()),
            ("x-origin-resource-size", self.size.to_string()),
            ("x-origin-ttfb", self.ttfb.to_string()),
            ("x-origin-transfer-duration", self.duration.to_string()),
        ]
    }
}

/// One recorded exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    /// Lowercased HTTP method
    pub method: String,
    /// Full request URL, ignored params already blanked
    pub url: String,
    /// Body location relative to a cache layer
    #[serde(default)]
    pub path: String,
    /// Response status
    #[serde(default = "default_status_code")]
    pub status_code: u16,
    /// Response headers
    #[serde(default)]
    pub headers: Headers,
    /// Origin timing and sizes
    #[serde(default)]
    pub origin: OriginMetrics,
    /// Creation time in milliseconds since the Unix epoch
    #[serde(default)]
    pub timestamp: u64,
}

fn default_status_code() -> u16 {
    200
}

impl Resource {
    /// Create a resource for a request; the storage path is derived here once
    ///
    /// # Errors
    ///
    /// Returns error if the URL cannot be parsed
    pub fn new(method: &str, url: &str) -> Result<Self> {
        let mut resource = Self {
            method: method.to_string(),
            url: url.to_string(),
            path: String::new(),
            status_code: default_status_code(),
            headers: Headers::new(),
            origin: OriginMetrics::default(),
            timestamp: now_millis(),
        };
        resource.normalize()?;
        Ok(resource)
    }

    /// Lowercase the method and derive `path` if it was not supplied
    ///
    /// A path that is already set is trusted as-is.
    ///
    /// # Errors
    ///
    /// Returns error if `path` is empty and the URL cannot be parsed
    pub fn normalize(&mut self) -> Result<()> {
        self.method = self.method.to_lowercase();
        if self.path.is_empty() {
            self.path = ProxyUrl::parse(&self.url)?.pathnize(&self.method);
        }
        Ok(())
    }

    /// Parsed URL
    ///
    /// # Errors
    ///
    /// Returns error if the stored URL cannot be parsed
    pub fn proxy_url(&self) -> Result<ProxyUrl> {
        ProxyUrl::parse(&self.url)
    }

    /// Origin transfer rate in bytes per second; NaN when no duration was recorded
    #[must_use]
    pub fn bytes_per_second(&self, gap: f64) -> f64 {
        if self.origin.duration <= 0.0 {
            return f64::NAN;
        }
        let seconds = (self.origin.duration + gap) / 1000.0;
        self.origin.transfer as f64 / seconds
    }
}

/// Derived facets of an indexed resource
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceTag {
    /// Lowercased method
    pub method: String,
    /// Scheme
    pub scheme: String,
    /// Host with non-default port
    pub host: String,
    /// URL path
    pub pathname: String,
    /// Path plus query, compared by the prefix matcher
    pub path_query: String,
    /// Parsed query, compared by the path-tree matcher
    pub query: QueryParams,
    /// Lowercased extension with dot, empty when absent
    pub extension: String,
    /// Lowercased `content-type` without parameters
    pub mime_type: String,
}

impl ResourceTag {
    /// Derive the tag of a resource
    ///
    /// # Errors
    ///
    /// Returns error if the resource URL cannot be parsed
    pub fn new(resource: &Resource) -> Result<Self> {
        let url = resource.proxy_url()?;
        Ok(Self::from_url(&resource.method, &url, &resource.headers))
    }

    /// Tag for a bare request, used as the query side of a match
    #[must_use]
    pub fn from_url(method: &str, url: &ProxyUrl, headers: &Headers) -> Self {
        let mime_type = headers
            .get_str("content-type")
            .unwrap_or_default()
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        Self {
            method: method.to_lowercase(),
            scheme: url.scheme().to_string(),
            host: url.host().to_string(),
            pathname: url.pathname().to_string(),
            path_query: url.path_query(),
            query: url.query_params(),
            extension: url.extension(),
            mime_type,
        }
    }
}

/// Milliseconds since the Unix epoch
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_path_derived_from_method_and_url() {
        let get = Resource::new("GET", "https://www.example.com/path/to/file?name=value").unwrap();
        assert_eq!(get.method, "get");
        assert_eq!(
            get.path,
            "get/https/www.example.com/path/to/file/index~name=value.html"
        );

        let post = Resource::new("POST", "https://www.example.com/path/to/file?name=value").unwrap();
        assert_eq!(
            post.path,
            "post/https/www.example.com/path/to/file/index~name=value.html"
        );
    }

    #[test]
    fn test_supplied_path_is_trusted() {
        let mut resource: Resource = serde_json::from_str(
            r#"{"method":"GET","url":"http://example.com/a","path":"custom/place.bin"}"#,
        )
        .unwrap();
        resource.normalize().unwrap();
        assert_eq!(resource.method, "get");
        assert_eq!(resource.path, "custom/place.bin");
        assert_eq!(resource.status_code, 200);
    }

    #[test]
    fn test_bytes_per_second() {
        let mut resource = Resource::new("get", "http://example.com/").unwrap();
        assert!(resource.bytes_per_second(0.0).is_nan());

        resource.origin.transfer = 1000;
        resource.origin.duration = 500.0;
        assert!((resource.bytes_per_second(0.0) - 2000.0).abs() < 1e-9);
        assert!((resource.bytes_per_second(500.0) - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn test_tag_extension_and_mime_type() {
        let mut resource = Resource::new("get", "https://www.example.com/path/to/file.HTML?name=value").unwrap();
        resource.headers.insert(
            "Content-Type",
            HeaderValue::Multi(vec!["text/HTML; charset=UTF-8".to_string()]),
        );

        let tag = ResourceTag::new(&resource).unwrap();
        assert_eq!(tag.extension, ".html");
        assert_eq!(tag.mime_type, "text/html");
        assert_eq!(tag.host, "www.example.com");
        assert_eq!(tag.path_query, "/path/to/file.HTML?name=value");
    }

    #[test]
    fn test_headers_keep_order_and_case() {
        let json = r#"{"X-Zeta":"1","content-type":"text/plain","Set-Cookie":["a=1","b=2"]}"#;
        let headers: Headers = serde_json::from_str(json).unwrap();

        let names: Vec<&str> = headers.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["X-Zeta", "content-type", "Set-Cookie"]);
        assert_eq!(headers.get_str("Content-Type"), Some("text/plain"));
        assert_eq!(
            headers.get("set-cookie").unwrap().values().collect::<Vec<_>>(),
            vec!["a=1", "b=2"]
        );

        assert_eq!(serde_json::to_string(&headers).unwrap(), json);
    }

    #[test]
    fn test_headers_append_collapses_repeats() {
        let mut headers = Headers::new();
        headers.append("Set-Cookie", "a=1");
        headers.append("set-cookie", "b=2");
        headers.append("Vary", "Accept");

        assert_eq!(headers.len(), 2);
        assert_eq!(
            headers.get("Set-Cookie"),
            Some(&HeaderValue::Multi(vec!["a=1".to_string(), "b=2".to_string()]))
        );
        assert!(headers.remove("VARY").is_some());
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn test_resource_json_shape() {
        let mut resource = Resource::new("get", "http://example.com/").unwrap();
        resource.origin.content_encoding = "gzip".to_string();
        resource.timestamp = 7;

        let value = serde_json::to_value(&resource).unwrap();
        assert_eq!(value["statusCode"], 200);
        assert_eq!(value["origin"]["contentEncoding"], "gzip");
        assert_eq!(value["timestamp"], 7);
        assert_eq!(value["path"], "get/http/example.com/index.html");
    }
}
