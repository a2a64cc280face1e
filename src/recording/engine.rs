//! Recording engine capturing origin exchanges with their timing

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::{StreamExt, TryStreamExt};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue, ACCEPT_ENCODING, CONTENT_ENCODING};
use hyper::{Method, Response};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::index::ResourceIndex;
use crate::network::http::full;
use crate::network::{strip_hop_by_hop, ForwardRequest, OriginClient};
use crate::playback::stage::{self, BodyStream};
use crate::playback::{Pipeline, ProxyBody, Stage};
use crate::resource::{OriginMetrics, Resource};
use crate::storage::ContentStore;
use crate::{ProxyError, Result};

/// A client request about to be recorded
#[derive(Debug)]
pub struct Exchange {
    /// Request method
    pub method: Method,
    /// URL sent to the origin
    pub origin_url: String,
    /// URL the recording is indexed under, ignored params blanked
    pub key_url: String,
    /// Client request headers
    pub headers: HeaderMap,
    /// Client request body
    pub body: Bytes,
}

type RecordingKey = (String, String);

/// Forwards requests to the origin and records what comes back
pub struct Recorder {
    client: OriginClient,
    store: ContentStore,
    in_flight: DashMap<RecordingKey, ()>,
    max_response_size: usize,
    debug_headers: bool,
}

impl Recorder {
    /// Create a new recorder
    #[must_use]
    pub fn new(
        client: OriginClient,
        store: ContentStore,
        max_response_size: usize,
        debug_headers: bool,
    ) -> Self {
        Self {
            client,
            store,
            in_flight: DashMap::new(),
            max_response_size,
            debug_headers,
        }
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Fetch from the origin, record the exchange and answer the client
    ///
    /// Only the first recording of a `(method, url)` is persisted; later
    /// ones are proxied without touching the index or the store.
    ///
    /// # Errors
    ///
    /// Returns `Upstream` if the origin fails or the response exceeds the
    /// size limit, or `InvalidUrl` if the request URL is not absolute
    pub async fn record(
        &self,
        index: &RwLock<ResourceIndex>,
        exchange: Exchange,
    ) -> Result<Response<ProxyBody>> {
        let started = Instant::now();
        let mut resource = Resource::new(exchange.method.as_str(), &exchange.key_url)?;

        let mut headers = exchange.headers;
        rewrite_accept_encoding(&mut headers);
        let request = ForwardRequest::new(exchange.method, &exchange.origin_url, headers, exchange.body)?;

        let response = self.client.forward(request).await?;
        let ttfb = elapsed_ms(started);
        let (head, body) = response.into_parts();

        let wire_counter = Arc::new(AtomicU64::new(0));
        let wire = self
            .collect_wire(
                Pipeline::new()
                    .with(Stage::Measure(Arc::clone(&wire_counter)))
                    .apply(incoming_stream(body)),
            )
            .await?;
        let duration = elapsed_ms(started) - ttfb;

        let content_encoding = head
            .headers
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let stored = decode_for_storage(&content_encoding, wire.clone()).await;

        let size = stored.len() as u64;
        let transfer = match wire_counter.load(Ordering::Relaxed) {
            0 => size,
            wire_bytes => wire_bytes,
        };

        resource.status_code = head.status.as_u16();
        for (name, value) in &head.headers {
            match value.to_str() {
                Ok(value) => resource.headers.append(name.as_str(), value),
                Err(_) => debug!("Not recording non-text header '{}'", name),
            }
        }
        resource.headers.remove("transfer-encoding");
        resource.origin = OriginMetrics {
            ttfb,
            size,
            transfer,
            duration,
            content_encoding,
        };

        debug!(
            "Fetched {} {}: status {}, ttfb {:.1}ms, {} bytes in {:.1}ms",
            resource.method, resource.url, resource.status_code, ttfb, transfer, duration
        );

        let mut client_headers = head.headers;
        strip_hop_by_hop(&mut client_headers);
        if self.debug_headers {
            for (name, value) in resource.origin.debug_headers() {
                if let Ok(value) = HeaderValue::from_str(&value) {
                    client_headers.insert(name, value);
                }
            }
        }

        self.persist(index, resource, &stored).await?;

        let mut response = Response::new(full(wire));
        *response.status_mut() = head.status;
        *response.headers_mut() = client_headers;
        Ok(response)
    }

    async fn collect_wire(&self, mut frames: BodyStream) -> Result<Bytes> {
        let mut wire = BytesMut::new();
        while let Some(chunk) = frames.next().await {
            let chunk = chunk.map_err(|e| ProxyError::Upstream(format!("Origin body failed: {e}")))?;
            if wire.len() + chunk.len() > self.max_response_size {
                return Err(ProxyError::Upstream(format!(
                    "Origin response exceeds {} bytes",
                    self.max_response_size
                )));
            }
            wire.extend_from_slice(&chunk);
        }
        Ok(wire.freeze())
    }

    /// Store the body and index the resource unless it is already known
    async fn persist(
        &self,
        index: &RwLock<ResourceIndex>,
        resource: Resource,
        body: &[u8],
    ) -> Result<()> {
        let key = (resource.method.clone(), resource.url.clone());
        if index.read().await.contains(&key.0, &key.1) {
            debug!("Already recorded {} {}", key.0, key.1);
            return Ok(());
        }

        let Some(_claim) = self.claim(key) else {
            debug!("Recording of {} {} already in flight", resource.method, resource.url);
            return Ok(());
        };

        // another recording may have finished between the check and the claim
        if index.read().await.contains(&resource.method, &resource.url) {
            return Ok(());
        }

        if let Err(e) = self.store.write(&resource.path, body).await {
            warn!("Failed to store body of {}: {}", resource.url, e);
        }

        let method = resource.method.clone();
        let url = resource.url.clone();
        let insertion = index.write().await.insert_if_absent(resource)?;
        info!(
            "Recorded {} {} at position {}",
            method,
            url,
            insertion.position()
        );
        Ok(())
    }

    fn claim(&self, key: RecordingKey) -> Option<InFlightClaim<'_>> {
        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                vacant.insert(());
                Some(InFlightClaim {
                    in_flight: &self.in_flight,
                    key,
                })
            }
        }
    }
}

/// Releases an in-flight recording claim when dropped
struct InFlightClaim<'a> {
    in_flight: &'a DashMap<RecordingKey, ()>,
    key: RecordingKey,
}

impl Drop for InFlightClaim<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.key);
    }
}

/// Ask the origin for gzip or nothing, so the body stays decodable
fn rewrite_accept_encoding(headers: &mut HeaderMap) {
    let Some(accepted) = headers.get(ACCEPT_ENCODING) else {
        return;
    };

    let gzip = accepted.to_str().is_ok_and(|value| {
        value.split(',').any(|coding| {
            coding
                .split(';')
                .next()
                .is_some_and(|name| name.trim().eq_ignore_ascii_case("gzip"))
        })
    });

    let rewritten = if gzip { "gzip" } else { "identity" };
    headers.insert(ACCEPT_ENCODING, HeaderValue::from_static(rewritten));
}

/// Decoded body for the store; undecodable gzip is kept as received
async fn decode_for_storage(content_encoding: &str, wire: Bytes) -> Bytes {
    if !content_encoding.trim().eq_ignore_ascii_case("gzip") || wire.is_empty() {
        return wire;
    }

    match stage::collect(Stage::Gunzip.apply(stage::once(wire.clone()))).await {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!("Could not decode gzip body, storing it encoded: {}", e);
            wire
        }
    }
}

fn incoming_stream(body: Incoming) -> BodyStream {
    Box::pin(body.into_data_stream().map_err(io::Error::other))
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}
