//! Timing-faithful replay of a recorded resource

use std::time::Duration;

use hyper::header::{HeaderName, HeaderValue as HttpHeaderValue};
use hyper::{Response, StatusCode};
use tracing::{debug, trace};

use crate::config::PlaybackSettings;
use crate::resource::Resource;
use crate::storage::ContentStore;
use crate::{ProxyError, Result};

use super::stage::{into_body, once, Pipeline, ProxyBody, Stage};

/// Headers never copied from a recording into a replayed response
const STRIPPED_HEADERS: [&str; 2] = ["content-length", "transfer-encoding"];

/// Turns a recorded resource into a delayed, rate-limited response
#[derive(Debug, Clone, Copy)]
pub struct PlaybackScheduler {
    settings: PlaybackSettings,
    debug_headers: bool,
}

impl PlaybackScheduler {
    /// Scheduler for one snapshot of the playback settings
    #[must_use]
    pub fn new(settings: PlaybackSettings, debug_headers: bool) -> Self {
        Self {
            settings,
            debug_headers,
        }
    }

    /// Delay before the response head: `(ttfb + latency_gap) / speed`
    #[must_use]
    pub fn first_byte_delay(&self, resource: &Resource) -> Option<Duration> {
        if !self.settings.waiting {
            return None;
        }
        let millis = (resource.origin.ttfb + self.settings.latency_gap) / self.settings.speed;
        if !millis.is_finite() || millis <= 0.0 {
            return None;
        }
        Some(Duration::from_micros((millis * 1000.0).round() as u64))
    }

    /// Body rate in bytes per second, `None` for unthrottled
    #[must_use]
    pub fn data_rate(&self, resource: &Resource) -> Option<f64> {
        if !self.settings.throttling {
            return None;
        }
        if self.settings.fixed_data_rate > 0.0 {
            return Some(self.settings.fixed_data_rate);
        }
        let rate = resource.bytes_per_second(self.settings.latency_gap) * self.settings.speed;
        (rate.is_finite() && rate > 0.0).then_some(rate)
    }

    /// Stages the stored body flows through on its way to the client
    #[must_use]
    pub fn pipeline(&self, resource: &Resource) -> Pipeline {
        let mut pipeline = Pipeline::new();
        if is_gzip(resource) {
            pipeline = pipeline.with(Stage::Gzip);
        }
        if let Some(rate) = self.data_rate(resource) {
            pipeline = pipeline.with(Stage::Throttle(rate));
        }
        pipeline
    }

    /// Build the replayed response
    ///
    /// The body is read fresh from the store, so edits to cached files are
    /// served without a restart. The first-byte delay elapses before this
    /// returns.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no layer holds the body, or an error if the
    /// file cannot be read or the recorded head is not valid HTTP
    pub async fn replay(
        &self,
        resource: &Resource,
        store: &ContentStore,
        cascade: &[String],
    ) -> Result<Response<ProxyBody>> {
        let body = store
            .read(&resource.path, cascade)
            .await?
            .ok_or_else(|| ProxyError::not_found(&resource.method, &resource.url))?;

        let mut builder = Response::builder().status(
            StatusCode::from_u16(resource.status_code)
                .map_err(|e| ProxyError::Http(format!("Recorded status: {e}")))?,
        );

        for (name, value) in resource.headers.iter() {
            if STRIPPED_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
                continue;
            }
            let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
                debug!("Skipping invalid recorded header name '{}'", name);
                continue;
            };
            for value in value.values() {
                match HttpHeaderValue::from_str(value) {
                    Ok(v) => builder = builder.header(header_name.clone(), v),
                    Err(_) => debug!("Skipping invalid value of recorded header '{}'", name),
                }
            }
        }

        if self.debug_headers {
            builder = builder.header("x-playback", "1");
            for (name, value) in resource.origin.debug_headers() {
                builder = builder.header(name, value);
            }
        }

        let pipeline = self.pipeline(resource);
        trace!(
            "Replaying {} {} ({} bytes, {} stages)",
            resource.method,
            resource.url,
            body.len(),
            pipeline.stages().len()
        );

        if let Some(delay) = self.first_byte_delay(resource) {
            tokio::time::sleep(delay).await;
        }

        Ok(builder.body(into_body(pipeline.apply(once(body))))?)
    }
}

/// Whether the client expects a gzip body for this resource
fn is_gzip(resource: &Resource) -> bool {
    match resource.headers.get_str("content-encoding") {
        Some(encoding) => encoding.trim().eq_ignore_ascii_case("gzip"),
        None => resource.origin.content_encoding.eq_ignore_ascii_case("gzip"),
    }
}
