//! Proxy engine: one index, one mode, one dispatch point for every request

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hyper::body::{Body, Incoming};
use hyper::header::{HeaderMap, HOST};
use hyper::http::request::Parts;
use hyper::{Method, Request, Response, StatusCode};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{Mode, PlaybackSettings, ProxyConfig, CASCADE_HEADER};
use crate::index::ResourceIndex;
use crate::network::http::{error_response, read_body, text_response, BoxError};
use crate::network::{OriginClient, ProxyServer, SHUTDOWN_TIMEOUT_MS};
use crate::playback::{PlaybackScheduler, ProxyBody};
use crate::recording::{Exchange, Recorder};
use crate::resource::Resource;
use crate::storage::{ContentStore, IndexFile};
use crate::url::clear_params;
use crate::{ProxyError, Result};

use super::decision::{decide, Decision};

/// Prefix candidates above this count are scored on the blocking pool
const BLOCKING_SCAN_THRESHOLD: usize = 512;

/// Recording/playback proxy
///
/// Cheap to clone; clones share the same index, mode and server.
#[derive(Clone)]
pub struct ProxyEngine {
    shared: Arc<Shared>,
}

struct Shared {
    config: ProxyConfig,
    index: RwLock<ResourceIndex>,
    mode: RwLock<Mode>,
    settings: RwLock<PlaybackSettings>,
    store: ContentStore,
    index_file: IndexFile,
    recorder: Recorder,
    save_lock: Mutex<()>,
    saved_len: AtomicUsize,
    server: Mutex<Option<RunningServer>>,
}

struct RunningServer {
    addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl ProxyEngine {
    /// Create an engine; the index stays empty until [`load`](Self::load)
    /// or [`start`](Self::start)
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or the cache root
    /// cannot be created
    pub fn new(config: ProxyConfig) -> Result<Self> {
        config.validate()?;
        config.ensure_cache_root()?;

        let store = ContentStore::new(config.cache_root.clone());
        let recorder = Recorder::new(
            OriginClient::new(config.limits.upstream_timeout_ms),
            store.clone(),
            config.limits.max_response_size,
            config.debug_headers,
        );

        let shared = Shared {
            index: RwLock::new(ResourceIndex::new(config.match_strategy)),
            mode: RwLock::new(config.mode),
            settings: RwLock::new(config.playback),
            index_file: IndexFile::new(config.index_path()),
            store,
            recorder,
            save_lock: Mutex::new(()),
            saved_len: AtomicUsize::new(0),
            server: Mutex::new(None),
            config,
        };

        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// Configuration the engine was created with
    #[must_use]
    pub fn config(&self) -> &ProxyConfig {
        &self.shared.config
    }

    /// Replace the index with the persisted one
    ///
    /// A missing index file leaves an empty index.
    ///
    /// # Errors
    ///
    /// Returns `IndexCorrupted` if the file cannot be parsed
    pub async fn load(&self) -> Result<()> {
        let loaded = self
            .shared
            .index_file
            .load(self.shared.config.match_strategy)
            .await?;
        let len = loaded.len();

        *self.shared.index.write().await = loaded;
        self.shared.saved_len.store(len, Ordering::Relaxed);
        Ok(())
    }

    /// Persist the whole index
    ///
    /// # Errors
    ///
    /// Returns error if the index cannot be serialized or written
    pub async fn save(&self) -> Result<()> {
        let _guard = self.shared.save_lock.lock().await;

        let (json, len) = {
            let index = self.shared.index.read().await;
            (index.to_json()?, index.len())
        };
        self.shared.index_file.write(&json).await?;
        self.shared.saved_len.store(len, Ordering::Relaxed);

        debug!("Saved {} resources", len);
        Ok(())
    }

    /// Persist the index only if recordings were added since the last save
    ///
    /// # Errors
    ///
    /// Returns error if saving fails
    pub async fn autosave(&self) -> Result<bool> {
        if self.resources_len().await == self.shared.saved_len.load(Ordering::Relaxed) {
            return Ok(false);
        }
        self.save().await?;
        Ok(true)
    }

    /// Load the index, bind the listener and start serving
    ///
    /// # Errors
    ///
    /// Returns error if the engine is already running, the index is
    /// corrupted, or the address cannot be bound
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut server_slot = self.shared.server.lock().await;
        if let Some(running) = server_slot.as_ref() {
            return Err(ProxyError::Other(format!(
                "Proxy already running on {}",
                running.addr
            )));
        }

        self.load().await?;

        let config = &self.shared.config;
        let server =
            ProxyServer::bind(&config.host, config.port, config.limits.max_connections).await?;
        let addr = server.local_addr();
        let shutdown = server.shutdown_handle();

        let engine = self.clone();
        let task = tokio::spawn(server.run(move |request: Request<Incoming>| {
            let engine = engine.clone();
            async move { engine.handle(request).await }
        }));

        info!(
            "Playback proxy started on {} as http://{} ({} mode)",
            config.cache_root.display(),
            addr,
            self.mode().await
        );

        *server_slot = Some(RunningServer {
            addr,
            shutdown,
            task,
        });
        Ok(addr)
    }

    /// Stop serving, then save the index
    ///
    /// # Errors
    ///
    /// Returns error if the final save fails
    pub async fn stop(&self) -> Result<()> {
        let running = self.shared.server.lock().await.take();

        if let Some(running) = running {
            running.shutdown.send(()).ok();
            let grace = Duration::from_millis(SHUTDOWN_TIMEOUT_MS + 1000);
            match tokio::time::timeout(grace, running.task).await {
                Ok(Ok(Err(e))) => warn!("Server ended with error: {}", e),
                Ok(Err(e)) => warn!("Server task failed: {}", e),
                Err(_) => warn!("Server did not stop within {:?}", grace),
                Ok(Ok(Ok(()))) => {}
            }
            info!("Stopped proxy on {}", running.addr);
        }

        self.save().await
    }

    /// Bound address while running
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.server.lock().await.as_ref().map(|r| r.addr)
    }

    /// Current mode
    pub async fn mode(&self) -> Mode {
        *self.shared.mode.read().await
    }

    /// Switch mode; takes effect for the next request
    pub async fn set_mode(&self, mode: Mode) {
        *self.shared.mode.write().await = mode;
        info!("Mode set to {}", mode);
    }

    /// Current playback settings
    pub async fn settings(&self) -> PlaybackSettings {
        *self.shared.settings.read().await
    }

    /// Modify the playback settings; invalid results are rejected
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` and keeps the old settings if the update
    /// leaves them invalid
    pub async fn update_settings<F>(&self, update: F) -> Result<()>
    where
        F: FnOnce(&mut PlaybackSettings),
    {
        let mut settings = self.shared.settings.write().await;
        let mut next = *settings;
        update(&mut next);
        next.validate()?;
        *settings = next;
        Ok(())
    }

    /// Number of indexed resources
    pub async fn resources_len(&self) -> usize {
        self.shared.index.read().await.len()
    }

    /// Run a closure against the index
    pub async fn with_index<R>(&self, f: impl FnOnce(&ResourceIndex) -> R) -> R {
        f(&*self.shared.index.read().await)
    }

    /// Answer one client request; errors become error responses
    pub async fn handle<B>(&self, request: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<BoxError>,
    {
        let method = request.method().clone();
        let uri = request.uri().clone();

        match self.dispatch(request).await {
            Ok(response) => response,
            Err(e) if e.is_not_found() => {
                debug!("{} {}: {}", method, uri, e);
                error_response(&e)
            }
            Err(e) => {
                warn!("{} {} failed: {}", method, uri, e);
                error_response(&e)
            }
        }
    }

    async fn dispatch<B>(&self, request: Request<B>) -> Result<Response<ProxyBody>>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<BoxError>,
    {
        if request.method() == Method::CONNECT {
            return Ok(text_response(
                StatusCode::NOT_IMPLEMENTED,
                "CONNECT tunnels are not supported",
            ));
        }

        let (parts, body) = request.into_parts();
        let origin_url = request_url(&parts)?;
        let key_url = clear_params(&origin_url, &self.shared.config.ignore_params);
        let method = parts.method.as_str().to_lowercase();
        let cascade = cascade_layers(&parts.headers, &self.shared.config.cascade);

        let mode = self.mode().await;
        let hit = match mode {
            Mode::Online => None,
            Mode::Offline | Mode::Mixed => self.lookup(&method, &key_url).await?,
        };

        match (decide(mode, hit.is_some()), hit) {
            (Decision::Record, _) => self.record(parts, body, origin_url, key_url).await,
            (Decision::Replay, Some(resource)) => self.replay(&resource, &cascade).await,
            (Decision::ReplayThenFallbackToRecord, Some(resource)) => {
                match self.replay(&resource, &cascade).await {
                    Err(e) if e.is_not_found() => {
                        debug!("Body of {} missing, recording live", resource.url);
                        self.record(parts, body, origin_url, key_url).await
                    }
                    other => other,
                }
            }
            _ => Err(ProxyError::not_found(&method, &key_url)),
        }
    }

    /// Nearest recording, scoring prefix candidates outside the index lock
    async fn lookup(&self, method: &str, url: &str) -> Result<Option<Resource>> {
        let lookup = self.shared.index.read().await.prepare_nearest(method, url);

        let position = if lookup.pending() >= BLOCKING_SCAN_THRESHOLD {
            tokio::task::spawn_blocking(move || lookup.resolve())
                .await
                .map_err(|e| ProxyError::Other(format!("Nearest-match scan failed: {e}")))?
        } else {
            lookup.resolve()
        };

        let Some(position) = position else {
            return Ok(None);
        };
        let index = self.shared.index.read().await;
        let resource = index.get(position).cloned();
        if let Some(resource) = &resource {
            if resource.url != url {
                debug!("Approximate match for {} {}: {}", method, url, resource.url);
            }
        }
        Ok(resource)
    }

    async fn replay(&self, resource: &Resource, cascade: &[String]) -> Result<Response<ProxyBody>> {
        let settings = self.settings().await;
        PlaybackScheduler::new(settings, self.shared.config.debug_headers)
            .replay(resource, &self.shared.store, cascade)
            .await
    }

    async fn record<B>(
        &self,
        parts: Parts,
        body: B,
        origin_url: String,
        key_url: String,
    ) -> Result<Response<ProxyBody>>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<BoxError>,
    {
        let body = read_body(body, self.shared.config.limits.max_request_size).await?;
        let exchange = Exchange {
            method: parts.method,
            origin_url,
            key_url,
            headers: parts.headers,
            body,
        };
        self.shared
            .recorder
            .record(&self.shared.index, exchange)
            .await
    }
}

/// Absolute URL of a request, from the request target or the `Host` header
fn request_url(parts: &Parts) -> Result<String> {
    if parts.uri.scheme().is_some() && parts.uri.authority().is_some() {
        return Ok(parts.uri.to_string());
    }

    let host = parts
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ProxyError::InvalidUrl {
            url: parts.uri.to_string(),
            reason: "request target is not absolute and there is no Host header".to_string(),
        })?;
    let path = parts.uri.path_and_query().map_or("/", |pq| pq.as_str());
    Ok(format!("http://{host}{path}"))
}

/// Layers for one request: the cascade header if present, else the configured list
fn cascade_layers(headers: &HeaderMap, configured: &[String]) -> Vec<String> {
    match headers.get(CASCADE_HEADER).and_then(|v| v.to_str().ok()) {
        Some(value) => value
            .split(',')
            .map(str::trim)
            .filter(|layer| !layer.is_empty())
            .map(String::from)
            .collect(),
        None => configured.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Full};
    use tempfile::TempDir;

    fn config(temp_dir: &TempDir, mode: Mode) -> ProxyConfig {
        let mut config = ProxyConfig::with_cache_root(temp_dir.path());
        config.mode = mode;
        config.host = "127.0.0.1".to_string();
        config.playback.waiting = false;
        config.playback.throttling = false;
        config
    }

    fn get(uri: &str) -> Request<Full<Bytes>> {
        Request::get(uri).body(Full::new(Bytes::new())).unwrap()
    }

    async fn seed(engine: &ProxyEngine, url: &str, body: &str) {
        let resource = Resource::new("get", url).unwrap();
        engine
            .shared
            .store
            .write(&resource.path, body.as_bytes())
            .await
            .unwrap();
        engine
            .shared
            .index
            .write()
            .await
            .insert_if_absent(resource)
            .unwrap();
    }

    async fn body_of(response: Response<ProxyBody>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[test]
    fn test_request_url() {
        let (parts, ()) = Request::get("http://example.com/a?b=1").body(()).unwrap().into_parts();
        assert_eq!(request_url(&parts).unwrap(), "http://example.com/a?b=1");

        let (parts, ()) = Request::get("/a?b=1")
            .header(HOST, "example.com:8080")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(request_url(&parts).unwrap(), "http://example.com:8080/a?b=1");

        let (parts, ()) = Request::get("/a").body(()).unwrap().into_parts();
        assert!(matches!(request_url(&parts), Err(ProxyError::InvalidUrl { .. })));
    }

    #[test]
    fn test_cascade_layers() {
        let configured = vec!["base".to_string()];
        assert_eq!(cascade_layers(&HeaderMap::new(), &configured), configured);

        let mut headers = HeaderMap::new();
        headers.insert(CASCADE_HEADER, "one, two,,".parse().unwrap());
        assert_eq!(cascade_layers(&headers, &configured), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_offline_replays_seeded_resource() {
        let temp_dir = TempDir::new().unwrap();
        let engine = ProxyEngine::new(config(&temp_dir, Mode::Offline)).unwrap();
        seed(&engine, "http://example.com/a.txt", "cached").await;

        let response = engine.handle(get("http://example.com/a.txt")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_of(response).await, "cached");
    }

    #[tokio::test]
    async fn test_offline_miss_is_404() {
        let temp_dir = TempDir::new().unwrap();
        let engine = ProxyEngine::new(config(&temp_dir, Mode::Offline)).unwrap();

        let response = engine.handle(get("http://example.com/missing")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_offline_similar_url_is_served() {
        let temp_dir = TempDir::new().unwrap();
        let engine = ProxyEngine::new(config(&temp_dir, Mode::Offline)).unwrap();
        seed(&engine, "http://example.com/api?user=1&session=aaaa", "near").await;

        let response = engine
            .handle(get("http://example.com/api?user=1&session=bbbb"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_of(response).await, "near");
    }

    #[tokio::test]
    async fn test_large_index_scan_does_not_block_recording() {
        let temp_dir = TempDir::new().unwrap();
        let engine = ProxyEngine::new(config(&temp_dir, Mode::Offline)).unwrap();
        {
            let mut index = engine.shared.index.write().await;
            for i in 0..BLOCKING_SCAN_THRESHOLD + 10 {
                let url = format!("http://example.com/items/{i}?page={i}");
                index.insert_if_absent(Resource::new("get", &url).unwrap()).unwrap();
            }
        }
        seed(&engine, "http://example.com/target.json?sid=aaaa", "target").await;

        let lookup = engine
            .shared
            .index
            .read()
            .await
            .prepare_nearest("get", "http://example.com/target.json?sid=bbbb");
        assert!(lookup.pending() >= BLOCKING_SCAN_THRESHOLD);

        let response = engine
            .handle(get("http://example.com/target.json?sid=bbbb"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_of(response).await, "target");

        // the index stays writable while a lookup is being scored
        let lookup = engine.shared.index.read().await.prepare_nearest("get", "http://example.com/items/3?page=4");
        engine
            .shared
            .index
            .write()
            .await
            .insert_if_absent(Resource::new("get", "http://example.com/late.txt").unwrap())
            .unwrap();
        assert!(lookup.resolve().is_some());
    }

    #[tokio::test]
    async fn test_ignored_params_are_blanked() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = config(&temp_dir, Mode::Offline);
        config.ignore_params = vec!["ts".to_string()];
        let engine = ProxyEngine::new(config).unwrap();
        seed(&engine, "http://example.com/x.js?ts=&v=2", "script").await;

        let response = engine.handle(get("http://example.com/x.js?ts=12345&v=2")).await;
        assert_eq!(body_of(response).await, "script");
    }

    #[tokio::test]
    async fn test_cascade_header_overrides_layers() {
        let temp_dir = TempDir::new().unwrap();
        let engine = ProxyEngine::new(config(&temp_dir, Mode::Offline)).unwrap();
        seed(&engine, "http://example.com/style.css", "base").await;

        let path = Resource::new("get", "http://example.com/style.css").unwrap().path;
        crate::storage::write_atomic(&engine.shared.store.layer_path("dark", &path), b"dark")
            .await
            .unwrap();

        let plain = engine.handle(get("http://example.com/style.css")).await;
        assert_eq!(body_of(plain).await, "base");

        let request = Request::get("http://example.com/style.css")
            .header(CASCADE_HEADER, "dark")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let layered = engine.handle(request).await;
        assert_eq!(body_of(layered).await, "dark");
    }

    #[tokio::test]
    async fn test_connect_is_refused() {
        let temp_dir = TempDir::new().unwrap();
        let engine = ProxyEngine::new(config(&temp_dir, Mode::Mixed)).unwrap();

        let request = Request::builder()
            .method(Method::CONNECT)
            .uri("example.com:443")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = engine.handle(request).await;
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn test_relative_target_without_host_is_400() {
        let temp_dir = TempDir::new().unwrap();
        let engine = ProxyEngine::new(config(&temp_dir, Mode::Offline)).unwrap();

        let response = engine.handle(get("/no-host")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_mixed_missing_body_falls_back_to_origin() {
        let temp_dir = TempDir::new().unwrap();
        let engine = ProxyEngine::new(config(&temp_dir, Mode::Mixed)).unwrap();

        // indexed but never stored, and the origin port is closed
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/gone.txt", listener.local_addr().unwrap());
        drop(listener);
        engine
            .shared
            .index
            .write()
            .await
            .insert_if_absent(Resource::new("get", &url).unwrap())
            .unwrap();

        let response = engine.handle(get(&url)).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_update_settings_rejects_invalid() {
        let temp_dir = TempDir::new().unwrap();
        let engine = ProxyEngine::new(config(&temp_dir, Mode::Offline)).unwrap();

        engine.update_settings(|s| s.speed = 4.0).await.unwrap();
        assert!((engine.settings().await.speed - 4.0).abs() < f64::EPSILON);

        assert!(engine.update_settings(|s| s.speed = -1.0).await.is_err());
        assert!((engine.settings().await.speed - 4.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_set_mode() {
        let temp_dir = TempDir::new().unwrap();
        let engine = ProxyEngine::new(config(&temp_dir, Mode::Offline)).unwrap();
        assert_eq!(engine.mode().await, Mode::Offline);

        engine.set_mode(Mode::Online).await;
        assert_eq!(engine.mode().await, Mode::Online);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let engine = ProxyEngine::new(config(&temp_dir, Mode::Offline)).unwrap();
        seed(&engine, "http://example.com/1", "one").await;
        seed(&engine, "http://example.com/2", "two").await;

        assert!(engine.autosave().await.unwrap());
        assert!(!engine.autosave().await.unwrap());
        assert!(temp_dir.path().join("network.json").is_file());

        let reloaded = ProxyEngine::new(config(&temp_dir, Mode::Offline)).unwrap();
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.resources_len().await, 2);
        let urls = reloaded
            .with_index(|index| index.resources().iter().map(|r| r.url.clone()).collect::<Vec<_>>())
            .await;
        assert_eq!(urls, vec!["http://example.com/1", "http://example.com/2"]);
    }

    #[tokio::test]
    async fn test_corrupted_index_aborts_start() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("network.json"), "not json").unwrap();

        let engine = ProxyEngine::new(config(&temp_dir, Mode::Offline)).unwrap();
        let err = engine.start().await.unwrap_err();
        assert!(matches!(err, ProxyError::IndexCorrupted { .. }));
        assert!(engine.local_addr().await.is_none());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let temp_dir = TempDir::new().unwrap();
        let engine = ProxyEngine::new(config(&temp_dir, Mode::Offline)).unwrap();

        let addr = engine.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(engine.local_addr().await, Some(addr));
        assert!(engine.start().await.is_err());

        engine.stop().await.unwrap();
        assert!(engine.local_addr().await.is_none());
        assert!(temp_dir.path().join("network.json").is_file());
    }
}
