//! Accept loop serving HTTP/1.1 proxy connections

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::playback::ProxyBody;
use crate::{ProxyError, Result};

use super::connection_pool::ConnectionPool;
use super::SHUTDOWN_TIMEOUT_MS;

/// Bound listener that dispatches every request to a handler
pub struct ProxyServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    connection_pool: ConnectionPool,
    shutdown_tx: broadcast::Sender<()>,
}

impl ProxyServer {
    /// Bind `host:port`; port 0 picks a free port
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be resolved or bound
    pub async fn bind(host: &str, port: u16, max_connections: usize) -> Result<Self> {
        let listener = TcpListener::bind((host, port)).await.map_err(|e| {
            ProxyError::ConfigError(format!("Failed to listen on {host}:{port}: {e}"))
        })?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            listener,
            local_addr,
            connection_pool: ConnectionPool::new(max_connections),
            shutdown_tx,
        })
    }

    /// Address actually bound
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sender that stops the accept loop and drains connections
    #[must_use]
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Serve until a shutdown signal is sent
    ///
    /// # Errors
    ///
    /// Currently infallible; accept errors are logged and skipped
    pub async fn run<F, Fut>(self, handler: F) -> Result<()>
    where
        F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Response<ProxyBody>> + Send + 'static,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut connections = JoinSet::new();

        info!("Listening on {}", self.local_addr);

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let Some(guard) = self.connection_pool.try_acquire() else {
                                warn!("Connection limit reached, rejecting {}", peer_addr);
                                drop(stream);
                                continue;
                            };

                            let handler = handler.clone();
                            let mut conn_shutdown = self.shutdown_tx.subscribe();

                            connections.spawn(async move {
                                let _guard = guard;
                                let service = service_fn(move |request| {
                                    let handler = handler.clone();
                                    async move { Ok::<_, Infallible>(handler(request).await) }
                                });

                                let conn = http1::Builder::new()
                                    .serve_connection(TokioIo::new(stream), service);
                                tokio::pin!(conn);

                                let result = tokio::select! {
                                    result = conn.as_mut() => result,
                                    _ = conn_shutdown.recv() => {
                                        conn.as_mut().graceful_shutdown();
                                        conn.await
                                    }
                                };

                                if let Err(e) = result {
                                    debug!("Connection from {} ended: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown_rx.recv() => {
                    info!("Listener {} shutting down", self.local_addr);
                    break;
                }
            }
        }

        drop(self.listener);

        // Wait for in-flight exchanges with timeout
        let shutdown_timeout = Duration::from_millis(SHUTDOWN_TIMEOUT_MS);
        let drained = tokio::time::timeout(shutdown_timeout, async {
            while let Some(result) = connections.join_next().await {
                if let Err(e) = result {
                    warn!("Connection task error: {}", e);
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!("Aborting {} connections still open", connections.len());
            connections.shutdown().await;
        }

        info!("Shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::http::text_response;
    use http_body_util::{BodyExt, Empty};
    use hyper::body::Bytes;
    use hyper::StatusCode;
    use hyper_util::client::legacy::Client;
    use hyper_util::rt::TokioExecutor;

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = ProxyServer::bind("127.0.0.1", 0, 10).await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_serves_requests_until_shutdown() {
        let server = ProxyServer::bind("127.0.0.1", 0, 10).await.unwrap();
        let addr = server.local_addr();
        let shutdown = server.shutdown_handle();

        let handle = tokio::spawn(server.run(|request: Request<Incoming>| async move {
            text_response(StatusCode::OK, request.uri().path())
        }));

        let client = Client::builder(TokioExecutor::new()).build_http::<Empty<Bytes>>();
        let response = client
            .get(format!("http://{addr}/hello").parse().unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "/hello");

        shutdown.send(()).ok();
        let result = tokio::time::timeout(Duration::from_secs(7), handle).await;
        assert!(result.unwrap().unwrap().is_ok());
    }
}
