//! Minimal concurrent HTTP server.
//!
//! Accepts connections on its own task and serves each one on a spawned task.
//! At most [`HttpServerConfig::max_connections`] connections are open at a
//! time: the accept loop takes a permit before accepting, so further clients
//! wait in the listen backlog. TLS is optional.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;
use tracing::{Span, debug, info, warn};

use super::tls::{TlsFiles, load_acceptor};
use crate::{Error, Result};

/// Default number of connections served concurrently.
pub const DEFAULT_MAX_CONNECTIONS: usize = 20;

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Embedded server configuration.
#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    /// Server bind address
    pub bind_address: String,
    /// Server port; 0 picks a free port
    pub port: u16,
    /// Serve HTTPS with these files instead of plain HTTP
    pub tls: Option<TlsFiles>,
    /// Connections served at the same time
    pub max_connections: usize,
    /// How long shutdown waits for in-flight connections
    pub shutdown_timeout: Duration,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 0,
            tls: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl HttpServerConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    pub fn with_bind_address(mut self, address: impl Into<String>) -> Self {
        self.bind_address = address.into();
        self
    }

    pub fn with_tls(mut self, tls: Option<TlsFiles>) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.max(1);
        self
    }

    fn scheme(&self) -> &'static str {
        if self.tls.is_some() { "https" } else { "http" }
    }
}

/// A running server. Dropping it does not stop it; call [`shutdown`](Self::shutdown).
pub struct HttpServer {
    name: String,
    config: HttpServerConfig,
    local_addr: SocketAddr,
    cancel_token: CancellationToken,
    connections: TaskTracker,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl HttpServer {
    /// Bind the listener and start accepting connections.
    pub async fn start(name: impl Into<String>, config: HttpServerConfig, router: Router) -> Result<Self> {
        let name = name.into();
        let acceptor = config.tls.as_ref().map(load_acceptor).transpose()?;

        let addr = format!("{}:{}", config.bind_address, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::config(format!("{}: unable to bind {}: {}", name, addr, e)))?;
        let local_addr = listener.local_addr()?;

        let cancel_token = CancellationToken::new();
        let connections = TaskTracker::new();
        let accept = AcceptLoop {
            name: name.clone(),
            listener,
            router: with_tracing(router),
            acceptor,
            permits: Arc::new(Semaphore::new(config.max_connections.max(1))),
            cancel_token: cancel_token.clone(),
            connections: connections.clone(),
        };
        let accept_task = tokio::spawn(accept.run());

        info!(
            "{} listening on {}://{}",
            name,
            config.scheme(),
            local_addr
        );

        Ok(Self {
            name,
            config,
            local_addr,
            cancel_token,
            connections,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, ask open connections to finish, and wait for them up to
    /// the configured timeout.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let accept_task = self.accept_task.lock().take();
        if let Some(task) = accept_task {
            let _ = task.await;
        }
        self.connections.close();
        if tokio::time::timeout(self.config.shutdown_timeout, self.connections.wait())
            .await
            .is_err()
        {
            warn!(
                "{}: {} connections still open after shutdown timeout",
                self.name,
                self.connections.len()
            );
        }
        info!("{} stopped", self.name);
    }

    pub fn is_down(&self) -> bool {
        let accepting = self
            .accept_task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished());
        !accepting && self.connections.is_empty()
    }
}

fn with_tracing(router: Router) -> Router {
    router.layer(
        TraceLayer::new_for_http()
            .make_span_with(|req: &Request| {
                if req.uri().path().starts_with("/health") {
                    Span::none()
                } else {
                    let mut make_span =
                        tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::DEBUG);
                    use tower_http::trace::MakeSpan;
                    make_span.make_span(req)
                }
            })
            .on_response(
                |res: &axum::http::Response<_>, latency: Duration, span: &Span| {
                    if span.is_disabled() {
                        return;
                    }
                    let on_response =
                        tower_http::trace::DefaultOnResponse::new().level(tracing::Level::DEBUG);
                    use tower_http::trace::OnResponse;
                    on_response.on_response(res, latency, span);
                },
            ),
    )
}

struct AcceptLoop {
    name: String,
    listener: TcpListener,
    router: Router,
    acceptor: Option<TlsAcceptor>,
    permits: Arc<Semaphore>,
    cancel_token: CancellationToken,
    connections: TaskTracker,
}

impl AcceptLoop {
    async fn run(self) {
        loop {
            let permit = tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.dispatch(stream, peer, permit),
                    Err(e) => {
                        // usually descriptor exhaustion; give it a moment
                        warn!("{}: accept failed: {}", self.name, e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        debug!("{}: accept loop stopped", self.name);
    }

    /// Serve `stream` on its own task, holding `permit` until it closes.
    fn dispatch(&self, stream: TcpStream, peer: SocketAddr, permit: OwnedSemaphorePermit) {
        let name = self.name.clone();
        let router = self.router.clone();
        let acceptor = self.acceptor.clone();
        let cancel_token = self.cancel_token.clone();

        self.connections.spawn(async move {
            let _permit = permit;
            let _ = stream.set_nodelay(true);

            match acceptor {
                Some(acceptor) => {
                    let handshake =
                        tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await;
                    match handshake {
                        Ok(Ok(tls)) => serve_connection(&name, tls, router, cancel_token).await,
                        Ok(Err(e)) => debug!("{}: TLS handshake with {} failed: {}", name, peer, e),
                        Err(_) => debug!("{}: TLS handshake with {} timed out", name, peer),
                    }
                }
                None => serve_connection(&name, stream, router, cancel_token).await,
            }
        });
    }
}

async fn serve_connection<I>(name: &str, io: I, router: Router, cancel_token: CancellationToken)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let builder = Builder::new(TokioExecutor::new());
    let connection = builder.serve_connection(TokioIo::new(io), TowerToHyperService::new(router));
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = cancel_token.cancelled() => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };
    if let Err(e) = result {
        debug!("{}: connection closed with error: {}", name, e);
    }
}
