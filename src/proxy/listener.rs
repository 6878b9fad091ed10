use std::net::SocketAddr;
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::logging::{AccessLogBuilder, CacheOutcome};
use crate::manager::lock::{PortGuard, PortLocks};
use crate::scope::Scope;
use crate::settings::{InboundScheme, Settings};
use crate::storage::StorageBackend;
use crate::util::timeout_with_context;

use super::codec::{self, BodyPlan};
use super::upstream::UpstreamClient;
use super::{AppContext, handler, tls};

/// A proxy instance accepting connections until its scope is cancelled.
#[derive(Debug)]
pub struct Instance {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl Instance {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Waits until the listener is dropped, in-flight connections have
    /// finished, storage is torn down and the port lock is released.
    pub async fn stopped(self) {
        if let Err(err) = self.task.await {
            error!(error = %err, "proxy instance task failed");
        }
    }
}

/// Claims `settings.port`, binds it and serves until `scope` is cancelled.
///
/// Waits while another instance holds the port. On any startup failure the
/// port lock is released before returning.
pub async fn start_instance(settings: Settings, scope: Scope, locks: &PortLocks) -> Result<Instance> {
    let guard = locks.acquire(settings.port).await;

    let upstream = settings.upstream()?;
    let connector = if upstream.tls {
        Some(tls::build_connector()?)
    } else {
        None
    };
    let acceptor = match settings.scheme {
        InboundScheme::Http => None,
        InboundScheme::Https => {
            let cert = settings
                .pem_path
                .as_deref()
                .ok_or_else(|| anyhow!("scheme = \"https\" requires pem_path"))?;
            let key = settings
                .key_path
                .as_deref()
                .ok_or_else(|| anyhow!("scheme = \"https\" requires key_path"))?;
            Some(tls::build_acceptor(cert, key)?)
        }
    };

    let bind_addr = settings.listen_addr();
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind listener on {bind_addr}"))?;
    let local_addr = listener.local_addr().unwrap_or(bind_addr);

    let backend = StorageBackend::from_settings(&settings)?;
    let client = UpstreamClient::new(upstream, connector, &settings);
    let app = AppContext::new(settings, backend, client);
    info!(
        address = %local_addr,
        upstream = %app.settings.host,
        bucket = app.naming.fixed.as_deref(),
        "proxy listener started"
    );

    let task = tokio::spawn(accept_loop(listener, acceptor, app, scope, guard));
    Ok(Instance { local_addr, task })
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    app: AppContext,
    scope: Scope,
    guard: PortGuard,
) {
    let local_addr = listener.local_addr().ok();
    let mut connections = JoinSet::new();
    loop {
        let accepted = tokio::select! {
            _ = scope.cancelled() => break,
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                reap(finished);
                continue;
            }
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                error!(error = %err, "failed to accept incoming connection");
                continue;
            }
        };
        debug!(%peer, "accepted connection");
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%peer, error = %err, "failed to set TCP_NODELAY on downstream stream");
        }
        let app = app.clone();
        let scope = scope.clone();
        let acceptor = acceptor.clone();
        connections.spawn(async move {
            if let Err(err) = serve_stream(stream, peer, acceptor, app, scope).await {
                debug!(%peer, error = %err, "connection closed with error");
            }
        });
    }

    drop(listener);
    // Idle connections notice the cancelled scope; requests already in the
    // handler run to completion before storage goes away.
    while let Some(finished) = connections.join_next().await {
        reap(finished);
    }
    let deleted = app.backend.shutdown().await;
    debug!(deleted, "storage teardown finished");
    info!(address = ?local_addr, "proxy listener stopped");
    drop(guard);
}

fn reap(finished: Result<(), JoinError>) {
    if let Err(err) = finished
        && err.is_panic()
    {
        warn!(error = %err, "connection task panicked");
    }
}

async fn serve_stream(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    app: AppContext,
    scope: Scope,
) -> Result<()> {
    match acceptor {
        None => handle_connection(stream, peer, app, scope).await,
        Some(acceptor) => {
            let tls = timeout_with_context(
                app.settings.client_timeout(),
                acceptor.accept(stream),
                format!("TLS handshake with {peer}"),
            )
            .await?;
            handle_connection(tls, peer, app, scope).await
        }
    }
}

async fn handle_connection<S>(stream: S, peer: SocketAddr, app: AppContext, scope: Scope) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let limits = app.client_limits();
    let mut reader = BufReader::new(stream);
    loop {
        let request = tokio::select! {
            _ = scope.cancelled() => break,
            request = codec::read_request(&mut reader, peer, &limits) => request,
        };
        let request = match request {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(err) => {
                debug!(%peer, error = %err, "rejecting malformed request");
                let (headers, body) = codec::text_response(StatusCode::BAD_REQUEST, "bad request");
                let mut head = codec::encode_response(
                    StatusCode::BAD_REQUEST,
                    &headers,
                    BodyPlan::Fixed(body.len()),
                    false,
                );
                head.extend_from_slice(&body);
                let _ = timeout(limits.read_timeout, reader.get_mut().write_all(&head)).await;
                break;
            }
        };

        let started = Instant::now();
        let reply = handler::handle(&app, &request).await;
        let plan = codec::reply_plan(&request.method, reply.status, reply.body.len());
        let mut wire = codec::encode_response(reply.status, &reply.headers, plan, request.keep_alive);
        if let BodyPlan::Fixed(_) = plan {
            wire.extend_from_slice(&reply.body);
        }
        let written = timeout_with_context(
            limits.read_timeout,
            reader.get_mut().write_all(&wire),
            format!("writing response to {peer}"),
        )
        .await;

        let mut log = AccessLogBuilder::new(peer)
            .method(request.method.as_str())
            .path(codec::request_target(&request.uri))
            .cache(reply.outcome)
            .status(reply.status)
            .bytes_out(if written.is_ok() { wire.len() as u64 } else { 0 })
            .elapsed(started.elapsed());
        if let Some(bucket) = reply.bucket {
            log = log.bucket(bucket);
        }
        match (&reply.error, &written) {
            (Some(detail), _) => log = log.error_detail(detail.clone()),
            (None, Err(err)) => log = log.cache(CacheOutcome::Error).error_detail(format!("{err:#}")),
            _ => {}
        }
        log.log();

        written?;
        if !request.keep_alive {
            break;
        }
    }

    let _ = timeout(limits.read_timeout, reader.get_mut().shutdown()).await;
    Ok(())
}
