use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use http::Uri;
use http::uri::{Authority, Scheme};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, lookup_host};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::debug;

use crate::error::{CacheError, CacheResult};
use crate::settings::Settings;
use crate::util::timeout_with_context;

use super::codec::{self, InboundRequest, Limits, UpstreamResponse};

/// The origin every proxied request is rewritten to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub tls: bool,
    /// `host[:port]` exactly as configured, used for `Host`.
    pub authority: String,
    pub host: String,
    pub port: u16,
}

impl Upstream {
    pub fn parse(url: &str) -> CacheResult<Self> {
        let uri: Uri = url
            .parse()
            .map_err(|err| CacheError::Config(format!("invalid upstream host '{url}': {err}")))?;
        let tls = match uri.scheme_str() {
            Some("http") => false,
            Some("https") => true,
            Some(other) => {
                return Err(CacheError::Config(format!(
                    "unsupported upstream scheme '{other}' in '{url}'"
                )));
            }
            None => {
                return Err(CacheError::Config(format!(
                    "upstream host '{url}' must include http:// or https://"
                )));
            }
        };
        let authority = uri
            .authority()
            .ok_or_else(|| CacheError::Config(format!("upstream host '{url}' has no authority")))?;
        let host = authority.host().trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(CacheError::Config(format!(
                "upstream host '{url}' has an empty host name"
            )));
        }
        let port = authority.port_u16().unwrap_or(if tls { 443 } else { 80 });
        let authority = match authority.port() {
            Some(port) => format!("{}:{}", authority.host(), port),
            None => authority.host().to_string(),
        };
        Ok(Self {
            tls,
            authority,
            host: host.to_string(),
            port,
        })
    }

    /// Points `inbound` at this upstream, keeping path, query and any
    /// inbound user info.
    pub fn rewrite(&self, inbound: &Uri) -> CacheResult<Uri> {
        let scheme = if self.tls { Scheme::HTTPS } else { Scheme::HTTP };
        let authority = match inbound
            .authority()
            .and_then(|a| a.as_str().rsplit_once('@').map(|(user, _)| user))
        {
            Some(user_info) => format!("{user_info}@{}", self.authority),
            None => self.authority.clone(),
        };
        let authority: Authority = authority
            .parse()
            .map_err(|err| CacheError::Upstream(format!("invalid rewritten authority: {err}")))?;
        Uri::builder()
            .scheme(scheme)
            .authority(authority)
            .path_and_query(codec::request_target(inbound))
            .build()
            .map_err(|err| CacheError::Upstream(format!("invalid rewritten url: {err}")))
    }
}

pub(crate) enum UpstreamIo {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Unpin for UpstreamIo {}

impl AsyncRead for UpstreamIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_flush(cx),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Which step of the round trip failed, used as a metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Connect,
    Tls,
    Io,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Connect => "connect",
            FailureKind::Tls => "tls",
            FailureKind::Io => "io",
        }
    }
}

#[derive(Debug)]
pub struct UpstreamFailure {
    pub kind: FailureKind,
    pub error: anyhow::Error,
}

impl std::fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#}", self.error)
    }
}

/// One-shot HTTP/1.1 client: every request uses a fresh connection.
pub struct UpstreamClient {
    upstream: Upstream,
    connector: Option<TlsConnector>,
    connect_timeout: Duration,
    limits: Limits,
}

impl UpstreamClient {
    pub fn new(upstream: Upstream, connector: Option<TlsConnector>, settings: &Settings) -> Self {
        let io_timeout = settings.upstream_timeout();
        Self {
            upstream,
            connector,
            connect_timeout: settings.upstream_connect_timeout(),
            limits: Limits {
                idle_timeout: io_timeout,
                read_timeout: io_timeout,
                max_header_bytes: settings.max_header_size,
                max_body_bytes: settings.max_body_size,
            },
        }
    }

    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    pub async fn send(
        &self,
        request: &InboundRequest,
    ) -> std::result::Result<UpstreamResponse, UpstreamFailure> {
        let (stream, peer) = self.connect().await.map_err(|error| UpstreamFailure {
            kind: FailureKind::Connect,
            error,
        })?;
        let mut io = match (&self.connector, self.upstream.tls) {
            (Some(connector), true) => {
                let tls = self
                    .handshake(connector, stream)
                    .await
                    .map_err(|error| UpstreamFailure {
                        kind: FailureKind::Tls,
                        error,
                    })?;
                UpstreamIo::Tls(Box::new(tls))
            }
            (None, true) => {
                return Err(UpstreamFailure {
                    kind: FailureKind::Tls,
                    error: anyhow!("no TLS connector configured for https upstream"),
                });
            }
            (_, false) => UpstreamIo::Plain(stream),
        };

        self.exchange(&mut io, request, peer)
            .await
            .map_err(|error| UpstreamFailure {
                kind: FailureKind::Io,
                error,
            })
    }

    async fn exchange(
        &self,
        io: &mut UpstreamIo,
        request: &InboundRequest,
        peer: SocketAddr,
    ) -> Result<UpstreamResponse> {
        let wire = codec::encode_upstream_request(
            request,
            codec::request_target(&request.uri),
            &self.upstream.authority,
        );
        timeout_with_context(
            self.limits.read_timeout,
            io.write_all(&wire),
            format!("writing request to upstream {peer}"),
        )
        .await?;
        timeout_with_context(
            self.limits.read_timeout,
            io.flush(),
            format!("flushing request to upstream {peer}"),
        )
        .await?;

        let mut reader = BufReader::new(io);
        let response =
            codec::read_response(&mut reader, &request.method, peer, &self.limits).await?;
        let _ = timeout(Duration::from_secs(1), reader.get_mut().shutdown()).await;
        Ok(response)
    }

    async fn connect(&self) -> Result<(TcpStream, SocketAddr)> {
        let target = (self.upstream.host.as_str(), self.upstream.port);
        let addrs: Vec<SocketAddr> = timeout_with_context(
            self.connect_timeout,
            lookup_host(target),
            format!("resolving upstream {}", self.upstream.host),
        )
        .await?
        .collect();

        let mut last_err: Option<anyhow::Error> = None;
        for addr in addrs {
            match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    stream
                        .set_nodelay(true)
                        .with_context(|| format!("failed to set TCP_NODELAY for {addr}"))?;
                    return Ok((stream, addr));
                }
                Ok(Err(err)) => {
                    debug!(%addr, error = %err, "upstream connect attempt failed");
                    last_err = Some(anyhow!(err).context(format!("connecting to {addr}")));
                }
                Err(_) => {
                    last_err = Some(anyhow!("timed out connecting to {addr}"));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            anyhow!("no addresses resolved for upstream {}", self.upstream.host)
        }))
    }

    async fn handshake(
        &self,
        connector: &TlsConnector,
        stream: TcpStream,
    ) -> Result<TlsStream<TcpStream>> {
        let server_name = ServerName::try_from(self.upstream.host.clone())
            .map_err(|_| anyhow!("invalid TLS server name '{}'", self.upstream.host))?;
        timeout_with_context(
            self.connect_timeout,
            connector.connect(server_name, stream),
            format!("TLS handshake with upstream {}", self.upstream.host),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_upstream_defaults() {
        let plain = Upstream::parse("http://search.local").unwrap();
        assert!(!plain.tls);
        assert_eq!(plain.port, 80);
        assert_eq!(plain.authority, "search.local");

        let tls = Upstream::parse("https://127.0.0.1:9443/ignored").unwrap();
        assert!(tls.tls);
        assert_eq!(tls.port, 9443);
        assert_eq!(tls.authority, "127.0.0.1:9443");

        let v6 = Upstream::parse("http://[::1]:8080").unwrap();
        assert_eq!(v6.host, "::1");
        assert_eq!(v6.authority, "[::1]:8080");
    }

    #[test]
    fn rejects_unusable_upstreams() {
        assert!(Upstream::parse("").is_err());
        assert!(Upstream::parse("search.local:9200").is_err());
        assert!(Upstream::parse("ftp://search.local").is_err());
    }

    #[test]
    fn rewrite_keeps_path_and_query() {
        let upstream = Upstream::parse("http://127.0.0.1:20200").unwrap();
        let inbound: Uri = "/home.php?a=1".parse().unwrap();
        let rewritten = upstream.rewrite(&inbound).unwrap();
        assert_eq!(rewritten.to_string(), "http://127.0.0.1:20200/home.php?a=1");

        let absolute: Uri = "http://user:pw@proxy.local/x".parse().unwrap();
        let rewritten = upstream.rewrite(&absolute).unwrap();
        assert_eq!(rewritten.to_string(), "http://user:pw@127.0.0.1:20200/x");
    }

    #[tokio::test]
    async fn connect_failure_is_classified() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let settings = Settings::new(format!("http://127.0.0.1:{port}"), "store");
        let client = UpstreamClient::new(settings.upstream().unwrap(), None, &settings);
        let request = InboundRequest {
            method: http::Method::GET,
            uri: "/".parse().unwrap(),
            version: http::Version::HTTP_11,
            headers: http::HeaderMap::new(),
            body: Vec::new(),
            keep_alive: true,
        };
        let failure = client.send(&request).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Connect);
    }
}
