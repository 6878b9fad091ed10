use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration as StdDuration;

use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::sleep;

#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub head: String,
    pub body: Vec<u8>,
}

impl SeenRequest {
    pub fn request_line(&self) -> &str {
        self.head.lines().next().unwrap_or_default()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then_some(value.trim())
        })
    }
}

/// Upstream answering every request with the same canned response and
/// counting what it receives.
pub struct CountingUpstream {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
    handle: JoinHandle<()>,
}

impl CountingUpstream {
    pub async fn ok(body: &str) -> Result<Self> {
        Self::respond(format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        ))
        .await
    }

    /// Like [`CountingUpstream::ok`], but holds every response back for `delay`.
    pub async fn delayed(body: &str, delay: StdDuration) -> Result<Self> {
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        Self::spawn(Some(Arc::new(response.into_bytes())), delay).await
    }

    /// Echoes the request body back, so different bodies give different records.
    pub async fn echo_body() -> Result<Self> {
        Self::spawn(None, StdDuration::ZERO).await
    }

    pub async fn respond(response: impl Into<Vec<u8>>) -> Result<Self> {
        Self::spawn(Some(Arc::new(response.into())), StdDuration::ZERO).await
    }

    async fn spawn(response: Option<Arc<Vec<u8>>>, delay: StdDuration) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = {
            let hits = hits.clone();
            let seen = seen.clone();
            tokio::spawn(async move {
                loop {
                    let (stream, _) = match listener.accept().await {
                        Ok(conn) => conn,
                        Err(_) => break,
                    };
                    let hits = hits.clone();
                    let seen = seen.clone();
                    let response = response.clone();
                    tokio::spawn(async move {
                        let _ = serve(stream, response, delay, hits, seen).await;
                    });
                }
            })
        };
        Ok(Self {
            addr,
            hits,
            seen,
            handle,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.seen.lock().clone()
    }
}

impl Drop for CountingUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(
    stream: TcpStream,
    response: Option<Arc<Vec<u8>>>,
    delay: StdDuration,
    hits: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let mut head = String::new();
    let mut length = 0usize;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(anyhow!("client closed before request head"));
        }
        if line == "\r\n" {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                length = value.trim().parse()?;
            }
        }
        head.push_str(&line);
    }
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;

    hits.fetch_add(1, Ordering::SeqCst);
    let reply = match response {
        Some(response) => response.as_ref().clone(),
        None => {
            let mut reply = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
                body.len()
            )
            .into_bytes();
            reply.extend_from_slice(&body);
            reply
        }
    };
    seen.lock().push(SeenRequest { head, body });
    if !delay.is_zero() {
        sleep(delay).await;
    }

    let stream = reader.get_mut();
    stream.write_all(&reply).await?;
    stream.shutdown().await.ok();
    Ok(())
}
