#![allow(dead_code)]

pub mod http_utils;
pub mod upstream;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use anyhow::{Result, anyhow};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use cacheproxy::{
    cli::LogFormat,
    manager::lock::PortLocks,
    proxy::listener::{self, Instance},
    scope::Scope,
    settings::Settings,
};

pub use http_utils::*;
pub use upstream::*;

pub struct TestDirs {
    _temp: TempDir,
    pub store_dir: PathBuf,
}

impl TestDirs {
    pub fn new() -> Result<Self> {
        let temp = TempDir::new()?;
        let store_dir = temp.path().join("store");
        Ok(Self {
            _temp: temp,
            store_dir,
        })
    }

    pub fn bucket_file(&self, bucket: &str) -> PathBuf {
        self.store_dir.join(format!("{bucket}.db"))
    }
}

pub fn test_settings(upstream: SocketAddr, store_dir: &Path) -> Settings {
    let mut settings = Settings::new(format!("http://{upstream}"), store_dir);
    settings.port = 0;
    settings.file_name = Some("recordings".to_string());
    settings.log = LogFormat::Text;
    settings.client_timeout = 5;
    settings.upstream_connect_timeout = 2;
    settings.upstream_timeout = 5;
    settings
}

pub fn find_free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// Two adjacent ports that are both free right now.
pub fn find_free_port_pair() -> Result<u16> {
    for _ in 0..50 {
        let first = find_free_port()?;
        let Some(second) = first.checked_add(1) else {
            continue;
        };
        if std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, second)).is_ok() {
            return Ok(first);
        }
    }
    Err(anyhow!("no adjacent free ports found"))
}

pub async fn wait_for_listener(addr: SocketAddr) -> Result<()> {
    for _ in 0..50 {
        match timeout(StdDuration::from_millis(50), TcpStream::connect(addr)).await {
            Ok(Ok(mut stream)) => {
                stream.shutdown().await.ok();
                return Ok(());
            }
            _ => sleep(StdDuration::from_millis(50)).await,
        }
    }
    Err(anyhow!("listener {addr} did not become ready"))
}

pub struct ProxyHarness {
    pub dirs: TestDirs,
    pub addr: SocketAddr,
    pub scope: Scope,
    instance: Instance,
}

impl ProxyHarness {
    pub async fn spawn(upstream: SocketAddr) -> Result<Self> {
        Self::spawn_with(upstream, |_| {}).await
    }

    pub async fn spawn_with<F>(upstream: SocketAddr, configure: F) -> Result<Self>
    where
        F: FnOnce(&mut Settings),
    {
        Self::spawn_in(TestDirs::new()?, upstream, configure).await
    }

    pub async fn spawn_in<F>(dirs: TestDirs, upstream: SocketAddr, configure: F) -> Result<Self>
    where
        F: FnOnce(&mut Settings),
    {
        let mut settings = test_settings(upstream, &dirs.store_dir);
        configure(&mut settings);
        let scope = Scope::new();
        let locks = PortLocks::new();
        let instance = listener::start_instance(settings, scope.clone(), &locks).await?;
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, instance.port()));
        wait_for_listener(addr).await?;
        Ok(Self {
            dirs,
            addr,
            scope,
            instance,
        })
    }

    pub async fn send(&self, raw: &[u8]) -> Result<RawResponse> {
        send_raw(self.addr, raw).await
    }

    pub async fn get(&self, path: &str) -> Result<RawResponse> {
        let raw = format!("GET {path} HTTP/1.1\r\nHost: proxy.test\r\nConnection: close\r\n\r\n");
        self.send(raw.as_bytes()).await
    }

    pub async fn post(&self, path: &str, body: &str) -> Result<RawResponse> {
        let raw = format!(
            "POST {path} HTTP/1.1\r\nHost: proxy.test\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        self.send(raw.as_bytes()).await
    }

    /// Cancels the instance and waits for storage teardown.
    pub async fn shutdown(self) -> TestDirs {
        self.scope.cancel();
        self.instance.stopped().await;
        self.dirs
    }
}
