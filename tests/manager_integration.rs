mod support;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use tokio::time::{sleep, timeout};

use cacheproxy::{
    manager::Manager,
    scope::Scope,
    storage::bucket::BucketDb,
};

use support::*;

fn local(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

#[tokio::test]
async fn run_srv_serves_the_requested_bucket() -> Result<()> {
    let upstream = CountingUpstream::ok("beer list").await?;
    let dirs = TestDirs::new()?;
    let port = find_free_port()?;
    let manager = Manager::new(port, port, test_settings(upstream.addr(), &dirs.store_dir));

    let scope = Scope::new();
    let served = manager.run_srv(&scope, "beer").await?;
    assert_eq!(served, port);
    wait_for_listener(local(port)).await?;

    let response = send_raw(
        local(port),
        b"GET /beer HTTP/1.1\r\nHost: proxy.test\r\nConnection: close\r\n\r\n",
    )
    .await?;
    assert_eq!(response.body_text(), "beer list");
    assert!(dirs.bucket_file("beer").exists());

    scope.cancel();
    Ok(())
}

#[tokio::test]
async fn run_srv_rotates_through_the_range() -> Result<()> {
    let upstream = CountingUpstream::ok("rotated").await?;
    let dirs = TestDirs::new()?;
    let from = find_free_port_pair()?;
    let manager = Manager::new(from, from + 1, test_settings(upstream.addr(), &dirs.store_dir));
    assert_eq!(manager.ports(), &[from, from + 1]);

    let scope = Scope::new();
    let first = manager.run_srv(&scope, "beer").await?;
    let second = manager.run_srv(&scope, "beer").await?;
    assert_eq!((first, second), (from, from + 1));

    for port in [first, second] {
        wait_for_listener(local(port)).await?;
        let response = send_raw(
            local(port),
            b"GET /rotate HTTP/1.1\r\nHost: proxy.test\r\nConnection: close\r\n\r\n",
        )
        .await?;
        assert_eq!(response.body_text(), "rotated");
    }
    assert!(upstream.hits() >= 1);

    scope.cancel();
    Ok(())
}

#[tokio::test]
async fn single_port_manager_waits_for_previous_instance() -> Result<()> {
    let upstream = CountingUpstream::ok("first").await?;
    let dirs = TestDirs::new()?;
    let port = find_free_port()?;
    let manager = Arc::new(Manager::new(
        port,
        port,
        test_settings(upstream.addr(), &dirs.store_dir),
    ));

    let first_scope = Scope::new();
    assert_eq!(manager.run_srv(&first_scope, "a").await?, port);
    assert!(manager.locks().is_held(port));

    let second_scope = Scope::new();
    let pending = {
        let manager = manager.clone();
        let scope = second_scope.clone();
        tokio::spawn(async move { manager.run_srv(&scope, "b").await })
    };
    sleep(StdDuration::from_millis(200)).await;
    assert!(!pending.is_finished(), "second instance started on a held port");

    first_scope.cancel();
    let second = timeout(StdDuration::from_secs(5), pending).await???;
    assert_eq!(second, port);
    wait_for_listener(local(port)).await?;

    let response = send_raw(
        local(port),
        b"GET /b HTTP/1.1\r\nHost: proxy.test\r\nConnection: close\r\n\r\n",
    )
    .await?;
    assert_eq!(response.status, 200);
    assert!(dirs.bucket_file("b").exists());

    second_scope.cancel();
    Ok(())
}

#[tokio::test]
async fn bind_failure_releases_the_port_lock() -> Result<()> {
    let upstream = CountingUpstream::ok("unused").await?;
    let dirs = TestDirs::new()?;
    let occupied = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    let port = occupied.local_addr()?.port();
    let manager = Manager::new(port, port, test_settings(upstream.addr(), &dirs.store_dir));

    let scope = Scope::new();
    assert!(manager.run_srv(&scope, "busy").await.is_err());
    assert!(!manager.locks().is_held(port));

    drop(occupied);
    assert_eq!(manager.run_srv(&scope, "busy").await?, port);
    scope.cancel();
    Ok(())
}

#[tokio::test]
async fn set_prototype_applies_to_later_instances() -> Result<()> {
    let old = CountingUpstream::ok("old").await?;
    let new = CountingUpstream::ok("new").await?;
    let dirs = TestDirs::new()?;
    let port = find_free_port()?;
    let manager = Manager::new(port, port, test_settings(old.addr(), &dirs.store_dir));

    manager.set_prototype(test_settings(new.addr(), &dirs.store_dir));
    let scope = Scope::new();
    let instance = manager.start(&scope, "swap").await?;
    wait_for_listener(local(port)).await?;

    let response = send_raw(
        local(port),
        b"GET / HTTP/1.1\r\nHost: proxy.test\r\nConnection: close\r\n\r\n",
    )
    .await?;
    assert_eq!(response.body_text(), "new");
    assert_eq!(old.hits(), 0);

    scope.cancel();
    instance.stopped().await;
    assert!(!manager.locks().is_held(port));
    Ok(())
}

#[tokio::test]
async fn session_mode_drops_unrequested_records_on_shutdown() -> Result<()> {
    let upstream = CountingUpstream::ok("fresh").await?;
    let dirs = TestDirs::new()?;
    {
        let (db, created) = BucketDb::open_or_create(&dirs.bucket_file("recordings"))?;
        assert!(created);
        db.upsert("stale-a", b"old")?;
        db.upsert("stale-b", b"old")?;
        db.close()?;
    }

    let proxy = ProxyHarness::spawn_in(dirs, upstream.addr(), |settings| {
        settings.session_mode = true;
    })
    .await?;
    proxy.get("/fresh").await?;
    proxy.get("/fresh").await?;
    assert_eq!(upstream.hits(), 1);

    let dirs = proxy.shutdown().await;
    let db = BucketDb::open_existing(&dirs.bucket_file("recordings"))?;
    let ids = db.ids()?;
    db.close()?;
    assert_eq!(ids.len(), 1, "{ids:?}");
    assert!(!ids.iter().any(|id| id.starts_with("stale")));
    Ok(())
}
