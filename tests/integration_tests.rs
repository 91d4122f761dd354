//! End-to-end scenarios: a defender wired with real sources, driven
//! through the middleware entry points and the admin API over a live
//! listener.

use std::fs;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::time::timeout;

use netdefender::config::ResponderConfig;
use netdefender::responders::tarpit::{ContentConfig, TarpitConfig};
use netdefender::{admin, Decision, Defender, DefenderConfig};

fn base_config() -> DefenderConfig {
    DefenderConfig {
        ranges: vec!["10.0.0.0/8".to_string()],
        blocklist_file: None,
        whitelist: Vec::new(),
        dynamic_blocklist: true,
        persist_dynamic_to: None,
        responder: ResponderConfig::Block,
    }
}

#[tokio::test]
async fn static_ranges_divert_and_forward() -> Result<()> {
    let defender = Defender::new(base_config()).await?;

    assert_eq!(defender.decide("10.1.2.3:5000"), Decision::Divert);
    assert_eq!(defender.decide("11.0.0.1:5000"), Decision::Forward);
    Ok(())
}

#[tokio::test]
async fn watched_file_updates_rules_within_bounded_delay() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("blocklist.txt");
    fs::write(&path, "192.168.1.1\n")?;

    let mut config = base_config();
    config.ranges.clear();
    config.blocklist_file = Some(path.clone());
    let defender = Defender::new(config).await?;

    assert_eq!(defender.decide("192.168.1.1:1"), Decision::Divert);
    assert_eq!(defender.decide("172.16.5.5:1"), Decision::Forward);

    // Operator appends a range; the watcher must pick it up.
    fs::write(&path, "192.168.1.1\n172.16.0.0/12\n")?;

    timeout(Duration::from_secs(2), async {
        loop {
            if defender.decide("172.16.5.5:1") == Decision::Divert {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("file change not applied within 2s");

    assert_eq!(defender.decide("192.168.1.1:1"), Decision::Divert);
    defender.close();
    Ok(())
}

#[tokio::test]
async fn dynamic_persistence_survives_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("dynamic.txt");

    {
        let mut config = base_config();
        config.persist_dynamic_to = Some(path.clone());
        let defender = Defender::new(config).await?;
        let dynamic = defender.dynamic_blocklist().unwrap();
        dynamic.add(&["203.0.113.0/24"])?;
        defender.composer().on_source_change();
        assert_eq!(defender.decide("203.0.113.10:1"), Decision::Divert);
    }

    // A fresh instance pointed at the same file picks the entry back up.
    let mut config = base_config();
    config.persist_dynamic_to = Some(path);
    let defender = Defender::new(config).await?;
    assert_eq!(defender.decide("203.0.113.10:1"), Decision::Divert);
    Ok(())
}

/// Serve the admin API on an ephemeral port and drive it with a real
/// HTTP client.
async fn spawn_admin(defender: Arc<Defender>) -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        loop {
            let Ok((stream, _peer)) = listener.accept().await else {
                return;
            };
            let io = TokioIo::new(stream);
            let defender = Arc::clone(&defender);
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let defender = Arc::clone(&defender);
                    async move {
                        Ok::<_, std::convert::Infallible>(
                            admin::handle_admin(req, &defender).await,
                        )
                    }
                });
                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });

    Ok(addr)
}

async fn admin_request(
    addr: SocketAddr,
    method: Method,
    path: &str,
    body: &str,
) -> Result<(StatusCode, serde_json::Value)> {
    let stream = tokio::net::TcpStream::connect(addr).await?;
    let io = TokioIo::new(stream);
    let (mut sender, connection) = hyper::client::conn::http1::handshake(io).await?;
    tokio::spawn(connection);

    let request = Request::builder()
        .method(method)
        .uri(path)
        .header("Host", addr.to_string())
        .body(Full::new(Bytes::from(body.to_string())))?;
    let response = sender.send_request(request).await?;
    let status = response.status();
    let bytes = response.into_body().collect().await?.to_bytes();
    let value = serde_json::from_slice(&bytes)?;
    Ok((status, value))
}

#[tokio::test]
async fn admin_api_over_the_wire() -> Result<()> {
    let defender = Defender::new(base_config()).await?;
    let addr = spawn_admin(Arc::clone(&defender)).await?;

    // POST a new CIDR.
    let (status, body) = admin_request(
        addr,
        Method::POST,
        "/defender/blocklist",
        r#"{"ips": ["203.0.113.0/24"]}"#,
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["count"], 1);

    // It shows up in GET and in request handling.
    let (status, body) = admin_request(addr, Method::GET, "/defender/blocklist", "").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sources"]["dynamic"], 1);
    assert_eq!(defender.decide("203.0.113.10:1"), Decision::Divert);

    // Adding the same CIDR twice changes nothing.
    let (status, _) = admin_request(
        addr,
        Method::POST,
        "/defender/blocklist",
        r#"{"ips": ["203.0.113.0/24"]}"#,
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED);
    let (_, body) = admin_request(addr, Method::GET, "/defender/blocklist", "").await?;
    assert_eq!(body["sources"]["dynamic"], 1);

    // Bare IPs are rejected.
    let (status, _) = admin_request(
        addr,
        Method::POST,
        "/defender/blocklist",
        r#"{"ips": ["10.0.0.1"]}"#,
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Unknown deletes 404.
    let (status, _) = admin_request(
        addr,
        Method::DELETE,
        "/defender/blocklist/nonexistent/32",
        "",
    )
    .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Stats reflect all sources.
    let (status, body) = admin_request(addr, Method::GET, "/defender/stats", "").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["counts"]["configured_ranges"], 1);
    assert_eq!(body["counts"]["dynamic_ranges"], 1);
    assert_eq!(body["counts"]["total"], 2);

    // Delete and verify the address is allowed again.
    let (status, body) = admin_request(
        addr,
        Method::DELETE,
        "/defender/blocklist/203.0.113.0/24",
        "",
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed"], "203.0.113.0/24");
    assert_eq!(defender.decide("203.0.113.10:1"), Decision::Forward);

    Ok(())
}

#[tokio::test]
async fn tarpit_paces_blocked_clients() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let content = dir.path().join("bait.bin");
    fs::write(&content, vec![b'z'; 10 * 1024])?;

    let mut config = base_config();
    config.responder = ResponderConfig::Tarpit(TarpitConfig {
        content: ContentConfig {
            protocol: "file".to_string(),
            path: content.to_string_lossy().into_owned(),
        },
        bytes_per_second: 100,
        timeout_ms: 500,
        ..TarpitConfig::default()
    });
    let defender = Defender::new(config).await?;

    let req = Request::builder().body(String::new())?;
    let started = std::time::Instant::now();
    let response = defender
        .handle(req, "10.1.2.3:5000", |_req| async {
            panic!("blocked client must not reach the next handler")
        })
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await?.to_bytes();
    let elapsed = started.elapsed();

    assert!(
        (20..=80).contains(&body.len()),
        "expected a slow drip of 20..=80 bytes, got {}",
        body.len()
    );
    assert!(elapsed >= Duration::from_millis(400));
    Ok(())
}

#[tokio::test]
async fn named_bundle_expands_into_rules() -> Result<()> {
    let mut config = base_config();
    config.ranges = vec!["private".to_string()];
    let defender = Defender::new(config).await?;

    assert_eq!(defender.decide("192.168.0.42:9"), Decision::Divert);
    assert_eq!(defender.decide("127.0.0.1:9"), Decision::Divert);
    assert_eq!(defender.decide("8.8.8.8:9"), Decision::Forward);
    Ok(())
}
