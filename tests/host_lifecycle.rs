//! Host start, readiness, discovery and close.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use std::time::Duration;

use tokio::io::AsyncWriteExt;

use common::{
    config, factories, free_port, https_client, port_is_free, self_signed, start_host, tcp_addr,
    TestService,
};
use trust_host::discovery::{Discovery, Registry};
use trust_host::host::{Collaborators, Host, HostError, ServiceFactories};
use trust_host::net::ListenerError;

#[tokio::test]
async fn duplicate_urls_share_one_socket() {
    let port = free_port();
    let url = format!("http://127.0.0.1:{port}");
    let host = start_host(config(&[&url, &url]), TestService::new(true)).await;

    assert_eq!(host.local_addrs().len(), 1);
    assert_eq!(tcp_addr(&host).port(), port);
    host.close().await;
}

#[tokio::test]
async fn distinct_addresses_get_their_own_socket() {
    let (tls, dir) = self_signed();
    let (p1, p2) = (free_port(), free_port());
    let mut cfg = config(&[
        &format!("http://127.0.0.1:{p1}"),
        &format!("https://127.0.0.1:{p2}"),
    ]);
    cfg.server_tls = Some(tls);

    let host = start_host(cfg, TestService::new(true)).await;
    assert_eq!(host.local_addrs().len(), 2);
    host.close().await;
    assert!(port_is_free(p1));
    assert!(port_is_free(p2));
    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn secure_url_without_tls_opens_no_socket() {
    let plain = free_port();
    let secure = free_port();
    let cfg = config(&[
        &format!("http://127.0.0.1:{plain}"),
        &format!("https://127.0.0.1:{secure}"),
    ]);

    let err = Host::start("test", cfg, Collaborators::new(), &factories(TestService::new(true)))
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::Listener(ListenerError::TlsRequired(_))));
    assert!(port_is_free(plain));
    assert!(port_is_free(secure));
}

#[tokio::test]
async fn readiness_follows_services() {
    let service = TestService::new(false);
    let host = start_host(config(&["http://127.0.0.1:0"]), Arc::clone(&service)).await;
    let url = format!("http://{}/v1/echo", tcp_addr(&host));

    assert!(!host.is_ready());
    let res = reqwest::get(&url).await.unwrap();
    assert_eq!(res.status(), 503);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["code"], "not_ready");

    service.set_ready(true);
    assert!(host.is_ready());
    let res = reqwest::get(&url).await.unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "ok");

    host.close().await;
}

#[tokio::test]
async fn host_without_services_is_ready() {
    let mut cfg = config(&["http://127.0.0.1:0"]);
    cfg.services.clear();
    let host = Host::start("empty", cfg, Collaborators::new(), &ServiceFactories::new())
        .await
        .unwrap();
    assert!(host.is_ready());
    assert!(host.service("test").is_none());
    host.close().await;
}

#[tokio::test]
async fn close_is_idempotent_and_closes_services_once() {
    let service = TestService::new(true);
    let host = start_host(config(&["http://127.0.0.1:0"]), Arc::clone(&service)).await;
    let port = tcp_addr(&host).port();

    host.close().await;
    host.close().await;

    assert_eq!(service.closed.load(Ordering::SeqCst), 1);
    assert!(port_is_free(port));
}

#[tokio::test]
async fn services_are_published_to_discovery() {
    let registry = Arc::new(Registry::new());
    let collaborators = Collaborators::new().with_discovery(registry.clone() as Arc<dyn Discovery>);

    let host = Host::start(
        "wfe",
        config(&["http://127.0.0.1:0"]),
        collaborators.clone(),
        &factories(TestService::new(true)),
    )
    .await
    .unwrap();
    assert!(registry.get("wfe", "test").is_some());
    assert!(registry.find_as::<TestService>(|s| s.ready.load(Ordering::SeqCst)));

    // Same host name again: publishing fails and the new host rolls back.
    let port = free_port();
    let err = Host::start(
        "wfe",
        config(&[&format!("http://127.0.0.1:{port}")]),
        collaborators,
        &factories(TestService::new(true)),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, HostError::Discovery(_)));
    assert!(port_is_free(port));

    host.close().await;
}

#[tokio::test]
async fn error_channel_is_handed_out_once() {
    let host = start_host(config(&["http://127.0.0.1:0"]), TestService::new(true)).await;
    assert!(host.take_errors().is_some());
    assert!(host.take_errors().is_none());
    host.close().await;
}

#[tokio::test]
async fn transport_failures_reach_the_error_channel() {
    let (tls, dir) = self_signed();
    let mut cfg = config(&["https://127.0.0.1:0"]);
    cfg.server_tls = Some(tls);
    let host = start_host(cfg, TestService::new(true)).await;
    let addr = tcp_addr(&host);
    let mut errors = host.take_errors().unwrap();

    // Plaintext on a TLS-only socket fails the handshake.
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();

    let err = tokio::time::timeout(Duration::from_secs(5), errors.recv())
        .await
        .expect("no error reported")
        .expect("channel closed");
    assert!(matches!(err, HostError::Connection { .. }), "{err}");

    // The host keeps serving.
    let res = https_client()
        .get(format!("https://{addr}/v1/echo"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);

    host.close().await;
    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn metadata_is_exposed() {
    let host = start_host(config(&["127.0.0.1:0"]), TestService::new(true)).await;
    assert_eq!(host.name(), "test");
    assert_eq!(host.listen_urls(), ["127.0.0.1:0"]);
    assert!(!host.hostname().is_empty());
    assert!(host.started_at() <= std::time::SystemTime::now());
    host.close().await;
}
