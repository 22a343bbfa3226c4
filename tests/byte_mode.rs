// End-to-end tests for the byte proxy, driven through the control plane.

use std::net::SocketAddr;
use std::time::Duration;

use fault_proxy::{FaultProxy, ProxyConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

async fn echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

async fn start_proxy() -> FaultProxy {
    start_proxy_with(|_| {}).await
}

async fn start_proxy_with(tweak: impl FnOnce(&mut ProxyConfig)) -> FaultProxy {
    let backend = echo_backend().await;
    let mut config = ProxyConfig::new("127.0.0.1:", "127.0.0.1:0", backend.to_string());
    tweak(&mut config);
    FaultProxy::start(config).await.unwrap()
}

async fn round_trip(client: &mut TcpStream, msg: &[u8]) {
    client.write_all(msg).await.unwrap();
    let mut buf = vec![0u8; msg.len()];
    timeout(Duration::from_secs(2), client.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(buf, msg);
}

/// The peer has closed: EOF or a reset
async fn assert_closed(client: &mut TcpStream, within: Duration) {
    let mut buf = [0u8; 16];
    let read = timeout(within, client.read(&mut buf))
        .await
        .expect("connection was not closed in time");
    assert!(matches!(read, Ok(0) | Err(_)), "unexpected data: {:?}", read);
}

#[tokio::test]
async fn test_scenario_a_ping() {
    let proxy = start_proxy().await;
    let mut client = TcpStream::connect(proxy.proxy_address()).await.unwrap();
    round_trip(&mut client, b"ping").await;
    proxy.close().await;
}

#[tokio::test]
async fn test_scenario_b_freeze_stalls_writes() {
    let proxy = start_proxy().await;
    let control = proxy.client();
    let mut client = TcpStream::connect(proxy.proxy_address()).await.unwrap();
    round_trip(&mut client, b"warm").await;

    control.freeze().await.unwrap();
    client.write_all(b"ping").await.unwrap();

    let mut buf = [0u8; 4];
    assert!(
        timeout(Duration::from_millis(200), client.read_exact(&mut buf))
            .await
            .is_err(),
        "data crossed a frozen proxy"
    );

    control.thaw().await.unwrap();
    timeout(Duration::from_millis(200), client.read_exact(&mut buf))
        .await
        .expect("data not delivered after thaw")
        .unwrap();
    assert_eq!(&buf, b"ping");
    proxy.close().await;
}

#[tokio::test]
async fn test_scenario_c_reject_then_accept() {
    let proxy = start_proxy().await;
    let control = proxy.client();

    control.reject().await.unwrap();
    let mut rejected = TcpStream::connect(proxy.proxy_address()).await.unwrap();
    assert_closed(&mut rejected, Duration::from_secs(1)).await;
    assert_eq!(proxy.metrics().rejected.get(), 1);

    control.accept().await.unwrap();
    let mut client = TcpStream::connect(proxy.proxy_address()).await.unwrap();
    round_trip(&mut client, b"back").await;
    proxy.close().await;
}

#[tokio::test]
async fn test_scenario_d_kill_all() {
    let proxy = start_proxy().await;
    let control = proxy.client();
    let mut client = TcpStream::connect(proxy.proxy_address()).await.unwrap();
    round_trip(&mut client, b"alive").await;

    control.kill_all().await.unwrap();
    // Synchronous: by the time the action returned the table is empty.
    assert_eq!(control.status().await.unwrap().active_sessions, 0);
    assert_closed(&mut client, Duration::from_secs(1)).await;

    // The listener is untouched.
    let mut fresh = TcpStream::connect(proxy.proxy_address()).await.unwrap();
    round_trip(&mut fresh, b"again").await;
    proxy.close().await;
}

#[tokio::test]
async fn test_scenario_e_restart_with_sleep() {
    let proxy = start_proxy().await;
    let control = proxy.client();
    let before = proxy.proxy_address();

    let restart = {
        let control = control.clone();
        tokio::spawn(async move { control.restart(Duration::from_millis(300), false).await })
    };

    // The control plane stays up while the proxy is down.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let status = control.status().await.unwrap();
    assert!(!status.running);

    timeout(Duration::from_secs(5), restart)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let status = control.status().await.unwrap();
    assert!(status.running);
    assert_eq!(status.proxy_address, Some(before.to_string()));

    let mut client = TcpStream::connect(before).await.unwrap();
    round_trip(&mut client, b"restarted").await;
    proxy.close().await;
}

#[tokio::test]
async fn test_forceful_restart_severs_sessions() {
    let proxy = start_proxy().await;
    let control = proxy.client();
    let mut client = TcpStream::connect(proxy.proxy_address()).await.unwrap();
    round_trip(&mut client, b"old").await;

    control.restart(Duration::ZERO, true).await.unwrap();
    assert_closed(&mut client, Duration::from_secs(1)).await;

    let mut fresh = TcpStream::connect(proxy.proxy_address()).await.unwrap();
    round_trip(&mut fresh, b"new").await;
    proxy.close().await;
}

#[tokio::test]
async fn test_stop_and_start() {
    let proxy = start_proxy().await;
    let control = proxy.client();

    control.stop().await.unwrap();
    let err = control.stop().await.unwrap_err();
    assert!(err.to_string().contains("already stopped"), "{}", err);
    assert!(TcpStream::connect(proxy.proxy_address()).await.is_err());

    control.start().await.unwrap();
    let err = control.start().await.unwrap_err();
    assert!(err.to_string().contains("already started"), "{}", err);

    let mut client = TcpStream::connect(proxy.proxy_address()).await.unwrap();
    round_trip(&mut client, b"up").await;
    proxy.close().await;
}

#[tokio::test]
async fn test_gate_actions_are_idempotent() {
    let proxy = start_proxy().await;
    let control = proxy.client();

    control.freeze().await.unwrap();
    control.freeze().await.unwrap();
    control.thaw().await.unwrap();
    control.accept().await.unwrap();
    control.accept().await.unwrap();

    let mut client = TcpStream::connect(proxy.proxy_address()).await.unwrap();
    round_trip(&mut client, b"ok").await;
    proxy.close().await;
}

#[tokio::test]
async fn test_thaw_unblocks_graceful_restart() {
    let proxy = start_proxy().await;
    let control = proxy.client();
    let mut client = TcpStream::connect(proxy.proxy_address()).await.unwrap();
    round_trip(&mut client, b"x").await;

    // Data read while frozen is held at the gate, so the session cannot end
    // on its own even after the client hangs up.
    control.freeze().await.unwrap();
    client.write_all(b"stuck").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(client);

    let restart = {
        let control = control.clone();
        tokio::spawn(async move { control.restart(Duration::ZERO, false).await })
    };

    // Graceful restart waits for the session; gate actions still get through.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!restart.is_finished());
    control.thaw().await.unwrap();

    timeout(Duration::from_secs(5), restart)
        .await
        .expect("restart did not finish after the session drained")
        .unwrap()
        .unwrap();
    proxy.close().await;
}

#[tokio::test]
async fn test_restart_survives_client_timeout() {
    let proxy = start_proxy().await;
    let impatient = proxy
        .client()
        .with_timeout(Duration::from_millis(200))
        .unwrap();

    // The client gives up long before the sleep is over.
    assert!(impatient.restart(Duration::from_millis(800), true).await.is_err());

    tokio::time::sleep(Duration::from_secs(2)).await;
    let status = proxy.client().status().await.unwrap();
    assert!(status.running, "restart was abandoned with its request");
    assert_eq!(proxy.controller().exit_reason(), None);

    let mut client = TcpStream::connect(proxy.proxy_address()).await.unwrap();
    round_trip(&mut client, b"back").await;
    proxy.close().await;
}

#[tokio::test]
async fn test_kill_all_during_graceful_restart() {
    let proxy = start_proxy().await;
    let control = proxy.client();
    let mut idle = TcpStream::connect(proxy.proxy_address()).await.unwrap();
    round_trip(&mut idle, b"idle").await;

    let restart = {
        let control = control.clone();
        tokio::spawn(async move { control.restart(Duration::ZERO, false).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!restart.is_finished());

    timeout(Duration::from_secs(2), control.kill_all())
        .await
        .expect("kill-all waited behind the restart")
        .unwrap();
    timeout(Duration::from_secs(2), restart)
        .await
        .expect("restart did not finish once sessions were killed")
        .unwrap()
        .unwrap();
    assert_closed(&mut idle, Duration::from_secs(1)).await;

    let mut fresh = TcpStream::connect(proxy.proxy_address()).await.unwrap();
    round_trip(&mut fresh, b"fresh").await;
    proxy.close().await;
}

#[tokio::test]
async fn test_graceful_restart_is_bounded_by_grace() {
    let proxy = start_proxy_with(|config| config.proxy.shutdown_grace_secs = 1).await;
    let control = proxy.client();
    let mut idle = TcpStream::connect(proxy.proxy_address()).await.unwrap();
    round_trip(&mut idle, b"idle").await;

    timeout(Duration::from_secs(4), control.restart(Duration::ZERO, false))
        .await
        .expect("an idle client held up the restart")
        .unwrap();
    assert_closed(&mut idle, Duration::from_secs(1)).await;
    assert!(control.status().await.unwrap().running);
    proxy.close().await;
}

#[tokio::test]
async fn test_quit_signals_exit() {
    let proxy = start_proxy().await;
    proxy.client().quit().await.unwrap();
    timeout(Duration::from_secs(1), proxy.wait_exit())
        .await
        .expect("quit did not signal exit");
    proxy.shutdown(Duration::from_secs(1)).await;
    assert!(TcpStream::connect(proxy.control_address()).await.is_err());
}
