//! End-to-end relay tests
//!
//! Each test stands up a throwaway upstream server on an ephemeral port, puts
//! a proxy in front of it, and drives real TCP clients through the proxy.

use reorder_proxy::config::ProxyConfig;
use reorder_proxy::proxy::{ProxyHandle, ReorderProxy};
use reorder_proxy::reorder::{Identity, ReorderPolicy, SwapPattern, WindowReversal};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

/// Upstream server listening on an ephemeral port
async fn upstream_server() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

fn proxy_config(upstream_port: u16) -> ProxyConfig {
    ProxyConfig::new("127.0.0.1", 0, "127.0.0.1", upstream_port)
}

fn start_proxy(upstream_port: u16, policy: Arc<dyn ReorderPolicy>, capacity: usize) -> ProxyHandle {
    let mut config = proxy_config(upstream_port);
    config.buffer_capacity = capacity;
    ReorderProxy::with_policy(config, policy).unwrap().start()
}

/// Connect a client through the proxy and accept its upstream leg
async fn connect_pair(proxy: SocketAddr, upstream: &TcpListener) -> (TcpStream, TcpStream) {
    let client = TcpStream::connect(proxy).await.unwrap();
    let (server, _) = timeout(WAIT, upstream.accept()).await.unwrap().unwrap();
    (client, server)
}

async fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .expect("timed out waiting for relayed bytes")
        .expect("read failed");
    buf
}

/// Read until the peer closes, failing if it never does
async fn read_until_closed(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    // A reset counts as closed too
    let _ = timeout(WAIT, stream.read_to_end(&mut buf))
        .await
        .expect("peer did not close the connection");
    buf
}

async fn wait_for_connections(handle: &ProxyHandle, count: usize) {
    timeout(WAIT, async {
        while handle.snapshot().await.unwrap().connection_count() != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection count never reached");
}

#[tokio::test]
async fn test_window_reversal_end_to_end() {
    let (upstream, port) = upstream_server().await;
    let handle = start_proxy(port, Arc::new(WindowReversal::default()), 16);
    let (mut client, mut server) = connect_pair(handle.local_addr(), &upstream).await;

    client.write_all(b"A\nB\nC\nD\n").await.unwrap();
    handle.wait_for_buffered(4, WAIT).await.unwrap();

    let round = handle.trigger_reorder().await.unwrap();
    assert_eq!(round.connections, 1);
    assert_eq!(round.frames.client_to_server, 4);
    assert_eq!(round.frames.server_to_client, 0);

    assert_eq!(read_exactly(&mut server, 8).await, b"B\nA\nD\nC\n");

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_nothing_is_forwarded_before_trigger() {
    let (upstream, port) = upstream_server().await;
    let handle = start_proxy(port, Arc::new(Identity), 16);
    let (mut client, mut server) = connect_pair(handle.local_addr(), &upstream).await;

    client.write_all(b"hello\n").await.unwrap();
    handle.wait_for_buffered(1, WAIT).await.unwrap();

    let mut buf = [0u8; 16];
    let early = timeout(Duration::from_millis(100), server.read(&mut buf)).await;
    assert!(early.is_err(), "frame was forwarded before release");

    handle.trigger_reorder().await.unwrap();
    assert_eq!(read_exactly(&mut server, 6).await, b"hello\n");

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_directions_are_independent() {
    let (upstream, port) = upstream_server().await;
    let handle = start_proxy(port, Arc::new(WindowReversal::default()), 16);
    let (mut client, mut server) = connect_pair(handle.local_addr(), &upstream).await;

    server.write_all(b"1\n2\n3\n").await.unwrap();
    client.write_all(b"x\ny\n").await.unwrap();
    let snapshot = handle.wait_for_buffered(5, WAIT).await.unwrap();
    assert_eq!(snapshot.buffered.client_to_server, 2);
    assert_eq!(snapshot.buffered.server_to_client, 3);

    let round = handle.trigger_reorder().await.unwrap();
    assert_eq!(round.total_frames(), 5);

    assert_eq!(read_exactly(&mut client, 6).await, b"2\n1\n3\n");
    assert_eq!(read_exactly(&mut server, 4).await, b"y\nx\n");

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_frames_split_across_writes() {
    let (upstream, port) = upstream_server().await;
    let handle = start_proxy(port, Arc::new(WindowReversal::default()), 16);
    let (mut client, mut server) = connect_pair(handle.local_addr(), &upstream).await;

    client.write_all(b"<a/>\n<b/").await.unwrap();
    handle.wait_for_buffered(1, WAIT).await.unwrap();
    client.write_all(b">\n<c").await.unwrap();
    handle.wait_for_buffered(2, WAIT).await.unwrap();

    handle.trigger_reorder().await.unwrap();
    assert_eq!(read_exactly(&mut server, 10).await, b"<b/>\n<a/>\n");

    // The partial frame is held back until its boundary arrives
    client.write_all(b"/>\n").await.unwrap();
    handle.wait_for_buffered(1, WAIT).await.unwrap();
    handle.trigger_reorder().await.unwrap();
    assert_eq!(read_exactly(&mut server, 5).await, b"<c/>\n");

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_full_buffer_applies_backpressure() {
    let (upstream, port) = upstream_server().await;
    let handle = start_proxy(port, Arc::new(WindowReversal::default()), 2);
    let (mut client, mut server) = connect_pair(handle.local_addr(), &upstream).await;

    client.write_all(b"a\nb\nc\nd\ne\n").await.unwrap();
    handle.wait_for_buffered(2, WAIT).await.unwrap();

    // The reader stalls instead of dropping or overwriting frames
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.snapshot().await.unwrap().buffered_frames(), 2);

    handle.trigger_reorder().await.unwrap();
    assert_eq!(read_exactly(&mut server, 4).await, b"b\na\n");

    handle.wait_for_buffered(2, WAIT).await.unwrap();
    handle.trigger_reorder().await.unwrap();
    assert_eq!(read_exactly(&mut server, 4).await, b"d\nc\n");

    handle.wait_for_buffered(1, WAIT).await.unwrap();
    let round = handle.trigger_reorder().await.unwrap();
    assert_eq!(round.frames.client_to_server, 1);
    assert_eq!(read_exactly(&mut server, 2).await, b"e\n");

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_swap_pattern_end_to_end() {
    let (upstream, port) = upstream_server().await;
    let policy = Arc::new(SwapPattern::new(vec![2, 0, 1]).unwrap());
    let handle = start_proxy(port, policy, 16);
    let (mut client, mut server) = connect_pair(handle.local_addr(), &upstream).await;

    client.write_all(b"0\n1\n2\n3\n").await.unwrap();
    handle.wait_for_buffered(4, WAIT).await.unwrap();
    handle.trigger_reorder().await.unwrap();

    // The incomplete trailing block keeps arrival order
    assert_eq!(read_exactly(&mut server, 8).await, b"2\n0\n1\n3\n");

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_close_drops_unreleased_frames() {
    let (upstream, port) = upstream_server().await;
    let handle = start_proxy(port, Arc::new(WindowReversal::default()), 16);
    let (mut client, mut server) = connect_pair(handle.local_addr(), &upstream).await;

    client.write_all(b"A\nB\n").await.unwrap();
    handle.wait_for_buffered(2, WAIT).await.unwrap();
    drop(client);

    assert!(read_until_closed(&mut server).await.is_empty());
    wait_for_connections(&handle, 0).await;
    assert_eq!(handle.snapshot().await.unwrap().buffered_frames(), 0);

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_upstream_unreachable_closes_client() {
    // Grab a free port, then release it so nothing listens there
    let (upstream, port) = upstream_server().await;
    drop(upstream);

    let handle = start_proxy(port, Arc::new(WindowReversal::default()), 16);

    let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
    assert!(read_until_closed(&mut client).await.is_empty());
    wait_for_connections(&handle, 0).await;

    // The listener keeps accepting after a failed relay
    let mut again = TcpStream::connect(handle.local_addr()).await.unwrap();
    assert!(read_until_closed(&mut again).await.is_empty());

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_closes_live_relays() {
    let (upstream, port) = upstream_server().await;
    let handle = start_proxy(port, Arc::new(WindowReversal::default()), 16);
    let (mut client, mut server) = connect_pair(handle.local_addr(), &upstream).await;

    client.write_all(b"A\nB\n").await.unwrap();
    handle.wait_for_buffered(2, WAIT).await.unwrap();

    timeout(WAIT, handle.stop()).await.unwrap().unwrap();

    assert!(read_until_closed(&mut server).await.is_empty());
    assert!(read_until_closed(&mut client).await.is_empty());
    assert!(TcpStream::connect(handle.local_addr()).await.is_err());
}

#[tokio::test]
async fn test_rounds_cover_every_connection() {
    let (upstream, port) = upstream_server().await;
    let handle = start_proxy(port, Arc::new(WindowReversal::default()), 16);

    let (mut first_client, mut first_server) = connect_pair(handle.local_addr(), &upstream).await;
    let (mut second_client, mut second_server) = connect_pair(handle.local_addr(), &upstream).await;
    wait_for_connections(&handle, 2).await;

    first_client.write_all(b"1a\n1b\n").await.unwrap();
    second_client.write_all(b"2a\n2b\n").await.unwrap();
    handle.wait_for_buffered(4, WAIT).await.unwrap();

    let round = handle.trigger_reorder().await.unwrap();
    assert_eq!(round.connections, 2);
    assert_eq!(round.failed, 0);
    assert_eq!(round.total_frames(), 4);

    assert_eq!(read_exactly(&mut first_server, 6).await, b"1b\n1a\n");
    assert_eq!(read_exactly(&mut second_server, 6).await, b"2b\n2a\n");

    // An idle round on live connections releases nothing
    let round = handle.trigger_reorder().await.unwrap();
    assert_eq!(round.connections, 2);
    assert_eq!(round.total_frames(), 0);

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_dropping_every_handle_stops_proxy() {
    let (upstream, port) = upstream_server().await;
    let handle = start_proxy(port, Arc::new(Identity), 16);
    let addr = handle.local_addr();
    let (mut client, _server) = connect_pair(addr, &upstream).await;

    drop(handle);

    assert!(read_until_closed(&mut client).await.is_empty());
}

#[tokio::test]
async fn test_oversized_frame_closes_connection() {
    let (upstream, port) = upstream_server().await;
    let mut config = proxy_config(port);
    config.max_frame_size = 16;
    config.read_buffer_size = 8;
    let handle = ReorderProxy::bind(config).unwrap().start();
    let (mut client, mut server) = connect_pair(handle.local_addr(), &upstream).await;

    client.write_all(b"short\n").await.unwrap();
    handle.wait_for_buffered(1, WAIT).await.unwrap();

    // No boundary within the limit
    client.write_all(&[b'x'; 40]).await.unwrap();

    assert!(read_until_closed(&mut server).await.is_empty());
    assert!(read_until_closed(&mut client).await.is_empty());
    wait_for_connections(&handle, 0).await;

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_complete_oversized_frame_closes_connection() {
    let (upstream, port) = upstream_server().await;
    let mut config = proxy_config(port);
    config.max_frame_size = 16;
    let handle = ReorderProxy::bind(config).unwrap().start();
    let (mut client, mut server) = connect_pair(handle.local_addr(), &upstream).await;

    // Arrives whole in one segment, boundary included
    client.write_all(b"0123456789abcdefghij\n").await.unwrap();

    assert!(read_until_closed(&mut server).await.is_empty());
    assert!(read_until_closed(&mut client).await.is_empty());
    wait_for_connections(&handle, 0).await;

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_connection_closing_mid_round_counts_as_failed() {
    const FRAMES: usize = 8192;
    const FRAME_LEN: usize = 4096;

    let (upstream, port) = upstream_server().await;
    let handle = start_proxy(port, Arc::new(WindowReversal::default()), FRAMES + 16);
    let (client, server) = connect_pair(handle.local_addr(), &upstream).await;

    let mut frame = vec![b'f'; FRAME_LEN - 1];
    frame.push(b'\n');
    let writer = tokio::spawn(async move {
        let mut client = client;
        for _ in 0..FRAMES {
            client.write_all(&frame).await.unwrap();
        }
        client
    });
    handle.wait_for_buffered(FRAMES, Duration::from_secs(30)).await.unwrap();
    let _client = writer.await.unwrap();

    // The upstream never reads, so the round blocks on the write until it goes away
    let round = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.trigger_reorder().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(server);

    let round = timeout(WAIT, round).await.unwrap().unwrap().unwrap();
    assert_eq!(round.connections, 0);
    assert_eq!(round.failed, 1);
    wait_for_connections(&handle, 0).await;

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_directions_keep_their_own_order() {
    let (upstream, port) = upstream_server().await;
    let handle = start_proxy(port, Arc::new(WindowReversal::default()), 16);
    let (client, server) = connect_pair(handle.local_addr(), &upstream).await;

    async fn send_tagged(mut stream: TcpStream, tag: char) -> TcpStream {
        for i in 0..6 {
            stream.write_all(format!("{}{}\n", tag, i).as_bytes()).await.unwrap();
            tokio::task::yield_now().await;
        }
        stream
    }

    let client_side = tokio::spawn(send_tagged(client, 'c'));
    let server_side = tokio::spawn(send_tagged(server, 's'));
    let mut client = client_side.await.unwrap();
    let mut server = server_side.await.unwrap();

    let snapshot = handle.wait_for_buffered(12, WAIT).await.unwrap();
    assert_eq!(snapshot.buffered.client_to_server, 6);
    assert_eq!(snapshot.buffered.server_to_client, 6);

    let round = handle.trigger_reorder().await.unwrap();
    assert_eq!(round.total_frames(), 12);

    assert_eq!(read_exactly(&mut client, 18).await, b"s1\ns0\ns3\ns2\ns5\ns4\n");
    assert_eq!(read_exactly(&mut server, 18).await, b"c1\nc0\nc3\nc2\nc5\nc4\n");

    handle.stop().await.unwrap();
}
