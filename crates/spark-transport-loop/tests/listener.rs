//! 监听器端到端验证：真实套接字经事件循环接纳、入队，再由消费者读写。

use spark_transport_loop::{
    Cancellation, FileHandleKind, ListenEndpoint, LoopConnection, LoopListener, LoopThread,
    SocketKind, TransportContext, TransportError, TransportOptions,
};
use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn bind(thread: &LoopThread, endpoint: ListenEndpoint) -> LoopListener {
    LoopListener::bind(
        TransportContext::new(TransportOptions::default()),
        thread.clone(),
        endpoint,
    )
    .expect("bind listener")
}

async fn next(listener: &LoopListener) -> LoopConnection {
    tokio::time::timeout(Duration::from_secs(5), listener.accept(&Cancellation::new()))
        .await
        .expect("accept timed out")
        .expect("accept")
        .expect("listener still accepting")
}

async fn echo_once(mut connection: LoopConnection) {
    let mut buf = [0u8; 5];
    connection.read_exact(&mut buf).await.expect("server read");
    connection.write_all(&buf).await.expect("server write");
    connection.flush().await.expect("server flush");
}

fn unix_path(tag: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("spark-loop-{tag}-{}.sock", std::process::id()));
    let _ = std::fs::remove_file(&path);
    path
}

#[tokio::test(flavor = "multi_thread")]
async fn tcp_connections_arrive_in_order_with_addresses() {
    let thread = LoopThread::start("spark-it-tcp").expect("start loop");
    let listener = bind(&thread, ListenEndpoint::tcp(([127, 0, 0, 1], 0)));
    let addr = listener
        .endpoint()
        .and_then(ListenEndpoint::tcp_addr)
        .expect("bound tcp endpoint");
    assert_ne!(addr.port(), 0);

    let first = std::net::TcpStream::connect(addr).expect("connect first");
    let first_local = first.local_addr().expect("first addr");
    let connection = next(&listener).await;
    assert_eq!(connection.kind(), SocketKind::Tcp);
    assert_eq!(connection.remote_addr(), Some(first_local));
    assert_eq!(connection.local_addr(), Some(addr));

    let client = tokio::task::spawn_blocking(move || {
        let mut first = first;
        first.write_all(b"hello").expect("client write");
        let mut reply = [0u8; 5];
        first.read_exact(&mut reply).expect("client read");
        reply
    });
    echo_once(connection).await;
    assert_eq!(&client.await.expect("client task"), b"hello");

    listener.stop().await;
    thread.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn unix_listener_yields_pipe_connections() {
    let path = unix_path("unix");
    let thread = LoopThread::start("spark-it-unix").expect("start loop");
    let listener = bind(&thread, ListenEndpoint::unix(&path));

    let mut client = std::os::unix::net::UnixStream::connect(&path).expect("connect");
    let connection = next(&listener).await;
    assert_eq!(connection.kind(), SocketKind::Pipe);
    assert_eq!(connection.remote_addr(), None);

    client.write_all(b"pipes").expect("client write");
    echo_once(connection).await;
    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).expect("client read");
    assert_eq!(&reply, b"pipes");

    listener.stop().await;
    assert!(!path.exists(), "停止后套接字文件应被删除");
    thread.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn inherited_auto_handle_is_resolved_at_listen_time() {
    let inherited = std::net::TcpListener::bind("127.0.0.1:0").expect("bind inherited");
    let addr = inherited.local_addr().expect("inherited addr");
    let endpoint = ListenEndpoint::file_handle(OwnedFd::from(inherited), FileHandleKind::Auto);

    let thread = LoopThread::start("spark-it-fd").expect("start loop");
    let listener = bind(&thread, endpoint);
    match listener.endpoint() {
        Some(ListenEndpoint::FileHandle(handle)) => assert_eq!(handle.kind(), FileHandleKind::Tcp),
        other => panic!("unexpected endpoint {other:?}"),
    }

    let _client = std::net::TcpStream::connect(addr).expect("connect");
    let connection = next(&listener).await;
    assert_eq!(connection.kind(), SocketKind::Tcp);
    assert_eq!(connection.local_addr(), Some(addr));

    listener.stop().await;
    thread.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_drains_queued_connections_then_ends() {
    let thread = LoopThread::start("spark-it-stop").expect("start loop");
    let listener = bind(&thread, ListenEndpoint::tcp(([127, 0, 0, 1], 0)));
    let addr = listener
        .endpoint()
        .and_then(ListenEndpoint::tcp_addr)
        .expect("bound tcp endpoint");

    let _clients: Vec<_> = (0..3)
        .map(|_| std::net::TcpStream::connect(addr).expect("connect"))
        .collect();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while listener.accept_queue_depth() < 3 {
        assert!(tokio::time::Instant::now() < deadline, "connections never queued");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    listener.stop().await;
    listener.stop().await;
    assert!(!listener.context().is_accepting());

    let cancellation = Cancellation::new();
    for _ in 0..3 {
        assert!(listener.accept(&cancellation).await.expect("drain").is_some());
    }
    assert!(listener.accept(&cancellation).await.expect("end").is_none());
    thread.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_accept_does_not_consume_later_connection() {
    let thread = LoopThread::start("spark-it-cancel").expect("start loop");
    let listener = bind(&thread, ListenEndpoint::tcp(([127, 0, 0, 1], 0)));
    let addr = listener
        .endpoint()
        .and_then(ListenEndpoint::tcp_addr)
        .expect("bound tcp endpoint");

    let cancellation = Cancellation::new();
    let canceller = cancellation.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });
    assert!(matches!(
        listener.accept(&cancellation).await,
        Err(TransportError::Cancelled)
    ));

    let _client = std::net::TcpStream::connect(addr).expect("connect");
    let connection = next(&listener).await;
    assert_eq!(connection.kind(), SocketKind::Tcp);

    listener.stop().await;
    thread.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn dropped_connection_releases_socket_while_peer_idles() {
    let thread = LoopThread::start("spark-it-drop").expect("start loop");
    let listener = bind(&thread, ListenEndpoint::tcp(([127, 0, 0, 1], 0)));
    let addr = listener
        .endpoint()
        .and_then(ListenEndpoint::tcp_addr)
        .expect("bound tcp endpoint");

    let _idle_client = std::net::TcpStream::connect(addr).expect("connect");
    let connection = next(&listener).await;
    assert_eq!(thread.queued_closes(), 0);
    drop(connection);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while thread.queued_closes() == 0 {
        assert!(tokio::time::Instant::now() < deadline, "socket pinned by idle peer");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    listener.stop().await;
    thread.stop();
}
