use crate::cancellation::Cancellation;
use crate::config::TransportContext;
use crate::error::{TransportError, is_connection_reset};
use crate::handle::{SocketKind, StreamHandle};
use crate::log::TransportLog;
use crate::thread::LoopThread;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};

/// 进程内唯一的连接标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ConnectionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{:08X}", self.0)
    }
}

/// 一条已接纳、可读写的连接。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 把接纳到的套接字、解析出的地址与所属事件循环打包成一个单元，经接纳队列交给消费者；
/// - 套接字读写由事件循环上的连接泵驱动，消费者可以在任意线程上读写应用侧，
///   不必关心套接字登记在哪个反应器上。
///
/// ## 逻辑 (How)
/// - `start` 创建 `tokio::io::duplex` 内存管道，把套接字与循环侧一端移入泵任务；
///   泵分别搬运“应用 → 套接字”与“套接字 → 应用”两个方向，结束后套接字随句柄析构交给循环关闭；
/// - 应用侧一端留在本结构中，`AsyncRead`/`AsyncWrite` 直接委托给它；
/// - 析构时触发 `released`：出站方向写完缓冲数据后，泵不再等待对端，立即释放套接字。
///
/// ## 契约 (What)
/// - 构造时独占套接字句柄；`start` 之后句柄归连接泵所有；
/// - 未启动时读写返回 `NotConnected`；
/// - 消费者通过析构或 [`LoopConnection::close`] 释放连接；即使对端保持空闲，套接字也会被关闭。
///
/// ## 注意事项 (Trade-offs)
/// - 内存管道多一次拷贝，换来消费者与事件循环线程解耦；缓冲上限取自
///   `TransportOptions::pump_buffer_size`，也是每条连接在循环侧的背压阈值。
pub struct LoopConnection {
    id: ConnectionId,
    kind: SocketKind,
    remote_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    thread: LoopThread,
    log: Arc<dyn TransportLog>,
    buffer_size: usize,
    socket: Option<StreamHandle>,
    application: Option<DuplexStream>,
    released: Cancellation,
}

impl LoopConnection {
    pub fn new(
        socket: StreamHandle,
        transport: &TransportContext,
        thread: LoopThread,
        remote_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            id: ConnectionId::next(),
            kind: socket.kind(),
            remote_addr,
            local_addr,
            thread,
            log: Arc::clone(transport.log()),
            buffer_size: transport.options().pump_buffer_size.max(1),
            socket: Some(socket),
            application: None,
            released: Cancellation::new(),
        }
    }

    /// 启动连接泵。只能调用一次；失败时套接字已被释放。
    pub fn start(&mut self) -> Result<(), TransportError> {
        let socket = self.socket.take().ok_or(TransportError::InvalidOperation {
            detail: "connection has already been started",
        })?;
        let (application, transport_side) = tokio::io::duplex(self.buffer_size);
        self.thread.spawn(pump(
            self.id,
            socket,
            transport_side,
            self.released.clone(),
            Arc::clone(&self.log),
        ))?;
        self.application = Some(application);
        Ok(())
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_started(&self) -> bool {
        self.application.is_some()
    }

    /// 半关闭应用侧写方向并释放连接。
    pub async fn close(mut self) -> io::Result<()> {
        match self.application.as_mut() {
            Some(application) => application.shutdown().await,
            None => Ok(()),
        }
    }

    fn application(self: Pin<&mut Self>) -> io::Result<Pin<&mut DuplexStream>> {
        match self.get_mut().application.as_mut() {
            Some(application) => Ok(Pin::new(application)),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }
}

async fn pump(
    id: ConnectionId,
    socket: StreamHandle,
    transport_side: DuplexStream,
    released: Cancellation,
    log: Arc<dyn TransportLog>,
) {
    let (mut socket_rd, mut socket_wr) = tokio::io::split(socket);
    let (mut app_rd, mut app_wr) = tokio::io::split(transport_side);

    let outbound = async {
        tokio::io::copy(&mut app_rd, &mut socket_wr).await?;
        socket_wr.shutdown().await
    };
    let inbound = async {
        tokio::io::copy(&mut socket_rd, &mut app_wr).await?;
        app_wr.shutdown().await
    };
    tokio::pin!(outbound, inbound);

    let result = tokio::select! {
        sent = &mut outbound => match sent {
            // 应用侧已半关闭：消费者仍持有连接时继续接收，释放后不再等待对端。
            Ok(()) => tokio::select! {
                received = &mut inbound => received,
                _ = released.cancelled() => Ok(()),
            },
            Err(err) => Err(err),
        },
        received = &mut inbound => match received {
            Ok(()) => outbound.await,
            Err(err) => Err(err),
        },
    };

    match result {
        Ok(()) => log.connection_closed(id, None),
        Err(err) if is_connection_reset(&err) => log.connection_reset(Some(id)),
        Err(err) => log.connection_closed(id, Some(&err)),
    }
}

impl AsyncRead for LoopConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.application() {
            Ok(application) => application.poll_read(cx, buf),
            Err(err) => Poll::Ready(Err(err)),
        }
    }
}

impl AsyncWrite for LoopConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.application() {
            Ok(application) => application.poll_write(cx, buf),
            Err(err) => Poll::Ready(Err(err)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.application() {
            Ok(application) => application.poll_flush(cx),
            Err(err) => Poll::Ready(Err(err)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.application() {
            Ok(application) => application.poll_shutdown(cx),
            Err(err) => Poll::Ready(Err(err)),
        }
    }
}

impl Drop for LoopConnection {
    fn drop(&mut self) {
        self.released.cancel();
    }
}

impl fmt::Debug for LoopConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopConnection")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("remote_addr", &self.remote_addr)
            .field("local_addr", &self.local_addr)
            .field("started", &self.is_started())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportOptions;
    use crate::handle::TcpHandle;
    use std::io::{Read, Write};

    #[tokio::test(flavor = "multi_thread")]
    async fn started_connection_pumps_bytes_both_ways() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let thread = LoopThread::start("spark-connection-test").expect("start loop");
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let mut client =
            std::net::TcpStream::connect(listener.local_addr().expect("addr")).expect("connect");
        let (server, remote) = listener.accept().expect("accept");

        let handle = TcpHandle::adopt(&thread, server).expect("adopt");
        let transport =
            TransportContext::new(TransportOptions::default().with_pump_buffer_size(1024));
        let mut connection =
            LoopConnection::new(handle.into(), &transport, thread.clone(), Some(remote), None);
        assert!(!connection.is_started());
        connection.start().expect("start pump");
        assert!(connection.start().is_err(), "重复启动应被拒绝");

        let client = tokio::task::spawn_blocking(move || {
            client.write_all(b"ping").expect("client write");
            let mut reply = [0u8; 4];
            client.read_exact(&mut reply).expect("client read");
            reply
        });

        let mut inbound = [0u8; 4];
        connection.read_exact(&mut inbound).await.expect("read");
        assert_eq!(&inbound, b"ping");
        connection.write_all(b"pong").await.expect("write");
        connection.flush().await.expect("flush");

        assert_eq!(&client.await.expect("client task"), b"pong");
        connection.close().await.expect("close");
        thread.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dropping_started_connection_closes_socket_despite_idle_peer() {
        let thread = LoopThread::start("spark-connection-drop").expect("start loop");
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let client =
            std::net::TcpStream::connect(listener.local_addr().expect("addr")).expect("connect");
        let (server, remote) = listener.accept().expect("accept");

        let handle = TcpHandle::adopt(&thread, server).expect("adopt");
        let mut connection = LoopConnection::new(
            handle.into(),
            &TransportContext::default(),
            thread.clone(),
            Some(remote),
            None,
        );
        connection.start().expect("start pump");
        drop(connection);

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        while thread.queued_closes() == 0 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "对端空闲时套接字也必须被释放"
            );
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(thread.queued_closes(), 1);

        // 对端读到 EOF，说明服务端已关闭连接。
        let eof = tokio::task::spawn_blocking(move || {
            let mut client = client;
            client
                .set_read_timeout(Some(std::time::Duration::from_secs(2)))
                .expect("timeout");
            let mut buf = [0u8; 1];
            client.read(&mut buf).expect("client read")
        });
        assert_eq!(eof.await.expect("client task"), 0);
        thread.stop();
    }

    #[test]
    fn start_on_stopped_loop_releases_socket() {
        let thread = LoopThread::start("spark-connection-stopped").expect("start loop");
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let _client =
            std::net::TcpStream::connect(listener.local_addr().expect("addr")).expect("connect");
        let (server, _) = listener.accept().expect("accept");
        let handle = TcpHandle::adopt(&thread, server).expect("adopt");
        thread.stop();

        let mut connection = LoopConnection::new(
            handle.into(),
            &TransportContext::default(),
            thread.clone(),
            None,
            None,
        );
        assert!(matches!(
            connection.start(),
            Err(TransportError::LoopStopped { .. })
        ));
        assert_eq!(thread.queued_closes(), 1);
    }
}
