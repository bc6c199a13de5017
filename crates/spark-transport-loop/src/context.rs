use crate::cancellation::Cancellation;
use crate::config::{FullQueuePolicy, TransportContext};
use crate::connection::LoopConnection;
use crate::endpoint::{FileHandleEndpoint, FileHandleKind, ListenEndpoint};
use crate::error::{self, TransportError, is_connection_reset, map_io_error};
use crate::handle::{PipeHandle, StreamHandle, TcpHandle};
use crate::queue::{AcceptQueue, TryEnqueueError};
use crate::thread::LoopThread;
use std::net::SocketAddr;
use std::sync::OnceLock;

const HANDLE_CONNECTION_SITE: &str = "ListenerContext::handle_connection";

/// 监听上下文：接纳桥的编排者。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 事件循环侧通过 [`create_accept_socket`](Self::create_accept_socket) 与
///   [`handle_connection`](Self::handle_connection) 驱动连接接纳；
/// - 消费侧通过 [`accept`](Self::accept) 逐个拉取连接，两侧只经由接纳队列交互。
///
/// ## 逻辑 (How)
/// - 端点在监听阶段写入一次（`OnceLock`），之后所有分派都读取同一份描述；
/// - `handle_connection` 把全部可失败步骤收敛到 [`intake`](Self::intake)，
///   自身只负责记录并吞掉错误，保证没有错误回流到事件循环；
/// - 队列满载时按 [`FullQueuePolicy`] 挂起或拒绝。
///
/// ## 契约 (What)
/// - `create_accept_socket`/`handle_connection` 只由事件循环线程顺序调用；
/// - `accept` 可被任意数量的任务并发调用，每次成功调用至多交付一个连接；
/// - `stop_accepting` 幂等。
///
/// ## 注意事项 (Trade-offs)
/// - `Wait` 策略下生产者在满载时挂起，监听器的接纳任务随之停滞，新连接留在内核 backlog 中；
///   同一循环上的连接泵不受影响。需要事件循环永不停滞时改用 `Reject`。
pub struct ListenerContext {
    transport: TransportContext,
    thread: LoopThread,
    endpoint: OnceLock<ListenEndpoint>,
    accept_queue: AcceptQueue<LoopConnection>,
}

impl ListenerContext {
    pub fn new(transport: TransportContext, thread: LoopThread) -> Self {
        Self {
            transport,
            thread,
            endpoint: OnceLock::new(),
            accept_queue: AcceptQueue::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_accept_capacity(
        transport: TransportContext,
        thread: LoopThread,
        capacity: usize,
    ) -> Self {
        Self {
            accept_queue: AcceptQueue::with_capacity(capacity),
            ..Self::new(transport, thread)
        }
    }

    pub fn transport(&self) -> &TransportContext {
        &self.transport
    }

    pub fn thread(&self) -> &LoopThread {
        &self.thread
    }

    /// 已绑定的端点；监听前为 `None`。
    pub fn endpoint(&self) -> Option<&ListenEndpoint> {
        self.endpoint.get()
    }

    /// 记录监听端点。只能成功一次。
    pub fn bind_endpoint(&self, endpoint: ListenEndpoint) -> Result<(), TransportError> {
        self.endpoint
            .set(endpoint)
            .map_err(|_| TransportError::AlreadyBound)
    }

    /// 排队等待消费的连接数量。
    pub fn accept_queue_depth(&self) -> usize {
        self.accept_queue.len()
    }

    pub fn accept_queue_capacity(&self) -> usize {
        self.accept_queue.capacity()
    }

    pub fn is_accepting(&self) -> bool {
        !self.accept_queue.is_closed()
    }

    /// 取出下一条连接。
    ///
    /// - `Ok(Some(connection))`：按入队顺序交付；
    /// - `Ok(None)`：已停止接纳且队列排空；
    /// - `Err(TransportError::Cancelled)`：等待期间被取消，未消费任何连接。
    pub async fn accept(
        &self,
        cancellation: &Cancellation,
    ) -> Result<Option<LoopConnection>, TransportError> {
        self.accept_queue.dequeue(cancellation).await
    }

    /// 停止接纳：关闭队列写入端。首次调用返回 `true`。
    pub fn stop_accepting(&self) -> bool {
        self.accept_queue.close()
    }

    /// 为下一次入站连接创建套接字句柄。
    ///
    /// 返回的句柄已登记到事件循环、尚未连接。配置类错误表示调用方缺陷，不应重试。
    pub fn create_accept_socket(&self) -> Result<StreamHandle, TransportError> {
        match self.endpoint.get() {
            Some(ListenEndpoint::Tcp(_)) => self.accept_tcp(),
            Some(ListenEndpoint::Unix(_)) => self.accept_pipe(),
            Some(ListenEndpoint::FileHandle(handle)) => self.accept_handle(handle),
            None => Err(TransportError::InvalidOperation {
                detail: "listener context has no bound endpoint",
            }),
        }
    }

    fn accept_handle(&self, handle: &FileHandleEndpoint) -> Result<StreamHandle, TransportError> {
        match handle.kind() {
            FileHandleKind::Auto => Err(TransportError::UnresolvedHandle),
            FileHandleKind::Tcp => self.accept_tcp(),
            FileHandleKind::Pipe => self.accept_pipe(),
            kind @ FileHandleKind::Datagram => Err(TransportError::Unsupported { kind }),
        }
    }

    fn accept_tcp(&self) -> Result<StreamHandle, TransportError> {
        let mut socket = TcpHandle::new();
        socket.init(&self.thread)?;
        socket.set_no_delay(self.transport.options().no_delay)?;
        Ok(StreamHandle::Tcp(socket))
    }

    fn accept_pipe(&self) -> Result<StreamHandle, TransportError> {
        let mut pipe = PipeHandle::new();
        pipe.init(&self.thread)?;
        Ok(StreamHandle::Pipe(pipe))
    }

    /// 处理事件循环交来的一个已接纳句柄。从不返回错误。
    pub async fn handle_connection(&self, socket: StreamHandle) {
        if let Err(err) = self.intake(socket).await {
            self.transport.log().unexpected_fault(&err, HANDLE_CONNECTION_SITE);
        }
    }

    /// 接纳流水线：解析地址、构造并启动连接、入队。
    ///
    /// 这是生产者路径上唯一可以失败的函数；对端重置在这里就地处理并返回 `Ok`。
    pub async fn intake(&self, socket: StreamHandle) -> Result<(), TransportError> {
        let (remote_addr, local_addr) = match resolve_addresses(&socket) {
            Ok(addresses) => addresses,
            Err(err) if is_connection_reset(&err) => {
                self.transport.log().connection_reset(None);
                socket.dispose();
                return Ok(());
            }
            Err(err) => return Err(map_io_error(error::RESOLVE_ADDR, err)),
        };

        let mut connection = LoopConnection::new(
            socket,
            &self.transport,
            self.thread.clone(),
            remote_addr,
            local_addr,
        );
        connection.start()?;
        self.transport
            .log()
            .connection_accepted(connection.id(), remote_addr);

        self.enqueue(connection).await
    }

    async fn enqueue(&self, connection: LoopConnection) -> Result<(), TransportError> {
        let connection = match self.accept_queue.try_enqueue(connection) {
            Ok(()) => return Ok(()),
            Err(TryEnqueueError::Closed(_)) => return Err(TransportError::AcceptQueueClosed),
            Err(TryEnqueueError::Full(connection)) => connection,
        };

        match self.transport.options().full_queue_policy {
            FullQueuePolicy::Wait => {
                self.transport
                    .log()
                    .accept_queue_full(self.accept_queue.capacity());
                self.accept_queue
                    .enqueue(connection)
                    .await
                    .map_err(|_| TransportError::AcceptQueueClosed)
            }
            FullQueuePolicy::Reject => {
                self.transport
                    .log()
                    .connection_rejected(connection.id(), "accept queue is full");
                Ok(())
            }
        }
    }
}

fn resolve_addresses(
    socket: &StreamHandle,
) -> std::io::Result<(Option<SocketAddr>, Option<SocketAddr>)> {
    match socket {
        StreamHandle::Tcp(tcp) => {
            let remote = tcp.peer_addr()?;
            let local = tcp.local_addr()?;
            Ok((Some(remote), Some(local)))
        }
        StreamHandle::Pipe(_) => Ok((None, None)),
    }
}

impl std::fmt::Debug for ListenerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerContext")
            .field("endpoint", &self.endpoint.get())
            .field("thread", &self.thread)
            .field("accept_queue", &self.accept_queue)
            .finish()
    }
}
