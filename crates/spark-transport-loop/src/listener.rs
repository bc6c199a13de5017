use crate::cancellation::Cancellation;
use crate::config::TransportContext;
use crate::connection::LoopConnection;
use crate::context::ListenerContext;
use crate::endpoint::{FileHandleKind, ListenEndpoint};
use crate::error::{self, TransportError, is_connection_reset, map_io_error};
use crate::handle::StreamHandle;
use crate::thread::LoopThread;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UnixListener};
use tokio::task::JoinHandle;

const ACCEPT_LOOP_SITE: &str = "LoopListener::accept_loop";
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// 登记在事件循环上的监听套接字。
#[derive(Debug)]
pub(crate) enum ListenSocket {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl ListenSocket {
    /// 打开监听套接字，返回套接字与绑定后的端点。
    ///
    /// TCP 端点中的端口 0 会被替换为内核实际分配的端口；`Auto` 句柄在此完成探测。
    pub(crate) fn open(
        endpoint: &ListenEndpoint,
        thread: &LoopThread,
        backlog: i32,
    ) -> Result<(Self, ListenEndpoint), TransportError> {
        let resolved = endpoint.resolve()?;
        let bind_err = |err: io::Error| map_io_error(error::BIND, err);

        let socket = match &resolved {
            ListenEndpoint::Tcp(addr) => {
                let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))
                    .map_err(bind_err)?;
                socket.set_reuse_address(true).map_err(bind_err)?;
                socket.bind(&SockAddr::from(*addr)).map_err(bind_err)?;
                socket.listen(backlog).map_err(bind_err)?;
                Self::register_tcp(thread, socket)?
            }
            ListenEndpoint::Unix(path) => {
                remove_stale_socket(path).map_err(bind_err)?;
                let socket = Socket::new(Domain::UNIX, Type::STREAM, None).map_err(bind_err)?;
                socket
                    .bind(&SockAddr::unix(path).map_err(bind_err)?)
                    .map_err(bind_err)?;
                socket.listen(backlog).map_err(bind_err)?;
                Self::register_unix(thread, socket)?
            }
            ListenEndpoint::FileHandle(handle) => {
                // 继承句柄已处于监听状态，dup 出的副本交给运行时，原句柄留在端点中。
                let socket = Socket::from(handle.try_clone_fd().map_err(bind_err)?);
                match handle.kind() {
                    FileHandleKind::Tcp => Self::register_tcp(thread, socket)?,
                    FileHandleKind::Pipe => Self::register_unix(thread, socket)?,
                    FileHandleKind::Auto => return Err(TransportError::UnresolvedHandle),
                    kind @ FileHandleKind::Datagram => {
                        return Err(TransportError::Unsupported { kind });
                    }
                }
            }
        };

        // 只有地址端点需要回填内核分配的端口；继承句柄保留描述符与解析后的类型。
        let bound = match (&socket, resolved) {
            (ListenSocket::Tcp(listener), ListenEndpoint::Tcp(_)) => {
                ListenEndpoint::Tcp(listener.local_addr().map_err(bind_err)?)
            }
            (_, resolved) => resolved,
        };
        Ok((socket, bound))
    }

    fn register_tcp(thread: &LoopThread, socket: Socket) -> Result<Self, TransportError> {
        socket
            .set_nonblocking(true)
            .map_err(|err| map_io_error(error::REGISTER, err))?;
        let _guard = thread.enter()?;
        TcpListener::from_std(socket.into())
            .map(ListenSocket::Tcp)
            .map_err(|err| map_io_error(error::REGISTER, err))
    }

    fn register_unix(thread: &LoopThread, socket: Socket) -> Result<Self, TransportError> {
        socket
            .set_nonblocking(true)
            .map_err(|err| map_io_error(error::REGISTER, err))?;
        let _guard = thread.enter()?;
        UnixListener::from_std(socket.into())
            .map(ListenSocket::Unix)
            .map_err(|err| map_io_error(error::REGISTER, err))
    }

    /// 接纳一个内核连接并放入 `handle`。
    pub(crate) async fn accept_into(&self, handle: &mut StreamHandle) -> Result<(), TransportError> {
        match (self, handle) {
            (ListenSocket::Tcp(listener), StreamHandle::Tcp(handle)) => {
                let (stream, _) = listener
                    .accept()
                    .await
                    .map_err(|err| map_io_error(error::ACCEPT, err))?;
                handle.attach(stream)
            }
            (ListenSocket::Unix(listener), StreamHandle::Pipe(handle)) => {
                let (stream, _) = listener
                    .accept()
                    .await
                    .map_err(|err| map_io_error(error::ACCEPT, err))?;
                handle.attach(stream)
            }
            _ => Err(TransportError::InvalidOperation {
                detail: "accept socket kind does not match the listening socket",
            }),
        }
    }
}

/// 删除残留的 Unix 域套接字文件。
///
/// 仅当路径是套接字文件且无人监听（连接被拒绝）时删除；普通文件与仍在服务的套接字原样保留，
/// 随后的 `bind` 会照常报告 `EADDRINUSE`。
fn remove_stale_socket(path: &Path) -> io::Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    if !metadata.file_type().is_socket() {
        return Ok(());
    }
    match std::os::unix::net::UnixStream::connect(path) {
        Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
            tracing::debug!(path = %path.display(), "removing stale unix socket");
            std::fs::remove_file(path)
        }
        _ => Ok(()),
    }
}

fn unlink_socket(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to unlink unix socket")
        }
    }
}

/// 事件循环上的监听器：持有监听套接字，并驱动 [`ListenerContext`] 的生产者一侧。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 把“绑定端点、在循环上接纳、交给上下文”收拢为一个对象，宿主只需
///   `bind` → 循环调用 `accept` → `stop`；
/// - 接纳循环本身就是上下文要求的单一、顺序的生产者。
///
/// ## 逻辑 (How)
/// - `bind` 在调用线程上完成 socket2 绑定与监听，再进入循环运行时登记监听器，
///   绑定错误同步返回；
/// - 接纳循环每轮先调用 `create_accept_socket`，再等待内核连接填充句柄，
///   最后 `handle_connection`；三步都与停止信号竞争；
/// - 重置类与 `ECONNABORTED` 接纳错误直接进入下一轮，其余错误记录后短暂退避。
///
/// ## 契约 (What)
/// - `accept` 语义与 [`ListenerContext::accept`] 相同；
/// - `stop` 幂等：停止接纳循环、关闭接纳队列，已排队的连接仍可被取走；
///   由本监听器创建的 Unix 域套接字文件在停止或析构时删除；
/// - 析构时若未调用 `stop`，接纳循环收到停止信号后自行退出。
///
/// ## 注意事项 (Trade-offs)
/// - 套接字工厂返回配置类错误时接纳循环终止并记录严重日志，不再重试。
pub struct LoopListener {
    context: Arc<ListenerContext>,
    shutdown: Cancellation,
    task: Mutex<Option<JoinHandle<()>>>,
    socket_path: Mutex<Option<PathBuf>>,
}

impl LoopListener {
    /// 绑定 `endpoint` 并在 `thread` 上启动接纳循环。
    pub fn bind(
        transport: TransportContext,
        thread: LoopThread,
        endpoint: ListenEndpoint,
    ) -> Result<Self, TransportError> {
        Self::serve(ListenerContext::new(transport, thread), endpoint)
    }

    fn serve(context: ListenerContext, endpoint: ListenEndpoint) -> Result<Self, TransportError> {
        let thread = context.thread().clone();
        let backlog = context.transport().options().backlog;
        let (socket, bound) = ListenSocket::open(&endpoint, &thread, backlog)?;
        tracing::info!(endpoint = %bound, loop_name = thread.name(), "listener bound");

        let socket_path = bound.unix_path().map(Path::to_path_buf);
        let context = Arc::new(context);
        context.bind_endpoint(bound)?;

        let shutdown = Cancellation::new();
        let task = thread.spawn(accept_loop(
            Arc::clone(&context),
            socket,
            shutdown.clone(),
        ))?;

        Ok(Self {
            context,
            shutdown,
            task: Mutex::new(Some(task)),
            socket_path: Mutex::new(socket_path),
        })
    }

    /// 绑定后的端点；TCP 端点携带实际端口。
    pub fn endpoint(&self) -> Option<&ListenEndpoint> {
        self.context.endpoint()
    }

    pub fn context(&self) -> &Arc<ListenerContext> {
        &self.context
    }

    pub fn accept_queue_depth(&self) -> usize {
        self.context.accept_queue_depth()
    }

    pub async fn accept(
        &self,
        cancellation: &Cancellation,
    ) -> Result<Option<LoopConnection>, TransportError> {
        self.context.accept(cancellation).await
    }

    /// 停止接纳循环并关闭接纳队列。
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            // 循环线程先于监听器停止时任务被运行时取消，结果同样是“已退出”。
            let _ = task.await;
        }
        if self.context.stop_accepting() {
            tracing::info!(endpoint = ?self.context.endpoint(), "listener stopped");
        }
        self.unlink_socket_path();
    }

    fn unlink_socket_path(&self) {
        if let Some(path) = self.socket_path.lock().take() {
            unlink_socket(&path);
        }
    }
}

impl Drop for LoopListener {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.context.stop_accepting();
        self.unlink_socket_path();
    }
}

impl std::fmt::Debug for LoopListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopListener")
            .field("context", &self.context)
            .field("stopping", &self.shutdown.is_cancelled())
            .finish()
    }
}

async fn accept_loop(context: Arc<ListenerContext>, socket: ListenSocket, shutdown: Cancellation) {
    loop {
        let mut handle = match context.create_accept_socket() {
            Ok(handle) => handle,
            Err(err) => {
                context.transport().log().unexpected_fault(&err, ACCEPT_LOOP_SITE);
                break;
            }
        };

        let accepted = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = socket.accept_into(&mut handle) => accepted,
        };
        if let Err(err) = accepted {
            if err.io_error().is_some_and(is_transient_accept_error) {
                continue;
            }
            context.transport().log().unexpected_fault(&err, ACCEPT_LOOP_SITE);
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => continue,
            }
        }

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = context.handle_connection(handle) => {}
        }
    }
}

fn is_transient_accept_error(err: &io::Error) -> bool {
    is_connection_reset(err) || err.kind() == io::ErrorKind::ConnectionAborted
}
