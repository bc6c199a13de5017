use crate::error::{self, TransportError, map_io_error};
use crate::thread::{CloseRequest, LoopThread};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};

/// 套接字句柄的物理类型。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SocketKind {
    Tcp,
    Pipe,
}

/// TCP 句柄：先在事件循环上初始化，再由监听器接纳连接填充。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 接纳路径先构造“已登记、未连接”的句柄，再把内核接纳到的流放入其中；
///   套接字选项（如 `TCP_NODELAY`）在构造时就确定，流到达时立即生效；
/// - 句柄释放统一经由事件循环的 `queue_close`，与注册位置保持一致。
///
/// ## 契约 (What)
/// - `init` 只能在循环运行时成功；
/// - `attach` 要求已初始化且尚未连接；
/// - 析构或 `dispose` 时若持有流，则提交给循环关闭，且只提交一次。
pub struct TcpHandle {
    thread: Option<LoopThread>,
    stream: Option<TcpStream>,
    no_delay: bool,
}

impl TcpHandle {
    pub fn new() -> Self {
        Self {
            thread: None,
            stream: None,
            no_delay: false,
        }
    }

    /// 把句柄登记到事件循环。
    pub fn init(&mut self, thread: &LoopThread) -> Result<(), TransportError> {
        thread.ensure_running()?;
        self.thread = Some(thread.clone());
        Ok(())
    }

    /// 记录并（若已连接）立即应用 `TCP_NODELAY`。
    pub fn set_no_delay(&mut self, enabled: bool) -> Result<(), TransportError> {
        self.no_delay = enabled;
        if let Some(stream) = &self.stream {
            stream
                .set_nodelay(enabled)
                .map_err(|err| map_io_error(error::CONFIGURE, err))?;
        }
        Ok(())
    }

    pub fn no_delay(&self) -> bool {
        self.no_delay
    }

    pub fn is_initialized(&self) -> bool {
        self.thread.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// 接纳一个已经由其他组件 `accept` 得到的标准库流，并登记到事件循环。
    pub fn adopt(thread: &LoopThread, stream: std::net::TcpStream) -> Result<Self, TransportError> {
        stream
            .set_nonblocking(true)
            .map_err(|err| map_io_error(error::REGISTER, err))?;
        let stream = {
            let _guard = thread.enter()?;
            TcpStream::from_std(stream).map_err(|err| map_io_error(error::REGISTER, err))?
        };
        let mut handle = Self::new();
        handle.init(thread)?;
        handle.attach(stream)?;
        Ok(handle)
    }

    pub(crate) fn attach(&mut self, stream: TcpStream) -> Result<(), TransportError> {
        if self.thread.is_none() {
            return Err(TransportError::InvalidOperation {
                detail: "tcp handle must be initialized before accepting",
            });
        }
        if self.stream.is_some() {
            return Err(TransportError::InvalidOperation {
                detail: "tcp handle is already connected",
            });
        }
        // 先放入句柄，配置失败时流随句柄一起经由 queue_close 释放。
        self.stream = Some(stream);
        self.set_no_delay(self.no_delay)
    }

    /// 通过 `getpeername` 解析对端地址。
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.connected()?.peer_addr()
    }

    /// 通过 `getsockname` 解析本地地址。
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.connected()?.local_addr()
    }

    fn connected(&self) -> io::Result<&TcpStream> {
        self.stream
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }
}

impl Default for TcpHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TcpHandle {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            match &self.thread {
                Some(thread) => thread.queue_close(CloseRequest::Tcp(stream)),
                None => drop(stream),
            }
        }
    }
}

impl fmt::Debug for TcpHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpHandle")
            .field("initialized", &self.is_initialized())
            .field("connected", &self.is_connected())
            .field("no_delay", &self.no_delay)
            .finish()
    }
}

/// Unix 域流式句柄。
pub struct PipeHandle {
    thread: Option<LoopThread>,
    stream: Option<UnixStream>,
}

impl PipeHandle {
    pub fn new() -> Self {
        Self {
            thread: None,
            stream: None,
        }
    }

    pub fn init(&mut self, thread: &LoopThread) -> Result<(), TransportError> {
        thread.ensure_running()?;
        self.thread = Some(thread.clone());
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.thread.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn adopt(
        thread: &LoopThread,
        stream: std::os::unix::net::UnixStream,
    ) -> Result<Self, TransportError> {
        stream
            .set_nonblocking(true)
            .map_err(|err| map_io_error(error::REGISTER, err))?;
        let stream = {
            let _guard = thread.enter()?;
            UnixStream::from_std(stream).map_err(|err| map_io_error(error::REGISTER, err))?
        };
        let mut handle = Self::new();
        handle.init(thread)?;
        handle.attach(stream)?;
        Ok(handle)
    }

    pub(crate) fn attach(&mut self, stream: UnixStream) -> Result<(), TransportError> {
        if self.thread.is_none() {
            return Err(TransportError::InvalidOperation {
                detail: "pipe handle must be initialized before accepting",
            });
        }
        if self.stream.is_some() {
            return Err(TransportError::InvalidOperation {
                detail: "pipe handle is already connected",
            });
        }
        self.stream = Some(stream);
        Ok(())
    }
}

impl Default for PipeHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PipeHandle {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            match &self.thread {
                Some(thread) => thread.queue_close(CloseRequest::Pipe(stream)),
                None => drop(stream),
            }
        }
    }
}

impl fmt::Debug for PipeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeHandle")
            .field("initialized", &self.is_initialized())
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// 接纳路径上流动的原始流句柄。
#[derive(Debug)]
pub enum StreamHandle {
    Tcp(TcpHandle),
    Pipe(PipeHandle),
}

impl StreamHandle {
    pub fn kind(&self) -> SocketKind {
        match self {
            StreamHandle::Tcp(_) => SocketKind::Tcp,
            StreamHandle::Pipe(_) => SocketKind::Pipe,
        }
    }

    pub fn is_connected(&self) -> bool {
        match self {
            StreamHandle::Tcp(handle) => handle.is_connected(),
            StreamHandle::Pipe(handle) => handle.is_connected(),
        }
    }

    pub fn as_tcp(&self) -> Option<&TcpHandle> {
        match self {
            StreamHandle::Tcp(handle) => Some(handle),
            StreamHandle::Pipe(_) => None,
        }
    }

    /// 释放句柄；持有的流经由事件循环关闭。
    pub fn dispose(self) {
        drop(self);
    }
}

impl From<TcpHandle> for StreamHandle {
    fn from(handle: TcpHandle) -> Self {
        StreamHandle::Tcp(handle)
    }
}

impl From<PipeHandle> for StreamHandle {
    fn from(handle: PipeHandle) -> Self {
        StreamHandle::Pipe(handle)
    }
}

fn not_connected() -> io::Error {
    io::Error::from(io::ErrorKind::NotConnected)
}

impl AsyncRead for StreamHandle {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            StreamHandle::Tcp(TcpHandle {
                stream: Some(stream),
                ..
            }) => Pin::new(stream).poll_read(cx, buf),
            StreamHandle::Pipe(PipeHandle {
                stream: Some(stream),
                ..
            }) => Pin::new(stream).poll_read(cx, buf),
            _ => Poll::Ready(Err(not_connected())),
        }
    }
}

impl AsyncWrite for StreamHandle {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            StreamHandle::Tcp(TcpHandle {
                stream: Some(stream),
                ..
            }) => Pin::new(stream).poll_write(cx, buf),
            StreamHandle::Pipe(PipeHandle {
                stream: Some(stream),
                ..
            }) => Pin::new(stream).poll_write(cx, buf),
            _ => Poll::Ready(Err(not_connected())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            StreamHandle::Tcp(TcpHandle {
                stream: Some(stream),
                ..
            }) => Pin::new(stream).poll_flush(cx),
            StreamHandle::Pipe(PipeHandle {
                stream: Some(stream),
                ..
            }) => Pin::new(stream).poll_flush(cx),
            _ => Poll::Ready(Err(not_connected())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            StreamHandle::Tcp(TcpHandle {
                stream: Some(stream),
                ..
            }) => Pin::new(stream).poll_shutdown(cx),
            StreamHandle::Pipe(PipeHandle {
                stream: Some(stream),
                ..
            }) => Pin::new(stream).poll_shutdown(cx),
            _ => Poll::Ready(Err(not_connected())),
        }
    }
}
