//! 监听端点描述。
//!
//! ## 意图（Why）
//! - 用一个封闭的和类型描述“监听在什么上”：TCP 地址、Unix 域套接字路径或继承的文件句柄；
//! - 绑定期与接纳期两处分派都对它做穷尽匹配，新增变体时编译器会指出所有需要补齐的位置。
//!
//! ## 契约（What）
//! - [`FileHandleKind::Auto`] 只允许出现在监听之前，监听阶段会通过探测句柄将其解析为
//!   `Tcp` 或 `Pipe`；
//! - 端点一旦交给 [`ListenerContext`](crate::ListenerContext) 即不可变。

use crate::error::{self, TransportError, map_io_error};
use serde::Deserialize;
use socket2::{SockRef, Type};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// 继承句柄的子类型。配置文件中使用小写名称。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileHandleKind {
    /// 尚未解析，需要在监听阶段探测。
    Auto,
    /// 流式 IP 套接字。
    Tcp,
    /// Unix 域流式套接字。
    Pipe,
    /// 数据报套接字，无法接纳流式连接。
    Datagram,
}

impl FileHandleKind {
    /// 通过 `getsockopt(SO_TYPE)` 与 `getsockname` 探测句柄的实际类型。
    pub fn probe(fd: BorrowedFd<'_>) -> io::Result<Self> {
        let socket = SockRef::from(&fd);
        let ty = socket.r#type()?;
        if ty == Type::DGRAM {
            return Ok(FileHandleKind::Datagram);
        }
        if ty != Type::STREAM {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "inherited handle is neither a stream nor a datagram socket",
            ));
        }

        let local = socket.local_addr()?;
        if local.is_unix() {
            Ok(FileHandleKind::Pipe)
        } else if local.as_socket().is_some() {
            Ok(FileHandleKind::Tcp)
        } else {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "inherited handle has an unknown address family",
            ))
        }
    }
}

/// 继承自父进程（或 systemd 等外部管理者）的监听句柄。
///
/// 句柄以 `Arc<OwnedFd>` 共享，端点可以廉价克隆；真正打开监听器时会 `dup` 出独立的
/// 描述符，原始句柄在最后一个端点副本释放时关闭。
#[derive(Clone, Debug)]
pub struct FileHandleEndpoint {
    fd: Arc<OwnedFd>,
    kind: FileHandleKind,
}

impl FileHandleEndpoint {
    pub fn new(fd: OwnedFd, kind: FileHandleKind) -> Self {
        Self {
            fd: Arc::new(fd),
            kind,
        }
    }

    pub fn kind(&self) -> FileHandleKind {
        self.kind
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub(crate) fn with_kind(&self, kind: FileHandleKind) -> Self {
        Self {
            fd: Arc::clone(&self.fd),
            kind,
        }
    }

    pub(crate) fn try_clone_fd(&self) -> io::Result<OwnedFd> {
        self.fd.try_clone()
    }
}

impl AsFd for FileHandleEndpoint {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// 监听端点。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 让绑定路径与接纳路径共享同一份描述，避免“监听时是 TCP、接纳时按管道处理”的错配；
/// - 继承句柄保留子类型标签，使 `Auto` 成为“可表示但会被拒绝”的状态，而不是静默穿透。
///
/// ## 契约 (What)
/// - `Tcp`：IP 地址与端口，端口 0 表示由内核分配，绑定后上下文记录实际端口；
/// - `Unix`：Unix 域套接字路径；
/// - `FileHandle`：继承句柄及其子类型。
#[derive(Clone, Debug)]
pub enum ListenEndpoint {
    Tcp(SocketAddr),
    Unix(PathBuf),
    FileHandle(FileHandleEndpoint),
}

impl ListenEndpoint {
    pub fn tcp(addr: impl Into<SocketAddr>) -> Self {
        ListenEndpoint::Tcp(addr.into())
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        ListenEndpoint::Unix(path.into())
    }

    pub fn file_handle(fd: OwnedFd, kind: FileHandleKind) -> Self {
        ListenEndpoint::FileHandle(FileHandleEndpoint::new(fd, kind))
    }

    /// TCP 端点的地址；其余变体返回 `None`。
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        match self {
            ListenEndpoint::Tcp(addr) => Some(*addr),
            _ => None,
        }
    }

    /// Unix 端点的路径；其余变体返回 `None`。
    pub fn unix_path(&self) -> Option<&Path> {
        match self {
            ListenEndpoint::Unix(path) => Some(path),
            _ => None,
        }
    }

    /// 端点是否已完成类型解析，即不含 `Auto` 句柄。
    pub fn is_resolved(&self) -> bool {
        !matches!(
            self,
            ListenEndpoint::FileHandle(FileHandleEndpoint {
                kind: FileHandleKind::Auto,
                ..
            })
        )
    }

    /// 监听期解析：把 `Auto` 句柄替换为探测得到的具体子类型，其余端点原样返回。
    pub(crate) fn resolve(&self) -> Result<ListenEndpoint, TransportError> {
        match self {
            ListenEndpoint::FileHandle(handle) if handle.kind() == FileHandleKind::Auto => {
                let kind = FileHandleKind::probe(handle.as_fd())
                    .map_err(|err| map_io_error(error::PROBE_HANDLE, err))?;
                Ok(ListenEndpoint::FileHandle(handle.with_kind(kind)))
            }
            other => Ok(other.clone()),
        }
    }
}

impl fmt::Display for ListenEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenEndpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
            ListenEndpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            ListenEndpoint::FileHandle(handle) => {
                write!(f, "fd:{} ({:?})", handle.raw_fd(), handle.kind())
            }
        }
    }
}
