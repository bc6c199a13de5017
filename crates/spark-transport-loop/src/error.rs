use crate::endpoint::FileHandleKind;
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Operation {
    code: &'static str,
    message: &'static str,
}

impl Operation {
    /// 稳定错误码，供告警与指标聚合使用。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 人类可读的操作名。
    pub fn message(&self) -> &'static str {
        self.message
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message)
    }
}

pub(crate) const BIND: Operation = Operation {
    code: "spark.transport.loop.bind_failed",
    message: "listener bind",
};
pub(crate) const PROBE_HANDLE: Operation = Operation {
    code: "spark.transport.loop.probe_handle_failed",
    message: "inherited handle probe",
};
pub(crate) const ACCEPT: Operation = Operation {
    code: "spark.transport.loop.accept_failed",
    message: "socket accept",
};
pub(crate) const RESOLVE_ADDR: Operation = Operation {
    code: "spark.transport.loop.resolve_addr_failed",
    message: "endpoint resolution",
};
pub(crate) const CONFIGURE: Operation = Operation {
    code: "spark.transport.loop.configure_failed",
    message: "socket configure",
};
pub(crate) const REGISTER: Operation = Operation {
    code: "spark.transport.loop.register_failed",
    message: "loop registration",
};
pub(crate) const SPAWN_LOOP: Operation = Operation {
    code: "spark.transport.loop.spawn_failed",
    message: "loop thread spawn",
};

/// 错误分类，决定调用方应当重试、修正配置还是直接放弃。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// 配置或调用顺序错误，重试无意义，需要修正调用方。
    Configuration,
    /// 瞬时故障，建议在给定间隔后重试。
    Retryable { after: Duration },
    /// 非瞬时故障，重试大概率仍然失败。
    NonRetryable,
    /// 调用方主动取消。
    Cancelled,
}

/// 连接接纳桥的统一错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：套接字工厂、事件循环登记与消费端取消都需要可区分的失败语义，
///   统一枚举让日志与告警可以按 [`TransportError::code`] 聚合。
/// - **契约 (What)**：
///   - `UnresolvedHandle`/`Unsupported`/`InvalidOperation`/`AlreadyBound` 属于配置类错误，
///     只会同步返回给触发建套接字或绑定的调用方；
///   - `Cancelled` 只由消费端 `accept` 产生，与数据结果可区分；
///   - `Io` 保留原始 [`io::Error`] 作为 `source`，并记录失败的 [`Operation`]。
/// - **风险 (Trade-offs)**：`LoopStopped` 携带线程名 `String`，换取日志可读性。
#[derive(Debug, Error)]
pub enum TransportError {
    /// 继承句柄的类型仍为 `Auto`，说明监听阶段未完成类型解析。
    #[error("cannot accept on a non-specific file handle, listen should be performed first")]
    UnresolvedHandle,

    /// 继承句柄的类型无法承载流式连接。
    #[error("file handle kind {kind:?} cannot accept stream connections")]
    Unsupported { kind: FileHandleKind },

    /// 调用顺序或内部不变式被破坏。
    #[error("invalid operation: {detail}")]
    InvalidOperation { detail: &'static str },

    /// 监听上下文只能绑定一次端点。
    #[error("listener context is already bound to an endpoint")]
    AlreadyBound,

    /// 事件循环线程已经停止，无法再登记句柄或调度任务。
    #[error("event loop `{name}` is not running")]
    LoopStopped { name: String },

    /// 接纳队列已关闭，新连接无法入队。
    #[error("accept queue is closed")]
    AcceptQueueClosed,

    /// 等待中的 `accept` 被取消。
    #[error("accept cancelled")]
    Cancelled,

    /// 底层 IO 失败。
    #[error("{op}: {source}")]
    Io {
        op: Operation,
        #[source]
        source: io::Error,
    },
}

impl TransportError {
    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            TransportError::UnresolvedHandle => "spark.transport.loop.unresolved_handle",
            TransportError::Unsupported { .. } => "spark.transport.loop.unsupported_handle",
            TransportError::InvalidOperation { .. } => "spark.transport.loop.invalid_operation",
            TransportError::AlreadyBound => "spark.transport.loop.already_bound",
            TransportError::LoopStopped { .. } => "spark.transport.loop.loop_stopped",
            TransportError::AcceptQueueClosed => "spark.transport.loop.accept_queue_closed",
            TransportError::Cancelled => "spark.transport.loop.cancelled",
            TransportError::Io { op, .. } => op.code(),
        }
    }

    /// 返回错误分类。
    pub fn category(&self) -> ErrorCategory {
        match self {
            TransportError::UnresolvedHandle
            | TransportError::Unsupported { .. }
            | TransportError::InvalidOperation { .. }
            | TransportError::AlreadyBound => ErrorCategory::Configuration,
            TransportError::LoopStopped { .. } | TransportError::AcceptQueueClosed => {
                ErrorCategory::NonRetryable
            }
            TransportError::Cancelled => ErrorCategory::Cancelled,
            TransportError::Io { source, .. } => categorize_io_error(source),
        }
    }

    /// 是否属于配置/不变式类错误。
    pub fn is_configuration(&self) -> bool {
        self.category() == ErrorCategory::Configuration
    }

    /// 若为 IO 错误，返回底层 [`io::Error`]。
    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            TransportError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// 将 IO 错误映射为 [`TransportError::Io`]，并记录失败的操作。
pub(crate) fn map_io_error(op: Operation, source: io::Error) -> TransportError {
    TransportError::Io { op, source }
}

/// 判断错误是否属于“对端已重置连接”一类。
///
/// `ENOTCONN` 也归入此类：对端在我们调用 `getpeername` 之前发送 RST 时，
/// 内核返回的正是它。macOS 在同样场景下返回 `EINVAL`。
pub fn is_connection_reset(error: &io::Error) -> bool {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::ConnectionReset | ErrorKind::BrokenPipe | ErrorKind::NotConnected => true,
        #[cfg(target_os = "macos")]
        ErrorKind::InvalidInput => true,
        _ => false,
    }
}

fn categorize_io_error(error: &io::Error) -> ErrorCategory {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::WouldBlock | ErrorKind::Interrupted => ErrorCategory::Retryable {
            after: Duration::from_millis(5),
        },
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::BrokenPipe
        | ErrorKind::AddrInUse
        | ErrorKind::AddrNotAvailable => ErrorCategory::Retryable {
            after: Duration::from_millis(50),
        },
        _ => ErrorCategory::NonRetryable,
    }
}
