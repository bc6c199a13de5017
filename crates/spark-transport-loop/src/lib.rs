#![doc = r#"
# spark-transport-loop

## 设计动机（Why）
- **定位**：单线程事件循环与异步消费者之间的连接接纳桥。事件循环负责监听、
  接纳内核连接并驱动连接泵；消费者在任意任务上以 `accept` 逐个取走连接。
- **架构角色**：[`ListenerContext`] 是唯一的交汇点，循环侧通过
  `create_accept_socket`/`handle_connection` 生产，消费侧通过 `accept` 消费，
  两侧仅共享一个容量为 [`ACCEPT_QUEUE_CAPACITY`] 的有界队列。
- **设计理念**：生产者路径上的失败绝不回流到事件循环：对端重置按调试事件记录，
  其余故障以严重级别写入 [`TransportLog`] 后吞掉。

## 核心契约（What）
- **端点**：[`ListenEndpoint`] 描述 TCP 地址、Unix 路径或继承句柄；继承句柄的
  `Auto` 类型须在监听阶段解析，否则套接字工厂返回 [`TransportError::UnresolvedHandle`]；
- **队列**：FIFO、有界；满载时按 [`FullQueuePolicy`] 挂起生产者或拒绝新连接；
- **取消**：`accept` 的取消以 [`TransportError::Cancelled`] 返回，不消费任何连接；
- **停止**：`stop_accepting` 幂等，排空后 `accept` 返回 `Ok(None)`。

## 实现策略（How）
- **执行框架**：[`LoopThread`] 在独立 OS 线程上运行 Tokio current-thread 运行时；
  句柄登记、连接泵与关闭请求都在该线程上执行；
- **交接**：`parking_lot::Mutex<VecDeque>` 加两组 `tokio::sync::Notify`，等待方先登记
  再检查，避免丢失唤醒；
- **字节搬运**：[`LoopConnection`] 通过 `tokio::io::duplex` 与循环上按方向拆分的
  `tokio::io::copy` 把套接字暴露给任意线程上的消费者；连接被丢弃即释放套接字。

## 风险与考量（Trade-offs）
- **背压**：`Wait` 策略下满载会让监听器的接纳任务停滞，新连接留在内核 backlog；
- **拷贝**：内存管道多一次拷贝，换取消费者与事件循环线程解耦；
- **平台**：仅支持 Unix 系统（依赖 Unix 域套接字与 `OwnedFd`）。
"#]

mod cancellation;
mod config;
mod connection;
mod context;
mod endpoint;
mod error;
mod handle;
mod listener;
mod log;
mod queue;
mod thread;

pub use cancellation::Cancellation;
pub use config::{FullQueuePolicy, TransportContext, TransportOptions};
pub use connection::{ConnectionId, LoopConnection};
pub use context::ListenerContext;
pub use endpoint::{FileHandleEndpoint, FileHandleKind, ListenEndpoint};
pub use error::{ErrorCategory, Operation, TransportError, is_connection_reset};
pub use handle::{PipeHandle, SocketKind, StreamHandle, TcpHandle};
pub use listener::LoopListener;
pub use log::{TracingLog, TransportLog};
pub use queue::{ACCEPT_QUEUE_CAPACITY, AcceptQueue, QueueClosed, TryEnqueueError};
pub use thread::LoopThread;
