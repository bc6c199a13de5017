use crate::log::{TracingLog, TransportLog};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;

/// 接纳队列满载时的处理策略。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - `Wait` 让生产者挂起直到消费者腾出空间：不丢连接，但会让监听器的接纳任务停滞，
///   停滞期间内核 backlog 继续堆积；
/// - `Reject` 立即关闭新连接并记录拒绝事件：事件循环永不停滞，代价是对端看到连接被关闭。
///
/// ## 契约 (What)
/// - 默认 `Wait`；
/// - 配置文件中使用小写 `"wait"`/`"reject"`。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FullQueuePolicy {
    #[default]
    Wait,
    Reject,
}

const DEFAULT_BACKLOG: i32 = 128;
const DEFAULT_PUMP_BUFFER_SIZE: usize = 64 * 1024;

/// 传输层共享配置，绑定后不可变。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportOptions {
    /// 是否为 TCP 连接设置 `TCP_NODELAY`。
    pub no_delay: bool,
    /// 监听套接字的 backlog。
    pub backlog: i32,
    /// 连接泵在套接字与应用侧之间缓冲的最大字节数。
    pub pump_buffer_size: usize,
    /// 接纳队列满载时的策略。
    pub full_queue_policy: FullQueuePolicy,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            no_delay: true,
            backlog: DEFAULT_BACKLOG,
            pump_buffer_size: DEFAULT_PUMP_BUFFER_SIZE,
            full_queue_policy: FullQueuePolicy::Wait,
        }
    }
}

impl TransportOptions {
    pub fn with_no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }

    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_pump_buffer_size(mut self, size: usize) -> Self {
        self.pump_buffer_size = size.max(1);
        self
    }

    pub fn with_full_queue_policy(mut self, policy: FullQueuePolicy) -> Self {
        self.full_queue_policy = policy;
        self
    }
}

/// 传输级上下文：配置与日志汇的组合，由事件循环、监听上下文与所有连接共享。
#[derive(Clone)]
pub struct TransportContext {
    options: TransportOptions,
    log: Arc<dyn TransportLog>,
}

impl TransportContext {
    /// 使用默认的 [`TracingLog`] 日志汇。
    pub fn new(options: TransportOptions) -> Self {
        Self::with_log(options, Arc::new(TracingLog))
    }

    pub fn with_log(options: TransportOptions, log: Arc<dyn TransportLog>) -> Self {
        Self { options, log }
    }

    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    pub fn log(&self) -> &Arc<dyn TransportLog> {
        &self.log
    }
}

impl Default for TransportContext {
    fn default() -> Self {
        Self::new(TransportOptions::default())
    }
}

impl fmt::Debug for TransportContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportContext")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
