use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// 取消原语，统一描述“调用方已放弃等待”的信号。
///
/// # 设计背景（Why）
/// - `accept` 在队列为空时会无限期挂起，调用方需要一种不依赖超时的方式中止等待；
/// - 标志位之外附带 [`Notify`]，挂起中的等待者在 `cancel` 时立即被唤醒，而不是依赖轮询。
///
/// # 契约说明（What）
/// - `cancel` 返回 `true` 表示本次调用首次触发取消，重复调用返回 `false`；
/// - 克隆/`child` 共享同一状态，任一副本取消即对全部可见；
/// - `cancelled` 在已取消时立即完成。
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    inner: Arc<CancellationState>,
}

#[derive(Debug, Default)]
struct CancellationState {
    flag: AtomicBool,
    notify: Notify,
}

impl Cancellation {
    /// 创建处于“未取消”状态的取消令牌。
    pub fn new() -> Self {
        Self::default()
    }

    /// 查询当前是否已被标记取消。
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// 将当前令牌标记为取消，并唤醒所有等待者。
    pub fn cancel(&self) -> bool {
        let first = self
            .inner
            .flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    /// 派生共享同一状态的子令牌。
    pub fn child(&self) -> Self {
        self.clone()
    }

    /// 等待取消发生。
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // 先登记再检查标志，避免 cancel 落在两者之间时丢失唤醒。
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
